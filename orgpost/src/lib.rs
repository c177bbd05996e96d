//! Capture library that files chat messages into Org outline files.
//! Top-level posts land at the end of a journal or todo file; replies are threaded
//! beneath the entry whose heading links back to the message being answered.
//!
//! The outline core (`core`, `parser`, `format`, `finder`, `editor`) is pure and does
//! not log. Backing stores and the `poster` service layer own I/O and tracing.

pub mod core {
    use crate::error::OutlineError;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use uuid::Uuid;

    /* ------------------------------ References ------------------------------ */

    /// Opaque identifier of the message that created an entry.
    ///
    /// Stored as the target of the last bracket link in an entry's heading, so it
    /// may not contain whitespace or square brackets.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(try_from = "String", into = "String")]
    pub struct SourceRef(String);

    impl SourceRef {
        pub fn new(raw: impl Into<String>) -> Result<Self, OutlineError> {
            let raw = raw.into();
            if raw.is_empty()
                || raw
                    .chars()
                    .any(|c| c.is_whitespace() || c == '[' || c == ']')
            {
                return Err(OutlineError::InvalidReference(raw));
            }
            Ok(Self(raw))
        }

        /// Fresh reference for posts that do not originate from a chat message.
        pub fn generate() -> Self {
            Self(format!("urn:uuid:{}", Uuid::new_v4()))
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl TryFrom<String> for SourceRef {
        type Error = OutlineError;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            Self::new(value)
        }
    }

    impl From<SourceRef> for String {
        fn from(value: SourceRef) -> Self {
            value.0
        }
    }

    impl fmt::Display for SourceRef {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /// Which outline file a top-level post belongs to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Target {
        Journal,
        Todo,
    }

    impl fmt::Display for Target {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Target::Journal => f.write_str("journal"),
                Target::Todo => f.write_str("todo"),
            }
        }
    }

    /* ------------------------------- Positions ------------------------------- */

    /// Index of an entry in `OutlineDocument::entries`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct EntryPosition(pub usize);

    /// Where an entry sits, both structurally and in the rendered file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct EntryLocation {
        pub position: EntryPosition,
        pub depth: usize,
        /// Zero-based line of the heading in the rendered file.
        pub line: usize,
    }

    /* -------------------------------- Entries -------------------------------- */

    /// One heading plus the lines under it up to the next heading.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Entry {
        pub depth: usize,
        /// Heading text after the stars and the separating space.
        pub title: String,
        #[serde(default)]
        pub body: Vec<String>,
    }

    impl Entry {
        pub fn new(depth: usize, title: impl Into<String>, body: Vec<String>) -> Self {
            Self {
                depth,
                title: title.into(),
                body,
            }
        }

        pub fn heading_line(&self) -> String {
            format!("{} {}", "*".repeat(self.depth), self.title)
        }

        /// The reference this entry was created from: the last bracket link target
        /// in its title. Earlier links belong to the message text.
        pub fn source_ref(&self) -> Option<&str> {
            crate::parser::link_targets(&self.title).pop()
        }

        pub fn embeds(&self, source_ref: &SourceRef) -> bool {
            self.source_ref() == Some(source_ref.as_str())
        }

        pub fn line_count(&self) -> usize {
            1 + self.body.len()
        }
    }

    /* -------------------------------- Document -------------------------------- */

    /// Flat, ordered view of an outline file. Parent/child links are derived from
    /// depth and order; nothing stores pointers between entries.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct OutlineDocument {
        /// Lines before the first heading, verbatim.
        #[serde(default)]
        pub preamble: Vec<String>,
        #[serde(default)]
        pub entries: Vec<Entry>,
        /// Whether the file ended with a newline.
        #[serde(default)]
        pub trailing_newline: bool,
    }

    impl OutlineDocument {
        pub fn new() -> Self {
            Self::default()
        }

        /// Empty document carrying a `#+TITLE:` line.
        pub fn with_title(title: &str) -> Self {
            Self {
                preamble: vec![format!("#+TITLE: {title}")],
                entries: vec![],
                trailing_newline: true,
            }
        }

        pub fn len(&self) -> usize {
            self.entries.len()
        }

        pub fn is_empty(&self) -> bool {
            self.entries.is_empty()
        }

        fn is_blank(&self) -> bool {
            self.preamble.is_empty() && self.entries.is_empty()
        }

        pub fn entry(&self, pos: EntryPosition) -> Option<&Entry> {
            self.entries.get(pos.0)
        }

        pub fn line_of(&self, pos: EntryPosition) -> Option<usize> {
            if pos.0 >= self.entries.len() {
                return None;
            }
            let before: usize = self.entries[..pos.0].iter().map(Entry::line_count).sum();
            Some(self.preamble.len() + before)
        }

        pub fn location(&self, pos: EntryPosition) -> Option<EntryLocation> {
            let entry = self.entry(pos)?;
            Some(EntryLocation {
                position: pos,
                depth: entry.depth,
                line: self.line_of(pos)?,
            })
        }

        /// Exclusive end index of the subtree rooted at `pos`: the first later entry
        /// at the same or a shallower depth, or the end of the document.
        pub fn subtree_end(&self, pos: EntryPosition) -> Option<usize> {
            let depth = self.entry(pos)?.depth;
            let end = self.entries[pos.0 + 1..]
                .iter()
                .position(|e| e.depth <= depth)
                .map_or(self.entries.len(), |offset| pos.0 + 1 + offset);
            Some(end)
        }

        pub fn parent(&self, pos: EntryPosition) -> Option<EntryPosition> {
            let depth = self.entry(pos)?.depth;
            self.entries[..pos.0]
                .iter()
                .rposition(|e| e.depth < depth)
                .map(EntryPosition)
        }

        /// `#+KEY: value` lines from the preamble, keys upper-cased, in file order.
        pub fn keywords(&self) -> IndexMap<String, String> {
            let mut out = IndexMap::new();
            for line in &self.preamble {
                if let Some((key, value)) = crate::parser::keyword_line(line) {
                    out.insert(key.to_ascii_uppercase(), value.to_string());
                }
            }
            out
        }

        pub fn title(&self) -> Option<String> {
            self.keywords().shift_remove("TITLE")
        }

        /// Entries deeper than one level below their nearest shallower predecessor
        /// (or below depth 1 at the start of the document).
        pub fn depth_violations(&self) -> Vec<EntryPosition> {
            let mut ancestors: Vec<usize> = Vec::new();
            let mut out = Vec::new();
            for (i, entry) in self.entries.iter().enumerate() {
                while ancestors.last().is_some_and(|&d| d >= entry.depth) {
                    ancestors.pop();
                }
                let floor = ancestors.last().copied().unwrap_or(0);
                if entry.depth > floor + 1 {
                    out.push(EntryPosition(i));
                }
                ancestors.push(entry.depth);
            }
            out
        }

        /// Insert at `index` (clamped to the end). A blank document gains a trailing
        /// newline so the written file is newline-terminated.
        pub fn insert(&mut self, index: usize, entry: Entry) -> EntryPosition {
            if self.is_blank() {
                self.trailing_newline = true;
            }
            let index = index.min(self.entries.len());
            self.entries.insert(index, entry);
            EntryPosition(index)
        }

        pub fn push(&mut self, entry: Entry) -> EntryPosition {
            self.insert(self.entries.len(), entry)
        }
    }

}

pub mod error {
    use crate::core::EntryPosition;
    use thiserror::Error;

    /// Failures of outline lookups and edits.
    #[derive(Debug, Error)]
    pub enum OutlineError {
        #[error("no entry references {source_ref}")]
        NotFound { source_ref: String },

        #[error("reference {source_ref} appears on several entries: {positions:?}")]
        AmbiguousReference {
            source_ref: String,
            positions: Vec<EntryPosition>,
        },

        #[error("malformed outline: {0}")]
        MalformedDocument(String),

        #[error("reference {source_ref} already belongs to a different entry")]
        DuplicateReference { source_ref: String },

        #[error("reply parent {source_ref} was not found")]
        ParentNotFound { source_ref: String },

        #[error("invalid source reference {0:?}")]
        InvalidReference(String),

        #[error("invalid entry: {0}")]
        InvalidEntry(String),

        #[error("heading {title:?} does not embed a source reference")]
        MissingReference { title: String },

        #[error("reading {path} failed")]
        RepositoryReadError {
            path: String,
            #[source]
            source: StorageError,
        },

        #[error("writing {path} failed")]
        RepositoryWriteError {
            path: String,
            #[source]
            source: StorageError,
        },

        #[error("{path} was modified concurrently")]
        ConcurrentModification { path: String },
    }

    impl OutlineError {
        /// Lookup misses the caller may answer with a fallback.
        pub fn is_recoverable(&self) -> bool {
            matches!(
                self,
                OutlineError::NotFound { .. } | OutlineError::ParentNotFound { .. }
            )
        }

        /// Failures worth one more read-modify-write attempt.
        pub fn is_transient(&self) -> bool {
            matches!(
                self,
                OutlineError::ConcurrentModification { .. }
                    | OutlineError::RepositoryWriteError { .. }
            )
        }
    }

    /// Failures reported by a backing repository.
    #[derive(Debug, Error)]
    pub enum StorageError {
        #[error("{0} does not exist")]
        NotFound(String),

        #[error("{0} already exists")]
        AlreadyExists(String),

        #[error("{path} no longer matches version {expected}")]
        Conflict { path: String, expected: String },

        #[error("invalid repository path {0:?}")]
        InvalidPath(String),

        #[error("remote returned {status} for {path}: {message}")]
        Remote {
            path: String,
            status: u16,
            message: String,
        },

        #[error("could not decode {path}: {reason}")]
        Decode { path: String, reason: String },

        #[error(transparent)]
        Io(#[from] std::io::Error),

        #[error(transparent)]
        Http(#[from] reqwest::Error),
    }

    #[derive(Debug, Error)]
    pub enum ConfigError {
        #[error("reading config {path}")]
        Read {
            path: String,
            #[source]
            source: std::io::Error,
        },

        #[error("parsing config {path}")]
        Parse {
            path: String,
            #[source]
            source: serde_json::Error,
        },

        #[error("invalid config: {0}")]
        Invalid(String),
    }

    pub type Result<T> = std::result::Result<T, OutlineError>;

}

pub mod parser {
    //! Line-oriented outline reader built on `nom`.
    //!
    //! Only headings are interpreted: a line of one or more `*` followed by a space
    //! opens an entry, every other line belongs to the preceding entry's body (or
    //! to the preamble before the first heading). Nothing is normalized, so
    //! `format::format_outline` reproduces the input byte for byte.

    use crate::core::{Entry, OutlineDocument};
    use nom::{
        IResult,
        bytes::complete::{is_not, tag, take_until, take_while1},
        character::complete::{char, space0},
        combinator::{opt, rest},
        error::VerboseError,
        multi::many1_count,
        sequence::{preceded, separated_pair, terminated},
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------ Public entry points ------------------------ */

    /// Parse outline text into its flat entry sequence.
    pub fn parse_outline(input: &str) -> OutlineDocument {
        let mut doc = OutlineDocument::new();
        if input.is_empty() {
            return doc;
        }

        let (content, trailing_newline) = match input.strip_suffix('\n') {
            Some(content) => (content, true),
            None => (input, false),
        };
        doc.trailing_newline = trailing_newline;

        for line in content.split('\n') {
            if let Some((depth, title)) = parse_heading_line(line) {
                doc.entries.push(Entry::new(depth, title, vec![]));
            } else if let Some(last) = doc.entries.last_mut() {
                last.body.push(line.to_string());
            } else {
                doc.preamble.push(line.to_string());
            }
        }
        doc
    }

    /// Depth and title of a heading line, `None` for any other line.
    pub fn parse_heading_line(line: &str) -> Option<(usize, &str)> {
        heading(line).ok().map(|(_, parsed)| parsed)
    }

    pub fn is_heading_line(line: &str) -> bool {
        parse_heading_line(line).is_some()
    }

    /// Targets of every well-formed `[[target]]` / `[[target][description]]` link,
    /// in order of appearance.
    pub fn link_targets(text: &str) -> Vec<&str> {
        let mut out = Vec::new();
        let mut rest = text;
        while let Some(start) = rest.find("[[") {
            let candidate = &rest[start..];
            match bracket_link(candidate) {
                Ok((after, target)) => {
                    out.push(target);
                    rest = after;
                }
                Err(_) => rest = &candidate[2..],
            }
        }
        out
    }

    /// `#+KEY: value` preamble line.
    pub fn keyword_line(line: &str) -> Option<(&str, &str)> {
        keyword(line).ok().map(|(_, (k, v))| (k, v.trim()))
    }

    /* ------------------------------ Combinators ------------------------------ */

    fn heading(i: &str) -> PResult<'_, (usize, &str)> {
        let (i, depth) = terminated(many1_count(char('*')), char(' '))(i)?;
        let (i, title) = rest(i)?;
        Ok((i, (depth, title)))
    }

    fn bracket_link(i: &str) -> PResult<'_, &str> {
        let (i, target) = preceded(tag("[["), is_not("[]"))(i)?;
        let (i, _) = opt(preceded(tag("]["), take_until("]]")))(i)?;
        let (i, _) = tag("]]")(i)?;
        Ok((i, target))
    }

    fn keyword(i: &str) -> PResult<'_, (&str, &str)> {
        preceded(
            tag("#+"),
            separated_pair(
                take_while1(|c: char| c != ':' && !c.is_whitespace()),
                terminated(char(':'), space0),
                rest,
            ),
        )(i)
    }

}

pub mod format {
    use super::core::*;

    /// Render a document back to text. Untouched input round-trips exactly.
    pub fn format_outline(doc: &OutlineDocument) -> String {
        let mut lines: Vec<&str> = Vec::new();
        let headings: Vec<String> = doc.entries.iter().map(Entry::heading_line).collect();

        lines.extend(doc.preamble.iter().map(String::as_str));
        for (entry, heading) in doc.entries.iter().zip(&headings) {
            lines.push(heading);
            lines.extend(entry.body.iter().map(String::as_str));
        }

        let mut out = lines.join("\n");
        if doc.trailing_newline && !lines.is_empty() {
            out.push('\n');
        }
        out
    }

}

pub mod finder {
    //! Read-only lookups over a parsed outline.

    use crate::core::*;
    use crate::error::{OutlineError, Result};
    use std::ops::Range;

    /// Locate the single entry created from `source_ref`.
    pub fn find_entry(doc: &OutlineDocument, source_ref: &SourceRef) -> Result<EntryPosition> {
        let hits: Vec<EntryPosition> = doc
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.embeds(source_ref))
            .map(|(i, _)| EntryPosition(i))
            .collect();

        match hits.len() {
            0 => Err(OutlineError::NotFound {
                source_ref: source_ref.to_string(),
            }),
            1 => Ok(hits[0]),
            _ => Err(OutlineError::AmbiguousReference {
                source_ref: source_ref.to_string(),
                positions: hits,
            }),
        }
    }

    /// The depth-1 ancestor of `pos` (or `pos` itself when it is top level).
    ///
    /// Walks backwards keeping the shallowest depth seen; only an entry shallower
    /// than everything between it and `pos` is an ancestor.
    pub fn find_enclosing_top_level(
        doc: &OutlineDocument,
        pos: EntryPosition,
    ) -> Result<EntryPosition> {
        let entry = doc.entry(pos).ok_or_else(|| {
            OutlineError::MalformedDocument(format!("entry {} is out of range", pos.0))
        })?;
        if entry.depth == 1 {
            return Ok(pos);
        }

        let mut shallowest = entry.depth;
        for i in (0..pos.0).rev() {
            let depth = doc.entries[i].depth;
            if depth < shallowest {
                if depth == 1 {
                    return Ok(EntryPosition(i));
                }
                shallowest = depth;
            }
        }

        Err(OutlineError::MalformedDocument(format!(
            "entry {} at depth {} has no top-level ancestor",
            pos.0, entry.depth
        )))
    }

    /// Entry indices covered by the thread rooted at top-level entry `top`.
    pub fn thread_span(doc: &OutlineDocument, top: EntryPosition) -> Result<Range<usize>> {
        let end = doc.subtree_end(top).ok_or_else(|| {
            OutlineError::MalformedDocument(format!("entry {} is out of range", top.0))
        })?;
        Ok(top.0..end)
    }

    /// Where a new last child of `parent` goes: right after the parent's subtree,
    /// so earlier replies and their own threads stay in front of it.
    pub fn reply_insertion_index(doc: &OutlineDocument, parent: EntryPosition) -> Result<usize> {
        doc.subtree_end(parent).ok_or_else(|| {
            OutlineError::MalformedDocument(format!("entry {} is out of range", parent.0))
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::parse_outline;
        use proptest::prelude::*;

        const NESTED: &str = "#+TITLE: Test Journal
* Entry: [[https://t.me/c/1234567890/100][2025-12-17 10:00]]
Original message content.
** Reply: [[https://t.me/c/1234567890/200][2025-12-17 11:00]]
First reply.
*** Reply: [[https://t.me/c/1234567890/250][2025-12-17 11:30]]
Nested reply.
** Reply: [[https://t.me/c/1234567890/300][2025-12-17 12:00]]
Second reply.
* Entry: [[https://t.me/c/1234567890/1000][2025-12-17 13:00]]
Different entry.
";

        fn r(id: i64) -> SourceRef {
            SourceRef::new(format!("https://t.me/c/1234567890/{id}")).unwrap()
        }

        #[test]
        fn finds_entry_by_exact_link() {
            let doc = parse_outline(NESTED);
            assert_eq!(find_entry(&doc, &r(100)).unwrap(), EntryPosition(0));
            assert_eq!(find_entry(&doc, &r(250)).unwrap(), EntryPosition(2));
            assert_eq!(find_entry(&doc, &r(1000)).unwrap(), EntryPosition(4));
        }

        #[test]
        fn prefix_of_a_reference_is_not_a_match() {
            let doc = parse_outline(NESTED);
            assert!(matches!(
                find_entry(&doc, &r(10)),
                Err(OutlineError::NotFound { .. })
            ));
        }

        #[test]
        fn references_in_bodies_are_ignored() {
            let doc = parse_outline("* Entry: [[a][t]]\nsee [[b][t]]\n");
            assert!(matches!(
                find_entry(&doc, &SourceRef::new("b").unwrap()),
                Err(OutlineError::NotFound { .. })
            ));
        }

        #[test]
        fn repeated_reference_is_ambiguous() {
            let doc = parse_outline("* one [[dup]]\n* two [[dup]]\n* three [[other]]\n");
            match find_entry(&doc, &SourceRef::new("dup").unwrap()) {
                Err(OutlineError::AmbiguousReference { positions, .. }) => {
                    assert_eq!(positions, vec![EntryPosition(0), EntryPosition(1)]);
                }
                other => panic!("expected ambiguity, got {other:?}"),
            }
        }

        #[test]
        fn top_level_of_nested_reply_is_its_thread_root() {
            let doc = parse_outline(NESTED);
            assert_eq!(
                find_enclosing_top_level(&doc, EntryPosition(2)).unwrap(),
                EntryPosition(0)
            );
            assert_eq!(
                find_enclosing_top_level(&doc, EntryPosition(3)).unwrap(),
                EntryPosition(0)
            );
            assert_eq!(
                find_enclosing_top_level(&doc, EntryPosition(4)).unwrap(),
                EntryPosition(4)
            );
        }

        #[test]
        fn document_starting_below_top_level_is_malformed() {
            let doc = parse_outline("** TODO orphan [[a]]\n*** child [[b]]\n");
            assert!(matches!(
                find_enclosing_top_level(&doc, EntryPosition(1)),
                Err(OutlineError::MalformedDocument(_))
            ));
        }

        #[test]
        fn reply_goes_after_existing_thread_of_parent() {
            let doc = parse_outline(NESTED);
            assert_eq!(reply_insertion_index(&doc, EntryPosition(0)).unwrap(), 4);
            assert_eq!(reply_insertion_index(&doc, EntryPosition(1)).unwrap(), 3);
            assert_eq!(reply_insertion_index(&doc, EntryPosition(4)).unwrap(), 5);
            assert_eq!(thread_span(&doc, EntryPosition(0)).unwrap(), 0..4);
        }

        /// Well-formed documents: each depth is between 1 and one more than the
        /// previous entry's depth; every entry carries the ref `ref-<index>`.
        fn arb_document() -> impl Strategy<Value = OutlineDocument> {
            prop::collection::vec(any::<u8>(), 1..40).prop_map(|steps| {
                let mut prev = 0usize;
                let entries = steps
                    .into_iter()
                    .enumerate()
                    .map(|(i, step)| {
                        let depth = 1 + usize::from(step) % (prev + 1);
                        prev = depth;
                        Entry::new(depth, format!("Entry: [[ref-{i}][t]]"), vec![format!("text {i}")])
                    })
                    .collect();
                OutlineDocument {
                    preamble: vec![],
                    entries,
                    trailing_newline: true,
                }
            })
        }

        proptest! {
            #[test]
            fn every_unique_reference_is_found(doc in arb_document()) {
                for i in 0..doc.len() {
                    let source_ref = SourceRef::new(format!("ref-{i}")).unwrap();
                    prop_assert_eq!(find_entry(&doc, &source_ref).unwrap(), EntryPosition(i));
                }
                let absent = SourceRef::new("ref-absent").unwrap();
                let missing = matches!(find_entry(&doc, &absent), Err(OutlineError::NotFound { .. }));
                prop_assert!(missing);
            }

            #[test]
            fn duplicated_reference_is_always_ambiguous(doc in arb_document(), pick in any::<usize>()) {
                let mut doc = doc;
                let i = pick % doc.len();
                let copy = doc.entries[i].clone();
                doc.push(Entry::new(1, copy.title, vec![]));
                let source_ref = SourceRef::new(format!("ref-{i}")).unwrap();
                let ambiguous = matches!(
                    find_entry(&doc, &source_ref),
                    Err(OutlineError::AmbiguousReference { .. })
                );
                prop_assert!(ambiguous);
            }

            #[test]
            fn top_level_ancestor_is_a_real_ancestor(doc in arb_document(), pick in any::<usize>()) {
                let pos = EntryPosition(pick % doc.len());
                let top = find_enclosing_top_level(&doc, pos).unwrap();
                prop_assert_eq!(doc.entries[top.0].depth, 1);
                prop_assert!(top <= pos);
                prop_assert!(thread_span(&doc, top).unwrap().contains(&pos.0));
            }
        }
    }
}

pub mod storage {
    //! Backing-store seam. The editor only needs whole-file reads, version-checked
    //! writes and exclusive creation; everything else is the backend's business.

    use crate::error::StorageError;
    use serde::{Deserialize, Serialize};
    use std::{
        collections::BTreeMap,
        fmt, fs,
        io::{ErrorKind, Write},
        path::{Path, PathBuf},
        sync::{Mutex, PoisonError},
    };
    use tempfile::NamedTempFile;
    use tracing::debug;

    /* ---------------------------- Value Objects ---------------------------- */

    /// A POSIX-like relative path from the repository root (no leading '/').
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(try_from = "String", into = "String")]
    pub struct RelPath(String);

    impl RelPath {
        pub fn new(raw: impl Into<String>) -> Result<Self, StorageError> {
            let raw = raw.into();
            let valid = !raw.is_empty()
                && !raw.starts_with('/')
                && !raw.contains('\\')
                && raw.split('/').all(|seg| !seg.is_empty() && seg != "." && seg != "..");
            if valid {
                Ok(Self(raw))
            } else {
                Err(StorageError::InvalidPath(raw))
            }
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn join(&self, segment: &str) -> Result<Self, StorageError> {
            Self::new(format!("{}/{}", self.0, segment))
        }
    }

    impl TryFrom<String> for RelPath {
        type Error = StorageError;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            Self::new(value)
        }
    }

    impl From<RelPath> for String {
        fn from(value: RelPath) -> Self {
            value.0
        }
    }

    impl fmt::Display for RelPath {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /// Opaque content version handed back on read and expected on write.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Version(pub String);

    impl fmt::Display for Version {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Snapshot {
        pub bytes: Vec<u8>,
        pub version: Version,
    }

    /// A file committed alongside an outline write, such as an attached image.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct StagedFile {
        pub path: RelPath,
        pub bytes: Vec<u8>,
    }

    /* -------------------------------- Trait -------------------------------- */

    pub trait Repository {
        /// Whole content and version of `path`; `StorageError::NotFound` if absent.
        fn read(&self, path: &RelPath) -> Result<Snapshot, StorageError>;

        /// Replace `path` if it is still at `expected`, else `StorageError::Conflict`.
        fn write(
            &self,
            path: &RelPath,
            bytes: &[u8],
            expected: &Version,
            message: &str,
        ) -> Result<Version, StorageError> {
            self.write_with(path, bytes, expected, &[], message)
        }

        /// Like `write`, and in the same change also put every file of `extra`
        /// (created or replaced). Either everything lands or nothing does.
        fn write_with(
            &self,
            path: &RelPath,
            bytes: &[u8],
            expected: &Version,
            extra: &[StagedFile],
            message: &str,
        ) -> Result<Version, StorageError>;

        /// Create `path`; `StorageError::AlreadyExists` if something is there.
        fn create(&self, path: &RelPath, bytes: &[u8], message: &str)
        -> Result<Version, StorageError>;
    }

    impl<R: Repository + ?Sized> Repository for &R {
        fn read(&self, path: &RelPath) -> Result<Snapshot, StorageError> {
            (**self).read(path)
        }

        fn write_with(
            &self,
            path: &RelPath,
            bytes: &[u8],
            expected: &Version,
            extra: &[StagedFile],
            message: &str,
        ) -> Result<Version, StorageError> {
            (**self).write_with(path, bytes, expected, extra, message)
        }

        fn create(
            &self,
            path: &RelPath,
            bytes: &[u8],
            message: &str,
        ) -> Result<Version, StorageError> {
            (**self).create(path, bytes, message)
        }
    }

    impl<R: Repository + ?Sized> Repository for Box<R> {
        fn read(&self, path: &RelPath) -> Result<Snapshot, StorageError> {
            (**self).read(path)
        }

        fn write_with(
            &self,
            path: &RelPath,
            bytes: &[u8],
            expected: &Version,
            extra: &[StagedFile],
            message: &str,
        ) -> Result<Version, StorageError> {
            (**self).write_with(path, bytes, expected, extra, message)
        }

        fn create(
            &self,
            path: &RelPath,
            bytes: &[u8],
            message: &str,
        ) -> Result<Version, StorageError> {
            (**self).create(path, bytes, message)
        }
    }

    /* ------------------------------- In memory ------------------------------- */

    #[derive(Debug, Default)]
    struct MemoryState {
        files: BTreeMap<RelPath, (Vec<u8>, u64)>,
        counter: u64,
        /// Foreign writes applied just before the next `write` to their path.
        interference: Vec<(RelPath, Vec<u8>)>,
        failing_writes: usize,
    }

    impl MemoryState {
        fn store(&mut self, path: &RelPath, bytes: Vec<u8>) -> Version {
            self.counter += 1;
            self.files.insert(path.clone(), (bytes, self.counter));
            Version(self.counter.to_string())
        }
    }

    /// Process-local repository with numeric versions. Can inject concurrent
    /// writers and I/O failures.
    #[derive(Debug, Default)]
    pub struct MemoryRepository {
        state: Mutex<MemoryState>,
    }

    impl MemoryRepository {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_file(self, path: &RelPath, content: &str) -> Self {
            self.lock().store(path, content.as_bytes().to_vec());
            self
        }

        pub fn contents(&self, path: &RelPath) -> Option<String> {
            self.lock()
                .files
                .get(path)
                .map(|(bytes, _)| String::from_utf8_lossy(bytes).into_owned())
        }

        pub fn paths(&self) -> Vec<RelPath> {
            self.lock().files.keys().cloned().collect()
        }

        /// Replace `path` with `content` right before the next write to it, as if
        /// another writer got there first.
        pub fn interfere_once(&self, path: &RelPath, content: &str) {
            self.lock()
                .interference
                .push((path.clone(), content.as_bytes().to_vec()));
        }

        /// Fail the next `count` writes with an I/O error.
        pub fn fail_writes(&self, count: usize) {
            self.lock().failing_writes = count;
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    impl Repository for MemoryRepository {
        fn read(&self, path: &RelPath) -> Result<Snapshot, StorageError> {
            let state = self.lock();
            let (bytes, version) = state
                .files
                .get(path)
                .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
            Ok(Snapshot {
                bytes: bytes.clone(),
                version: Version(version.to_string()),
            })
        }

        fn write_with(
            &self,
            path: &RelPath,
            bytes: &[u8],
            expected: &Version,
            extra: &[StagedFile],
            _message: &str,
        ) -> Result<Version, StorageError> {
            let mut state = self.lock();
            if state.failing_writes > 0 {
                state.failing_writes -= 1;
                return Err(StorageError::Io(std::io::Error::other("injected write failure")));
            }
            if let Some(idx) = state.interference.iter().position(|(p, _)| p == path) {
                let (p, foreign) = state.interference.remove(idx);
                state.store(&p, foreign);
            }
            let current = state
                .files
                .get(path)
                .map(|(_, v)| v.to_string())
                .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
            if current != expected.0 {
                return Err(StorageError::Conflict {
                    path: path.to_string(),
                    expected: expected.to_string(),
                });
            }
            for file in extra {
                state.store(&file.path, file.bytes.clone());
            }
            Ok(state.store(path, bytes.to_vec()))
        }

        fn create(
            &self,
            path: &RelPath,
            bytes: &[u8],
            _message: &str,
        ) -> Result<Version, StorageError> {
            let mut state = self.lock();
            if state.files.contains_key(path) {
                return Err(StorageError::AlreadyExists(path.to_string()));
            }
            Ok(state.store(path, bytes.to_vec()))
        }
    }

    /* ------------------------------ Local disk ------------------------------ */

    /// Files under a directory on disk; versions are blake3 digests of content.
    #[derive(Debug, Clone)]
    pub struct LocalRepository {
        root: PathBuf,
    }

    impl LocalRepository {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self { root: root.into() }
        }

        /// Resolve a relative path to an absolute on-disk path.
        pub fn abs_path(&self, rel: &RelPath) -> PathBuf {
            rel.as_str()
                .split('/')
                .fold(self.root.clone(), |acc, seg| acc.join(seg))
        }
    }

    fn digest(bytes: &[u8]) -> Version {
        Version(blake3::hash(bytes).to_hex().to_string())
    }

    fn not_found_or(path: &RelPath, err: std::io::Error) -> StorageError {
        if err.kind() == ErrorKind::NotFound {
            StorageError::NotFound(path.to_string())
        } else {
            StorageError::Io(err)
        }
    }

    /// Content of `path` written to a tempfile beside it, ready to be renamed
    /// into place. Readers never observe a partial file.
    fn stage(path: &Path, data: &[u8]) -> Result<NamedTempFile, StorageError> {
        let dir = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        Ok(tmp)
    }

    impl Repository for LocalRepository {
        fn read(&self, path: &RelPath) -> Result<Snapshot, StorageError> {
            let abs = self.abs_path(path);
            let bytes = fs::read(&abs).map_err(|e| not_found_or(path, e))?;
            debug!(path = %path, bytes = bytes.len(), "read outline file");
            let version = digest(&bytes);
            Ok(Snapshot { bytes, version })
        }

        /// Every file is staged before anything is renamed, and the outline is
        /// renamed last. The digest check and the renames are separate steps, so
        /// a writer outside this process can still land in between; within one
        /// process the editor's retry covers the conflicts it does see.
        fn write_with(
            &self,
            path: &RelPath,
            bytes: &[u8],
            expected: &Version,
            extra: &[StagedFile],
            message: &str,
        ) -> Result<Version, StorageError> {
            let abs = self.abs_path(path);
            let outline = stage(&abs, bytes)?;
            let staged = extra
                .iter()
                .map(|file| {
                    let target = self.abs_path(&file.path);
                    stage(&target, &file.bytes).map(|tmp| (tmp, target))
                })
                .collect::<Result<Vec<_>, _>>()?;

            let current = fs::read(&abs).map_err(|e| not_found_or(path, e))?;
            if &digest(&current) != expected {
                return Err(StorageError::Conflict {
                    path: path.to_string(),
                    expected: expected.to_string(),
                });
            }

            for (tmp, target) in staged {
                tmp.persist(&target).map_err(|e| e.error)?;
            }
            outline.persist(&abs).map_err(|e| e.error)?;
            debug!(path = %path, files = extra.len(), message, "wrote outline file");
            Ok(digest(bytes))
        }

        fn create(
            &self,
            path: &RelPath,
            bytes: &[u8],
            message: &str,
        ) -> Result<Version, StorageError> {
            let abs = self.abs_path(path);
            stage(&abs, bytes)?.persist_noclobber(&abs).map_err(|e| {
                if e.error.kind() == ErrorKind::AlreadyExists {
                    StorageError::AlreadyExists(path.to_string())
                } else {
                    StorageError::Io(e.error)
                }
            })?;
            debug!(path = %path, message, "created file");
            Ok(digest(bytes))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use tempfile::TempDir;

        fn p(s: &str) -> RelPath {
            RelPath::new(s).expect("valid path")
        }

        #[test]
        fn rel_path_rejects_escapes() {
            assert!(RelPath::new("journal.org").is_ok());
            assert!(RelPath::new("notes/todo.org").is_ok());
            for bad in ["", "/abs.org", "../up.org", "a//b", "a/./b", "a\\b"] {
                assert!(RelPath::new(bad).is_err(), "{bad} should be rejected");
            }
        }

        #[test]
        fn rel_path_join_validates_segment() {
            let path = p("pics/telegram");
            assert_eq!(path.join("abc.jpg").unwrap().as_str(), "pics/telegram/abc.jpg");
            assert!(path.join("../abc.jpg").is_err());
        }

        #[test]
        fn memory_write_requires_current_version() {
            let repo = MemoryRepository::new().with_file(&p("j.org"), "a");
            let snap = repo.read(&p("j.org")).unwrap();
            let v2 = repo.write(&p("j.org"), b"b", &snap.version, "m").unwrap();
            assert_ne!(v2, snap.version);
            assert!(matches!(
                repo.write(&p("j.org"), b"c", &snap.version, "m"),
                Err(StorageError::Conflict { .. })
            ));
            assert_eq!(repo.contents(&p("j.org")).as_deref(), Some("b"));
        }

        #[test]
        fn memory_interference_causes_one_conflict() {
            let repo = MemoryRepository::new().with_file(&p("j.org"), "a");
            repo.interfere_once(&p("j.org"), "foreign");
            let snap = repo.read(&p("j.org")).unwrap();
            assert!(matches!(
                repo.write(&p("j.org"), b"mine", &snap.version, "m"),
                Err(StorageError::Conflict { .. })
            ));
            let snap = repo.read(&p("j.org")).unwrap();
            assert_eq!(snap.bytes, b"foreign");
            repo.write(&p("j.org"), b"mine", &snap.version, "m").unwrap();
        }

        #[test]
        fn memory_create_is_exclusive() {
            let repo = MemoryRepository::new();
            repo.create(&p("t.org"), b"x", "m").unwrap();
            assert!(matches!(
                repo.create(&p("t.org"), b"y", "m"),
                Err(StorageError::AlreadyExists(_))
            ));
            assert!(matches!(repo.read(&p("missing.org")), Err(StorageError::NotFound(_))));
        }

        #[test]
        fn local_round_trip_with_digest_versions() {
            let dir = TempDir::new().expect("tempdir");
            let repo = LocalRepository::new(dir.path());
            let path = p("notes/journal.org");

            assert!(matches!(repo.read(&path), Err(StorageError::NotFound(_))));
            let v1 = repo.create(&path, b"* one\n", "create").unwrap();
            assert!(matches!(
                repo.create(&path, b"* other\n", "create"),
                Err(StorageError::AlreadyExists(_))
            ));

            let snap = repo.read(&path).unwrap();
            assert_eq!(snap.version, v1);
            repo.write(&path, b"* one\n* two\n", &v1, "append").unwrap();
            assert_eq!(
                fs::read_to_string(dir.path().join("notes/journal.org")).unwrap(),
                "* one\n* two\n"
            );
            assert!(matches!(
                repo.write(&path, b"stale", &v1, "append"),
                Err(StorageError::Conflict { .. })
            ));
        }

        fn image(path: &str, bytes: &[u8]) -> StagedFile {
            StagedFile {
                path: p(path),
                bytes: bytes.to_vec(),
            }
        }

        #[test]
        fn memory_write_with_is_all_or_nothing() {
            let repo = MemoryRepository::new().with_file(&p("j.org"), "a");
            let snap = repo.read(&p("j.org")).unwrap();
            let extra = [image("pics/one.jpg", b"1"), image("pics/two.jpg", b"2")];

            repo.interfere_once(&p("j.org"), "foreign");
            assert!(matches!(
                repo.write_with(&p("j.org"), b"b", &snap.version, &extra, "m"),
                Err(StorageError::Conflict { .. })
            ));
            assert_eq!(repo.paths(), vec![p("j.org")]);

            let snap = repo.read(&p("j.org")).unwrap();
            repo.write_with(&p("j.org"), b"b", &snap.version, &extra, "m").unwrap();
            assert_eq!(repo.contents(&p("pics/two.jpg")).as_deref(), Some("2"));
            assert_eq!(repo.contents(&p("j.org")).as_deref(), Some("b"));
        }

        #[test]
        fn local_write_with_lands_files_only_on_current_version() {
            let dir = TempDir::new().expect("tempdir");
            let repo = LocalRepository::new(dir.path());
            let path = p("journal.org");
            let v1 = repo.create(&path, b"* one\n", "create").unwrap();
            let extra = [image("pics/telegram/a.jpg", b"jpeg")];

            fs::write(dir.path().join("journal.org"), "* edited elsewhere\n").unwrap();
            assert!(matches!(
                repo.write_with(&path, b"* one\n* two\n", &v1, &extra, "m"),
                Err(StorageError::Conflict { .. })
            ));
            assert!(!dir.path().join("pics/telegram/a.jpg").exists());
            assert_eq!(fs::read_dir(dir.path().join("pics/telegram")).unwrap().count(), 0);

            let current = repo.read(&path).unwrap().version;
            repo.write_with(&path, b"* two\n", &current, &extra, "m").unwrap();
            assert_eq!(fs::read(dir.path().join("pics/telegram/a.jpg")).unwrap(), b"jpeg");
            assert_eq!(fs::read_to_string(dir.path().join("journal.org")).unwrap(), "* two\n");
        }

        #[test]
        fn local_create_never_leaves_partial_or_stray_files() {
            let dir = TempDir::new().expect("tempdir");
            let repo = LocalRepository::new(dir.path());
            repo.create(&p("todo.org"), b"first", "create").unwrap();
            assert!(matches!(
                repo.create(&p("todo.org"), b"second", "create"),
                Err(StorageError::AlreadyExists(_))
            ));
            assert_eq!(fs::read(dir.path().join("todo.org")).unwrap(), b"first");
            assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
        }
    }
}

pub mod github {
    //! Repository backed by a GitHub repository through the REST contents API.
    //! File versions are blob SHAs; GitHub itself rejects a PUT whose `sha` is stale.
    //! Writes that carry extra files go through the Git Data API instead, so the
    //! outline and its attachments land in a single commit.

    use crate::error::StorageError;
    use crate::storage::{RelPath, Repository, Snapshot, StagedFile, Version};
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use reqwest::{
        StatusCode,
        blocking::{Client, RequestBuilder, Response},
    };
    use serde::{Deserialize, Serialize, de::DeserializeOwned};
    use std::time::Duration;
    use tracing::{debug, warn};

    pub const DEFAULT_API_URL: &str = "https://api.github.com";

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct GitHubSettings {
        /// `owner/name`.
        pub repo: String,
        pub branch: String,
        pub token: String,
        #[serde(default = "default_api_url")]
        pub api_url: String,
    }

    fn default_api_url() -> String {
        DEFAULT_API_URL.to_string()
    }

    #[derive(Debug, Deserialize)]
    struct ContentsFile {
        sha: String,
        #[serde(default)]
        content: String,
        #[serde(default)]
        encoding: String,
    }

    #[derive(Debug, Serialize)]
    struct PutContents<'a> {
        message: &'a str,
        content: String,
        branch: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        sha: Option<&'a str>,
    }

    #[derive(Debug, Deserialize)]
    struct PutResponse {
        content: Sha,
    }

    #[derive(Debug, Deserialize)]
    struct Sha {
        sha: String,
    }

    #[derive(Debug, Deserialize)]
    struct GitRef {
        object: Sha,
    }

    #[derive(Debug, Deserialize)]
    struct GitCommit {
        tree: Sha,
    }

    #[derive(Debug, Deserialize)]
    struct GitBlob {
        content: String,
        encoding: String,
    }

    #[derive(Debug, Serialize)]
    struct TreeItem<'a> {
        path: &'a str,
        mode: &'static str,
        #[serde(rename = "type")]
        kind: &'static str,
        sha: String,
    }

    pub struct GitHubRepository {
        client: Client,
        settings: GitHubSettings,
    }

    impl GitHubRepository {
        pub fn new(settings: GitHubSettings) -> Result<Self, StorageError> {
            let client = Client::builder()
                .timeout(Duration::from_secs(30))
                .user_agent(concat!("orgpost/", env!("CARGO_PKG_VERSION")))
                .build()?;
            Ok(Self { client, settings })
        }

        fn api(&self, tail: &str) -> String {
            format!(
                "{}/repos/{}/{}",
                self.settings.api_url.trim_end_matches('/'),
                self.settings.repo,
                tail
            )
        }

        fn url(&self, path: &RelPath) -> String {
            self.api(&format!("contents/{path}"))
        }

        fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
            req.header("Authorization", format!("Bearer {}", self.settings.token))
                .header("Accept", "application/vnd.github+json")
                .header("X-GitHub-Api-Version", "2022-11-28")
        }

        /// Send `req` and decode a successful JSON answer; anything else is `Remote`.
        fn fetch<T: DeserializeOwned>(&self, path: &RelPath, req: RequestBuilder) -> Result<T, StorageError> {
            let resp = self.authorized(req).send()?;
            if !resp.status().is_success() {
                return Err(remote_error(path, resp));
            }
            Ok(resp.json()?)
        }

        fn put(
            &self,
            path: &RelPath,
            bytes: &[u8],
            sha: Option<&str>,
            message: &str,
        ) -> Result<Response, StorageError> {
            let body = PutContents {
                message,
                content: STANDARD.encode(bytes),
                branch: &self.settings.branch,
                sha,
            };
            Ok(self.authorized(self.client.put(self.url(path))).json(&body).send()?)
        }

        /// Contents-API metadata of `path` as of `reference` (branch or commit).
        fn contents_at(&self, path: &RelPath, reference: &str) -> Result<ContentsFile, StorageError> {
            let url = format!("{}?ref={}", self.url(path), reference);
            let resp = self.authorized(self.client.get(url)).send()?;
            match resp.status() {
                StatusCode::NOT_FOUND => Err(StorageError::NotFound(path.to_string())),
                s if s.is_success() => Ok(resp.json()?),
                _ => Err(remote_error(path, resp)),
            }
        }

        /// Files above 1 MB come back from the contents API without content.
        fn blob(&self, path: &RelPath, sha: &str) -> Result<Vec<u8>, StorageError> {
            let blob: GitBlob =
                self.fetch(path, self.client.get(self.api(&format!("git/blobs/{sha}"))))?;
            decode_content(path, &blob.encoding, &blob.content)
        }

        fn create_blob(&self, path: &RelPath, bytes: &[u8]) -> Result<String, StorageError> {
            let body = serde_json::json!({"content": STANDARD.encode(bytes), "encoding": "base64"});
            let blob: Sha = self.fetch(path, self.client.post(self.api("git/blobs")).json(&body))?;
            Ok(blob.sha)
        }

        /// One commit holding the outline and every extra file, published by a
        /// fast-forward of the branch.
        fn commit_files(
            &self,
            path: &RelPath,
            bytes: &[u8],
            expected: &Version,
            extra: &[StagedFile],
            message: &str,
        ) -> Result<Version, StorageError> {
            let branch = &self.settings.branch;
            let head: GitRef = self.fetch(
                path,
                self.client.get(self.api(&format!("git/ref/heads/{branch}"))),
            )?;
            let head = head.object.sha;

            let current = self.contents_at(path, &head)?;
            if current.sha != expected.0 {
                return Err(StorageError::Conflict {
                    path: path.to_string(),
                    expected: expected.to_string(),
                });
            }
            let base: GitCommit =
                self.fetch(path, self.client.get(self.api(&format!("git/commits/{head}"))))?;

            let outline_sha = self.create_blob(path, bytes)?;
            let mut tree = vec![TreeItem {
                path: path.as_str(),
                mode: "100644",
                kind: "blob",
                sha: outline_sha.clone(),
            }];
            for file in extra {
                tree.push(TreeItem {
                    path: file.path.as_str(),
                    mode: "100644",
                    kind: "blob",
                    sha: self.create_blob(&file.path, &file.bytes)?,
                });
            }

            let body = serde_json::json!({"base_tree": base.tree.sha, "tree": tree});
            let new_tree: Sha = self.fetch(path, self.client.post(self.api("git/trees")).json(&body))?;
            let body = serde_json::json!({"message": message, "tree": new_tree.sha, "parents": [head]});
            let commit: Sha = self.fetch(path, self.client.post(self.api("git/commits")).json(&body))?;

            let body = serde_json::json!({"sha": commit.sha, "force": false});
            let resp = self
                .authorized(self.client.patch(self.api(&format!("git/refs/heads/{branch}"))))
                .json(&body)
                .send()?;
            match resp.status() {
                // The branch moved since `head` was read: not a fast-forward.
                StatusCode::UNPROCESSABLE_ENTITY | StatusCode::CONFLICT => Err(StorageError::Conflict {
                    path: path.to_string(),
                    expected: expected.to_string(),
                }),
                s if s.is_success() => {
                    debug!(path = %path, files = extra.len(), commit = %commit.sha, "committed files");
                    Ok(Version(outline_sha))
                }
                _ => Err(remote_error(path, resp)),
            }
        }
    }

    fn decode_content(path: &RelPath, encoding: &str, content: &str) -> Result<Vec<u8>, StorageError> {
        if encoding != "base64" {
            return Err(StorageError::Decode {
                path: path.to_string(),
                reason: format!("unsupported encoding {encoding:?}"),
            });
        }
        let packed: String = content.split_whitespace().collect();
        STANDARD.decode(packed).map_err(|e| StorageError::Decode {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    fn remote_error(path: &RelPath, resp: Response) -> StorageError {
        let status = resp.status().as_u16();
        let message = resp.text().unwrap_or_default();
        warn!(path = %path, status, "github request failed");
        StorageError::Remote {
            path: path.to_string(),
            status,
            message,
        }
    }

    fn new_sha(path: &RelPath, resp: Response) -> Result<Version, StorageError> {
        let parsed: PutResponse = resp.json()?;
        debug!(path = %path, sha = %parsed.content.sha, "committed file");
        Ok(Version(parsed.content.sha))
    }

    impl Repository for GitHubRepository {
        fn read(&self, path: &RelPath) -> Result<Snapshot, StorageError> {
            let file = self.contents_at(path, &self.settings.branch)?;
            let bytes = if file.encoding == "none" {
                self.blob(path, &file.sha)?
            } else {
                decode_content(path, &file.encoding, &file.content)?
            };
            debug!(path = %path, sha = %file.sha, bytes = bytes.len(), "fetched file");
            Ok(Snapshot {
                bytes,
                version: Version(file.sha),
            })
        }

        fn write(
            &self,
            path: &RelPath,
            bytes: &[u8],
            expected: &Version,
            message: &str,
        ) -> Result<Version, StorageError> {
            let resp = self.put(path, bytes, Some(&expected.0), message)?;
            match resp.status() {
                // 409 when the sha is stale, 422 when it names no blob of the file.
                StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => Err(StorageError::Conflict {
                    path: path.to_string(),
                    expected: expected.to_string(),
                }),
                StatusCode::NOT_FOUND => Err(StorageError::NotFound(path.to_string())),
                s if s.is_success() => new_sha(path, resp),
                _ => Err(remote_error(path, resp)),
            }
        }

        fn write_with(
            &self,
            path: &RelPath,
            bytes: &[u8],
            expected: &Version,
            extra: &[StagedFile],
            message: &str,
        ) -> Result<Version, StorageError> {
            if extra.is_empty() {
                self.write(path, bytes, expected, message)
            } else {
                self.commit_files(path, bytes, expected, extra, message)
            }
        }

        fn create(
            &self,
            path: &RelPath,
            bytes: &[u8],
            message: &str,
        ) -> Result<Version, StorageError> {
            let resp = self.put(path, bytes, None, message)?;
            match resp.status() {
                // GitHub answers a sha-less PUT over an existing file with 422.
                StatusCode::UNPROCESSABLE_ENTITY | StatusCode::CONFLICT => {
                    Err(StorageError::AlreadyExists(path.to_string()))
                }
                s if s.is_success() => new_sha(path, resp),
                _ => Err(remote_error(path, resp)),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use mockito::{Matcher, Server};

        fn repo(server: &Server) -> GitHubRepository {
            GitHubRepository::new(GitHubSettings {
                repo: "alice/notes".into(),
                branch: "main".into(),
                token: "secret".into(),
                api_url: server.url(),
            })
            .expect("client")
        }

        fn path() -> RelPath {
            RelPath::new("journal.org").unwrap()
        }

        #[test]
        fn read_decodes_wrapped_base64() {
            let mut server = Server::new();
            let encoded = STANDARD.encode("* Entry: [[r][t]]\n");
            let wrapped = format!("{}\n{}", &encoded[..8], &encoded[8..]);
            let mock = server
                .mock("GET", "/repos/alice/notes/contents/journal.org")
                .match_query(Matcher::UrlEncoded("ref".into(), "main".into()))
                .match_header("authorization", "Bearer secret")
                .with_status(200)
                .with_body(
                    serde_json::json!({"sha": "abc123", "content": wrapped, "encoding": "base64"})
                        .to_string(),
                )
                .create();

            let snap = repo(&server).read(&path()).unwrap();
            assert_eq!(snap.bytes, b"* Entry: [[r][t]]\n");
            assert_eq!(snap.version, Version("abc123".into()));
            mock.assert();
        }

        #[test]
        fn read_missing_file_is_not_found() {
            let mut server = Server::new();
            server
                .mock("GET", "/repos/alice/notes/contents/journal.org")
                .match_query(Matcher::Any)
                .with_status(404)
                .with_body(r#"{"message":"Not Found"}"#)
                .create();

            assert!(matches!(
                repo(&server).read(&path()),
                Err(StorageError::NotFound(_))
            ));
        }

        #[test]
        fn write_sends_expected_sha_and_returns_new_one() {
            let mut server = Server::new();
            let mock = server
                .mock("PUT", "/repos/alice/notes/contents/journal.org")
                .match_body(Matcher::PartialJson(serde_json::json!({
                    "sha": "old",
                    "branch": "main",
                    "message": "Add r to journal.org",
                    "content": STANDARD.encode("new"),
                })))
                .with_status(200)
                .with_body(r#"{"content":{"sha":"new-sha"}}"#)
                .create();

            let version = repo(&server)
                .write(&path(), b"new", &Version("old".into()), "Add r to journal.org")
                .unwrap();
            assert_eq!(version, Version("new-sha".into()));
            mock.assert();
        }

        #[test]
        fn stale_sha_is_a_conflict() {
            let mut server = Server::new();
            server
                .mock("PUT", "/repos/alice/notes/contents/journal.org")
                .with_status(409)
                .with_body(r#"{"message":"journal.org does not match old"}"#)
                .create();

            assert!(matches!(
                repo(&server).write(&path(), b"x", &Version("old".into()), "m"),
                Err(StorageError::Conflict { .. })
            ));
        }

        #[test]
        fn create_over_existing_file_reports_already_exists() {
            let mut server = Server::new();
            server
                .mock("PUT", "/repos/alice/notes/contents/journal.org")
                .with_status(422)
                .with_body(r#"{"message":"\"sha\" wasn't supplied."}"#)
                .create();

            assert!(matches!(
                repo(&server).create(&path(), b"x", "m"),
                Err(StorageError::AlreadyExists(_))
            ));
        }

        #[test]
        fn other_failures_surface_status() {
            let mut server = Server::new();
            server
                .mock("PUT", "/repos/alice/notes/contents/journal.org")
                .with_status(500)
                .with_body("boom")
                .create();

            match repo(&server).create(&path(), b"x", "m") {
                Err(StorageError::Remote { status, message, .. }) => {
                    assert_eq!(status, 500);
                    assert_eq!(message, "boom");
                }
                other => panic!("expected remote error, got {other:?}"),
            }
        }

        #[test]
        fn large_file_is_read_through_blob_api() {
            let mut server = Server::new();
            server
                .mock("GET", "/repos/alice/notes/contents/journal.org")
                .match_query(Matcher::UrlEncoded("ref".into(), "main".into()))
                .with_status(200)
                .with_body(r#"{"sha": "big", "content": "", "encoding": "none"}"#)
                .create();
            let blob = server
                .mock("GET", "/repos/alice/notes/git/blobs/big")
                .with_status(200)
                .with_body(
                    serde_json::json!({"content": STANDARD.encode("* huge\n"), "encoding": "base64"})
                        .to_string(),
                )
                .create();

            let snap = repo(&server).read(&path()).unwrap();
            assert_eq!(snap.bytes, b"* huge\n");
            assert_eq!(snap.version, Version("big".into()));
            blob.assert();
        }

        fn image() -> StagedFile {
            StagedFile {
                path: RelPath::new("pics/telegram/cat.jpg").unwrap(),
                bytes: b"jpeg".to_vec(),
            }
        }

        /// Branch head `head1` whose tree is `tree1` and whose journal blob is `old`.
        fn mock_head(server: &mut Server) {
            server
                .mock("GET", "/repos/alice/notes/git/ref/heads/main")
                .with_status(200)
                .with_body(r#"{"object": {"sha": "head1"}}"#)
                .create();
            server
                .mock("GET", "/repos/alice/notes/contents/journal.org")
                .match_query(Matcher::UrlEncoded("ref".into(), "head1".into()))
                .with_status(200)
                .with_body(r#"{"sha": "old", "content": "", "encoding": "base64"}"#)
                .create();
            server
                .mock("GET", "/repos/alice/notes/git/commits/head1")
                .with_status(200)
                .with_body(r#"{"tree": {"sha": "tree1"}}"#)
                .create();
        }

        fn mock_commit(server: &mut Server) -> Vec<mockito::Mock> {
            let outline = server
                .mock("POST", "/repos/alice/notes/git/blobs")
                .match_body(Matcher::PartialJson(
                    serde_json::json!({"content": STANDARD.encode("new"), "encoding": "base64"}),
                ))
                .with_status(201)
                .with_body(r#"{"sha": "blob-outline"}"#)
                .create();
            let picture = server
                .mock("POST", "/repos/alice/notes/git/blobs")
                .match_body(Matcher::PartialJson(
                    serde_json::json!({"content": STANDARD.encode("jpeg")}),
                ))
                .with_status(201)
                .with_body(r#"{"sha": "blob-image"}"#)
                .create();
            let tree = server
                .mock("POST", "/repos/alice/notes/git/trees")
                .match_body(Matcher::PartialJson(serde_json::json!({"base_tree": "tree1"})))
                .with_status(201)
                .with_body(r#"{"sha": "tree2"}"#)
                .create();
            let commit = server
                .mock("POST", "/repos/alice/notes/git/commits")
                .match_body(Matcher::PartialJson(serde_json::json!({
                    "message": "Add r to journal.org",
                    "tree": "tree2",
                    "parents": ["head1"],
                })))
                .with_status(201)
                .with_body(r#"{"sha": "commit2"}"#)
                .create();
            vec![outline, picture, tree, commit]
        }

        #[test]
        fn outline_and_attachments_share_one_commit() {
            let mut server = Server::new();
            mock_head(&mut server);
            let steps = mock_commit(&mut server);
            let update = server
                .mock("PATCH", "/repos/alice/notes/git/refs/heads/main")
                .match_body(Matcher::PartialJson(
                    serde_json::json!({"sha": "commit2", "force": false}),
                ))
                .with_status(200)
                .with_body(r#"{"object": {"sha": "commit2"}}"#)
                .create();

            let version = repo(&server)
                .write_with(&path(), b"new", &Version("old".into()), &[image()], "Add r to journal.org")
                .unwrap();
            assert_eq!(version, Version("blob-outline".into()));
            for step in steps {
                step.assert();
            }
            update.assert();
        }

        #[test]
        fn moved_branch_rejects_the_commit() {
            let mut server = Server::new();
            mock_head(&mut server);
            let _steps = mock_commit(&mut server);
            server
                .mock("PATCH", "/repos/alice/notes/git/refs/heads/main")
                .with_status(422)
                .with_body(r#"{"message": "Update is not a fast forward"}"#)
                .create();

            assert!(matches!(
                repo(&server).write_with(&path(), b"new", &Version("old".into()), &[image()], "Add r to journal.org"),
                Err(StorageError::Conflict { .. })
            ));
        }

        #[test]
        fn stale_outline_version_uploads_nothing() {
            let mut server = Server::new();
            mock_head(&mut server);
            let blobs = server
                .mock("POST", "/repos/alice/notes/git/blobs")
                .expect(0)
                .create();

            assert!(matches!(
                repo(&server).write_with(&path(), b"new", &Version("older".into()), &[image()], "m"),
                Err(StorageError::Conflict { .. })
            ));
            blobs.assert();
        }
    }
}

pub mod editor {
    //! Read-modify-write operations on one outline file.
    //!
    //! Each operation loads the whole file, edits the parsed document and writes
    //! it back against the version it read. A stale version or failed write is
    //! retried once from a fresh read; re-applying is safe because the new
    //! entry's own reference is checked before anything is written.

    use crate::core::*;
    use crate::error::{OutlineError, Result, StorageError};
    use crate::finder::{find_enclosing_top_level, find_entry, reply_insertion_index, thread_span};
    use crate::format::format_outline;
    use crate::parser::{is_heading_line, link_targets, parse_outline};
    use crate::storage::{RelPath, Repository, Snapshot, StagedFile, Version};
    use std::collections::BTreeMap;

    /// A heading about to be written, the reference it must be found by, and
    /// any files committed together with it.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct NewEntry {
        pub source_ref: SourceRef,
        /// Heading text without stars; its last link must target `source_ref`.
        pub title: String,
        pub body: Vec<String>,
        pub files: Vec<StagedFile>,
    }

    impl NewEntry {
        pub fn new(source_ref: SourceRef, title: impl Into<String>, body: Vec<String>) -> Self {
            Self {
                source_ref,
                title: title.into(),
                body,
                files: vec![],
            }
        }

        pub fn with_files(mut self, files: Vec<StagedFile>) -> Self {
            self.files = files;
            self
        }
    }

    pub struct OutlineEditor<R> {
        repo: R,
        /// `#+TITLE:` written into files this editor creates.
        titles: BTreeMap<RelPath, String>,
    }

    impl<R: Repository> OutlineEditor<R> {
        pub fn new(repo: R) -> Self {
            Self {
                repo,
                titles: BTreeMap::new(),
            }
        }

        pub fn with_title(mut self, path: RelPath, title: impl Into<String>) -> Self {
            self.titles.insert(path, title.into());
            self
        }

        pub fn repository(&self) -> &R {
            &self.repo
        }

        /// Create `path` (empty, or with its configured title) unless it exists.
        /// Losing a creation race to another writer counts as success.
        pub fn ensure_file(&self, path: &RelPath) -> Result<Snapshot> {
            match self.repo.read(path) {
                Ok(snapshot) => return Ok(snapshot),
                Err(StorageError::NotFound(_)) => {}
                Err(source) => return Err(read_error(path, source)),
            }

            let initial = match self.titles.get(path) {
                Some(title) => format_outline(&OutlineDocument::with_title(title)),
                None => String::new(),
            };
            let message = format!("Create {path}");
            match self.repo.create(path, initial.as_bytes(), &message) {
                Ok(version) => Ok(Snapshot {
                    bytes: initial.into_bytes(),
                    version,
                }),
                Err(StorageError::AlreadyExists(_)) => {
                    self.repo.read(path).map_err(|source| read_error(path, source))
                }
                Err(source) => Err(OutlineError::RepositoryWriteError {
                    path: path.to_string(),
                    source,
                }),
            }
        }

        /// Current document; a missing file reads as an empty one.
        pub fn load(&self, path: &RelPath) -> Result<OutlineDocument> {
            Ok(self
                .read_document(path)?
                .map(|(doc, _)| doc)
                .unwrap_or_default())
        }

        pub fn find(&self, path: &RelPath, source_ref: &SourceRef) -> Result<EntryLocation> {
            let doc = self.load(path)?;
            let pos = find_entry(&doc, source_ref)?;
            locate(&doc, pos)
        }

        /// Append a depth-1 entry at the end of `path`, creating the file first if
        /// needed.
        pub fn append_entry(&self, path: &RelPath, new: &NewEntry) -> Result<EntryLocation> {
            validate_new_entry(new)?;
            self.ensure_file(path)?;
            let message = format!("Add {} to {path}", new.source_ref);

            self.with_retry(|| {
                let (mut doc, version) = self
                    .read_document(path)?
                    .ok_or_else(|| OutlineError::RepositoryReadError {
                        path: path.to_string(),
                        source: StorageError::NotFound(path.to_string()),
                    })?;
                let entry = Entry::new(1, new.title.as_str(), new.body.clone());
                if let Some(location) = existing_copy(&doc, &new.source_ref, &entry)? {
                    return Ok(location);
                }

                let pos = doc.push(entry);
                self.store(path, &doc, &version, &new.files, &message)?;
                locate(&doc, pos)
            })
        }

        /// Insert a reply as the last child of the entry referenced by `parent`.
        /// Never creates the file: a missing file means a missing parent.
        pub fn insert_reply(
            &self,
            path: &RelPath,
            parent: &SourceRef,
            new: &NewEntry,
        ) -> Result<EntryLocation> {
            validate_new_entry(new)?;
            let message = format!("Reply {} to {parent} in {path}", new.source_ref);
            let parent_missing = || OutlineError::ParentNotFound {
                source_ref: parent.to_string(),
            };

            self.with_retry(|| {
                let (mut doc, version) = self.read_document(path)?.ok_or_else(parent_missing)?;
                let parent_pos = match find_entry(&doc, parent) {
                    Ok(pos) => pos,
                    Err(OutlineError::NotFound { .. }) => return Err(parent_missing()),
                    Err(e) => return Err(e),
                };

                let top = find_enclosing_top_level(&doc, parent_pos)?;
                let thread = thread_span(&doc, top)?;
                let index = reply_insertion_index(&doc, parent_pos)?;
                if index <= parent_pos.0 || index > thread.end {
                    return Err(OutlineError::MalformedDocument(format!(
                        "reply to {parent} would leave its thread"
                    )));
                }

                let depth = doc.entries[parent_pos.0].depth + 1;
                let entry = Entry::new(depth, new.title.as_str(), new.body.clone());
                if let Some(location) = existing_copy(&doc, &new.source_ref, &entry)? {
                    return Ok(location);
                }

                let pos = doc.insert(index, entry);
                self.store(path, &doc, &version, &new.files, &message)?;
                locate(&doc, pos)
            })
        }

        fn with_retry<T>(&self, mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
            match attempt() {
                Err(e) if e.is_transient() => attempt(),
                other => other,
            }
        }

        fn read_document(&self, path: &RelPath) -> Result<Option<(OutlineDocument, Version)>> {
            match self.repo.read(path) {
                Ok(snapshot) => {
                    let text = decode(path, snapshot.bytes)?;
                    Ok(Some((parse_outline(&text), snapshot.version)))
                }
                Err(StorageError::NotFound(_)) => Ok(None),
                Err(source) => Err(read_error(path, source)),
            }
        }

        fn store(
            &self,
            path: &RelPath,
            doc: &OutlineDocument,
            expected: &Version,
            files: &[StagedFile],
            message: &str,
        ) -> Result<Version> {
            let rendered = format_outline(doc);
            self.repo
                .write_with(path, rendered.as_bytes(), expected, files, message)
                .map_err(|source| match source {
                    StorageError::Conflict { .. } => OutlineError::ConcurrentModification {
                        path: path.to_string(),
                    },
                    source => OutlineError::RepositoryWriteError {
                        path: path.to_string(),
                        source,
                    },
                })
        }
    }

    fn read_error(path: &RelPath, source: StorageError) -> OutlineError {
        OutlineError::RepositoryReadError {
            path: path.to_string(),
            source,
        }
    }

    fn decode(path: &RelPath, bytes: Vec<u8>) -> Result<String> {
        String::from_utf8(bytes)
            .map_err(|_| OutlineError::MalformedDocument(format!("{path} is not valid UTF-8")))
    }

    fn locate(doc: &OutlineDocument, pos: EntryPosition) -> Result<EntryLocation> {
        doc.location(pos).ok_or_else(|| {
            OutlineError::MalformedDocument(format!("entry {} is out of range", pos.0))
        })
    }

    /// Title and body must keep the file's structure intact, and the title's
    /// last link must be the entry's own reference, or lookups would file the
    /// entry under something else.
    fn validate_new_entry(new: &NewEntry) -> Result<()> {
        if new.title.contains(['\n', '\r']) {
            return Err(OutlineError::InvalidEntry("title spans several lines".into()));
        }
        for line in &new.body {
            if line.contains('\n') {
                return Err(OutlineError::InvalidEntry(format!(
                    "body line {line:?} contains a newline"
                )));
            }
            if is_heading_line(line) {
                return Err(OutlineError::InvalidEntry(format!(
                    "body line {line:?} would start a new heading"
                )));
            }
        }
        match link_targets(&new.title).pop() {
            Some(target) if target == new.source_ref.as_str() => Ok(()),
            _ => Err(OutlineError::MissingReference {
                title: new.title.clone(),
            }),
        }
    }

    /// Whether `entry` is already in the document. A replayed request carries
    /// the same reference, depth and body; only the link description (the
    /// timestamp) may differ.
    fn existing_copy(
        doc: &OutlineDocument,
        source_ref: &SourceRef,
        entry: &Entry,
    ) -> Result<Option<EntryLocation>> {
        match find_entry(doc, source_ref) {
            Ok(pos) if same_entry(&doc.entries[pos.0], entry, source_ref) => {
                locate(doc, pos).map(Some)
            }
            Ok(_) => Err(OutlineError::DuplicateReference {
                source_ref: source_ref.to_string(),
            }),
            Err(OutlineError::NotFound { .. }) => Ok(None),
            Err(OutlineError::AmbiguousReference { .. }) => Err(OutlineError::DuplicateReference {
                source_ref: source_ref.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    fn same_entry(existing: &Entry, new: &Entry, source_ref: &SourceRef) -> bool {
        existing.depth == new.depth
            && existing.body == new.body
            && without_description(&existing.title, source_ref)
                == without_description(&new.title, source_ref)
    }

    /// `title` with the link to `source_ref` reduced to `[[source_ref]]`.
    fn without_description(title: &str, source_ref: &SourceRef) -> String {
        let open = format!("[[{source_ref}][");
        let Some(start) = title.rfind(&open) else {
            return title.to_string();
        };
        let described = start + open.len();
        match title[described..].find("]]") {
            Some(len) => format!(
                "{}[[{source_ref}]]{}",
                &title[..start],
                &title[described + len + 2..]
            ),
            None => title.to_string(),
        }
    }

}

pub mod compose {
    //! Heading and body text for journal, todo and reply entries.

    use crate::core::SourceRef;
    use crate::editor::NewEntry;
    use crate::parser::{is_heading_line, link_targets};
    use crate::storage::RelPath;
    use chrono::NaiveDateTime;

    /// Written in place of an empty message.
    pub const NO_TEXT: &str = "%% No text %%";
    pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M";

    /// Heading text (without stars) and body lines ready for the editor.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct EntryDraft {
        pub title: String,
        pub body: Vec<String>,
    }

    impl EntryDraft {
        pub fn into_entry(self, source_ref: SourceRef) -> NewEntry {
            NewEntry::new(source_ref, self.title, self.body)
        }
    }

    /// Images referenced from an entry body, rendered at a fixed width.
    #[derive(Debug, Clone, Copy)]
    pub struct Attachments<'a> {
        pub paths: &'a [RelPath],
        pub width: u32,
    }

    impl Attachments<'static> {
        pub const NONE: Self = Attachments {
            paths: &[],
            width: 0,
        };
    }

    impl Attachments<'_> {
        fn lines(&self) -> impl Iterator<Item = String> + '_ {
            self.paths.iter().flat_map(move |path| {
                [
                    format!("#+attr_html: :width {}px", self.width),
                    format!("[[file:{path}]]"),
                ]
            })
        }
    }

    fn link(source_ref: &SourceRef, at: NaiveDateTime) -> String {
        format!("[[{source_ref}][{}]]", at.format(TIMESTAMP_FORMAT))
    }

    pub fn journal_entry(
        source_ref: &SourceRef,
        at: NaiveDateTime,
        text: &str,
        attachments: Attachments<'_>,
    ) -> EntryDraft {
        EntryDraft {
            title: format!("Entry: {}", link(source_ref, at)),
            body: text_lines(text).into_iter().chain(attachments.lines()).collect(),
        }
    }

    /// First line of the text (minus any `todo ` prefix) becomes the heading.
    /// Bracket runs in it are broken up when they would swallow the trailing
    /// reference link.
    pub fn todo_entry(
        source_ref: &SourceRef,
        at: NaiveDateTime,
        text: &str,
        attachments: Attachments<'_>,
    ) -> EntryDraft {
        let text = strip_todo_prefix(text);
        let mut lines = text.lines();
        let first = lines.next().map(str::trim).filter(|l| !l.is_empty());
        let summary = first.unwrap_or(NO_TEXT);
        let suffix = link(source_ref, at);
        let mut title = format!("TODO {summary} {suffix}");
        if link_targets(&title).pop() != Some(source_ref.as_str()) {
            title = format!("TODO {} {suffix}", split_brackets(summary));
        }
        EntryDraft {
            title,
            body: lines.map(escape_line).chain(attachments.lines()).collect(),
        }
    }

    /// `[[` and `]]` become `[ [` and `] ]`, so the text opens no links.
    fn split_brackets(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut prev = None;
        for c in text.chars() {
            if matches!(c, '[' | ']') && prev == Some(c) {
                out.push(' ');
            }
            out.push(c);
            prev = Some(c);
        }
        out
    }

    pub fn reply_entry(
        source_ref: &SourceRef,
        at: NaiveDateTime,
        text: &str,
        attachments: Attachments<'_>,
    ) -> EntryDraft {
        EntryDraft {
            title: format!("Reply: {}", link(source_ref, at)),
            body: text_lines(text).into_iter().chain(attachments.lines()).collect(),
        }
    }

    pub fn is_todo(text: &str) -> bool {
        text.get(..5).is_some_and(|head| head.eq_ignore_ascii_case("todo "))
    }

    pub fn strip_todo_prefix(text: &str) -> &str {
        if is_todo(text) { &text[5..] } else { text }
    }

    /// Org's escape for body lines that would otherwise open a heading.
    pub fn escape_line(line: &str) -> String {
        if is_heading_line(line) {
            format!(",{line}")
        } else {
            line.to_string()
        }
    }

    fn text_lines(text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return vec![NO_TEXT.to_string()];
        }
        text.lines().map(escape_line).collect()
    }

}

pub mod config {
    use crate::core::Target;
    use crate::error::ConfigError;
    use crate::storage::RelPath;
    use serde::{Deserialize, Serialize};
    use std::{fs, path::Path};

    /// Where posts go and how created files look. Every field has a default, so
    /// an empty JSON object is a valid config.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct BotConfig {
        pub journal_file: String,
        pub todo_file: String,
        pub attachments_dir: String,
        pub image_width: u32,
        pub journal_title: Option<String>,
        pub todo_title: Option<String>,
        /// Files searched, in order, for the parent of a reply.
        pub reply_search: Vec<Target>,
    }

    impl Default for BotConfig {
        fn default() -> Self {
            Self {
                journal_file: "journal.org".into(),
                todo_file: "todo.org".into(),
                attachments_dir: "pics/telegram".into(),
                image_width: 600,
                journal_title: None,
                todo_title: None,
                reply_search: vec![Target::Journal, Target::Todo],
            }
        }
    }

    impl BotConfig {
        pub fn load(path: &Path) -> Result<Self, ConfigError> {
            let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
            config.validate()?;
            Ok(config)
        }

        pub fn validate(&self) -> Result<(), ConfigError> {
            self.file_for(Target::Journal)?;
            self.file_for(Target::Todo)?;
            self.attachments_path()?;
            if self.journal_file == self.todo_file {
                return Err(ConfigError::Invalid(
                    "journal_file and todo_file must differ".into(),
                ));
            }
            if self.image_width == 0 {
                return Err(ConfigError::Invalid("image_width must be positive".into()));
            }
            if self.reply_search.is_empty() {
                return Err(ConfigError::Invalid("reply_search is empty".into()));
            }
            Ok(())
        }

        pub fn file_for(&self, target: Target) -> Result<RelPath, ConfigError> {
            let raw = match target {
                Target::Journal => &self.journal_file,
                Target::Todo => &self.todo_file,
            };
            RelPath::new(raw.as_str()).map_err(|e| ConfigError::Invalid(e.to_string()))
        }

        pub fn title_for(&self, target: Target) -> Option<&str> {
            match target {
                Target::Journal => self.journal_title.as_deref(),
                Target::Todo => self.todo_title.as_deref(),
            }
        }

        pub fn attachments_path(&self) -> Result<RelPath, ConfigError> {
            RelPath::new(self.attachments_dir.as_str())
                .map_err(|e| ConfigError::Invalid(e.to_string()))
        }
    }

}

pub mod poster {
    //! Service layer between message ingress and the outline editor: picks the
    //! file, composes the entry and falls back to the journal when a reply's
    //! parent cannot be found.

    use crate::compose::{self, Attachments, EntryDraft};
    use crate::config::BotConfig;
    use crate::core::{EntryLocation, SourceRef, Target};
    use crate::editor::{NewEntry, OutlineEditor};
    use crate::error::{ConfigError, OutlineError, Result};
    use crate::storage::{RelPath, Repository, StagedFile};
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use tracing::{debug, info, warn};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Operation {
        Journal,
        Todo,
        Reply,
    }

    impl Operation {
        /// Replies win; otherwise a leading `todo ` marks a todo.
        pub fn classify(text: &str, has_reply_parent: bool) -> Self {
            if has_reply_parent {
                Operation::Reply
            } else if compose::is_todo(text) {
                Operation::Todo
            } else {
                Operation::Journal
            }
        }
    }

    impl fmt::Display for Operation {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                Operation::Journal => "journal",
                Operation::Todo => "todo",
                Operation::Reply => "reply",
            })
        }
    }

    /// One inbound message, already authorized and reduced to text.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PostRequest {
        /// Derived from the text and parent when absent.
        #[serde(default)]
        pub operation: Option<Operation>,
        #[serde(default)]
        pub text: String,
        /// Repository paths of already stored attachments.
        #[serde(default)]
        pub attachments: Vec<RelPath>,
        pub source_ref: SourceRef,
        #[serde(default)]
        pub parent_source_ref: Option<SourceRef>,
        /// Local time shown in the heading; now when absent.
        #[serde(default)]
        pub at: Option<NaiveDateTime>,
    }

    impl PostRequest {
        pub fn operation(&self) -> Operation {
            self.operation
                .unwrap_or_else(|| Operation::classify(&self.text, self.parent_source_ref.is_some()))
        }
    }

    /// Raw attachment bytes to be committed together with the entry.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Upload {
        /// Original file name; only its extension is kept.
        pub name: String,
        pub bytes: Vec<u8>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct PostOutcome {
        /// What was actually written: a reply that fell back is a journal post.
        pub operation: Operation,
        pub target: Target,
        pub path: RelPath,
        pub location: EntryLocation,
        pub fell_back: bool,
        /// Paths the uploads were stored under.
        pub attachments: Vec<RelPath>,
    }

    impl PostOutcome {
        pub fn acknowledgement(&self) -> &'static str {
            match self.operation {
                Operation::Journal => "Added to journal!",
                Operation::Todo => "Added to todo list!",
                Operation::Reply => "Added reply to entry!",
            }
        }
    }

    pub struct Poster<R> {
        editor: OutlineEditor<R>,
        config: BotConfig,
    }

    impl<R: Repository> Poster<R> {
        pub fn new(repo: R, config: BotConfig) -> std::result::Result<Self, ConfigError> {
            config.validate()?;
            let mut editor = OutlineEditor::new(repo);
            for target in [Target::Journal, Target::Todo] {
                if let Some(title) = config.title_for(target) {
                    editor = editor.with_title(config.file_for(target)?, title);
                }
            }
            Ok(Self { editor, config })
        }

        pub fn config(&self) -> &BotConfig {
            &self.config
        }

        pub fn editor(&self) -> &OutlineEditor<R> {
            &self.editor
        }

        pub fn path_for(&self, target: Target) -> Result<RelPath> {
            self.config
                .file_for(target)
                .map_err(|e| OutlineError::InvalidEntry(e.to_string()))
        }

        pub fn post_top_level(&self, target: Target, entry: &NewEntry) -> Result<EntryLocation> {
            let path = self.path_for(target)?;
            let location = self.editor.append_entry(&path, entry)?;
            info!(
                file = %target,
                path = %path,
                line = location.line,
                files = entry.files.len(),
                "posted entry"
            );
            Ok(location)
        }

        pub fn post_reply(
            &self,
            target: Target,
            parent: &SourceRef,
            entry: &NewEntry,
        ) -> Result<EntryLocation> {
            let path = self.path_for(target)?;
            let location = self.editor.insert_reply(&path, parent, entry)?;
            info!(file = %target, path = %path, %parent, depth = location.depth, "posted reply");
            Ok(location)
        }

        /// Content-addressed home of an upload: the same bytes always map to the
        /// same path and different bytes never share one.
        pub fn attachment_path(&self, upload: &Upload) -> Result<RelPath> {
            let dir = self
                .config
                .attachments_path()
                .map_err(|e| OutlineError::InvalidEntry(e.to_string()))?;
            let hash = blake3::hash(&upload.bytes).to_hex();
            let stem = &hash.as_str()[..16];
            let name = match extension(&upload.name) {
                Some(ext) => format!("{stem}.{ext}"),
                None => stem.to_string(),
            };
            dir.join(&name)
                .map_err(|e| OutlineError::InvalidEntry(e.to_string()))
        }

        /// First configured file whose outline contains `parent`.
        pub fn locate(&self, parent: &SourceRef) -> Result<Option<Target>> {
            for &target in &self.config.reply_search {
                match self.editor.find(&self.path_for(target)?, parent) {
                    Ok(_) => return Ok(Some(target)),
                    Err(OutlineError::NotFound { .. }) => {
                        debug!(file = %target, %parent, "parent not in file");
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(None)
        }

        pub fn handle(&self, request: &PostRequest) -> Result<PostOutcome> {
            self.handle_with(request, &[])
        }

        /// Like [`Poster::handle`], committing `uploads` in the same write as the
        /// entry that links them.
        pub fn handle_with(&self, request: &PostRequest, uploads: &[Upload]) -> Result<PostOutcome> {
            let at = request
                .at
                .unwrap_or_else(|| chrono::Local::now().naive_local());
            let files = uploads
                .iter()
                .map(|upload| {
                    Ok(StagedFile {
                        path: self.attachment_path(upload)?,
                        bytes: upload.bytes.clone(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let mut paths = request.attachments.clone();
            paths.extend(files.iter().map(|file| file.path.clone()));
            let attachments = Attachments {
                paths: &paths,
                width: self.config.image_width,
            };
            let source_ref = &request.source_ref;
            let entry = |draft: EntryDraft| {
                draft
                    .into_entry(source_ref.clone())
                    .with_files(files.clone())
            };
            let stored: Vec<RelPath> = files.iter().map(|file| file.path.clone()).collect();

            let operation = request.operation();
            if operation == Operation::Reply {
                if let Some(parent) = &request.parent_source_ref {
                    if let Some(target) = self.locate(parent)? {
                        let draft = compose::reply_entry(source_ref, at, &request.text, attachments);
                        match self.post_reply(target, parent, &entry(draft)) {
                            Ok(location) => {
                                return self.outcome(Operation::Reply, target, location, false, stored);
                            }
                            Err(e) if e.is_recoverable() => {
                                warn!(%parent, error = %e, "parent vanished, posting to journal");
                            }
                            Err(e) => return Err(e),
                        }
                    } else {
                        info!(%parent, "reply parent not found, posting to journal");
                    }
                } else {
                    warn!(%source_ref, "reply without parent, posting to journal");
                }
                let draft = compose::journal_entry(source_ref, at, &request.text, attachments);
                let location = self.post_top_level(Target::Journal, &entry(draft))?;
                return self.outcome(Operation::Journal, Target::Journal, location, true, stored);
            }

            let (target, draft): (Target, EntryDraft) = match operation {
                Operation::Todo => (
                    Target::Todo,
                    compose::todo_entry(source_ref, at, &request.text, attachments),
                ),
                _ => (
                    Target::Journal,
                    compose::journal_entry(source_ref, at, &request.text, attachments),
                ),
            };
            let location = self.post_top_level(target, &entry(draft))?;
            self.outcome(operation, target, location, false, stored)
        }

        fn outcome(
            &self,
            operation: Operation,
            target: Target,
            location: EntryLocation,
            fell_back: bool,
            attachments: Vec<RelPath>,
        ) -> Result<PostOutcome> {
            Ok(PostOutcome {
                operation,
                target,
                path: self.path_for(target)?,
                location,
                fell_back,
                attachments,
            })
        }
    }

    /// Lowercased extension of `name` when it is short and alphanumeric.
    fn extension(name: &str) -> Option<String> {
        let (_, ext) = name.rsplit_once('.')?;
        let plain = !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric());
        plain.then(|| ext.to_ascii_lowercase())
    }

}
