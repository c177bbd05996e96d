use std::{
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use orgpost::compose::{self, Attachments};
use orgpost::config::BotConfig;
use orgpost::core::{SourceRef, Target};
use orgpost::github::{DEFAULT_API_URL, GitHubRepository, GitHubSettings};
use orgpost::poster::{Operation, PostOutcome, PostRequest, Poster, Upload};
use orgpost::storage::{LocalRepository, Repository, StagedFile};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "orgpost",
    about = "File chat messages into Org journal and todo outlines",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// JSON config file; built-in defaults when omitted.
    #[arg(long, global = true, env = "ORGPOST_CONFIG")]
    config: Option<PathBuf>,
    #[command(flatten)]
    backend: BackendArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct BackendArgs {
    /// Directory holding the outline files (local backend).
    #[arg(long, global = true, env = "ORGPOST_ROOT", default_value = ".")]
    root: PathBuf,
    /// `owner/name` of a GitHub repository; selects the GitHub backend.
    #[arg(long, global = true, env = "GITHUB_REPO")]
    github_repo: Option<String>,
    #[arg(long, global = true, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,
    #[arg(long, global = true, env = "GITHUB_BRANCH", default_value = "main")]
    github_branch: String,
    #[arg(long, global = true, env = "GITHUB_API_URL", default_value = DEFAULT_API_URL)]
    github_api_url: String,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Append a journal entry.
    Journal(PostArgs),

    /// Append a todo entry.
    Todo(PostArgs),

    /// Reply to an existing entry, falling back to the journal if it is missing.
    Reply(ReplyArgs),

    /// Dispatch a JSON post request read from a file or stdin.
    Handle(HandleArgs),

    /// Print where the entry for a reference lives.
    Find(FindArgs),

    /// Report headings that skip levels.
    Check(CheckArgs),
}

#[derive(Debug, Args)]
struct PostArgs {
    /// Message text.
    text: String,
    /// Reference embedded in the heading. Defaults to a fresh urn:uuid.
    #[arg(long = "ref")]
    source_ref: Option<String>,
    /// Image files to commit with the entry and link from it.
    #[arg(long = "attach")]
    attachments: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct ReplyArgs {
    #[command(flatten)]
    post: PostArgs,
    /// Reference of the entry being answered.
    #[arg(long)]
    parent: String,
    /// Only look in this file; no journal fallback.
    #[arg(long, value_enum)]
    target: Option<TargetArg>,
}

#[derive(Debug, Args)]
struct HandleArgs {
    /// Request file, or `-` for stdin.
    #[arg(default_value = "-")]
    input: PathBuf,
    /// Print the outcome as JSON instead of the acknowledgement.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FindArgs {
    #[arg(long = "ref")]
    source_ref: String,
    /// Restrict the search to one file.
    #[arg(long, value_enum)]
    target: Option<TargetArg>,
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// File to check; both when omitted.
    #[arg(long, value_enum)]
    target: Option<TargetArg>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum TargetArg {
    Journal,
    Todo,
}

impl From<TargetArg> for Target {
    fn from(value: TargetArg) -> Self {
        match value {
            TargetArg::Journal => Target::Journal,
            TargetArg::Todo => Target::Todo,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    run(cli, &mut io::stdout().lock())
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli, out: &mut impl Write) -> Result<()> {
    let config = match &cli.config {
        Some(path) => BotConfig::load(path)?,
        None => BotConfig::default(),
    };
    let poster = Poster::new(open_repository(&cli.backend)?, config)?;

    match cli.command {
        Commands::Journal(args) => handle_post(&poster, Operation::Journal, args, out),
        Commands::Todo(args) => handle_post(&poster, Operation::Todo, args, out),
        Commands::Reply(args) => handle_reply(&poster, args, out),
        Commands::Handle(args) => handle_request(&poster, args, out),
        Commands::Find(args) => handle_find(&poster, args, out),
        Commands::Check(args) => handle_check(&poster, args, out),
    }
}

fn open_repository(args: &BackendArgs) -> Result<Box<dyn Repository>> {
    match &args.github_repo {
        Some(repo) => {
            let token = args
                .github_token
                .clone()
                .context("--github-token (or GITHUB_TOKEN) is required with --github-repo")?;
            let github = GitHubRepository::new(GitHubSettings {
                repo: repo.clone(),
                branch: args.github_branch.clone(),
                token,
                api_url: args.github_api_url.clone(),
            })
            .context("failed to build GitHub client")?;
            Ok(Box::new(github))
        }
        None => {
            if !args.root.is_dir() {
                anyhow::bail!("{:?} is not a directory", args.root);
            }
            Ok(Box::new(LocalRepository::new(&args.root)))
        }
    }
}

fn source_ref_or_generate(raw: Option<String>) -> Result<SourceRef> {
    match raw {
        Some(raw) => SourceRef::new(raw).context("invalid --ref"),
        None => Ok(SourceRef::generate()),
    }
}

fn read_uploads(files: &[PathBuf]) -> Result<Vec<Upload>> {
    files
        .iter()
        .map(|file| {
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("{:?} has no usable file name", file))?;
            let bytes = fs::read(file).with_context(|| format!("failed to read {:?}", file))?;
            Ok(Upload {
                name: name.to_string(),
                bytes,
            })
        })
        .collect()
}

fn post_request(
    operation: Operation,
    args: PostArgs,
    parent: Option<SourceRef>,
) -> Result<(PostRequest, Vec<Upload>)> {
    let uploads = read_uploads(&args.attachments)?;
    let request = PostRequest {
        operation: Some(operation),
        attachments: vec![],
        source_ref: source_ref_or_generate(args.source_ref)?,
        text: args.text,
        parent_source_ref: parent,
        at: None,
    };
    Ok((request, uploads))
}

fn report(outcome: &PostOutcome, out: &mut impl Write) -> Result<()> {
    writeln!(out, "{}", outcome.acknowledgement())?;
    if outcome.fell_back {
        writeln!(out, "(reply parent not found; posted as a journal entry)")?;
    }
    writeln!(
        out,
        "{}:{} depth {}",
        outcome.path,
        outcome.location.line + 1,
        outcome.location.depth
    )?;
    Ok(())
}

fn handle_post<R: Repository>(
    poster: &Poster<R>,
    operation: Operation,
    args: PostArgs,
    out: &mut impl Write,
) -> Result<()> {
    let (request, uploads) = post_request(operation, args, None)?;
    let outcome = poster
        .handle_with(&request, &uploads)
        .with_context(|| format!("failed to post {operation} entry"))?;
    report(&outcome, out)
}

fn handle_reply<R: Repository>(poster: &Poster<R>, args: ReplyArgs, out: &mut impl Write) -> Result<()> {
    let parent = SourceRef::new(args.parent).context("invalid --parent")?;
    let (request, uploads) = post_request(Operation::Reply, args.post, Some(parent.clone()))?;

    let Some(target) = args.target.map(Target::from) else {
        let outcome = poster
            .handle_with(&request, &uploads)
            .context("failed to post reply")?;
        return report(&outcome, out);
    };

    let at = chrono::Local::now().naive_local();
    let files = uploads
        .iter()
        .map(|upload| {
            Ok(StagedFile {
                path: poster.attachment_path(upload)?,
                bytes: upload.bytes.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let paths: Vec<_> = files.iter().map(|file| file.path.clone()).collect();
    let attachments = Attachments {
        paths: &paths,
        width: poster.config().image_width,
    };
    let entry = compose::reply_entry(&request.source_ref, at, &request.text, attachments)
        .into_entry(request.source_ref.clone())
        .with_files(files);
    let location = poster
        .post_reply(target, &parent, &entry)
        .with_context(|| format!("failed to reply to {parent} in the {target} file"))?;
    let outcome = PostOutcome {
        operation: Operation::Reply,
        target,
        path: poster.path_for(target)?,
        location,
        fell_back: false,
        attachments: paths,
    };
    report(&outcome, out)
}

fn read_input(input: &Path) -> Result<String> {
    if input == Path::new("-") {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read request from stdin")?;
        Ok(buf)
    } else {
        fs::read_to_string(input).with_context(|| format!("failed to read {:?}", input))
    }
}

fn handle_request<R: Repository>(poster: &Poster<R>, args: HandleArgs, out: &mut impl Write) -> Result<()> {
    let raw = read_input(&args.input)?;
    let request: PostRequest = serde_json::from_str(&raw).context("invalid post request JSON")?;
    let outcome = poster.handle(&request).context("failed to handle request")?;
    if args.json {
        writeln!(out, "{}", serde_json::to_string_pretty(&outcome)?)?;
        Ok(())
    } else {
        report(&outcome, out)
    }
}

fn handle_find<R: Repository>(poster: &Poster<R>, args: FindArgs, out: &mut impl Write) -> Result<()> {
    let source_ref = SourceRef::new(args.source_ref).context("invalid --ref")?;
    let target = match args.target {
        Some(target) => target.into(),
        None => poster
            .locate(&source_ref)?
            .with_context(|| format!("no entry references {source_ref}"))?,
    };
    let path = poster.path_for(target)?;
    let location = poster.editor().find(&path, &source_ref)?;
    writeln!(out, "{}:{} depth {}", path, location.line + 1, location.depth)?;
    Ok(())
}

fn handle_check<R: Repository>(poster: &Poster<R>, args: CheckArgs, out: &mut impl Write) -> Result<()> {
    let targets = match args.target {
        Some(target) => vec![target.into()],
        None => vec![Target::Journal, Target::Todo],
    };

    let mut problems = 0;
    for target in targets {
        let path = poster.path_for(target)?;
        let doc = poster
            .editor()
            .load(&path)
            .with_context(|| format!("failed to load {path}"))?;
        let violations = doc.depth_violations();
        for pos in &violations {
            if let Some(location) = doc.location(*pos) {
                writeln!(
                    out,
                    "{}:{}: heading at depth {} skips a level",
                    path,
                    location.line + 1,
                    location.depth
                )?;
            }
        }
        if violations.is_empty() {
            match doc.title() {
                Some(title) => writeln!(out, "{path} ({title}): {} entries, ok", doc.len())?,
                None => writeln!(out, "{path}: {} entries, ok", doc.len())?,
            }
        }
        problems += violations.len();
    }

    if problems > 0 {
        anyhow::bail!("{problems} heading(s) skip a level");
    }
    Ok(())
}
