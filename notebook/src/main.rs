use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indexmap::IndexMap;
use notebook::core::{KnownSection, LogEntry, SessionIndex};
use notebook::parser::{parse_log_entries, parse_session_index};
use notebook::project::{default_cache_home, resolve_repo_root};
use notebook::{ProjectPaths, commit, merge_notebook_texts, parse_notebook_from_str, read_notebook};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "notebook",
    about = "Merge repo-local agent notebooks into the cached aggregate",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge the repo's `.agents/notebook.md` into the cached notebook and remove it.
    Migrate(MigrateArgs),

    /// Merge a source notebook into a destination notebook.
    Merge(MergeArgs),

    /// Normalize notebooks into canonical section order.
    Format(FormatArgs),

    /// Parse notebooks and print their sections, session ids, and log entries.
    Parse(ParseArgs),
}

#[derive(Debug, Args)]
struct MigrateArgs {
    /// Directory inside the repository to migrate. Defaults to the current directory.
    #[arg(long)]
    repo: Option<PathBuf>,
    /// Cache root holding aggregated notebooks (`<cache-home>/agents/<repo>/notebook.md`).
    #[arg(long, env = "XDG_CACHE_HOME")]
    cache_home: Option<PathBuf>,
    /// Print the merged notebook instead of publishing it.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct MergeArgs {
    /// Existing aggregate notebook; treated as empty if missing.
    destination: PathBuf,
    /// Newly arriving notebook.
    source: PathBuf,
    /// Publish the merged notebook to this path instead of printing it.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Notebook files to format.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Notebook files to parse.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Migrate(args) => handle_migrate(args),
        Commands::Merge(args) => handle_merge(args),
        Commands::Format(args) => handle_format(args),
        Commands::Parse(args) => handle_parse(args),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn handle_migrate(args: MigrateArgs) -> Result<()> {
    let MigrateArgs {
        repo,
        cache_home,
        dry_run,
    } = args;

    let start = match repo {
        Some(path) => path,
        None => std::env::current_dir().context("reading current directory")?,
    };
    let repo_root = resolve_repo_root(&start);
    let cache_home = resolve_cache_home(cache_home)?;
    let paths = ProjectPaths::resolve(&repo_root, &cache_home);
    debug!(?paths, "resolved notebook paths");

    match migrate(&paths, dry_run)? {
        Migration::NothingToMigrate => println!("No repo notebook found, nothing to migrate."),
        Migration::DryRun(merged) => print!("{merged}"),
        Migration::Migrated => println!("Migrated notebook to {}", paths.destination.display()),
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Migration {
    NothingToMigrate,
    DryRun(String),
    Migrated,
}

fn migrate(paths: &ProjectPaths, dry_run: bool) -> Result<Migration> {
    let Some(source) = read_notebook(&paths.source)? else {
        return Ok(Migration::NothingToMigrate);
    };
    // Read the aggregate as late as possible; other processes may publish to it too.
    let destination = read_notebook(&paths.destination)?.unwrap_or_default();
    let merged = merge_notebook_texts(&destination, &source);

    if dry_run {
        return Ok(Migration::DryRun(merged));
    }
    commit(&merged, &paths.destination, Some(&paths.source)).context("migration failed")?;
    Ok(Migration::Migrated)
}

fn resolve_cache_home(explicit: Option<PathBuf>) -> Result<PathBuf> {
    explicit
        .filter(|path| !path.as_os_str().is_empty())
        .or_else(default_cache_home)
        .context("could not determine a cache directory; pass --cache-home")
}

fn handle_merge(args: MergeArgs) -> Result<()> {
    let MergeArgs {
        destination,
        source,
        output,
    } = args;

    let Some(source_text) = read_notebook(&source)? else {
        eprintln!("No notebook at {:?}, nothing to merge.", source);
        return Ok(());
    };
    let destination_text = read_notebook(&destination)?.unwrap_or_default();
    let merged = merge_notebook_texts(&destination_text, &source_text);

    match output {
        Some(path) => {
            commit(&merged, &path, None).with_context(|| format!("writing {:?}", path))?;
            println!("Wrote merged notebook to {:?}", path);
        }
        None => print!("{merged}"),
    }
    Ok(())
}

fn handle_format(args: FormatArgs) -> Result<()> {
    let FormatArgs { inputs, in_place } = args;

    for (idx, path) in inputs.iter().enumerate() {
        debug!(path = %path.display(), "formatting notebook");
        let formatted = format_file(path)?;
        if in_place {
            commit(&formatted, path, None).with_context(|| format!("writing {:?}", path))?;
            continue;
        }
        if inputs.len() > 1 {
            if idx > 0 {
                println!();
            }
            println!("== {} ==", path.display());
        }
        print!("{formatted}");
    }
    Ok(())
}

fn format_file(path: &Path) -> Result<String> {
    let text = read_notebook(path)?.with_context(|| format!("{:?} does not exist", path))?;
    Ok(merge_notebook_texts(&text, ""))
}

#[derive(Debug, serde::Serialize)]
struct ParsedNotebook {
    path: String,
    sections: IndexMap<String, Vec<String>>,
    session_index: SessionIndex,
    log: Vec<LogEntry>,
}

fn parse_file(path: &Path) -> Result<ParsedNotebook> {
    let text = read_notebook(path)?.with_context(|| format!("{:?} does not exist", path))?;
    let notebook = parse_notebook_from_str(&text);
    let session_index = parse_session_index(notebook.known_body(KnownSection::SessionIndex));
    let log = parse_log_entries(notebook.known_body(KnownSection::Log));
    Ok(ParsedNotebook {
        path: path.display().to_string(),
        sections: notebook.sections,
        session_index,
        log,
    })
}

fn handle_parse(args: ParseArgs) -> Result<()> {
    let ParseArgs { inputs, json } = args;

    let mut parsed = Vec::new();
    for path in &inputs {
        debug!(path = %path.display(), "parsing notebook");
        parsed.push(parse_file(path).with_context(|| format!("parsing {:?}", path))?);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&parsed)?);
    } else {
        for (idx, notebook) in parsed.iter().enumerate() {
            if parsed.len() > 1 {
                println!("== {} ==", notebook.path);
            }
            println!("{:#?}", notebook);
            if parsed.len() > 1 && idx + 1 < parsed.len() {
                println!();
            }
        }
    }
    Ok(())
}
