//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use tracing::{info, warn};

use storyforge_core::{Orchestrator, build_processor, ensure_task_entry, split_options};
use storyforge_scheduler::{CancellationToken, PauseSignal, RateLimiterRegistry};
use storyforge_shared::{
    AppConfig, Book, BookId, ChunkStatus, GenerationKind, RunConfig, StoryforgeError,
    init_config, load_config, validate_api_key,
};
use storyforge_splitter::ApproxTokenizer;
use storyforge_storage::Storage;

use crate::progress::CliProgress;

const DATABASE_FILE: &str = "storyforge.db";

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// storyforge: illustrate and translate books, resumably.
#[derive(Parser)]
#[command(
    name = "storyforge",
    version,
    about = "Generate illustrations and translations for long-form text in resumable runs.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Import a book tree from JSON.
    Import {
        /// Path to the book JSON (`{title, chapters: [{id, title, lines: [{id, text}]}]}`).
        path: PathBuf,
    },

    /// List imported books.
    List,

    /// Split a book into chunks for one generation kind.
    Split {
        /// Book ID.
        #[arg(long)]
        book: BookId,

        /// Generation kind: illustration or translation.
        #[arg(long)]
        kind: GenerationKind,

        /// Discard the existing chunk list and split again.
        #[arg(long)]
        resplit: bool,
    },

    /// Run (or resume) generation for a book.
    Run {
        /// Book ID.
        #[arg(long)]
        book: BookId,

        /// Generation kind: illustration or translation.
        #[arg(long)]
        kind: GenerationKind,

        /// Hold off new chunks and calls while this file exists.
        #[arg(long)]
        pause_file: Option<PathBuf>,
    },

    /// Show per-kind chunk status for a book.
    Status {
        /// Book ID.
        #[arg(long)]
        book: BookId,
    },

    /// Move failed chunks back to pending.
    Reset {
        /// Book ID.
        #[arg(long)]
        book: BookId,

        /// Generation kind: illustration or translation.
        #[arg(long)]
        kind: GenerationKind,
    },

    /// Delete a book together with its chunk lists.
    Delete {
        /// Book ID.
        #[arg(long)]
        book: BookId,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "storyforge=info",
        1 => "storyforge=debug",
        _ => "storyforge=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Import { path } => cmd_import(&path).await,
        Command::List => cmd_list().await,
        Command::Split {
            book,
            kind,
            resplit,
        } => cmd_split(&book, kind, resplit).await,
        Command::Run {
            book,
            kind,
            pause_file,
        } => cmd_run(&book, kind, pause_file).await,
        Command::Status { book } => cmd_status(&book).await,
        Command::Reset { book, kind } => cmd_reset(&book, kind).await,
        Command::Delete { book } => cmd_delete(&book).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

fn database_path(config: &AppConfig) -> Result<PathBuf> {
    Ok(config.data_dir()?.join(DATABASE_FILE))
}

async fn open_storage(config: &AppConfig) -> Result<Storage> {
    Ok(Storage::open(&database_path(config)?).await?)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_import(path: &Path) -> Result<()> {
    let config = load_config()?;
    let raw = std::fs::read_to_string(path)
        .map_err(|e| eyre!("cannot read '{}': {e}", path.display()))?;
    let book: Book = serde_json::from_str(&raw)
        .map_err(|e| eyre!("'{}' is not a valid book tree: {e}", path.display()))?;
    book.validate()?;

    let storage = open_storage(&config).await?;
    storage.save_book(&book).await?;

    let lines: usize = book.chapters.iter().map(|c| c.lines.len()).sum();
    info!(book = %book.id, chapters = book.chapters.len(), lines, "book imported");

    println!();
    println!("  Book imported.");
    println!("  ID:       {}", book.id);
    println!("  Title:    {}", book.title);
    println!("  Chapters: {}", book.chapters.len());
    println!("  Lines:    {lines}");
    println!();
    Ok(())
}

async fn cmd_list() -> Result<()> {
    let config = load_config()?;
    let storage = match Storage::open_readonly(&database_path(&config)?).await {
        Ok(storage) => storage,
        Err(StoryforgeError::NotFound(_)) => {
            println!("No books imported yet.");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let books = storage.list_books().await?;
    if books.is_empty() {
        println!("No books imported yet.");
        return Ok(());
    }
    for book in books {
        println!(
            "{}  {}  (updated {})",
            book.id,
            book.title,
            book.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

async fn cmd_split(book_id: &BookId, kind: GenerationKind, resplit: bool) -> Result<()> {
    let config = load_config()?;
    config.validate()?;
    let run_config = RunConfig::for_kind(&config, kind)?;
    let storage = open_storage(&config).await?;
    let book = storage.load_book(book_id).await?;

    let options = split_options(kind, &run_config, config.illustration.units_per_chapter);
    let entry = ensure_task_entry(&storage, &book, kind, &options, &ApproxTokenizer, resplit).await?;

    println!(
        "{kind}: {} chunk(s), {} completed",
        entry.chunks.len(),
        entry.completed_count()
    );
    Ok(())
}

async fn cmd_run(book_id: &BookId, kind: GenerationKind, pause_file: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    config.validate()?;

    // Fail before any network call if a key is missing.
    validate_api_key(config.language_model_for(kind)?)?;
    if let Some(media) = config.media_for(kind)? {
        validate_api_key(media)?;
    }

    let run_config = RunConfig::for_kind(&config, kind)?;
    let storage = Arc::new(open_storage(&config).await?);
    let book = storage.load_book(book_id).await?;
    let options = split_options(kind, &run_config, config.illustration.units_per_chapter);
    ensure_task_entry(&*storage, &book, kind, &options, &ApproxTokenizer, false).await?;

    let limiters = RateLimiterRegistry::new();
    let processor = build_processor(&config, kind, &limiters)?;
    let orchestrator = Orchestrator::new(storage, processor, run_config);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight chunks");
            on_signal.cancel();
        }
    });

    let pause: Arc<dyn PauseSignal> = match pause_file {
        Some(path) => Arc::new(move || path.exists()),
        None => Arc::new(|| false),
    };

    info!(book = %book_id, %kind, "starting generation run");
    let progress = Arc::new(CliProgress::new());

    match orchestrator.run(book_id, &cancel, progress.clone(), pause).await {
        Ok(summary) => {
            println!();
            println!("  Run finished.");
            println!("  Chunks:    {}", summary.total);
            println!("  Completed: {} ({} this run)", summary.completed_overall(), summary.completed);
            println!("  Failed:    {}", summary.failed);
            println!("  Time:      {:.1}s", summary.elapsed.as_secs_f64());
            if summary.failed > 0 {
                println!();
                println!("  Run again to retry failed chunks.");
            }
            println!();
            Ok(())
        }
        Err(StoryforgeError::Cancelled) => {
            progress.abandon();
            println!();
            println!("  Run cancelled. Finished chunks were saved; run again to resume.");
            println!();
            Ok(())
        }
        Err(e) => {
            progress.abandon();
            Err(e.into())
        }
    }
}

async fn cmd_status(book_id: &BookId) -> Result<()> {
    let config = load_config()?;
    let storage = Storage::open_readonly(&database_path(&config)?).await?;
    let book = storage.load_book(book_id).await?;

    println!();
    println!("  {} ({})", book.title, book.id);
    for kind in [GenerationKind::Illustration, GenerationKind::Translation] {
        let Some(entry) = storage.load_task_entry(book_id, kind).await? else {
            println!("  {kind:<13} not split");
            continue;
        };
        let count = |status: ChunkStatus| entry.chunks.iter().filter(|c| c.status == status).count();
        println!(
            "  {kind:<13} {:<9} {:>5.1}%  completed {}  pending {}  running {}  failed {}",
            entry.status.as_str(),
            entry.progress() * 100.0,
            count(ChunkStatus::Completed),
            count(ChunkStatus::Pending),
            count(ChunkStatus::Running),
            count(ChunkStatus::Failed),
        );
        if let Some(err) = &entry.last_error {
            println!("  {:<13} last error: {err}", "");
        }
    }
    println!();
    Ok(())
}

async fn cmd_reset(book_id: &BookId, kind: GenerationKind) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let mut entry = storage
        .load_task_entry(book_id, kind)
        .await?
        .ok_or_else(|| eyre!("book {book_id} has no {kind} chunks; run `storyforge split` first"))?;

    let reset = entry.reset_failed();
    entry.status = entry.derive_status();
    entry.last_error = None;
    entry.touch();
    storage.save_task_entry(&entry).await?;

    println!("{kind}: {reset} failed chunk(s) reset to pending");
    Ok(())
}

async fn cmd_delete(book_id: &BookId) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    if storage.delete_book(book_id).await? {
        println!("Deleted book {book_id}");
        Ok(())
    } else {
        Err(eyre!("no book with id {book_id}"))
    }
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
