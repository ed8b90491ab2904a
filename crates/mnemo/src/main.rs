//! mnemo - git-native semantic memory for developer assistants.
//!
//! Main entry point for the mnemo CLI.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{capture, gc, recall, search, status, sync, Context};

/// mnemo - git-native semantic memory for developer assistants
#[derive(Parser)]
#[command(name = "mnemo")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Repository to operate on (defaults to the current directory)
    #[arg(long, global = true, env = "MNEMO_REPO")]
    pub repo: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture a memory onto a commit
    Capture(capture::CaptureArgs),

    /// Hydrate a memory by id
    Recall(recall::RecallArgs),

    /// Search memories semantically
    Search(search::SearchArgs),

    /// Show index statistics and health
    Status(status::StatusArgs),

    /// Reconcile git notes and the index
    Sync(sync::SyncArgs),

    /// Run lifecycle transitions and collect old tombstones
    Gc(gc::GcArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let ctx = Context {
        json: cli.json,
        verbose: cli.verbose,
        repo: cli.repo.unwrap_or_else(|| PathBuf::from(".")),
        config: mnemo_config::Config::from_env(),
    };

    let result = match cli.command {
        Commands::Capture(args) => capture::run(args, &ctx).await,
        Commands::Recall(args) => recall::run(args, &ctx).await,
        Commands::Search(args) => search::run(args, &ctx).await,
        Commands::Status(args) => status::run(args, &ctx).await,
        Commands::Sync(args) => sync::run(args, &ctx).await,
        Commands::Gc(args) => gc::run(args, &ctx).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let red = console::Style::new().red();
            eprintln!("{} {e}", red.apply_to("error:"));
            eprintln!("  {}", e.recovery_action());
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
