mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::actions::ActionsSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "tickd",
    about = "Lease-guarded action executor: durable queue, retries, dead letters, operator control",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .tickd/)
    #[arg(long, global = true, env = "TICKD_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .tickd/ with a default config and an initialized store
    Init {
        /// Store backend: sqlite (multi-process) or redb (single process)
        #[arg(long, default_value = "sqlite")]
        backend: String,
    },

    /// Run the executor loop until killed, interrupted, or --max-ticks is reached
    Run {
        /// Stop after this many loop iterations
        #[arg(long)]
        max_ticks: Option<u64>,
    },

    /// Submit an action (duplicate keys return the existing record)
    Enqueue {
        /// POST_SOCIAL, SEND_MESSAGE, SEND_EMAIL, CRM_SYNC or WEBHOOK
        action_type: String,
        /// Idempotency key
        #[arg(long)]
        key: String,
        /// Inline JSON payload
        #[arg(long, conflicts_with = "payload_file")]
        payload: Option<String>,
        /// Read the JSON payload from a file
        #[arg(long)]
        payload_file: Option<PathBuf>,
    },

    /// Show control flags, lease holder, queue depth and recent history
    Status,

    /// Stop claiming work; the leader keeps renewing its lease
    Pause,

    /// Resume claiming work
    Resume,

    /// Stop every daemon sharing this store at its next tick boundary
    Kill {
        /// Clear the kill flag instead
        #[arg(long)]
        clear: bool,
    },

    /// Show or switch the execution mode (proof | real)
    Mode { mode: Option<String> },

    /// Inspect queued actions
    Actions {
        #[command(subcommand)]
        subcommand: ActionsSubcommand,
    },

    /// Move a dead-lettered action back to PENDING with a fresh attempt budget
    Requeue { id: String },

    /// Serve the HTTP API
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "7741")]
        port: u16,

        /// Also run the executor loop in this process
        #[arg(long)]
        daemon: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } | Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init { backend } => cmd::init::run(&root, &backend, cli.json),
        Commands::Run { max_ticks } => cmd::run::run(&root, max_ticks, cli.json),
        Commands::Enqueue {
            action_type,
            key,
            payload,
            payload_file,
        } => cmd::enqueue::run(
            &root,
            &action_type,
            &key,
            payload.as_deref(),
            payload_file.as_deref(),
            cli.json,
        ),
        Commands::Status => cmd::status::run(&root, cli.json),
        Commands::Pause => cmd::control::pause(&root, cli.json),
        Commands::Resume => cmd::control::resume(&root, cli.json),
        Commands::Kill { clear } => cmd::control::kill(&root, clear, cli.json),
        Commands::Mode { mode } => cmd::control::mode(&root, mode.as_deref(), cli.json),
        Commands::Actions { subcommand } => cmd::actions::run(&root, subcommand, cli.json),
        Commands::Requeue { id } => cmd::actions::requeue(&root, &id, cli.json),
        Commands::Serve { port, daemon } => cmd::serve::run(&root, port, daemon),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
