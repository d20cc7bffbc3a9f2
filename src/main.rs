//! # fofa-harvest CLI (`harvest`)
//!
//! The `harvest` binary drives extraction jobs, key classification and
//! query monitors.
//!
//! ## Usage
//!
//! ```bash
//! harvest --config ./config/harvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest init` | Create the SQLite database and run schema migrations |
//! | `harvest keys check` | Verify every key and cache its privilege level |
//! | `harvest keys list` | Show cached key levels |
//! | `harvest extract "<query>"` | Extract every record of a query |
//! | `harvest update "<query>"` | Merge records newer than the last extraction |
//! | `harvest history` | List finished extractions |
//! | `harvest monitor <action>` | Manage and run query monitors |
//!
//! ## Examples
//!
//! ```bash
//! # Endpoints of a large query, peeled by country
//! harvest extract 'app="Redis"' --mode peel
//!
//! # Custom fields to CSV, at most 5000 rows
//! harvest extract 'title="admin"' --fields host,ip,port,title --limit 5000
//!
//! # Watch a query and run monitors in the foreground
//! harvest monitor add 'port="6379" && country="DE"'
//! harvest monitor daemon
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fofa_harvest::extract::{ExtractMode, ExtractRequest};
use fofa_harvest::progress::ProgressMode;
use fofa_harvest::{config, extract, history, keys, migrate, monitor};

/// fofa-harvest: bulk extraction past the 10,000-record query cap.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/harvest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Bulk extraction and monitoring for capped, rate-limited search APIs",
    version,
    long_about = "fofa-harvest turns one logical query into a complete, deduplicated result set \
    despite the per-query record cap, rotating across API keys of different privilege, and \
    keeps saved queries under observation with an adaptive polling interval."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file with the history and key-level
    /// tables. Safe to run repeatedly.
    Init,

    /// Verify or list API keys.
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /// Extract every record of a query.
    ///
    /// Without `--fields`, collects `host:port` endpoints and writes one per
    /// line. With `--fields`, collects raw field tuples and writes CSV.
    Extract {
        /// The search query.
        query: String,

        /// Strategy: `auto`, `direct`, `traceback`, or `peel`.
        #[arg(long, default_value = "auto")]
        mode: String,

        /// Comma-separated fields to export instead of endpoints.
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,

        /// Stop after this many unique records.
        #[arg(long)]
        limit: Option<usize>,

        /// Output file (default: generated under `extract.output_dir`).
        #[arg(long)]
        output: Option<PathBuf>,

        /// Progress output: `auto`, `human`, `json`, or `off`.
        #[arg(long, default_value = "auto")]
        progress: String,
    },

    /// Merge records newer than the recorded extraction of a query.
    Update {
        query: String,

        /// Progress output: `auto`, `human`, `json`, or `off`.
        #[arg(long, default_value = "auto")]
        progress: String,
    },

    /// List finished extractions.
    History,

    /// Manage query monitors.
    Monitor {
        #[command(subcommand)]
        action: MonitorAction,
    },
}

#[derive(Subcommand)]
enum KeysAction {
    /// Verify every configured key against the remote and cache its level.
    Check,
    /// Show cached levels without contacting the remote.
    List,
}

#[derive(Subcommand)]
enum MonitorAction {
    /// Start monitoring a query.
    Add {
        query: String,
        /// Opaque notification target passed to the notifier.
        #[arg(long)]
        target: Option<String>,
    },
    /// List monitor tasks.
    List,
    /// Deactivate a monitor task.
    Del { id: String },
    /// Print everything a monitor has collected.
    Get { id: String },
    /// Set how many new records trigger a notification.
    Threshold { id: String, threshold: u64 },
    /// Run one cycle of a task now.
    RunOnce { id: String },
    /// Run every active task until interrupted.
    Daemon,
}

fn parse_progress(value: &str) -> anyhow::Result<ProgressMode> {
    match value {
        "auto" => Ok(ProgressMode::default_for_tty()),
        "human" => Ok(ProgressMode::Human),
        "json" => Ok(ProgressMode::Json),
        "off" => Ok(ProgressMode::Off),
        other => anyhow::bail!(
            "Unknown progress mode: '{}'. Must be auto, human, json, or off.",
            other
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Keys { action } => match action {
            KeysAction::Check => keys::run_keys_check(&cfg).await?,
            KeysAction::List => keys::run_keys_list(&cfg).await?,
        },
        Commands::Extract {
            query,
            mode,
            fields,
            limit,
            output,
            progress,
        } => {
            let mode: ExtractMode = mode.parse()?;
            let mut request = ExtractRequest::new(query, mode);
            request.fields = fields
                .into_iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect();
            request.limit = limit;
            extract::run_extract(&cfg, request, output, parse_progress(&progress)?).await?;
        }
        Commands::Update { query, progress } => {
            extract::run_update(&cfg, &query, parse_progress(&progress)?).await?;
        }
        Commands::History => {
            history::run_history(&cfg).await?;
        }
        Commands::Monitor { action } => match action {
            MonitorAction::Add { query, target } => {
                monitor::run_monitor_add(&cfg, &query, target)?;
            }
            MonitorAction::List => monitor::run_monitor_list(&cfg)?,
            MonitorAction::Del { id } => monitor::run_monitor_del(&cfg, &id)?,
            MonitorAction::Get { id } => monitor::run_monitor_get(&cfg, &id)?,
            MonitorAction::Threshold { id, threshold } => {
                monitor::run_monitor_threshold(&cfg, &id, threshold)?;
            }
            MonitorAction::RunOnce { id } => monitor::run_monitor_once(&cfg, &id).await?,
            MonitorAction::Daemon => monitor::run_monitor_daemon(&cfg).await?,
        },
    }

    Ok(())
}
