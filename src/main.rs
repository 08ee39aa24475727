#![forbid(unsafe_code)]

//! `audit-chain`: audit trail maintenance binary.
//!
//! Bootstraps the audit database and prints the records of one correlation
//! chain for inspection.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use audit_chain::persistence::db;
use audit_chain::store::{AuditStore, SqliteAuditStore};
use audit_chain::{AppError, AuditConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "audit-chain", about = "Hierarchical audit trail tools", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured database path.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the audit database and its tables.
    Init,
    /// Print every record sharing a correlation id as JSON.
    Trail {
        /// Correlation id to look up.
        correlation_id: String,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => AuditConfig::load_from_path(path)?,
        None => AuditConfig::default(),
    };
    if let Some(db_path) = args.db {
        config.db_path = db_path;
    }

    // ── Initialize database ─────────────────────────────
    let pool = Arc::new(db::connect(&config.db_path).await?);
    info!(db_path = %config.db_path.display(), "audit database ready");

    match args.command {
        Command::Init => Ok(()),
        Command::Trail { correlation_id } => {
            let store = SqliteAuditStore::new(pool).with_write_timeout(config.write_timeout());
            let trail = store.trail(&correlation_id).await?;
            if trail.requests.is_empty() && trail.handlers.is_empty() && trail.entities.is_empty() {
                return Err(AppError::NotFound(format!(
                    "no audit records for correlation id {correlation_id}"
                )));
            }
            let rendered = serde_json::to_string_pretty(&trail)?;
            println!("{rendered}");
            Ok(())
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
