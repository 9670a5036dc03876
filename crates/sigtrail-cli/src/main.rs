//! sigtrail - electronic signature and audit trail CLI
//!
//! Operator tool for signing records, re-verifying signatures and reading
//! the audit trail of a `SQLite` database.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sigtrail_core::config::{EngineConfig, LoggingConfig};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// sigtrail - electronic signature and audit trail CLI
#[derive(Parser, Debug)]
#[command(name = "sigtrail")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults apply when it does not exist)
    #[arg(short, long, default_value = "sigtrail.toml")]
    config: PathBuf,

    /// Database file, overriding `[database] path`
    #[arg(long)]
    database: Option<PathBuf>,

    /// Log filter, overriding `[logging] level` (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the signature, audit and reference tables
    Init {
        /// Create the audit table without signature columns
        #[arg(long)]
        legacy_audit: bool,
    },

    /// Sign the current state of a record
    Sign(commands::SignArgs),

    /// Verify a signature against the record's current state
    Verify {
        /// Signature id
        id: i64,

        /// User recorded on the audit event
        #[arg(long)]
        user: Option<i64>,
    },

    /// Revoke a signature
    Revoke {
        /// Signature id
        id: i64,

        /// Why the signature is revoked
        #[arg(long)]
        reason: String,

        /// User performing the revocation
        #[arg(long)]
        actor: i64,
    },

    /// Show a stored signature
    Show {
        /// Signature id
        id: i64,
    },

    /// Show the latest signature for a record
    Latest {
        /// Table of the signed record
        #[arg(long)]
        table: String,

        /// Primary key of the signed record
        #[arg(long)]
        record: i64,
    },

    /// List every stored signature, newest first
    List,

    /// Print the SHA-256 token of a file's contents
    HashFile {
        /// File to hash
        path: PathBuf,
    },

    /// List audit events, newest first
    Events {
        /// Number of events to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: u32,

        /// Only events referencing this signature
        #[arg(long)]
        signature: Option<i64>,
    },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        EngineConfig::from_file(&cli.config)
            .with_context(|| format!("failed to load config {}", cli.config.display()))?
    } else {
        EngineConfig::default()
    };
    if let Some(path) = &cli.database {
        config.database.path.clone_from(path);
    }
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }

    init_logging(&config.logging)?;
    debug!(database = %config.database.path.display(), "configuration loaded");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let code = runtime.block_on(run(cli.command, &config, &mut out))?;
    out.flush()?;
    Ok(code)
}

async fn run(command: Commands, config: &EngineConfig, out: &mut dyn Write) -> Result<ExitCode> {
    let engine = || commands::Engine::open(config);
    match command {
        Commands::Init { legacy_audit } => commands::init(config, legacy_audit, out)?,
        Commands::Sign(args) => commands::sign(&engine()?, &args, out).await?,
        Commands::Verify { id, user } => {
            if !commands::verify(&engine()?, id, user, out).await? {
                return Ok(ExitCode::FAILURE);
            }
        },
        Commands::Revoke { id, reason, actor } => {
            commands::revoke(&engine()?, id, &reason, actor, out).await?;
        },
        Commands::Show { id } => commands::show(&engine()?, id, out).await?,
        Commands::Latest { table, record } => {
            commands::latest(&engine()?, &table, record, out).await?;
        },
        Commands::List => commands::list(&engine()?, out).await?,
        Commands::HashFile { path } => commands::hash_file(&path, out)?,
        Commands::Events { limit, signature } => {
            commands::events(&engine()?, limit, signature, out).await?;
        },
    }
    Ok(ExitCode::SUCCESS)
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("warn"));

    if let Some(log_file) = &logging.file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(io::stderr),
            )
            .init();
    }
    Ok(())
}
