//! `outpost`: outbox dispatcher and retention worker.

use anyhow::Result;
use clap::{Parser, Subcommand};

use outpost_core::EventId;
use outpost_infra::{SinkKind, WorkerConfig};
use outpost_observability::LogFormat;

mod commands;

#[derive(Parser)]
#[command(name = "outpost")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Postgres connection string (overrides DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Log output format
    #[arg(long, global = true, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// Events claimed per pass (overrides OUTBOX_BATCH_SIZE)
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Failed attempts before an event is dead-lettered (overrides OUTBOX_MAX_ATTEMPTS)
    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    /// Per-event publish timeout in seconds (overrides OUTBOX_PUBLISH_TIMEOUT_SECS)
    #[arg(long, global = true)]
    publish_timeout_secs: Option<u64>,

    /// Where events are published: log or redis (overrides OUTBOX_SINK)
    #[arg(long, global = true)]
    sink: Option<SinkKind>,

    /// Redis connection string for the redis sink (overrides REDIS_URL)
    #[arg(long, global = true)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch the outbox and run retention sweeps until stopped
    Run {
        /// Seconds between outbox passes
        #[arg(long, default_value_t = 10)]
        outbox_interval: u64,

        /// Seconds between retention sweeps
        #[arg(long, default_value_t = 3600)]
        cleanup_interval: u64,
    },

    /// Drain the outbox once and exit
    ProcessOutbox,

    /// Delete processed and dead events past retention
    CleanupOutbox,

    /// Delete completed idempotency records past retention
    CleanupIdempotency,

    /// Apply the bundled database schema
    Migrate,

    /// Print outbox counts per status
    Stats,

    /// List dead-lettered events
    DeadLetters {
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Return a dead-lettered event to the pool with a fresh retry budget
    Replay {
        /// Outbox event id
        event_id: EventId,
    },
}

impl Cli {
    /// Environment first, then flags on top.
    fn config(&self) -> Result<WorkerConfig> {
        let mut config = WorkerConfig::from_env()?;
        if let Some(url) = &self.database_url {
            config.database_url = Some(url.clone());
        }
        if let Some(n) = self.batch_size {
            config.batch_size = n;
        }
        if let Some(n) = self.max_attempts {
            config.max_attempts = n;
        }
        if let Some(secs) = self.publish_timeout_secs {
            config.publish_timeout = std::time::Duration::from_secs(secs);
        }
        if let Some(sink) = self.sink {
            config.sink = sink;
        }
        if let Some(url) = &self.redis_url {
            config.redis_url = url.clone();
        }
        Ok(config.validated()?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    outpost_observability::init(cli.log_format);

    let config = cli.config()?;
    let pool = commands::connect(&config).await?;

    match cli.command {
        Commands::Run {
            outbox_interval,
            cleanup_interval,
        } => commands::run(&config, pool, outbox_interval, cleanup_interval).await?,
        Commands::ProcessOutbox => commands::process_outbox(&config, pool).await?,
        Commands::CleanupOutbox => commands::cleanup_outbox(pool).await?,
        Commands::CleanupIdempotency => commands::cleanup_idempotency(pool).await?,
        Commands::Migrate => commands::migrate(pool).await?,
        Commands::Stats => commands::stats(pool).await?,
        Commands::DeadLetters { limit } => commands::dead_letters(pool, limit).await?,
        Commands::Replay { event_id } => commands::replay(pool, event_id).await?,
    }

    Ok(())
}
