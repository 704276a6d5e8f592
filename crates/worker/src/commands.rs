//! Subcommand bodies. Each one wires the Postgres stores it needs and runs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info};

use outpost_core::EventId;
use outpost_events::Sink;
use outpost_infra::db;
use outpost_infra::idempotency::PgIdempotencyStore;
use outpost_infra::outbox::{OutboxStore, PgOutboxStore};
use outpost_infra::sinks::LogSink;
use outpost_infra::{
    CleanupSweeper, Orchestrator, OrchestratorConfig, OutboxDispatcher, SinkKind, WorkerConfig,
};

pub async fn connect(config: &WorkerConfig) -> Result<PgPool> {
    let url = config.database_url()?;
    db::connect(url, config.max_connections)
        .await
        .context("failed to connect to Postgres")
}

fn build_sink(config: &WorkerConfig) -> Result<Arc<dyn Sink>> {
    match config.sink {
        SinkKind::Log => Ok(Arc::new(LogSink::new())),
        #[cfg(feature = "redis")]
        SinkKind::Redis => {
            let sink = outpost_infra::sinks::RedisStreamSink::new(&config.redis_url)?;
            Ok(Arc::new(sink))
        }
        #[cfg(not(feature = "redis"))]
        SinkKind::Redis => anyhow::bail!("this build has no redis support (enable the `redis` feature)"),
    }
}

fn dispatcher(
    config: &WorkerConfig,
    pool: PgPool,
) -> Result<OutboxDispatcher<PgOutboxStore, Arc<dyn Sink>>> {
    Ok(OutboxDispatcher::new(PgOutboxStore::new(pool), build_sink(config)?)
        .with_config(config.dispatcher_config())
        .with_policy(config.retry_policy()))
}

fn sweeper(pool: PgPool) -> CleanupSweeper<PgOutboxStore, PgIdempotencyStore> {
    CleanupSweeper::new(PgOutboxStore::new(pool.clone()), PgIdempotencyStore::new(pool))
}

pub async fn run(
    config: &WorkerConfig,
    pool: PgPool,
    outbox_interval: u64,
    cleanup_interval: u64,
) -> Result<()> {
    let orchestrator = Orchestrator::new(dispatcher(config, pool.clone())?, sweeper(pool))
        .with_config(OrchestratorConfig {
            outbox_interval: Duration::from_secs(outbox_interval.max(1)),
            cleanup_interval: Duration::from_secs(cleanup_interval.max(1)),
        });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, stopping after the current tick");
        let _ = shutdown_tx.send(true);
    });

    info!(
        worker_id = %orchestrator.dispatcher().claim_token(),
        sink = %config.sink,
        batch_size = config.batch_size,
        "outpost worker starting"
    );
    let state = orchestrator.run(shutdown_rx).await;
    info!(last_cleanup_at = ?state.last_cleanup_at, "outpost worker exited");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "unable to listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "unable to listen for ctrl-c");
    }
}

pub async fn process_outbox(config: &WorkerConfig, pool: PgPool) -> Result<()> {
    let report = dispatcher(config, pool)?.drain().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub async fn cleanup_outbox(pool: PgPool) -> Result<()> {
    let deleted = sweeper(pool).purge_outbox().await?;
    println!("deleted {deleted} outbox events");
    Ok(())
}

pub async fn cleanup_idempotency(pool: PgPool) -> Result<()> {
    let deleted = sweeper(pool).purge_idempotency().await?;
    println!("deleted {deleted} idempotency records");
    Ok(())
}

pub async fn migrate(pool: PgPool) -> Result<()> {
    db::migrate(&pool).await.context("migration failed")?;
    info!("schema is up to date");
    Ok(())
}

pub async fn stats(pool: PgPool) -> Result<()> {
    let stats = PgOutboxStore::new(pool).stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

pub async fn dead_letters(pool: PgPool, limit: usize) -> Result<()> {
    let events = PgOutboxStore::new(pool).list_dead_letters(limit).await?;
    println!("{}", serde_json::to_string_pretty(&events)?);
    Ok(())
}

pub async fn replay(pool: PgPool, event_id: EventId) -> Result<()> {
    let event = PgOutboxStore::new(pool).requeue_dead_letter(event_id).await?;
    info!(event_id = %event.id, event_type = %event.event_type, "dead letter requeued");
    Ok(())
}
