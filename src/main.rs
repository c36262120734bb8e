//! Order-flow signal engine entrypoint.
//!
//! Wires the pipeline: exchange feed -> ingest engine -> signal worker ->
//! storage / broadcast / alerts, plus the HTTP surface. Shutdown drains in
//! ingest -> signal -> storage order with a hard deadline; whatever does
//! not flush stays in the coordinator tables for the next start.

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam::channel::bounded;
use orderflow_backend::{
    alert::run_alert_worker,
    api::{ApiState, SharedHealth},
    config::Config,
    engine::{Engine, IngestEvent},
    metrics::MetricsCollector,
    models::WsServerEvent,
    signals::{worker::SignalWorker, worker::SignalWorkerMsg, StorageWorker},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::{net::TcpListener, sync::broadcast, sync::mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Hard limit for ordered shutdown; unflushed jobs survive via restore().
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Ingest channel capacity; the feed blocks (backpressure) when full.
const INGEST_CAPACITY: usize = 8_192;

#[derive(Parser, Debug)]
#[command(name = "orderflow", about = "Real-time order-flow signal engine")]
struct Args {
    /// Path to the TOML configuration document.
    #[arg(long, env = "ORDERFLOW_CONFIG")]
    config: Option<PathBuf>,
}

fn wait_with_deadline(handle: JoinHandle<()>, name: &str, deadline: Instant) {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(worker = name, "shutdown deadline hit, leaving worker behind");
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    if handle.join().is_err() {
        error!(worker = name, "worker panicked");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("info,orderflow_backend=debug")
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    // Invalid configuration is fatal: bail before any worker starts.
    let config = Arc::new(Config::load(args.config.as_deref()).context("configuration invalid")?);
    info!(symbol = %config.feed.symbol, "starting order-flow engine");

    let metrics = Arc::new(MetricsCollector::new());
    let health = SharedHealth::new();
    let (broadcast_tx, _keepalive_rx) =
        broadcast::channel::<WsServerEvent>(config.broadcast.channel_capacity);

    // Storage worker owns the database connection.
    let storage_worker =
        StorageWorker::spawn(&config.storage, metrics.clone()).context("storage startup failed")?;
    let storage = storage_worker.handle();

    // Channels between the stages.
    let (ingest_tx, ingest_rx) = bounded::<IngestEvent>(INGEST_CAPACITY);
    let (signal_tx, signal_rx) = bounded::<SignalWorkerMsg>(config.storage.queue_capacity);
    let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();

    // Signal worker: coordinator + manager + outcomes.
    let signal_worker = SignalWorker::new(
        config.clone(),
        metrics.clone(),
        storage.clone(),
        broadcast_tx.clone(),
        ingest_tx.clone(),
        health.clone(),
    );
    let signal_join = thread::Builder::new()
        .name("signal-worker".into())
        .spawn(move || signal_worker.run(signal_rx))
        .context("failed to spawn signal worker")?;

    // Ingest engine on its own OS thread.
    let engine = Engine::new(
        config.clone(),
        metrics.clone(),
        signal_tx.clone(),
        broadcast_tx.clone(),
        snapshot_tx,
        health.clone(),
    );
    let engine_join = thread::Builder::new()
        .name("ingest-engine".into())
        .spawn(move || engine.run(ingest_rx))
        .context("failed to spawn ingest engine")?;

    // Exchange feed: decodes frames and forwards them to the engine.
    if config.feed.enabled {
        let (feed_tx, feed_rx) = bounded(INGEST_CAPACITY);
        let forward_tx = ingest_tx.clone();
        thread::Builder::new()
            .name("feed-forwarder".into())
            .spawn(move || {
                while let Ok(event) = feed_rx.recv() {
                    if forward_tx.send(IngestEvent::Exchange(event)).is_err() {
                        break;
                    }
                }
            })
            .context("failed to spawn feed forwarder")?;
        tokio::spawn(orderflow_backend::feed::run_feed(
            config.feed.clone(),
            feed_tx,
            snapshot_rx,
        ));
    } else {
        info!("exchange feed disabled; expecting events from an external driver");
        drop(snapshot_rx);
    }

    // Alert webhook worker.
    tokio::spawn(run_alert_worker(
        config.alert.clone(),
        metrics.clone(),
        broadcast_tx.subscribe(),
    ));

    // HTTP/WS surface.
    let api_state = ApiState {
        metrics: metrics.clone(),
        health: health.clone(),
        broadcast_tx: broadcast_tx.clone(),
    };
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "api listening");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, orderflow_backend::api::router(api_state)).await {
            error!(error = %e, "api server stopped");
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown requested, draining workers");

    // Ordered drain: ingest -> signal -> storage, bounded by a deadline.
    let deadline = Instant::now() + SHUTDOWN_DEADLINE;
    let _ = ingest_tx.send(IngestEvent::Shutdown);
    wait_with_deadline(engine_join, "ingest-engine", deadline);
    let _ = signal_tx.send(SignalWorkerMsg::Shutdown);
    wait_with_deadline(signal_join, "signal-worker", deadline);
    storage_worker.shutdown();
    server.abort();

    info!("shutdown complete");
    Ok(())
}
