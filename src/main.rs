//! # MC3E Ingestion Core
//!
//! Data-acquisition core for Mitsubishi Q-series PLCs over the MC 3E ASCII
//! protocol: a connection-pooled polling engine feeding a thread-safe
//! circular buffer, drained in batches to a remote store with retry and CSV
//! spillover on permanent failure.
//!
//! ## Responsibilities
//!
//! 1. Poll configured tag groups off PLCs, Fixed-interval or Handshake-mode
//! 2. Decode raw words into typed samples and enqueue them
//! 3. Buffer samples in a bounded circular buffer with overflow eviction
//! 4. Batch-write the buffer to the remote store, retrying with backoff
//! 5. Spill to CSV on exhausted retries; durably log per-failure detail
//! 6. Expose a control surface (start/stop/status/trigger) and metrics
//!
//! ## NOT Responsible For
//!
//! - Wire framing for the control surface (host concern)
//! - SQLite-backed configuration storage (host concern; this core only
//!   reads a loaded [`config_store::Configuration`])
//! - Master-data sync, CSV template downloads, UI visualization

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod buffer;
mod config;
mod config_store;
mod control;
mod errors;
mod failure_log;
mod mc3e;
mod metrics;
mod oracle;
mod plc;
mod polling;
mod queue;
mod sample;

use buffer::{CircularBuffer, PutOutcome};
use config::Config;
use config_store::{ConfigStore, InMemoryConfigStore};
use control::ControlPlane;
use failure_log::FailureLogger;
use metrics::MetricsServer;
use oracle::{FakeOracleStore, InMemoryOraclePool, OraclePoolConfig, OracleWriter, WriterConfig};
use plc::{PlcManager, PoolConfig, ReconnectionConfig};
use polling::PollingEngine;
use queue::data_queue;
use sample::BufferEntry;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mc3e_ingestion=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting MC3E ingestion core v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    // The relational configuration store (SQLite, per spec §6) is a host
    // concern outside this crate; `ConfigStore` is the narrow trait it
    // implements. Wire a bootstrap in-memory snapshot until a host supplies
    // a real implementation.
    let store = InMemoryConfigStore::new(config_store::Configuration::default());
    let configuration = store.load().await.map_err(errors::IngestionError::Configuration).map_err(|e| {
        error!(error = %e, "fatal: configuration load failed, aborting startup");
        anyhow::Error::new(e)
    })?;
    info!(
        plcs = configuration.plcs.len(),
        groups = configuration.groups.len(),
        "Loaded configuration"
    );

    let plc_manager = Arc::new(PlcManager::new());
    for plc in configuration.plcs.values().filter(|p| p.enabled) {
        plc_manager
            .register(
                plc.code.clone(),
                plc.host.clone(),
                plc.port,
                PoolConfig {
                    max_size: plc.pool_size.max(config.pool_size_per_plc),
                    acquire_timeout: config.connection_timeout,
                    idle_timeout: config.idle_timeout,
                    connect_timeout: plc.connect_timeout,
                    read_timeout: plc.read_timeout,
                },
                ReconnectionConfig::default(),
            )
            .await;
        info!(plc_code = %plc.code, host = %plc.host, "Registered PLC");
    }

    let buffer = Arc::new(CircularBuffer::new(config.buffer_max_size));
    let (queue_tx, mut queue_rx) = data_queue(config.data_queue_size);
    let failure_logger = Arc::new(FailureLogger::new(config.failure_log_path.clone()));

    let engine = Arc::new(PollingEngine::with_max_groups(
        &configuration,
        plc_manager.clone(),
        queue_tx,
        failure_logger.clone(),
        config.max_polling_groups,
    ));

    // The remote store's wire protocol (spec §4.11) is served here by an
    // in-memory fake; a real OCI-backed `OraclePool` is a host concern until
    // a driver crate is wired in.
    let oracle_store = FakeOracleStore::new();
    let oracle_pool = InMemoryOraclePool::new(
        oracle_store,
        OraclePoolConfig {
            min_size: config.oracle.pool_min,
            max_size: config.oracle.pool_max,
            ..OraclePoolConfig::default()
        },
    );
    let writer = Arc::new(OracleWriter::new(
        buffer.clone(),
        oracle_pool,
        WriterConfig {
            write_interval: config.buffer_write_interval,
            batch_size: config.buffer_batch_size,
            retry_count: config.buffer_retry_count,
            backup_dir: config.backup_file_path.clone(),
        },
    ));

    let control = Arc::new(ControlPlane::new(
        engine.clone(),
        writer.clone(),
        buffer.clone(),
        plc_manager.clone(),
        failure_logger.clone(),
    ));

    // Pump decoded samples off the data queue into the circular buffer. This
    // is the only consumer of the queue; back-pressure on `put` is what
    // throttles polling workers when the buffer can't keep up.
    let pump_buffer = buffer.clone();
    let pump_writer = writer.clone();
    let pump_handle = tokio::spawn(async move {
        let batch_size = config.buffer_batch_size;
        while let Some(sample) = queue_rx.get().await {
            let outcome = pump_buffer.put(BufferEntry::new(sample));
            let overflowed = outcome == PutOutcome::AcceptedWithOverflow;
            if overflowed || pump_buffer.size() >= batch_size {
                pump_writer.wake_now();
            }
        }
    });

    let writer_cancel = CancellationToken::new();
    let writer_task_cancel = writer_cancel.clone();
    let writer_for_task = writer.clone();
    let writer_handle = tokio::spawn(async move {
        writer_for_task.run(writer_task_cancel).await;
    });

    let metrics_server = MetricsServer::new(config.metrics_port, control.clone());
    tokio::spawn(async move {
        if let Err(e) = metrics_server.serve().await {
            error!("Metrics server error: {}", e);
        }
    });
    info!(port = config.metrics_port, "Metrics server listening");

    control.system_start().await;
    info!("Polling groups started");

    info!("Service ready. Listening for shutdown signals (SIGTERM, SIGINT)");
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("SIGINT (Ctrl+C) received, initiating graceful shutdown...");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate()).expect("Failed to create SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("SIGTERM received, initiating graceful shutdown...");
        }
    }

    info!("Stopping all polling groups...");
    control.system_stop().await;

    info!("Stopping Oracle writer, flushing remaining buffer...");
    writer_cancel.cancel();
    let _ = writer_handle.await;

    pump_handle.abort();

    plc_manager.shutdown().await;

    info!("MC3E ingestion core stopped successfully");
    Ok(())
}
