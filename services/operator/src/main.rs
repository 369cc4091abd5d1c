//! CockroachDB operator
//!
//! Runs the controller against the in-memory platform and database, which
//! simulate a container platform that schedules and restarts pods. A cluster
//! resource can be seeded from a JSON file named by
//! `CRDB_OPERATOR_SEED_CLUSTER`.

use std::sync::Arc;

use anyhow::{Context, Result};
use crdb_api::CrdbCluster;
use crdb_operator::worker::{ClusterEvent, Controller};
use crdb_operator::{Driver, InMemoryBackend, LogFormat, OperatorConfig};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = OperatorConfig::from_env()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }

    info!(
        max_concurrent_reconciles = config.max_concurrent_reconciles,
        api_timeout_ms = config.api_timeout.as_millis() as u64,
        min_nodes = config.min_nodes,
        "Starting CockroachDB operator"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let backend = Arc::new(InMemoryBackend::new());

    let driver = Arc::new(Driver::new(
        backend.clone(),
        backend.clone(),
        config.driver_config(),
    ));
    let controller = Controller::new(
        backend.clone(),
        driver,
        config.controller_config(),
        shutdown_rx.clone(),
    );

    let (events_tx, events_rx) = mpsc::channel(64);
    if let Ok(path) = std::env::var("CRDB_OPERATOR_SEED_CLUSTER") {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading seed cluster {path}"))?;
        let cluster: CrdbCluster = serde_json::from_str(&raw)
            .with_context(|| format!("parsing seed cluster {path}"))?;
        let key = cluster.key();
        backend.insert_cluster(cluster);
        events_tx
            .send(ClusterEvent::Changed(key.clone()))
            .await
            .context("controller event channel closed")?;
        info!(cluster = %key, "Seeded cluster");
    }

    let mut controller_handle = tokio::spawn(controller.run(events_rx));

    // The simulated platform converges on the workloads the operator writes.
    let settle_handle = tokio::spawn({
        let backend = Arc::clone(&backend);
        let mut shutdown = shutdown_rx.clone();
        let period = config.tick_interval;
        async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => backend.settle(),
                    _ = shutdown.changed() => break,
                }
            }
        }
    });

    let controller_done = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            false
        }
        result = &mut controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
            true
        }
    };

    let _ = shutdown_tx.send(true);
    drop(events_tx);

    if !controller_done {
        if let Err(e) = controller_handle.await {
            error!(error = %e, "Controller task panicked");
        }
    }
    let _ = settle_handle.await;

    info!("Operator shutdown complete");
    Ok(())
}
