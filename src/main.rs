use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use beacon::aggregator::Aggregator;
use beacon::db::Db;
use beacon::detector::{failure_threshold, IncidentDetector};
use beacon::events::EventBroadcaster;
use beacon::maintenance::MaintenanceOracle;
use beacon::models::Monitor;
use beacon::probes::ProbeSet;
use beacon::reload;
use beacon::runner::Runner;
use beacon::scheduler::{worker_concurrency, Scheduler};
use beacon::store::CheckStore;

fn shutdown_grace_seconds() -> u64 {
    std::env::var("SHUTDOWN_GRACE_SECONDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let db_path = std::env::var("DATABASE_PATH").unwrap_or_else(|_| "beacon.db".into());
    let monitors_path = std::env::var("MONITORS_PATH").unwrap_or_else(|_| "monitors.json".into());

    let raw = std::fs::read_to_string(&monitors_path)
        .with_context(|| format!("reading monitor list from {monitors_path}"))?;
    let monitors: Vec<Monitor> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {monitors_path}"))?;

    let db = Arc::new(Db::new(&db_path).context("initializing database")?);
    let store = CheckStore::new(db.clone());
    let oracle = Arc::new(MaintenanceOracle::new(db.clone()));
    let events = Arc::new(EventBroadcaster::new(64));
    let detector = Arc::new(IncidentDetector::new(
        db.clone(),
        store.clone(),
        oracle.clone(),
        events.clone(),
        failure_threshold(),
    ));
    let probes = Arc::new(ProbeSet::new().context("building probe set")?);
    let runner = Arc::new(Runner::new(probes));
    let scheduler = Arc::new(Scheduler::new(db.clone(), runner, detector, worker_concurrency()));

    reload::reload(&db, &oracle, &scheduler, &monitors).context("applying monitor list")?;
    info!(monitors = monitors.len(), db = %db_path, "beacon starting");

    scheduler.start().await;

    let aggregator = Arc::new(Aggregator::new(db.clone(), store));
    let aggregator_task = tokio::spawn(aggregator.run(scheduler.subscribe_shutdown()));

    // Surface incident lifecycle events in the log; an external notifier
    // would subscribe the same way.
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            info!(
                kind = ?event.kind,
                monitor_id = event.monitor_id,
                incident_id = %event.incident_id,
                "incident event"
            );
        }
    });

    wait_for_signal().await;
    info!("shutdown signal received; draining");

    scheduler.shutdown(Duration::from_secs(shutdown_grace_seconds())).await;
    let _ = aggregator_task.await;
    info!("bye");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
