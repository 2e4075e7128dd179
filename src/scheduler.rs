use chrono::Utc;
use futures::future::join_all;
use rusqlite::params;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::db::Db;
use crate::detector::IncidentDetector;
use crate::error::Result;
use crate::models::Monitor;
use crate::runner::{MonitorEntry, Runner};

/// Worker pool size. At most this many checks run concurrently.
pub fn worker_concurrency() -> usize {
    std::env::var("WORKER_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10)
}

/// Store-write retries before a sample is dropped. Monitoring is better
/// repeated on the next tick than hammered.
const JOB_RETRIES: u32 = 1;

/// Completed / failed run history kept in scheduler_runs.
const KEEP_COMPLETED_RUNS: i64 = 100;
const KEEP_FAILED_RUNS: i64 = 500;

/// Idle poll interval when no job is due.
const IDLE_POLL: Duration = Duration::from_millis(500);

struct ClaimedJob {
    key: String,
    monitor_id: i64,
}

/// Durable per-monitor repeating jobs over a worker pool. The queue is the
/// scheduler_jobs table: one row per monitor keyed `monitor-<id>`, claimed
/// by atomically advancing next_run_at. A claim survives restarts
/// (at-least-once); overlapping runs of one monitor are permitted.
pub struct Scheduler {
    db: Arc<Db>,
    runner: Arc<Runner>,
    detector: Arc<IncidentDetector>,
    monitors: RwLock<HashMap<i64, Arc<MonitorEntry>>>,
    concurrency: usize,
    shutdown_tx: watch::Sender<bool>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        db: Arc<Db>,
        runner: Arc<Runner>,
        detector: Arc<IncidentDetector>,
        concurrency: usize,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Scheduler {
            db,
            runner,
            detector,
            monitors: RwLock::new(HashMap::new()),
            concurrency: concurrency.max(1),
            shutdown_tx,
            workers: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// The shared drain flag; other periodic tasks hook into the same
    /// shutdown signal.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Swap in the compiled monitor set. Called by reload.
    pub fn replace_monitors(&self, entries: Vec<MonitorEntry>) {
        let mut map = self.monitors.write().unwrap();
        map.clear();
        for entry in entries {
            map.insert(entry.monitor.id, Arc::new(entry));
        }
    }

    pub fn monitor_entry(&self, monitor_id: i64) -> Option<Arc<MonitorEntry>> {
        self.monitors.read().unwrap().get(&monitor_id).cloned()
    }

    /// Rebuild the job table from a monitor list: remove every repeating
    /// job, then re-add one per monitor, due immediately.
    pub fn sync_jobs(&self, monitors: &[Monitor]) -> Result<()> {
        let conn = self.db.conn.lock().unwrap();
        conn.execute("DELETE FROM scheduler_jobs", [])?;
        let now_ms = Utc::now().timestamp_millis();
        for monitor in monitors {
            conn.execute(
                "INSERT INTO scheduler_jobs (key, monitor_id, every_ms, next_run_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    format!("monitor-{}", monitor.id),
                    monitor.id,
                    monitor.interval_seconds as i64 * 1000,
                    now_ms,
                ],
            )?;
        }
        Ok(())
    }

    /// Spawn the worker pool.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        for worker_id in 0..self.concurrency {
            let scheduler = Arc::clone(self);
            let shutdown = self.shutdown_tx.subscribe();
            workers.push(tokio::spawn(scheduler.worker_loop(worker_id, shutdown)));
        }
        info!(workers = self.concurrency, "scheduler started");
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.claim_due() {
                Some(job) => self.run_job(job).await,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                        _ = shutdown.changed() => {
                            tracing::debug!(worker_id, "worker draining");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Claim the due job with the smallest next_run_at, atomically advancing
    /// it by its interval. The guarded update means each tick is claimed at
    /// most once even with many workers polling.
    fn claim_due(&self) -> Option<ClaimedJob> {
        let conn = self.db.conn.lock().unwrap();
        let now_ms = Utc::now().timestamp_millis();
        let (key, monitor_id, every_ms, next_run_at): (String, i64, i64, i64) = conn
            .query_row(
                "SELECT key, monitor_id, every_ms, next_run_at FROM scheduler_jobs
                 WHERE next_run_at <= ?1 ORDER BY next_run_at ASC LIMIT 1",
                params![now_ms],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .ok()?;
        let claimed = conn
            .execute(
                "UPDATE scheduler_jobs SET next_run_at = ?1 WHERE key = ?2 AND next_run_at = ?3",
                params![now_ms + every_ms, key, next_run_at],
            )
            .unwrap_or(0);
        if claimed == 1 {
            Some(ClaimedJob { key, monitor_id })
        } else {
            // Another worker won the tick.
            None
        }
    }

    async fn run_job(&self, job: ClaimedJob) {
        let Some(entry) = self.monitor_entry(job.monitor_id) else {
            // Job for a monitor that has since been removed.
            warn!(monitor_id = job.monitor_id, "dropping stale job");
            let conn = self.db.conn.lock().unwrap();
            let _ = conn.execute("DELETE FROM scheduler_jobs WHERE key = ?1", params![job.key]);
            return;
        };

        let result = self.runner.run_check(&entry).await;

        let mut attempt = 0;
        loop {
            match self.detector.process(&result) {
                Ok(()) => {
                    self.record_run(&job.key, "ok", None);
                    return;
                }
                Err(e) if attempt < JOB_RETRIES => {
                    attempt += 1;
                    warn!(
                        monitor_id = job.monitor_id,
                        attempt,
                        error = %e,
                        "store write failed; retrying"
                    );
                }
                Err(e) => {
                    // The sample is lost; the next interval writes a new one.
                    error!(monitor_id = job.monitor_id, error = %e, "dropping check sample");
                    self.record_run(&job.key, "failed", Some(e.to_string()));
                    return;
                }
            }
        }
    }

    fn record_run(&self, key: &str, outcome: &str, error: Option<String>) {
        let conn = self.db.conn.lock().unwrap();
        let _ = conn.execute(
            "INSERT INTO scheduler_runs (job_key, outcome, error) VALUES (?1, ?2, ?3)",
            params![key, outcome, error],
        );
        let keep = if outcome == "ok" { KEEP_COMPLETED_RUNS } else { KEEP_FAILED_RUNS };
        let _ = conn.execute(
            "DELETE FROM scheduler_runs WHERE outcome = ?1 AND id NOT IN (
                 SELECT id FROM scheduler_runs WHERE outcome = ?1 ORDER BY id DESC LIMIT ?2
             )",
            params![outcome, keep],
        );
    }

    /// Drain: no new claims, wait for in-flight workers up to the grace
    /// period, then abort what remains.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        let mut workers = self.workers.lock().await;
        let handles: Vec<JoinHandle<()>> = workers.drain(..).collect();
        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(grace, join_all(handles)).await.is_err() {
            warn!("shutdown grace elapsed; aborting in-flight checks");
            for handle in abort_handles {
                handle.abort();
            }
        }
        info!("scheduler stopped");
    }
}
