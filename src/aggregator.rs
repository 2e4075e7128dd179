use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::params;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info};

use crate::db::Db;
use crate::error::Result;
use crate::models::StatusHistoryDay;
use crate::store::CheckStore;

/// Retention horizon for raw check rows.
pub fn check_retention_days() -> u32 {
    std::env::var("CHECK_RETENTION_DAYS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(90)
}

/// Retention horizon for daily summary rows.
pub fn summary_retention_days() -> u32 {
    std::env::var("SUMMARY_RETENTION_DAYS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(365)
}

/// Rolls raw check rows into per-(monitor, day) summaries, finalizes
/// yesterday after midnight, trims retention, and backfills gaps at startup.
/// Aggregation is pure SQL over the checks table, so re-running a day is
/// idempotent.
pub struct Aggregator {
    db: Arc<Db>,
    store: CheckStore,
    retention_days: u32,
    summary_retention_days: u32,
}

impl Aggregator {
    pub fn new(db: Arc<Db>, store: CheckStore) -> Self {
        Aggregator {
            db,
            store,
            retention_days: check_retention_days(),
            summary_retention_days: summary_retention_days(),
        }
    }

    /// Aggregate one (monitor, day). None when the monitor has no checks on
    /// that date.
    pub fn aggregate_day(&self, monitor_id: i64, date: &str) -> Result<Option<StatusHistoryDay>> {
        let conn = self.db.conn.lock().unwrap();
        let (total, up, avg): (i64, i64, Option<i64>) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'up' THEN 1 ELSE 0 END), 0),
                    CAST(ROUND(AVG(CASE WHEN status = 'up' THEN response_time_ms END)) AS INTEGER)
             FROM checks WHERE monitor_id = ?1 AND date(checked_at) = ?2",
            params![monitor_id, date],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        if total == 0 {
            return Ok(None);
        }
        Ok(Some(StatusHistoryDay {
            monitor_id,
            date: date.to_string(),
            uptime_pct: round2(up as f64 / total as f64 * 100.0),
            avg_response_time_ms: avg,
            total_checks: total,
            successful_checks: up,
        }))
    }

    /// Aggregate and upsert one (monitor, day). Returns whether a row was
    /// written.
    pub fn upsert_day(&self, monitor_id: i64, date: &str) -> Result<bool> {
        let Some(day) = self.aggregate_day(monitor_id, date)? else {
            return Ok(false);
        };
        let conn = self.db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO status_history
                 (monitor_id, date, uptime_pct, avg_response_time_ms, total_checks, successful_checks)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(monitor_id, date) DO UPDATE SET
                 uptime_pct = excluded.uptime_pct,
                 avg_response_time_ms = excluded.avg_response_time_ms,
                 total_checks = excluded.total_checks,
                 successful_checks = excluded.successful_checks",
            params![
                day.monitor_id,
                day.date,
                day.uptime_pct,
                day.avg_response_time_ms,
                day.total_checks,
                day.successful_checks,
            ],
        )?;
        Ok(true)
    }

    /// Upsert the summary for every monitor that has checks on `date`.
    pub fn roll_up_date(&self, date: &str) -> Result<usize> {
        let monitor_ids: Vec<i64> = {
            let conn = self.db.conn.lock().unwrap();
            let mut stmt =
                conn.prepare("SELECT DISTINCT monitor_id FROM checks WHERE date(checked_at) = ?1")?;
            let ids = stmt
                .query_map(params![date], |r| r.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            ids
        };
        let mut written = 0;
        for monitor_id in monitor_ids {
            if self.upsert_day(monitor_id, date)? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Fill summary gaps inside the retention horizon: every (monitor, day)
    /// with check rows but no summary row gets aggregated.
    pub fn backfill(&self) -> Result<usize> {
        let pairs: Vec<(i64, String)> = {
            let conn = self.db.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT DISTINCT monitor_id, date(checked_at) FROM checks
                 WHERE checked_at > datetime('now', ?1)
                 EXCEPT SELECT monitor_id, date FROM status_history",
            )?;
            let rows = stmt
                .query_map(params![format!("-{} days", self.retention_days)], |r| {
                    Ok((r.get(0)?, r.get(1)?))
                })?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };
        let mut written = 0;
        for (monitor_id, date) in &pairs {
            if self.upsert_day(*monitor_id, date)? {
                written += 1;
            }
        }
        if written > 0 {
            info!(days = written, "backfilled daily summaries");
        }
        Ok(written)
    }

    /// Retention trim: raw check rows past the check horizon, summary rows
    /// past the summary horizon. Returns (checks_deleted, summaries_deleted).
    pub fn run_retention(&self) -> Result<(usize, usize)> {
        let checks = self.store.delete_older_than(self.retention_days)?;
        let summaries = {
            let conn = self.db.conn.lock().unwrap();
            conn.execute(
                "DELETE FROM status_history WHERE date < date('now', ?1)",
                params![format!("-{} days", self.summary_retention_days)],
            )?
        };
        if checks > 0 || summaries > 0 {
            info!(checks, summaries, "retention pruned");
        }
        Ok((checks, summaries))
    }

    /// Cached summary rows merged with a fresh re-aggregation of the raw
    /// rows; the raw value wins, covering checks the hourly job has not yet
    /// observed.
    pub fn history_with_fallback(
        &self,
        monitor_id: i64,
        days: u32,
    ) -> Result<Vec<StatusHistoryDay>> {
        let mut merged: BTreeMap<String, StatusHistoryDay> = BTreeMap::new();

        {
            let conn = self.db.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT date, uptime_pct, avg_response_time_ms, total_checks, successful_checks
                 FROM status_history
                 WHERE monitor_id = ?1 AND date >= date('now', ?2)
                 ORDER BY date ASC",
            )?;
            let cached = stmt
                .query_map(params![monitor_id, format!("-{} days", days)], |r| {
                    Ok(StatusHistoryDay {
                        monitor_id,
                        date: r.get(0)?,
                        uptime_pct: r.get(1)?,
                        avg_response_time_ms: r.get(2)?,
                        total_checks: r.get(3)?,
                        successful_checks: r.get(4)?,
                    })
                })?
                .filter_map(|r| r.ok());
            for day in cached {
                merged.insert(day.date.clone(), day);
            }
        }

        let fresh_dates: Vec<String> = {
            let conn = self.db.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT DISTINCT date(checked_at) FROM checks
                 WHERE monitor_id = ?1 AND checked_at > datetime('now', ?2)",
            )?;
            let dates = stmt
                .query_map(params![monitor_id, format!("-{} days", days)], |r| r.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            dates
        };
        for date in fresh_dates {
            if let Some(day) = self.aggregate_day(monitor_id, &date)? {
                merged.insert(date, day);
            }
        }

        Ok(merged.into_values().collect())
    }

    /// Timer loop: hourly roll-up of today, yesterday finalized when the UTC
    /// date flips, retention once a day. Runs until the drain flag is set.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.backfill() {
            error!(error = %e, "startup backfill failed");
        }

        // None means "due now", so the first pass runs both jobs.
        let mut last_hourly: Option<Instant> = None;
        let mut last_retention: Option<Instant> = None;
        let mut current_day = Utc::now().date_naive();

        loop {
            if *shutdown.borrow() {
                return;
            }

            if last_hourly.map_or(true, |t| t.elapsed() >= Duration::from_secs(3600)) {
                let today = Utc::now().date_naive().to_string();
                if let Err(e) = self.roll_up_date(&today) {
                    error!(error = %e, "hourly roll-up failed");
                }
                last_hourly = Some(Instant::now());
            }

            let today = Utc::now().date_naive();
            if today != current_day {
                // Finalize the day that just ended.
                let yesterday = (today - ChronoDuration::days(1)).to_string();
                match self.roll_up_date(&yesterday) {
                    Ok(written) => info!(date = %yesterday, monitors = written, "finalized daily summaries"),
                    Err(e) => error!(error = %e, "daily finalization failed"),
                }
                current_day = today;
            }

            if last_retention.map_or(true, |t| t.elapsed() >= Duration::from_secs(86_400)) {
                if let Err(e) = self.run_retention() {
                    error!(error = %e, "retention failed");
                }
                last_retention = Some(Instant::now());
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                _ = shutdown.changed() => return,
            }
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CheckResult;
    use chrono::{DateTime, TimeZone};

    fn harness() -> (tempfile::TempDir, Arc<Db>, Aggregator) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Db::new(dir.path().join("a.db").to_str().unwrap()).unwrap());
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO monitors (id, name, monitor_type, url, interval_seconds)
                 VALUES (3, 'svc-3', 'http', 'http://x', 30)",
                [],
            )
            .unwrap();
        }
        let store = CheckStore::new(db.clone());
        let aggregator = Aggregator::new(db.clone(), store);
        (dir, db, aggregator)
    }

    fn save(db: &Arc<Db>, ts: DateTime<Utc>, success: bool, rt: u64) {
        CheckStore::new(db.clone())
            .save(&CheckResult {
                monitor_id: 3,
                monitor_name: "svc-3".into(),
                timestamp: ts,
                success,
                response_time_ms: rt,
                error: if success { None } else { Some("timeout".into()) },
                condition_results: vec![],
            })
            .unwrap();
    }

    #[test]
    fn day_aggregation_matches_expected_values() {
        let (_dir, db, aggregator) = harness();
        let base = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();
        for i in 0..95 {
            save(&db, base + ChronoDuration::minutes(i * 10), true, 100);
        }
        for i in 0..5 {
            save(&db, base + ChronoDuration::minutes(950 + i * 10), false, 100);
        }

        let day = aggregator.aggregate_day(3, "2025-01-15").unwrap().unwrap();
        assert_eq!(day.total_checks, 100);
        assert_eq!(day.successful_checks, 95);
        assert_eq!(day.uptime_pct, 95.0);
        assert_eq!(day.avg_response_time_ms, Some(100));
    }

    #[test]
    fn upsert_twice_yields_identical_rows() {
        let (_dir, db, aggregator) = harness();
        let base = Utc.with_ymd_and_hms(2025, 1, 15, 8, 0, 0).unwrap();
        for i in 0..10 {
            save(&db, base + ChronoDuration::minutes(i), i % 3 != 0, 80 + i as u64);
        }

        assert!(aggregator.upsert_day(3, "2025-01-15").unwrap());
        let first = read_row(&db);
        assert!(aggregator.upsert_day(3, "2025-01-15").unwrap());
        let second = read_row(&db);
        assert_eq!(first, second);
    }

    fn read_row(db: &Arc<Db>) -> (f64, Option<i64>, i64, i64) {
        let conn = db.conn.lock().unwrap();
        conn.query_row(
            "SELECT uptime_pct, avg_response_time_ms, total_checks, successful_checks
             FROM status_history WHERE monitor_id = 3 AND date = '2025-01-15'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .unwrap()
    }

    #[test]
    fn aggregate_day_is_none_without_checks() {
        let (_dir, _db, aggregator) = harness();
        assert!(aggregator.aggregate_day(3, "2025-01-15").unwrap().is_none());
        assert!(!aggregator.upsert_day(3, "2025-01-15").unwrap());
    }

    #[test]
    fn backfill_fills_only_missing_days() {
        let (_dir, db, aggregator) = harness();
        let now = Utc::now();
        save(&db, now - ChronoDuration::days(2), true, 50);
        save(&db, now - ChronoDuration::days(1), false, 50);

        let written = aggregator.backfill().unwrap();
        assert_eq!(written, 2);
        // Everything is summarized now; a second backfill is a no-op.
        assert_eq!(aggregator.backfill().unwrap(), 0);
    }

    #[test]
    fn fallback_prefers_fresh_aggregation() {
        let (_dir, db, aggregator) = harness();
        let now = Utc::now();
        let today = now.date_naive().to_string();
        save(&db, now - ChronoDuration::minutes(30), true, 50);
        aggregator.upsert_day(3, &today).unwrap();

        // New checks arrive after the hourly upsert.
        save(&db, now - ChronoDuration::minutes(5), false, 50);
        save(&db, now - ChronoDuration::minutes(1), false, 50);

        let history = aggregator.history_with_fallback(3, 7).unwrap();
        let row = history.iter().find(|d| d.date == today).unwrap();
        assert_eq!(row.total_checks, 3);
        assert_eq!(row.successful_checks, 1);

        // The cached row still holds the stale count.
        let conn = db.conn.lock().unwrap();
        let cached: i64 = conn
            .query_row(
                "SELECT total_checks FROM status_history WHERE monitor_id = 3 AND date = ?1",
                params![today],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(cached, 1);
    }
}
