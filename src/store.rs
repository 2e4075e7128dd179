use rusqlite::params;
use std::collections::HashMap;
use std::sync::Arc;

use crate::db::{sqlite_datetime, Db};
use crate::error::Result;
use crate::models::{CheckResult, CheckRow, CheckStatus};

/// Append-only persistence for check rows plus the aggregate queries the
/// rest of the engine needs. All per-monitor queries filter on
/// `(monitor_id, checked_at)` and ride the composite index.
#[derive(Clone)]
pub struct CheckStore {
    db: Arc<Db>,
}

/// Bucket size for response-time history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Hour,
    Day,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseTimeBucket {
    pub bucket: String,
    pub avg_ms: f64,
    pub min_ms: i64,
    pub max_ms: i64,
}

impl CheckStore {
    pub fn new(db: Arc<Db>) -> Self {
        CheckStore { db }
    }

    /// Append one check row. The row's status is the monitor-level verdict
    /// (probe success and all conditions).
    pub fn save(&self, result: &CheckResult) -> Result<()> {
        let conn = self.db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO checks (monitor_id, status, response_time_ms, error_message, checked_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                result.monitor_id,
                CheckStatus::from_success(result.success).as_str(),
                result.response_time_ms as i64,
                result.error,
                sqlite_datetime(&result.timestamp),
            ],
        )?;
        Ok(())
    }

    /// The `n` most recent checks for a monitor, newest first.
    pub fn recent(&self, monitor_id: i64, n: usize) -> Result<Vec<CheckRow>> {
        let conn = self.db.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, monitor_id, status, response_time_ms, error_message, checked_at
             FROM checks WHERE monitor_id = ?1
             ORDER BY checked_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![monitor_id, n as i64], row_to_check)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn latest(&self, monitor_id: i64) -> Result<Option<CheckRow>> {
        Ok(self.recent(monitor_id, 1)?.into_iter().next())
    }

    /// Uptime percentage over the trailing window; 100 when there are no
    /// checks at all.
    pub fn uptime_pct(&self, monitor_id: i64, days: u32) -> Result<f64> {
        let conn = self.db.conn.lock().unwrap();
        let (total, up): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN status = 'up' THEN 1 ELSE 0 END), 0)
             FROM checks WHERE monitor_id = ?1 AND checked_at > datetime('now', ?2)",
            params![monitor_id, format!("-{} days", days)],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        if total == 0 {
            return Ok(100.0);
        }
        Ok(up as f64 / total as f64 * 100.0)
    }

    /// Average response time over successful checks only.
    pub fn avg_response_time(&self, monitor_id: i64, days: u32) -> Result<Option<f64>> {
        let conn = self.db.conn.lock().unwrap();
        let avg: Option<f64> = conn.query_row(
            "SELECT AVG(response_time_ms) FROM checks
             WHERE monitor_id = ?1 AND status = 'up' AND checked_at > datetime('now', ?2)",
            params![monitor_id, format!("-{} days", days)],
            |r| r.get(0),
        )?;
        Ok(avg)
    }

    /// Bucketed avg/min/max response times over successful checks.
    pub fn response_time_history(
        &self,
        monitor_id: i64,
        days: u32,
        granularity: Granularity,
    ) -> Result<Vec<ResponseTimeBucket>> {
        let bucket_expr = match granularity {
            Granularity::Hour => "strftime('%Y-%m-%d %H:00:00', checked_at)",
            Granularity::Day => "date(checked_at)",
        };
        let sql = format!(
            "SELECT {bucket_expr} AS bucket,
                    AVG(response_time_ms), MIN(response_time_ms), MAX(response_time_ms)
             FROM checks
             WHERE monitor_id = ?1 AND status = 'up' AND checked_at > datetime('now', ?2)
             GROUP BY bucket ORDER BY bucket ASC"
        );
        let conn = self.db.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![monitor_id, format!("-{} days", days)], |r| {
                Ok(ResponseTimeBucket {
                    bucket: r.get(0)?,
                    avg_ms: r.get(1)?,
                    min_ms: r.get(2)?,
                    max_ms: r.get(3)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Count of consecutive-row status changes within the trailing window.
    /// Feeds flapping detection.
    pub fn state_transitions_in_window(&self, monitor_id: i64, minutes: u32) -> Result<u32> {
        let conn = self.db.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT status FROM checks
             WHERE monitor_id = ?1 AND checked_at > datetime('now', ?2)
             ORDER BY checked_at ASC, id ASC",
        )?;
        let statuses: Vec<String> = stmt
            .query_map(params![monitor_id, format!("-{} minutes", minutes)], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(statuses.windows(2).filter(|w| w[0] != w[1]).count() as u32)
    }

    /// Newest row per monitor in one round-trip, keyed by monitor id.
    pub fn latest_bulk(&self, monitor_ids: &[i64]) -> Result<HashMap<i64, CheckRow>> {
        let conn = self.db.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, monitor_id, status, response_time_ms, error_message, MAX(checked_at)
             FROM checks GROUP BY monitor_id",
        )?;
        let mut map = HashMap::new();
        let rows = stmt.query_map([], row_to_check)?;
        for row in rows.filter_map(|r| r.ok()) {
            if monitor_ids.contains(&row.monitor_id) {
                map.insert(row.monitor_id, row);
            }
        }
        Ok(map)
    }

    /// Uptime percentage per monitor in one round-trip. Monitors with no
    /// checks in the window report 100.
    pub fn uptime_pct_bulk(&self, monitor_ids: &[i64], days: u32) -> Result<HashMap<i64, f64>> {
        let conn = self.db.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT monitor_id, COUNT(*), SUM(CASE WHEN status = 'up' THEN 1 ELSE 0 END)
             FROM checks WHERE checked_at > datetime('now', ?1)
             GROUP BY monitor_id",
        )?;
        let mut map: HashMap<i64, f64> =
            monitor_ids.iter().map(|id| (*id, 100.0)).collect();
        let rows = stmt.query_map(params![format!("-{} days", days)], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?))
        })?;
        for row in rows.filter_map(|r| r.ok()) {
            let (monitor_id, total, up) = row;
            if map.contains_key(&monitor_id) && total > 0 {
                map.insert(monitor_id, up as f64 / total as f64 * 100.0);
            }
        }
        Ok(map)
    }

    /// Retention trim. Returns the number of rows deleted.
    pub fn delete_older_than(&self, days: u32) -> Result<usize> {
        let conn = self.db.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM checks WHERE checked_at < datetime('now', ?1)",
            params![format!("-{} days", days)],
        )?;
        Ok(deleted)
    }
}

fn row_to_check(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckRow> {
    let status: String = row.get(2)?;
    Ok(CheckRow {
        id: row.get(0)?,
        monitor_id: row.get(1)?,
        status: if status == "up" { CheckStatus::Up } else { CheckStatus::Down },
        response_time_ms: row.get::<_, i64>(3)? as u64,
        error: row.get(4)?,
        checked_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};

    fn test_db() -> (tempfile::TempDir, Arc<Db>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Db::new(dir.path().join("test.db").to_str().unwrap()).unwrap());
        (dir, db)
    }

    fn seed_monitor(db: &Db, id: i64) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO monitors (id, name, monitor_type, url, interval_seconds)
             VALUES (?1, ?2, 'http', 'http://example.test', 30)",
            params![id, format!("svc-{id}")],
        )
        .unwrap();
    }

    fn result_at(monitor_id: i64, ts: DateTime<Utc>, success: bool) -> CheckResult {
        CheckResult {
            monitor_id,
            monitor_name: format!("svc-{monitor_id}"),
            timestamp: ts,
            success,
            response_time_ms: 100,
            error: if success { None } else { Some("timeout: probe".into()) },
            condition_results: vec![],
        }
    }

    #[test]
    fn recent_is_newest_first() {
        let (_dir, db) = test_db();
        seed_monitor(&db, 1);
        let store = CheckStore::new(db);
        let base = Utc::now() - ChronoDuration::minutes(10);
        for i in 0..5 {
            store.save(&result_at(1, base + ChronoDuration::minutes(i), i % 2 == 0)).unwrap();
        }
        let rows = store.recent(1, 3).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].checked_at > rows[2].checked_at);
    }

    #[test]
    fn uptime_is_100_with_no_checks() {
        let (_dir, db) = test_db();
        seed_monitor(&db, 1);
        let store = CheckStore::new(db);
        assert_eq!(store.uptime_pct(1, 7).unwrap(), 100.0);
    }

    #[test]
    fn uptime_counts_only_the_window() {
        let (_dir, db) = test_db();
        seed_monitor(&db, 1);
        let store = CheckStore::new(db);
        let now = Utc::now();
        // Inside the 1-day window: 3 up, 1 down.
        for i in 0..3 {
            store.save(&result_at(1, now - ChronoDuration::hours(i), true)).unwrap();
        }
        store.save(&result_at(1, now - ChronoDuration::hours(4), false)).unwrap();
        // Outside the window: all down, must not count.
        store.save(&result_at(1, now - ChronoDuration::days(3), false)).unwrap();
        assert_eq!(store.uptime_pct(1, 1).unwrap(), 75.0);
    }

    #[test]
    fn avg_response_time_ignores_failures() {
        let (_dir, db) = test_db();
        seed_monitor(&db, 1);
        let store = CheckStore::new(db.clone());
        let now = Utc::now();
        store.save(&result_at(1, now - ChronoDuration::minutes(2), true)).unwrap();
        let mut slow_failure = result_at(1, now - ChronoDuration::minutes(1), false);
        slow_failure.response_time_ms = 30_000;
        store.save(&slow_failure).unwrap();
        assert_eq!(store.avg_response_time(1, 1).unwrap(), Some(100.0));
    }

    #[test]
    fn transitions_count_adjacent_changes() {
        let (_dir, db) = test_db();
        seed_monitor(&db, 1);
        let store = CheckStore::new(db);
        let base = Utc::now() - ChronoDuration::minutes(5);
        for (i, up) in [true, false, false, true, false].iter().enumerate() {
            store.save(&result_at(1, base + ChronoDuration::seconds(i as i64 * 30), *up)).unwrap();
        }
        // up→down, down→up, up→down = 3 transitions
        assert_eq!(store.state_transitions_in_window(1, 60).unwrap(), 3);
    }

    #[test]
    fn retention_deletes_exactly_the_old_rows() {
        let (_dir, db) = test_db();
        seed_monitor(&db, 1);
        let store = CheckStore::new(db);
        let now = Utc::now();
        store.save(&result_at(1, now - ChronoDuration::days(10), true)).unwrap();
        store.save(&result_at(1, now - ChronoDuration::days(8), false)).unwrap();
        store.save(&result_at(1, now - ChronoDuration::days(2), true)).unwrap();
        store.save(&result_at(1, now, true)).unwrap();

        let deleted = store.delete_older_than(7).unwrap();
        assert_eq!(deleted, 2);
        let remaining = store.recent(1, 10).unwrap();
        assert_eq!(remaining.len(), 2);
        let cutoff = sqlite_datetime(&(now - ChronoDuration::days(7)));
        assert!(remaining.iter().all(|c| c.checked_at >= cutoff));
    }

    #[test]
    fn bulk_uptime_defaults_missing_monitors_to_100() {
        let (_dir, db) = test_db();
        seed_monitor(&db, 1);
        seed_monitor(&db, 2);
        let store = CheckStore::new(db);
        let now = Utc::now();
        store.save(&result_at(1, now, false)).unwrap();
        let map = store.uptime_pct_bulk(&[1, 2], 1).unwrap();
        assert_eq!(map[&1], 0.0);
        assert_eq!(map[&2], 100.0);
    }
}
