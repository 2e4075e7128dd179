use chrono::{DateTime, Utc};
use rusqlite::{Connection, Result};
use std::sync::Mutex;

/// Shared SQLite handle. A single connection behind a mutex is the write
/// serialization strategy for the whole engine; WAL keeps readers cheap.
pub struct Db {
    pub conn: Mutex<Connection>,
}

impl Db {
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
        let db = Db { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("
            CREATE TABLE IF NOT EXISTS monitors (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                group_name TEXT,
                monitor_type TEXT NOT NULL DEFAULT 'http',
                url TEXT NOT NULL,
                interval_seconds INTEGER NOT NULL DEFAULT 60,
                is_public INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS checks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                monitor_id INTEGER NOT NULL REFERENCES monitors(id) ON DELETE CASCADE,
                status TEXT NOT NULL,
                response_time_ms INTEGER NOT NULL,
                error_message TEXT,
                checked_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_checks_monitor ON checks(monitor_id, checked_at DESC);

            CREATE TABLE IF NOT EXISTS incidents (
                id TEXT PRIMARY KEY,
                monitor_id INTEGER NOT NULL REFERENCES monitors(id) ON DELETE CASCADE,
                status TEXT NOT NULL DEFAULT 'investigating',
                severity TEXT NOT NULL DEFAULT 'minor',
                title TEXT NOT NULL,
                description TEXT,
                started_at TEXT NOT NULL DEFAULT (datetime('now')),
                resolved_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_incidents_monitor ON incidents(monitor_id, started_at DESC);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_incidents_one_active
                ON incidents(monitor_id) WHERE resolved_at IS NULL;

            CREATE TABLE IF NOT EXISTS maintenance_windows (
                id TEXT PRIMARY KEY,
                monitor_id INTEGER REFERENCES monitors(id) ON DELETE CASCADE,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                timezone TEXT NOT NULL DEFAULT 'UTC',
                description TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_maintenance_active ON maintenance_windows(start_time, end_time);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_maintenance_monitor_start
                ON maintenance_windows(monitor_id, start_time);

            CREATE TABLE IF NOT EXISTS status_history (
                monitor_id INTEGER NOT NULL REFERENCES monitors(id) ON DELETE CASCADE,
                date TEXT NOT NULL,
                uptime_pct REAL NOT NULL,
                avg_response_time_ms INTEGER,
                total_checks INTEGER NOT NULL,
                successful_checks INTEGER NOT NULL,
                PRIMARY KEY (monitor_id, date)
            );

            CREATE TABLE IF NOT EXISTS scheduler_jobs (
                key TEXT PRIMARY KEY,
                monitor_id INTEGER NOT NULL,
                every_ms INTEGER NOT NULL,
                next_run_at INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_due ON scheduler_jobs(next_run_at);

            CREATE TABLE IF NOT EXISTS scheduler_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_key TEXT NOT NULL,
                outcome TEXT NOT NULL,
                error TEXT,
                ran_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_runs_outcome ON scheduler_runs(outcome, id);
        ")?;

        Ok(())
    }
}

/// Format a UTC instant the way SQLite's datetime() does, so stored values,
/// datetime modifiers, and lexicographic comparison all agree.
pub fn sqlite_datetime(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.db");
        let path = path.to_str().unwrap();
        let db = Db::new(path).unwrap();
        drop(db);
        // Second open re-runs the migration against the existing schema.
        Db::new(path).unwrap();
    }

    #[test]
    fn sqlite_datetime_matches_canonical_format() {
        let ts = DateTime::parse_from_rfc3339("2025-01-15T09:05:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(sqlite_datetime(&ts), "2025-01-15 09:05:00");
    }
}
