use chrono::{DateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use rusqlite::params;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::db::{sqlite_datetime, Db};
use crate::error::Result;
use crate::models::{parse_local_datetime, parse_time_of_day, parse_timezone, MaintenanceWindowSpec};

/// A recurring daily window, held in process memory. May wrap past midnight
/// (start_time > end_time means overnight).
#[derive(Debug, Clone)]
pub struct DailyWindow {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub timezone: Tz,
    pub description: Option<String>,
}

/// A fixed window normalized to UTC, ready for storage.
#[derive(Debug, Clone)]
pub struct FixedWindow {
    pub start_utc: String,
    pub end_utc: String,
    pub timezone: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MaintenanceStatus {
    pub in_maintenance: bool,
    pub description: Option<String>,
    pub ends_at: Option<DateTime<Utc>>,
}

/// Answers "is this monitor in a maintenance window right now?". Recurring
/// daily windows are checked first and take precedence over fixed windows;
/// fixed windows with a null monitor_id apply globally.
pub struct MaintenanceOracle {
    db: Arc<Db>,
    recurring: RwLock<HashMap<i64, Vec<DailyWindow>>>,
}

impl MaintenanceOracle {
    pub fn new(db: Arc<Db>) -> Self {
        MaintenanceOracle { db, recurring: RwLock::new(HashMap::new()) }
    }

    /// Replace the recurring windows for one monitor wholesale. Only the
    /// reload path writes here.
    pub fn replace_recurring(&self, monitor_id: i64, windows: Vec<DailyWindow>) {
        let mut map = self.recurring.write().unwrap();
        if windows.is_empty() {
            map.remove(&monitor_id);
        } else {
            map.insert(monitor_id, windows);
        }
    }

    /// Drop recurring entries for monitors no longer in the configuration.
    pub fn retain_monitors(&self, ids: &HashSet<i64>) {
        self.recurring.write().unwrap().retain(|id, _| ids.contains(id));
    }

    pub fn in_maintenance(&self, monitor_id: i64, now: DateTime<Utc>) -> Result<MaintenanceStatus> {
        // Recurring daily windows first.
        {
            let map = self.recurring.read().unwrap();
            if let Some(windows) = map.get(&monitor_id) {
                for window in windows {
                    if let Some(status) = window.active_at(now) {
                        return Ok(status);
                    }
                }
            }
        }

        // Fixed windows, monitor-specific or global.
        let conn = self.db.conn.lock().unwrap();
        let now_str = sqlite_datetime(&now);
        let row: Option<(Option<String>, String)> = conn
            .query_row(
                "SELECT description, end_time FROM maintenance_windows
                 WHERE start_time <= ?1 AND end_time >= ?1
                   AND (monitor_id = ?2 OR monitor_id IS NULL)
                 ORDER BY start_time ASC LIMIT 1",
                params![now_str, monitor_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        Ok(match row {
            Some((description, end_time)) => MaintenanceStatus {
                in_maintenance: true,
                description,
                ends_at: parse_local_datetime(&end_time).map(|naive| Utc.from_utc_datetime(&naive)),
            },
            None => MaintenanceStatus::default(),
        })
    }
}

impl DailyWindow {
    /// Minute-of-day containment in the window's own timezone, with
    /// overnight wraparound when start > end.
    fn active_at(&self, now: DateTime<Utc>) -> Option<MaintenanceStatus> {
        let local = now.with_timezone(&self.timezone);
        let minute = (local.time().hour() * 60 + local.time().minute()) as i32;
        let start = (self.start_time.hour() * 60 + self.start_time.minute()) as i32;
        let end = (self.end_time.hour() * 60 + self.end_time.minute()) as i32;

        let active = if start <= end {
            minute >= start && minute < end
        } else {
            minute >= start || minute < end
        };
        if !active {
            return None;
        }

        Some(MaintenanceStatus {
            in_maintenance: true,
            description: self.description.clone(),
            ends_at: self.next_end(now),
        })
    }

    /// Next wall-clock occurrence of end_time in the window's timezone
    /// (tomorrow once an overnight window has crossed midnight).
    fn next_end(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = now.with_timezone(&self.timezone);
        let today = local.date_naive();
        let mut candidate = self
            .timezone
            .from_local_datetime(&today.and_time(self.end_time))
            .earliest()?;
        if candidate <= local {
            candidate = self
                .timezone
                .from_local_datetime(&today.succ_opt()?.and_time(self.end_time))
                .earliest()?;
        }
        Some(candidate.with_timezone(&Utc))
    }
}

/// Extract the recurring entries from a monitor's window specs. Specs are
/// validated at reload, so unparseable entries are silently skipped here.
pub fn daily_windows_from_spec(specs: &[MaintenanceWindowSpec]) -> Vec<DailyWindow> {
    specs
        .iter()
        .filter_map(|spec| match spec {
            MaintenanceWindowSpec::Daily { start_time, end_time, timezone, description } => {
                Some(DailyWindow {
                    start_time: parse_time_of_day(start_time)?,
                    end_time: parse_time_of_day(end_time)?,
                    timezone: parse_timezone(timezone)?,
                    description: description.clone(),
                })
            }
            MaintenanceWindowSpec::Fixed { .. } => None,
        })
        .collect()
}

/// Extract the fixed entries, converting local datetimes to UTC storage form.
pub fn fixed_windows_utc(specs: &[MaintenanceWindowSpec]) -> Vec<FixedWindow> {
    specs
        .iter()
        .filter_map(|spec| match spec {
            MaintenanceWindowSpec::Fixed { start, end, timezone, description } => {
                let tz = parse_timezone(timezone)?;
                let start_local = tz.from_local_datetime(&parse_local_datetime(start)?).earliest()?;
                let end_local = tz.from_local_datetime(&parse_local_datetime(end)?).earliest()?;
                Some(FixedWindow {
                    start_utc: sqlite_datetime(&start_local.with_timezone(&Utc)),
                    end_utc: sqlite_datetime(&end_local.with_timezone(&Utc)),
                    timezone: timezone.clone(),
                    description: description.clone(),
                })
            }
            MaintenanceWindowSpec::Daily { .. } => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        Utc.from_utc_datetime(&parse_local_datetime(s).unwrap())
    }

    fn window(start: &str, end: &str, tz: &str) -> DailyWindow {
        DailyWindow {
            start_time: parse_time_of_day(start).unwrap(),
            end_time: parse_time_of_day(end).unwrap(),
            timezone: tz.parse().unwrap(),
            description: None,
        }
    }

    #[test]
    fn simple_window_containment() {
        let w = window("09:00", "09:15", "UTC");
        assert!(w.active_at(utc("2025-06-01T09:05:00")).is_some());
        assert!(w.active_at(utc("2025-06-01T09:00:00")).is_some());
        // End is exclusive.
        assert!(w.active_at(utc("2025-06-01T09:15:00")).is_none());
        assert!(w.active_at(utc("2025-06-01T08:59:00")).is_none());
    }

    #[test]
    fn overnight_window_wraps_midnight() {
        let w = window("23:00", "01:00", "UTC");
        assert!(w.active_at(utc("2025-06-01T23:30:00")).is_some());
        assert!(w.active_at(utc("2025-06-02T00:30:00")).is_some());
        assert!(w.active_at(utc("2025-06-02T01:00:00")).is_none());
        assert!(w.active_at(utc("2025-06-01T12:00:00")).is_none());
    }

    #[test]
    fn overnight_ends_at_lands_tomorrow() {
        let w = window("23:00", "01:00", "UTC");
        let status = w.active_at(utc("2025-06-01T23:30:00")).unwrap();
        assert_eq!(status.ends_at.unwrap(), utc("2025-06-02T01:00:00"));

        // Past midnight the end is later today.
        let status = w.active_at(utc("2025-06-02T00:30:00")).unwrap();
        assert_eq!(status.ends_at.unwrap(), utc("2025-06-02T01:00:00"));
    }

    #[test]
    fn window_respects_timezone() {
        // 09:00-10:00 in New York is 13:00-14:00 UTC in June (EDT).
        let w = window("09:00", "10:00", "America/New_York");
        assert!(w.active_at(utc("2025-06-01T13:30:00")).is_some());
        assert!(w.active_at(utc("2025-06-01T09:30:00")).is_none());
    }

    #[test]
    fn fixed_window_lookup_includes_global() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Db::new(dir.path().join("m.db").to_str().unwrap()).unwrap());
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO monitors (id, name, monitor_type, url, interval_seconds)
                 VALUES (1, 'svc', 'http', 'http://x', 30)",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO maintenance_windows (id, monitor_id, start_time, end_time, timezone, description)
                 VALUES ('w1', NULL, '2025-06-01 10:00:00', '2025-06-01 11:00:00', 'UTC', 'global patching')",
                [],
            )
            .unwrap();
        }
        let oracle = MaintenanceOracle::new(db);

        let status = oracle.in_maintenance(1, utc("2025-06-01T10:30:00")).unwrap();
        assert!(status.in_maintenance);
        assert_eq!(status.description.as_deref(), Some("global patching"));
        assert_eq!(status.ends_at.unwrap(), utc("2025-06-01T11:00:00"));

        let status = oracle.in_maintenance(1, utc("2025-06-01T12:00:00")).unwrap();
        assert!(!status.in_maintenance);
    }

    #[test]
    fn daily_takes_precedence_over_fixed() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Db::new(dir.path().join("m.db").to_str().unwrap()).unwrap());
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO monitors (id, name, monitor_type, url, interval_seconds)
                 VALUES (1, 'svc', 'http', 'http://x', 30)",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO maintenance_windows (id, monitor_id, start_time, end_time, timezone, description)
                 VALUES ('w1', 1, '2025-06-01 09:00:00', '2025-06-01 12:00:00', 'UTC', 'fixed')",
                [],
            )
            .unwrap();
        }
        let oracle = MaintenanceOracle::new(db);
        oracle.replace_recurring(
            1,
            vec![DailyWindow {
                start_time: parse_time_of_day("09:00").unwrap(),
                end_time: parse_time_of_day("10:00").unwrap(),
                timezone: chrono_tz::UTC,
                description: Some("daily".into()),
            }],
        );

        let status = oracle.in_maintenance(1, utc("2025-06-01T09:30:00")).unwrap();
        assert_eq!(status.description.as_deref(), Some("daily"));
    }

    #[test]
    fn recurring_map_replacement_is_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Db::new(dir.path().join("m.db").to_str().unwrap()).unwrap());
        let oracle = MaintenanceOracle::new(db);
        oracle.replace_recurring(1, vec![window("09:00", "10:00", "UTC")]);
        assert!(oracle.in_maintenance(1, utc("2025-06-01T09:30:00")).unwrap().in_maintenance);

        oracle.replace_recurring(1, vec![]);
        assert!(!oracle.in_maintenance(1, utc("2025-06-01T09:30:00")).unwrap().in_maintenance);
    }
}
