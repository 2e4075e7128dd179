use rusqlite::params;
use std::collections::HashSet;
use tracing::info;
use uuid::Uuid;

use crate::db::Db;
use crate::error::Result;
use crate::maintenance::{self, MaintenanceOracle};
use crate::models::{validate_monitor_list, Monitor};
use crate::runner::MonitorEntry;
use crate::scheduler::Scheduler;

/// Apply a new monitor list: validate, sync the store in one transaction,
/// replace the recurring-maintenance map, then rebuild the job queue.
/// Idempotent for an unchanged list; any validation failure aborts with the
/// prior configuration still active.
pub fn reload(
    db: &Db,
    oracle: &MaintenanceOracle,
    scheduler: &Scheduler,
    monitors: &[Monitor],
) -> Result<()> {
    validate_monitor_list(monitors)?;

    {
        let mut conn = db.conn.lock().unwrap();
        let tx = conn.transaction()?;

        for monitor in monitors {
            tx.execute(
                "INSERT INTO monitors (id, name, group_name, monitor_type, url, interval_seconds, is_public)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     group_name = excluded.group_name,
                     monitor_type = excluded.monitor_type,
                     url = excluded.url,
                     interval_seconds = excluded.interval_seconds,
                     is_public = excluded.is_public,
                     updated_at = datetime('now')",
                params![
                    monitor.id,
                    monitor.name,
                    monitor.group,
                    monitor.kind.as_str(),
                    monitor.url,
                    monitor.interval_seconds,
                    monitor.public as i64,
                ],
            )?;

            // Replace the monitor's fixed windows: upsert by
            // (monitor_id, start_time), drop the rest.
            let fixed = maintenance::fixed_windows_utc(&monitor.maintenance_windows);
            if fixed.is_empty() {
                tx.execute(
                    "DELETE FROM maintenance_windows WHERE monitor_id = ?1",
                    params![monitor.id],
                )?;
            } else {
                let keep: Vec<String> = fixed.iter().map(|w| w.start_utc.clone()).collect();
                let placeholders =
                    keep.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
                let sql = format!(
                    "DELETE FROM maintenance_windows
                     WHERE monitor_id = ?1 AND start_time NOT IN ({placeholders})"
                );
                let mut args: Vec<&dyn rusqlite::ToSql> = vec![&monitor.id];
                for start in &keep {
                    args.push(start);
                }
                tx.execute(&sql, args.as_slice())?;

                for window in &fixed {
                    tx.execute(
                        "INSERT INTO maintenance_windows
                             (id, monitor_id, start_time, end_time, timezone, description)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT(monitor_id, start_time) DO UPDATE SET
                             end_time = excluded.end_time,
                             timezone = excluded.timezone,
                             description = excluded.description",
                        params![
                            Uuid::new_v4().to_string(),
                            monitor.id,
                            window.start_utc,
                            window.end_utc,
                            window.timezone,
                            window.description,
                        ],
                    )?;
                }
            }
        }

        // Monitors absent from the new list go away, cascading their check
        // rows and incidents.
        if monitors.is_empty() {
            tx.execute("DELETE FROM monitors", [])?;
        } else {
            let placeholders = monitors.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
            let sql = format!("DELETE FROM monitors WHERE id NOT IN ({placeholders})");
            let ids: Vec<i64> = monitors.iter().map(|m| m.id).collect();
            let args: Vec<&dyn rusqlite::ToSql> =
                ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
            tx.execute(&sql, args.as_slice())?;
        }

        tx.commit()?;
    }

    // Recurring windows live in memory; replace each monitor's entry
    // wholesale and drop entries for removed monitors.
    let ids: HashSet<i64> = monitors.iter().map(|m| m.id).collect();
    for monitor in monitors {
        oracle.replace_recurring(
            monitor.id,
            maintenance::daily_windows_from_spec(&monitor.maintenance_windows),
        );
    }
    oracle.retain_monitors(&ids);

    // Compile conditions once, swap the scheduler's monitor set, rebuild the
    // job queue.
    scheduler.replace_monitors(monitors.iter().cloned().map(MonitorEntry::new).collect());
    scheduler.sync_jobs(monitors)?;

    info!(monitors = monitors.len(), "configuration applied");
    Ok(())
}
