use rusqlite::params;
use std::sync::Arc;
use tracing::{debug, info};

use crate::db::{sqlite_datetime, Db};
use crate::error::Result;
use crate::events::{EventBroadcaster, IncidentEvent, IncidentEventKind};
use crate::maintenance::MaintenanceOracle;
use crate::models::{CheckResult, CheckStatus, Incident, IncidentSeverity, IncidentStatus};
use crate::store::CheckStore;

/// Consecutive failing checks required before an incident opens.
pub fn failure_threshold() -> u32 {
    std::env::var("FAILURE_THRESHOLD")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2)
}

/// Turns the stream of per-monitor check results into incident open/resolve
/// transitions. Stateless per call: all state lives in the incident table,
/// and the one-active-incident invariant is enforced by a guarded insert
/// backed by the partial unique index on (monitor_id) WHERE resolved_at IS
/// NULL.
pub struct IncidentDetector {
    db: Arc<Db>,
    store: CheckStore,
    oracle: Arc<MaintenanceOracle>,
    events: Arc<EventBroadcaster>,
    failure_threshold: u32,
}

impl IncidentDetector {
    pub fn new(
        db: Arc<Db>,
        store: CheckStore,
        oracle: Arc<MaintenanceOracle>,
        events: Arc<EventBroadcaster>,
        failure_threshold: u32,
    ) -> Self {
        IncidentDetector { db, store, oracle, events, failure_threshold: failure_threshold.max(1) }
    }

    /// Process one check result: persist it, then advance incident state.
    /// Maintenance windows suppress incident transitions but never the check
    /// row itself.
    pub fn process(&self, result: &CheckResult) -> Result<()> {
        self.store.save(result)?;

        let maintenance = self.oracle.in_maintenance(result.monitor_id, result.timestamp)?;
        if maintenance.in_maintenance {
            debug!(monitor_id = result.monitor_id, "in maintenance; incident state untouched");
            return Ok(());
        }

        let active = self.active_incident(result.monitor_id)?;

        if result.success {
            if let Some(incident) = active {
                self.resolve(&incident, result)?;
            }
            return Ok(());
        }

        if active.is_some() {
            // Already tracking this outage.
            return Ok(());
        }

        // Walk recent rows newest-first; the run ends at the first success.
        let recent = self.store.recent(result.monitor_id, self.failure_threshold as usize)?;
        let run = recent.iter().take_while(|c| c.status == CheckStatus::Down).count() as u32;
        if run >= self.failure_threshold {
            self.open(result)?;
        }
        Ok(())
    }

    pub fn active_incident(&self, monitor_id: i64) -> Result<Option<Incident>> {
        let conn = self.db.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, monitor_id, status, severity, title, description, started_at, resolved_at
                 FROM incidents WHERE monitor_id = ?1 AND resolved_at IS NULL LIMIT 1",
                params![monitor_id],
                |r| {
                    let status: String = r.get(2)?;
                    let severity: String = r.get(3)?;
                    Ok(Incident {
                        id: r.get(0)?,
                        monitor_id: r.get(1)?,
                        status: IncidentStatus::from_str(&status),
                        severity: IncidentSeverity::from_str(&severity),
                        title: r.get(4)?,
                        description: r.get(5)?,
                        started_at: r.get(6)?,
                        resolved_at: r.get(7)?,
                    })
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(row)
    }

    fn open(&self, result: &CheckResult) -> Result<()> {
        let id = uuid::Uuid::new_v4().to_string();
        let severity = classify_severity(result.error.as_deref());
        let title = format!("{} is down", result.monitor_name);
        let started_at = sqlite_datetime(&result.timestamp);

        // Conditional on no currently active incident, so two overlapping
        // workers cannot open duplicates.
        let inserted = {
            let conn = self.db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO incidents (id, monitor_id, status, severity, title, description, started_at)
                 SELECT ?1, ?2, 'investigating', ?3, ?4, ?5, ?6
                 WHERE NOT EXISTS (
                     SELECT 1 FROM incidents WHERE monitor_id = ?2 AND resolved_at IS NULL
                 )",
                params![id, result.monitor_id, severity.as_str(), title, result.error, started_at],
            )?
        };

        if inserted == 1 {
            info!(
                monitor_id = result.monitor_id,
                incident_id = %id,
                severity = severity.as_str(),
                "incident opened"
            );
            self.events.send(IncidentEvent {
                kind: IncidentEventKind::Opened,
                monitor_id: result.monitor_id,
                incident_id: id,
                timestamp: result.timestamp,
                severity: Some(severity),
                title: Some(title),
            });
        }
        Ok(())
    }

    fn resolve(&self, incident: &Incident, result: &CheckResult) -> Result<()> {
        let resolved_at = sqlite_datetime(&result.timestamp);
        let updated = {
            let conn = self.db.conn.lock().unwrap();
            conn.execute(
                "UPDATE incidents SET status = 'resolved', resolved_at = ?1
                 WHERE id = ?2 AND resolved_at IS NULL",
                params![resolved_at, incident.id],
            )?
        };

        if updated > 0 {
            info!(monitor_id = result.monitor_id, incident_id = %incident.id, "incident resolved");
            self.events.send(IncidentEvent {
                kind: IncidentEventKind::Resolved,
                monitor_id: result.monitor_id,
                incident_id: incident.id.clone(),
                timestamp: result.timestamp,
                severity: Some(incident.severity),
                title: Some(incident.title.clone()),
            });
        }
        Ok(())
    }

    /// Flapping query: last 20 rows, at least 10 required, more than 5
    /// transitions counts as flapping. Not consulted by the open path.
    pub fn is_flapping(&self, monitor_id: i64) -> Result<bool> {
        let rows = self.store.recent(monitor_id, 20)?;
        if rows.len() < 10 {
            return Ok(false);
        }
        let transitions = rows.windows(2).filter(|w| w[0].status != w[1].status).count();
        Ok(transitions > 5)
    }
}

/// Severity from the failing check's error string. DNS and certificate
/// faults indicate misconfiguration or expiry; timeouts and refused
/// connections are service-level outages.
pub fn classify_severity(error: Option<&str>) -> IncidentSeverity {
    let Some(error) = error else { return IncidentSeverity::Minor };
    let lower = error.to_lowercase();
    if lower.contains("dns") || lower.contains("certificate") {
        IncidentSeverity::Critical
    } else if lower.contains("timeout") || lower.contains("econnrefused") {
        IncidentSeverity::Major
    } else {
        IncidentSeverity::Minor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_classification() {
        assert_eq!(classify_severity(None), IncidentSeverity::Minor);
        assert_eq!(classify_severity(Some("Body mismatch")), IncidentSeverity::Minor);
        assert_eq!(
            classify_severity(Some("timeout: request did not complete")),
            IncidentSeverity::Major
        );
        assert_eq!(
            classify_severity(Some("ECONNREFUSED: connection refused")),
            IncidentSeverity::Major
        );
        assert_eq!(classify_severity(Some("DNS lookup failed")), IncidentSeverity::Critical);
        assert_eq!(classify_severity(Some("certificate error: expired")), IncidentSeverity::Critical);
    }
}
