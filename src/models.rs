use chrono::{DateTime, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorType {
    Http,
    Tcp,
    Websocket,
    Dns,
    Ping,
    #[serde(other)]
    Unknown,
}

impl MonitorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorType::Http => "http",
            MonitorType::Tcp => "tcp",
            MonitorType::Websocket => "websocket",
            MonitorType::Dns => "dns",
            MonitorType::Ping => "ping",
            MonitorType::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "http" => MonitorType::Http,
            "tcp" => MonitorType::Tcp,
            "websocket" => MonitorType::Websocket,
            "dns" => MonitorType::Dns,
            "ping" => MonitorType::Ping,
            _ => MonitorType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsParams {
    pub query_name: String,
    #[serde(default = "default_query_type")]
    pub query_type: String,
}

fn default_query_type() -> String { "A".into() }

/// One maintenance window entry in a monitor's configuration. A window with
/// absolute `start`/`end` datetimes is fixed; a window with `start_time`/
/// `end_time` times of day recurs daily and may wrap past midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaintenanceWindowSpec {
    Fixed {
        start: String,
        end: String,
        #[serde(default = "default_timezone")]
        timezone: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Daily {
        start_time: String,
        end_time: String,
        #[serde(default = "default_timezone")]
        timezone: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

fn default_timezone() -> String { "UTC".into() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(rename = "type")]
    pub kind: MonitorType,
    pub url: String,
    #[serde(default = "default_interval")]
    pub interval_seconds: u32,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u32,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsParams>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub maintenance_windows: Vec<MaintenanceWindowSpec>,
}

fn default_interval() -> u32 { 60 }
fn default_timeout() -> u32 { 30 }

impl Monitor {
    /// Validate a single monitor record. Called by reload before anything is
    /// written; a failure leaves the previous configuration active.
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation(format!("monitor {}: name is empty", self.id)));
        }
        if self.kind == MonitorType::Unknown {
            return Err(Error::Validation(format!("monitor {}: unknown type", self.id)));
        }
        if self.interval_seconds < 10 {
            return Err(Error::Validation(format!(
                "monitor {}: interval_seconds must be >= 10 (got {})",
                self.id, self.interval_seconds
            )));
        }
        for window in &self.maintenance_windows {
            window.validate(self.id)?;
        }
        Ok(())
    }
}

impl MaintenanceWindowSpec {
    pub fn validate(&self, monitor_id: i64) -> Result<(), Error> {
        match self {
            MaintenanceWindowSpec::Fixed { start, end, timezone, .. } => {
                let start = parse_local_datetime(start).ok_or_else(|| {
                    Error::Validation(format!(
                        "monitor {monitor_id}: bad maintenance start '{start}'"
                    ))
                })?;
                let end = parse_local_datetime(end).ok_or_else(|| {
                    Error::Validation(format!("monitor {monitor_id}: bad maintenance end '{end}'"))
                })?;
                if start >= end {
                    return Err(Error::Validation(format!(
                        "monitor {monitor_id}: maintenance window start must precede end"
                    )));
                }
                parse_timezone(timezone).ok_or_else(|| {
                    Error::Validation(format!("monitor {monitor_id}: bad timezone '{timezone}'"))
                })?;
            }
            MaintenanceWindowSpec::Daily { start_time, end_time, timezone, .. } => {
                parse_time_of_day(start_time).ok_or_else(|| {
                    Error::Validation(format!(
                        "monitor {monitor_id}: bad maintenance start_time '{start_time}'"
                    ))
                })?;
                parse_time_of_day(end_time).ok_or_else(|| {
                    Error::Validation(format!(
                        "monitor {monitor_id}: bad maintenance end_time '{end_time}'"
                    ))
                })?;
                parse_timezone(timezone).ok_or_else(|| {
                    Error::Validation(format!("monitor {monitor_id}: bad timezone '{timezone}'"))
                })?;
            }
        }
        Ok(())
    }
}

/// Validate a whole monitor list: per-monitor rules plus id uniqueness.
pub fn validate_monitor_list(monitors: &[Monitor]) -> Result<(), Error> {
    let mut seen = HashSet::new();
    for monitor in monitors {
        monitor.validate()?;
        if !seen.insert(monitor.id) {
            return Err(Error::Validation(format!("duplicate monitor id {}", monitor.id)));
        }
    }
    Ok(())
}

pub fn parse_local_datetime(s: &str) -> Option<NaiveDateTime> {
    let trimmed = s.trim_end_matches('Z');
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S"))
        .ok()
}

pub fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

pub fn parse_timezone(s: &str) -> Option<chrono_tz::Tz> {
    s.parse::<chrono_tz::Tz>().ok()
}

// ─── Check Results ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Up,
    Down,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Up => "up",
            CheckStatus::Down => "down",
        }
    }

    pub fn from_success(success: bool) -> Self {
        if success { CheckStatus::Up } else { CheckStatus::Down }
    }
}

/// Per-condition evaluation outcome, parallel to `Monitor::conditions`.
#[derive(Debug, Clone, Serialize)]
pub struct ConditionOutcome {
    pub condition: String,
    pub passed: bool,
}

/// The runner's verdict for a single monitor invocation: probe-level success
/// combined with the condition evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub monitor_id: i64,
    pub monitor_name: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub condition_results: Vec<ConditionOutcome>,
}

/// A persisted check row, newest-first in most queries.
#[derive(Debug, Clone, Serialize)]
pub struct CheckRow {
    pub id: i64,
    pub monitor_id: i64,
    pub status: CheckStatus,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: String,
}

// ─── Incidents ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Investigating,
    Identified,
    Monitoring,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Investigating => "investigating",
            IncidentStatus::Identified => "identified",
            IncidentStatus::Monitoring => "monitoring",
            IncidentStatus::Resolved => "resolved",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "identified" => IncidentStatus::Identified,
            "monitoring" => IncidentStatus::Monitoring,
            "resolved" => IncidentStatus::Resolved,
            _ => IncidentStatus::Investigating,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentSeverity {
    Minor,
    Major,
    Critical,
}

impl IncidentSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentSeverity::Minor => "minor",
            IncidentSeverity::Major => "major",
            IncidentSeverity::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "major" => IncidentSeverity::Major,
            "critical" => IncidentSeverity::Critical,
            _ => IncidentSeverity::Minor,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    pub id: String,
    pub monitor_id: i64,
    pub status: IncidentStatus,
    pub severity: IncidentSeverity,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
}

// ─── Daily Summaries ────────────────────────────────────────────────────────

/// One per-(monitor, day) uptime summary row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusHistoryDay {
    pub monitor_id: i64,
    pub date: String,
    pub uptime_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_response_time_ms: Option<i64>,
    pub total_checks: i64,
    pub successful_checks: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(id: i64) -> Monitor {
        Monitor {
            id,
            name: format!("svc-{id}"),
            group: None,
            kind: MonitorType::Http,
            url: "http://example.test".into(),
            interval_seconds: 30,
            timeout_seconds: 30,
            public: true,
            conditions: vec![],
            dns: None,
            maintenance_windows: vec![],
        }
    }

    #[test]
    fn rejects_short_interval() {
        let mut m = monitor(1);
        m.interval_seconds = 5;
        assert!(m.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_ids() {
        assert!(validate_monitor_list(&[monitor(1), monitor(1)]).is_err());
        assert!(validate_monitor_list(&[monitor(1), monitor(2)]).is_ok());
    }

    #[test]
    fn rejects_unknown_type_from_config() {
        let parsed: Monitor = serde_json::from_str(
            r#"{"id": 7, "name": "x", "type": "gopher", "url": "gopher://x"}"#,
        )
        .unwrap();
        assert_eq!(parsed.kind, MonitorType::Unknown);
        assert!(parsed.validate().is_err());
    }

    #[test]
    fn window_spec_shapes_deserialize() {
        let fixed: MaintenanceWindowSpec = serde_json::from_str(
            r#"{"start": "2026-03-01T02:00:00", "end": "2026-03-01T04:00:00", "timezone": "UTC"}"#,
        )
        .unwrap();
        assert!(matches!(fixed, MaintenanceWindowSpec::Fixed { .. }));

        let daily: MaintenanceWindowSpec =
            serde_json::from_str(r#"{"start_time": "23:00", "end_time": "01:00"}"#).unwrap();
        assert!(matches!(daily, MaintenanceWindowSpec::Daily { .. }));
        assert!(daily.validate(1).is_ok());
    }

    #[test]
    fn fixed_window_must_start_before_end() {
        let spec = MaintenanceWindowSpec::Fixed {
            start: "2026-03-01T04:00:00".into(),
            end: "2026-03-01T02:00:00".into(),
            timezone: "UTC".into(),
            description: None,
        };
        assert!(spec.validate(1).is_err());
    }
}
