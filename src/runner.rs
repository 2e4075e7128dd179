use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;

use crate::conditions::{self, Condition};
use crate::models::{CheckResult, Monitor};
use crate::probes::{ProbeResult, ProbeSet};

/// Extra headroom on top of a probe's own timeout before the runner gives up
/// on it entirely.
const TIMEOUT_GRACE: Duration = Duration::from_secs(2);

/// Default fan-out for batch runs.
pub const DEFAULT_BATCH_CONCURRENCY: usize = 20;

/// A monitor plus its conditions compiled once at config load.
#[derive(Debug, Clone)]
pub struct MonitorEntry {
    pub monitor: Monitor,
    pub conditions: Vec<Condition>,
}

impl MonitorEntry {
    pub fn new(monitor: Monitor) -> Self {
        let conditions = conditions::compile_all(&monitor.conditions);
        MonitorEntry { monitor, conditions }
    }
}

/// Dispatches a monitor to its probe, isolates probe panics, and folds the
/// condition evaluation into the final verdict.
pub struct Runner {
    probes: Arc<ProbeSet>,
}

impl Runner {
    pub fn new(probes: Arc<ProbeSet>) -> Self {
        Runner { probes }
    }

    pub async fn run_check(&self, entry: &MonitorEntry) -> CheckResult {
        let monitor = &entry.monitor;
        let timeout = Duration::from_secs(monitor.timeout_seconds.max(1) as u64);

        let probe_result = match self.probes.get(monitor.kind) {
            Some(probe) => {
                // Run on a separate task so a panicking probe becomes a
                // failed check instead of tearing down the worker.
                let owned = monitor.clone();
                let handle = tokio::spawn(async move {
                    match tokio::time::timeout(timeout + TIMEOUT_GRACE, probe.probe(&owned, timeout))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => ProbeResult::failure(
                            (timeout + TIMEOUT_GRACE).as_millis() as u64,
                            format!("timeout: probe exceeded {}ms", timeout.as_millis()),
                        ),
                    }
                });
                match handle.await {
                    Ok(result) => result,
                    Err(join_error) => ProbeResult::failure(0, panic_message(join_error)),
                }
            }
            None => ProbeResult::failure(0, format!("unknown monitor type '{}'", monitor.kind.as_str())),
        };

        let condition_results = conditions::evaluate_all(&entry.conditions, &probe_result.context);
        let success = probe_result.success && condition_results.iter().all(|c| c.passed);

        // A down check always carries a short reason; when the transport was
        // fine the first failed condition is the reason.
        let error = probe_result.error.clone().or_else(|| {
            if success {
                None
            } else {
                condition_results
                    .iter()
                    .find(|c| !c.passed)
                    .map(|c| format!("condition failed: {}", c.condition))
            }
        });

        CheckResult {
            monitor_id: monitor.id,
            monitor_name: monitor.name.clone(),
            timestamp: Utc::now(),
            success,
            response_time_ms: probe_result.response_time_ms,
            error,
            condition_results,
        }
    }

    /// Run a batch with bounded fan-out. Always yields exactly one result
    /// per entry, whatever individual probes do.
    pub async fn run_checks(
        &self,
        entries: Vec<Arc<MonitorEntry>>,
        concurrency: usize,
    ) -> Vec<CheckResult> {
        stream::iter(entries)
            .map(|entry| async move { self.run_check(&entry).await })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await
    }
}

fn panic_message(join_error: tokio::task::JoinError) -> String {
    if join_error.is_panic() {
        let payload = join_error.into_panic();
        if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "probe panicked".to_string()
        }
    } else {
        "probe task cancelled".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MonitorType;
    use crate::probes::{keys, Probe, ProbeContext};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn monitor(id: i64, kind: MonitorType, conditions: Vec<&str>) -> Monitor {
        Monitor {
            id,
            name: format!("svc-{id}"),
            group: None,
            kind,
            url: "http://example.test".into(),
            interval_seconds: 30,
            timeout_seconds: 5,
            public: true,
            conditions: conditions.into_iter().map(String::from).collect(),
            dns: None,
            maintenance_windows: vec![],
        }
    }

    struct StaticProbe {
        status: u16,
    }

    #[async_trait]
    impl Probe for StaticProbe {
        async fn probe(&self, _monitor: &Monitor, _timeout: Duration) -> crate::probes::ProbeResult {
            let mut context = ProbeContext::new();
            context.insert(keys::STATUS.into(), json!(self.status));
            context.insert(keys::CONNECTED.into(), json!(true));
            crate::probes::ProbeResult::success(12, context)
        }
    }

    struct PanickingProbe;

    #[async_trait]
    impl Probe for PanickingProbe {
        async fn probe(&self, _monitor: &Monitor, _timeout: Duration) -> crate::probes::ProbeResult {
            panic!("boom in probe");
        }
    }

    struct GaugedProbe {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Probe for GaugedProbe {
        async fn probe(&self, _monitor: &Monitor, _timeout: Duration) -> crate::probes::ProbeResult {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            crate::probes::ProbeResult::success(10, ProbeContext::new())
        }
    }

    fn probe_set_with(kind: MonitorType, probe: Arc<dyn Probe>) -> Arc<ProbeSet> {
        let mut set = ProbeSet::new().unwrap();
        set.insert(kind, probe);
        Arc::new(set)
    }

    #[tokio::test]
    async fn conditions_gate_the_verdict() {
        let probes = probe_set_with(MonitorType::Http, Arc::new(StaticProbe { status: 500 }));
        let runner = Runner::new(probes);
        let entry = MonitorEntry::new(monitor(1, MonitorType::Http, vec!["[STATUS] == 200"]));

        let result = runner.run_check(&entry).await;
        assert!(!result.success);
        assert_eq!(result.condition_results.len(), 1);
        assert!(!result.condition_results[0].passed);
        assert!(result.error.as_deref().unwrap().contains("condition failed"));
    }

    #[tokio::test]
    async fn probe_panic_becomes_failed_check() {
        let probes = probe_set_with(MonitorType::Http, Arc::new(PanickingProbe));
        let runner = Runner::new(probes);
        let entry = MonitorEntry::new(monitor(1, MonitorType::Http, vec![]));

        let result = runner.run_check(&entry).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("boom in probe"));
    }

    #[tokio::test]
    async fn unknown_type_fails_cleanly() {
        let runner = Runner::new(Arc::new(ProbeSet::new().unwrap()));
        let entry = MonitorEntry::new(monitor(1, MonitorType::Unknown, vec![]));

        let result = runner.run_check(&entry).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("unknown monitor type"));
    }

    #[tokio::test]
    async fn batch_returns_all_results_despite_panics() {
        let probes = probe_set_with(MonitorType::Http, Arc::new(PanickingProbe));
        let runner = Runner::new(probes);
        let entries: Vec<Arc<MonitorEntry>> = (1..=8)
            .map(|id| Arc::new(MonitorEntry::new(monitor(id, MonitorType::Http, vec![]))))
            .collect();

        let results = runner.run_checks(entries, 4).await;
        assert_eq!(results.len(), 8);
        assert!(results.iter().all(|r| !r.success));
    }

    #[tokio::test]
    async fn batch_respects_the_concurrency_bound() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let probes = probe_set_with(
            MonitorType::Http,
            Arc::new(GaugedProbe { current: current.clone(), peak: peak.clone() }),
        );
        let runner = Runner::new(probes);
        let entries: Vec<Arc<MonitorEntry>> = (1..=50)
            .map(|id| Arc::new(MonitorEntry::new(monitor(id, MonitorType::Http, vec![]))))
            .collect();

        let results = runner.run_checks(entries, 5).await;
        assert_eq!(results.len(), 50);
        assert!(peak.load(Ordering::SeqCst) <= 5, "peak was {}", peak.load(Ordering::SeqCst));

        let mut ids: Vec<i64> = results.iter().map(|r| r.monitor_id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 50);
    }
}
