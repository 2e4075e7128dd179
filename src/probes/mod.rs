use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::models::{Monitor, MonitorType};

mod dns;
mod http;
mod ping;
mod tcp;
mod tls;
mod websocket;

pub use dns::DnsProbe;
pub use http::HttpProbe;
pub use ping::PingProbe;
pub use tcp::TcpProbe;
pub use websocket::WebsocketProbe;

/// Context keys a probe may populate. Conditions reference these by name.
pub mod keys {
    pub const STATUS: &str = "STATUS";
    pub const RESPONSE_TIME: &str = "RESPONSE_TIME";
    pub const CONNECTED: &str = "CONNECTED";
    pub const BODY: &str = "BODY";
    pub const HEADERS: &str = "HEADERS";
    pub const CERTIFICATE_EXPIRATION: &str = "CERTIFICATE_EXPIRATION";
    pub const CERTIFICATE_EXPIRY_DAYS: &str = "CERTIFICATE_EXPIRY_DAYS";
    pub const DNS_RCODE: &str = "DNS_RCODE";
    pub const ERROR: &str = "ERROR";
    pub const TIMESTAMP: &str = "TIMESTAMP";
}

/// Typed bag of observable attributes produced by one probe invocation.
/// Absent keys read as null in condition evaluation.
pub type ProbeContext = BTreeMap<String, Value>;

/// Transport-level outcome of a single probe. Condition evaluation happens
/// separately in the runner.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub success: bool,
    pub response_time_ms: u64,
    pub context: ProbeContext,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn success(response_time_ms: u64, mut context: ProbeContext) -> Self {
        stamp(&mut context);
        ProbeResult { success: true, response_time_ms, context, error: None }
    }

    pub fn failure(response_time_ms: u64, error: String) -> Self {
        let mut context = ProbeContext::new();
        context.insert(keys::CONNECTED.into(), json!(false));
        context.insert(keys::ERROR.into(), Value::String(error.clone()));
        stamp(&mut context);
        ProbeResult { success: false, response_time_ms, context, error: Some(error) }
    }
}

fn stamp(context: &mut ProbeContext) {
    context
        .entry(keys::TIMESTAMP.to_string())
        .or_insert_with(|| json!(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)));
}

/// One protocol's check. Implementations must resolve within the given
/// timeout (the runner enforces a hard grace on top) and must never panic on
/// unreachable targets; failures are data.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, monitor: &Monitor, timeout: Duration) -> ProbeResult;
}

/// Registry mapping monitor types to probe implementations.
pub struct ProbeSet {
    probes: HashMap<MonitorType, Arc<dyn Probe>>,
}

impl ProbeSet {
    pub fn new() -> Result<Self, reqwest::Error> {
        let mut probes: HashMap<MonitorType, Arc<dyn Probe>> = HashMap::new();
        probes.insert(MonitorType::Http, Arc::new(HttpProbe::new()?));
        probes.insert(MonitorType::Tcp, Arc::new(TcpProbe));
        probes.insert(MonitorType::Websocket, Arc::new(WebsocketProbe));
        probes.insert(MonitorType::Dns, Arc::new(DnsProbe));
        probes.insert(MonitorType::Ping, Arc::new(PingProbe));
        Ok(ProbeSet { probes })
    }

    /// Replace or add the probe for a monitor type. Used to plug in
    /// alternative implementations (tests stub protocols this way).
    pub fn insert(&mut self, kind: MonitorType, probe: Arc<dyn Probe>) {
        self.probes.insert(kind, probe);
    }

    pub fn get(&self, kind: MonitorType) -> Option<Arc<dyn Probe>> {
        self.probes.get(&kind).cloned()
    }
}
