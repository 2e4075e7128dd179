use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use serde_json::json;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use super::{keys, Probe, ProbeContext, ProbeResult};
use crate::models::Monitor;

/// ICMP echo check. Hostnames are resolved first; success means at least one
/// reply arrived within the timeout.
pub struct PingProbe;

#[async_trait]
impl Probe for PingProbe {
    async fn probe(&self, monitor: &Monitor, timeout: Duration) -> ProbeResult {
        let host = monitor.url.strip_prefix("ping://").unwrap_or(&monitor.url);
        let start = Instant::now();

        let ip = match host.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => match resolve_host(host, timeout).await {
                Ok(ip) => ip,
                Err(msg) => {
                    return ProbeResult::failure(start.elapsed().as_millis() as u64, msg);
                }
            },
        };

        let payload = [0u8; 8];
        let result = tokio::time::timeout(timeout, surge_ping::ping(ip, &payload)).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok((_reply, duration))) => {
                let rtt_ms = duration.as_millis() as u64;
                let mut context = ProbeContext::new();
                context.insert(keys::RESPONSE_TIME.into(), json!(rtt_ms));
                context.insert(keys::CONNECTED.into(), json!(true));
                ProbeResult::success(rtt_ms, context)
            }
            Ok(Err(e)) => ProbeResult::failure(elapsed_ms, format!("ping to {host} failed: {e}")),
            Err(_) => ProbeResult::failure(
                elapsed_ms,
                format!("timeout: no ping reply from {host} within {}ms", timeout.as_millis()),
            ),
        }
    }
}

async fn resolve_host(host: &str, timeout: Duration) -> Result<IpAddr, String> {
    let resolver = TokioAsyncResolver::tokio_from_system_conf()
        .map_err(|e| format!("DNS resolver unavailable: {e}"))?;
    let lookup = tokio::time::timeout(timeout, resolver.lookup_ip(host))
        .await
        .map_err(|_| format!("timeout: DNS resolution of {host} timed out"))?
        .map_err(|e| format!("DNS resolution of {host} failed: {e}"))?;
    lookup
        .iter()
        .next()
        .ok_or_else(|| format!("DNS resolution of {host} returned no addresses"))
}
