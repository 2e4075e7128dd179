use async_trait::async_trait;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use super::{keys, Probe, ProbeContext, ProbeResult};
use crate::models::Monitor;

/// TCP connectivity check: dial host:port within the timeout, close
/// immediately. `CONNECTED` mirrors the transport outcome.
pub struct TcpProbe;

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, monitor: &Monitor, timeout: Duration) -> ProbeResult {
        let addr = monitor.url.strip_prefix("tcp://").unwrap_or(&monitor.url);
        let start = Instant::now();

        let result = tokio::time::timeout(timeout, TcpStream::connect(addr)).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(_stream)) => {
                let mut context = ProbeContext::new();
                context.insert(keys::CONNECTED.into(), json!(true));
                context.insert(keys::RESPONSE_TIME.into(), json!(elapsed_ms));
                ProbeResult::success(elapsed_ms, context)
            }
            Ok(Err(e)) => {
                let msg = if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    format!("ECONNREFUSED: connection to {addr} refused")
                } else {
                    format!("tcp connect failed: {e}")
                };
                ProbeResult::failure(elapsed_ms, msg)
            }
            Err(_) => ProbeResult::failure(
                elapsed_ms,
                format!("timeout: tcp connect to {addr} exceeded {}ms", timeout.as_millis()),
            ),
        }
    }
}
