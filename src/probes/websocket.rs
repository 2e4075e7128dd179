use async_trait::async_trait;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio_tungstenite::connect_async;

use super::{keys, Probe, ProbeContext, ProbeResult};
use crate::models::Monitor;

/// WebSocket check: perform the opening handshake, then close cleanly.
/// Success means the handshake completed.
pub struct WebsocketProbe;

#[async_trait]
impl Probe for WebsocketProbe {
    async fn probe(&self, monitor: &Monitor, timeout: Duration) -> ProbeResult {
        let start = Instant::now();

        let result = tokio::time::timeout(timeout, connect_async(monitor.url.as_str())).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok((mut stream, _response))) => {
                let _ = stream.close(None).await;
                let mut context = ProbeContext::new();
                context.insert(keys::CONNECTED.into(), json!(true));
                context.insert(keys::RESPONSE_TIME.into(), json!(elapsed_ms));
                ProbeResult::success(elapsed_ms, context)
            }
            Ok(Err(e)) => {
                ProbeResult::failure(elapsed_ms, format!("websocket handshake failed: {e}"))
            }
            Err(_) => ProbeResult::failure(
                elapsed_ms,
                format!("timeout: websocket handshake exceeded {}ms", timeout.as_millis()),
            ),
        }
    }
}
