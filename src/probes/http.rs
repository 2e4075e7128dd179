use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use super::{keys, Probe, ProbeContext, ProbeResult};
use crate::models::Monitor;
use crate::probes::tls;

/// HTTP(S) check: GET with bounded redirects, every status code accepted at
/// the transport level. For https targets a certificate-expiry side channel
/// runs concurrently with the request and never delays it beyond its own
/// timeout.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(HttpProbe { client })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, monitor: &Monitor, timeout: Duration) -> ProbeResult {
        let start = Instant::now();

        // Kick off the certificate side channel before awaiting the request.
        let cert_task = reqwest::Url::parse(&monitor.url).ok().and_then(|url| {
            if url.scheme() != "https" {
                return None;
            }
            let host = url.host_str()?.to_string();
            let port = url.port().unwrap_or(443);
            Some(tokio::spawn(tls::certificate_expiry(host, port)))
        });

        let response = self.client.get(&monitor.url).timeout(timeout).send().await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let response = match response {
            Ok(resp) => resp,
            Err(e) => {
                if let Some(task) = cert_task {
                    task.abort();
                }
                return ProbeResult::failure(elapsed_ms, describe_error(&e));
            }
        };

        let status = response.status().as_u16();
        let mut headers = serde_json::Map::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.to_string(), json!(v));
            }
        }
        let looks_json = headers
            .get("content-type")
            .and_then(|v| v.as_str())
            .map(|ct| ct.contains("json"))
            .unwrap_or(false);

        let body = match response.text().await {
            Ok(text) => {
                if looks_json {
                    serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text))
                } else {
                    Value::String(text)
                }
            }
            Err(e) => {
                if let Some(task) = cert_task {
                    task.abort();
                }
                return ProbeResult::failure(elapsed_ms, format!("body read failed: {e}"));
            }
        };

        let mut context = ProbeContext::new();
        context.insert(keys::STATUS.into(), json!(status));
        context.insert(keys::RESPONSE_TIME.into(), json!(elapsed_ms));
        context.insert(keys::CONNECTED.into(), json!(true));
        context.insert(keys::BODY.into(), body);
        context.insert(keys::HEADERS.into(), Value::Object(headers));

        // The side channel has its own 5s timeout; on any failure the
        // certificate keys are simply absent.
        if let Some(task) = cert_task {
            if let Ok(Some(expiry)) = task.await {
                context.insert(keys::CERTIFICATE_EXPIRY_DAYS.into(), json!(expiry.days));
                context.insert(keys::CERTIFICATE_EXPIRATION.into(), json!(expiry.human));
            }
        }

        ProbeResult::success(elapsed_ms, context)
    }
}

/// Map a reqwest failure onto a short error string. The wording matters:
/// incident severity keys off "DNS", "certificate", "timeout" and
/// "ECONNREFUSED" markers.
fn describe_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        return "timeout: request did not complete in time".to_string();
    }
    let detail = e.to_string().to_lowercase();
    if detail.contains("dns") || detail.contains("resolve") {
        format!("DNS resolution failed: {e}")
    } else if detail.contains("refused") {
        format!("ECONNREFUSED: {e}")
    } else if detail.contains("certificate") || detail.contains("tls") || detail.contains("ssl") {
        format!("certificate error: {e}")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        format!("request failed: {e}")
    }
}
