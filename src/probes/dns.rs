use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::TokioAsyncResolver;
use serde_json::json;
use std::time::{Duration, Instant};

use super::{keys, Probe, ProbeContext, ProbeResult};
use crate::models::Monitor;

/// DNS check: typed query against the system resolver. Success requires a
/// non-empty NOERROR answer; `DNS_RCODE` is populated whenever the query got
/// far enough to observe one.
pub struct DnsProbe;

impl DnsProbe {
    fn resolver() -> TokioAsyncResolver {
        TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        })
    }
}

#[async_trait]
impl Probe for DnsProbe {
    async fn probe(&self, monitor: &Monitor, timeout: Duration) -> ProbeResult {
        let (query_name, query_type) = match &monitor.dns {
            Some(params) => (params.query_name.clone(), params.query_type.clone()),
            None => (monitor.url.clone(), "A".to_string()),
        };

        let record_type = match query_type.to_uppercase().parse::<RecordType>() {
            Ok(rt) => rt,
            Err(_) => {
                return ProbeResult::failure(0, format!("unsupported DNS record type '{query_type}'"));
            }
        };

        let resolver = Self::resolver();
        let start = Instant::now();
        let result =
            tokio::time::timeout(timeout, resolver.lookup(query_name.as_str(), record_type)).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(lookup)) => {
                let answers = lookup.iter().count();
                if answers == 0 {
                    let mut failed = ProbeResult::failure(
                        elapsed_ms,
                        format!("DNS query for {query_name} returned an empty answer"),
                    );
                    failed.context.insert(keys::DNS_RCODE.into(), json!("NOERROR"));
                    return failed;
                }
                let mut context = ProbeContext::new();
                context.insert(keys::DNS_RCODE.into(), json!("NOERROR"));
                context.insert(keys::RESPONSE_TIME.into(), json!(elapsed_ms));
                ProbeResult::success(elapsed_ms, context)
            }
            Ok(Err(e)) => {
                if let ResolveErrorKind::NoRecordsFound { response_code, .. } = e.kind() {
                    let rcode = response_code.to_string().to_uppercase();
                    let mut failed = ProbeResult::failure(
                        elapsed_ms,
                        format!("DNS query for {query_name} failed: {rcode}"),
                    );
                    failed.context.insert(keys::DNS_RCODE.into(), json!(rcode));
                    failed
                } else {
                    ProbeResult::failure(elapsed_ms, format!("DNS lookup failed: {e}"))
                }
            }
            Err(_) => ProbeResult::failure(
                elapsed_ms,
                format!("timeout: DNS query for {query_name} exceeded {}ms", timeout.as_millis()),
            ),
        }
    }
}
