use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use std::time::{Duration, Instant};
use tracing::{debug, Instrument};

use crate::models::{CredentialBundle, HealthCheckResult};

/// Everything needed for one liveness probe.
#[derive(Debug, Clone)]
pub struct ProbeRequest<'a> {
    pub service_id: &'a str,
    pub url: &'a str,
    pub method: Method,
    pub timeout: Duration,
    pub expected_statuses: &'a [u16],
}

pub struct HealthChecker {
    client: Client,
}

impl HealthChecker {
    pub fn new() -> Result<Self, reqwest::Error> {
        // redirects are followed (reqwest default policy, up to 10 hops)
        let client = Client::builder().build()?;
        Ok(Self { client })
    }

    /// Single attempt; never returns an error, every failure is a result.
    pub async fn probe(&self, req: &ProbeRequest<'_>, creds: Option<&CredentialBundle>) -> HealthCheckResult {
        let headers = match creds.map(|c| build_headers(c)).transpose() {
            Ok(h) => h.unwrap_or_default(),
            Err(reason) => return failed(req.service_id, None, 0, reason),
        };

        let mut builder = self
            .client
            .request(req.method.clone(), req.url)
            .timeout(req.timeout)
            .headers(headers);
        if let Some((user, pass)) = creds.and_then(|c| c.basic_auth()) {
            builder = builder.basic_auth(user, Some(pass));
        }

        let start_time = Instant::now();
        let outcome = builder
            .send()
            .instrument(tracing::info_span!("health_http", url = %req.url))
            .await;
        let latency_ms = start_time.elapsed().as_millis() as u64;

        match outcome {
            Ok(response) => {
                let status = response.status().as_u16();
                if req.expected_statuses.contains(&status) {
                    debug!("✅ {} answered {} in {}ms", req.url, status, latency_ms);
                    HealthCheckResult {
                        service_id: req.service_id.to_string(),
                        ok: true,
                        status_code: Some(status),
                        latency_ms,
                        error: None,
                        checked_at: Utc::now(),
                    }
                } else {
                    debug!("❌ {} answered unexpected {}", req.url, status);
                    failed(req.service_id, Some(status), latency_ms, format!("Unexpected status {status}"))
                }
            }
            Err(err) if err.is_timeout() => {
                debug!("❌ {} timed out after {}ms", req.url, latency_ms);
                failed(req.service_id, None, latency_ms, "Timeout".to_string())
            }
            Err(err) => {
                debug!("❌ {} failed: {}", req.url, err);
                failed(req.service_id, None, latency_ms, describe(&err))
            }
        }
    }
}

fn failed(service_id: &str, status_code: Option<u16>, latency_ms: u64, error: String) -> HealthCheckResult {
    HealthCheckResult {
        service_id: service_id.to_string(),
        ok: false,
        status_code,
        latency_ms,
        error: Some(error),
        checked_at: Utc::now(),
    }
}

fn build_headers(creds: &CredentialBundle) -> Result<HeaderMap, String> {
    let mut map = HeaderMap::new();
    for (name, value) in &creds.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| format!("Invalid header name: {name}"))?;
        let value = HeaderValue::from_str(value).map_err(|_| format!("Invalid value for header {}", name.as_str()))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Full error chain; reqwest's top-level message alone hides the cause.
fn describe(err: &reqwest::Error) -> String {
    let mut msg = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

/// Parses a configured HTTP method, defaulting to GET.
pub fn parse_method(raw: Option<&str>) -> Method {
    raw.and_then(|m| Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()).ok())
        .unwrap_or(Method::GET)
}
