use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A monitored service as configured by the operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceDefinition {
    pub slug: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub health_url: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    /// Remote system name as shown by the telemetry backend (free text).
    #[serde(default)]
    pub host: Option<String>,
    /// Remote container name on that system (exact match).
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub expected_status: Option<Vec<u16>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub credentials: Option<EncryptedCredentials>,
}

fn default_enabled() -> bool { true }

impl ServiceDefinition {
    pub fn new(slug: &str, name: &str, url: &str) -> Self {
        Self {
            slug: slug.to_string(),
            name: name.to_string(),
            url: url.to_string(),
            health_url: None,
            group: None,
            host: None,
            container: None,
            enabled: true,
            method: None,
            expected_status: None,
            timeout_ms: None,
            credentials: None,
        }
    }

    /// The URL probed for liveness; falls back to the service URL.
    pub fn probe_url(&self) -> &str {
        self.health_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or(&self.url)
    }
}

/// Vault tokens as stored at rest. Empty strings mean "not set".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EncryptedCredentials {
    #[serde(default)]
    pub basic_user: String,
    #[serde(default)]
    pub basic_pass: String,
    /// Encrypted JSON object of header name to value.
    #[serde(default)]
    pub headers: String,
}

/// Plaintext credentials. Lives only for the duration of one probe.
#[derive(Default, Clone)]
pub struct CredentialBundle {
    pub basic_user: String,
    pub basic_pass: String,
    pub headers: BTreeMap<String, String>,
}

impl CredentialBundle {
    pub fn basic_auth(&self) -> Option<(&str, &str)> {
        if self.basic_user.is_empty() || self.basic_pass.is_empty() {
            None
        } else {
            Some((&self.basic_user, &self.basic_pass))
        }
    }
}

impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("basic_user", &"<redacted>")
            .field("basic_pass", &"<redacted>")
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckResult {
    #[serde(rename = "id")]
    pub service_id: String,
    pub ok: bool,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub error: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu: Option<f64>,
    pub mem_used: Option<f64>,
    pub mem_total: Option<f64>,
    pub mem_percent: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Healthy,
    Unhealthy,
    Unknown,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerMetrics {
    pub state: Option<ContainerState>,
    pub uptime: Option<String>,
    pub cpu: Option<f64>,
    pub mem_used: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub service_id: String,
    pub system: SystemMetrics,
    pub container: ContainerMetrics,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSummary {
    pub total: usize,
    pub up: usize,
    pub down: usize,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub checked_at: DateTime<Utc>,
}

/// Output of one liveness cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub summary: HealthSummary,
    pub results: Vec<HealthCheckResult>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceMetricsEntry {
    pub id: String,
    pub host: Option<String>,
    pub container_name: Option<String>,
    pub system: SystemMetrics,
    pub container: ContainerMetrics,
}

/// Output of one metrics cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub checked_at: DateTime<Utc>,
    pub errors: Vec<String>,
    pub results: Vec<ServiceMetricsEntry>,
}
