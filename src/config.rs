use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tokio::fs;
use tracing::{debug, warn};

use crate::models::ServiceDefinition;

pub const ENV_PREFIX: &str = "HOMEDASH";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    /// Directory of one-file-per-secret mounts (docker/k8s style).
    #[serde(default = "default_secrets_dir")]
    pub secrets_dir: String,
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub enabled: bool,
    pub health_interval_seconds: u64,
    pub metrics_interval_seconds: u64,
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Empty disables the telemetry integration.
    pub base_url: String,
    pub identity: String,
    pub password: String,
    pub timeout_ms: u64,
    pub token_ttl_seconds: u64,
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub default_timeout_ms: u64,
    pub default_method: String,
    pub default_expected_status: Vec<u16>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_path: String,
    pub memory_history_limit: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub encryption_key: String,
}

impl Config {
    /// Defaults, then the TOML file (if present), then `HOMEDASH__SECTION__KEY`
    /// environment overrides, then secret files for credentials left empty.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if fs::try_exists(path).await.unwrap_or(false) {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        } else {
            warn!(path = %path.display(), "Config file not found, using default configuration");
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: Config = builder.build()?.try_deserialize()?;
        config.fill_secrets().await;
        config.validate()?;
        Ok(config)
    }

    async fn fill_secrets(&mut self) {
        let dir = Path::new(&self.secrets_dir).to_path_buf();
        if self.telemetry.identity.is_empty() {
            if let Some(v) = read_secret(&dir, "telemetry_identity").await { self.telemetry.identity = v; }
        }
        if self.telemetry.password.is_empty() {
            if let Some(v) = read_secret(&dir, "telemetry_password").await { self.telemetry.password = v; }
        }
        if self.vault.encryption_key.is_empty() {
            if let Some(v) = read_secret(&dir, "encryption_key").await { self.vault.encryption_key = v; }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.polling.health_interval_seconds == 0 || self.polling.metrics_interval_seconds == 0 {
            bail!("polling intervals must be at least one second");
        }
        if self.polling.max_concurrency == 0 {
            bail!("polling.max_concurrency must be positive");
        }
        let mut seen = HashSet::new();
        for svc in &self.services {
            if svc.slug.trim().is_empty() {
                bail!("service '{}' has an empty slug", svc.name);
            }
            if !seen.insert(svc.slug.as_str()) {
                bail!("duplicate service slug '{}'", svc.slug);
            }
        }
        Ok(())
    }

    pub fn telemetry_enabled(&self) -> bool {
        !self.telemetry.base_url.trim().is_empty()
    }

    /// Annotated defaults with one sample service, for `--print-default-config`.
    pub fn example_toml() -> String {
        let mut cfg = Config::default();
        let mut svc = ServiceDefinition::new("immich", "Immich", "http://arborlon:2283");
        svc.health_url = Some("http://arborlon:2283/api/server/ping".into());
        svc.group = Some("Media".into());
        svc.host = Some("arborlon".into());
        svc.container = Some("immich_server".into());
        cfg.services.push(svc);
        toml::to_string_pretty(&cfg).unwrap_or_default()
    }
}

async fn read_secret(dir: &Path, name: &str) -> Option<String> {
    match fs::read_to_string(dir.join(name)).await {
        Ok(raw) => {
            let v = raw.trim().to_string();
            (!v.is_empty()).then_some(v)
        }
        Err(e) => {
            debug!(secret = name, error = %e, "secret file not readable");
            None
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            polling: PollingConfig::default(),
            telemetry: TelemetryConfig::default(),
            probe: ProbeConfig::default(),
            storage: StorageConfig::default(),
            vault: VaultConfig::default(),
            secrets_dir: default_secrets_dir(),
            services: Vec::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".into(), port: 9090 }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            health_interval_seconds: 10,
            metrics_interval_seconds: 10,
            max_concurrency: 5,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            identity: String::new(),
            password: String::new(),
            timeout_ms: 3000,
            token_ttl_seconds: 600,
            page_size: 200,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 2500,
            default_method: "GET".into(),
            default_expected_status: vec![200],
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            database_path: "data/homedash.db".into(),
            memory_history_limit: 1000,
        }
    }
}

fn default_secrets_dir() -> String { "/run/secrets".into() }
