use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::extract::{extract_container_metrics, extract_system_metrics};
use crate::health::{parse_method, HealthChecker, ProbeRequest};
use crate::metrics;
use crate::models::*;
use crate::normalize::normalize;
use crate::resolver::{self, SystemIndex};
use crate::store::{ServiceSource, SnapshotStore};
use crate::telemetry::TelemetryClient;
use crate::vault::CredentialVault;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollKind {
    Health,
    Metrics,
}

impl PollKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Health => "health",
            Self::Metrics => "metrics",
        }
    }
}

pub struct ServiceMonitor {
    config: Config,
    services: Arc<dyn ServiceSource>,
    store: Arc<dyn SnapshotStore>,
    health_checker: HealthChecker,
    telemetry: Option<TelemetryClient>,
    vault: Option<CredentialVault>,
    latest_health: DashMap<String, HealthCheckResult>,
    latest_metrics: DashMap<String, ServiceMetricsEntry>,
}

/// Cheap, cloneable access to a running monitor (API state, CLI checks).
#[derive(Clone)]
pub struct MonitorHandle {
    inner: Arc<ServiceMonitor>,
}

/// Latest known state of one enabled service, without probing.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceOverview {
    pub id: String,
    pub name: String,
    pub url: String,
    pub group: Option<String>,
    pub health: Option<HealthCheckResult>,
    pub metrics: Option<ServiceMetricsEntry>,
}

/// Remote systems with the keys they are matched on, next to each configured host.
#[derive(Debug, Clone, Serialize)]
pub struct SystemsReport {
    pub enabled: bool,
    pub error: Option<String>,
    pub systems: Vec<RemoteSystem>,
    pub services: Vec<HostMatch>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoteSystem {
    pub id: Option<String>,
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostMatch {
    pub id: String,
    pub host: String,
    pub key: String,
    pub matched: bool,
}

/// Per-service plan for one metrics cycle, computed after the systems index.
struct MetricsTarget<'a> {
    service: &'a ServiceDefinition,
    system_id: Option<String>,
    note: Option<String>,
}

impl ServiceMonitor {
    pub fn new(config: Config, services: Arc<dyn ServiceSource>, store: Arc<dyn SnapshotStore>) -> Result<Self> {
        let health_checker = HealthChecker::new()?;

        let telemetry = if config.telemetry_enabled() {
            Some(TelemetryClient::new(&config.telemetry)?)
        } else {
            info!("telemetry backend not configured, resource metrics disabled");
            None
        };

        let vault = if config.vault.encryption_key.is_empty() {
            None
        } else {
            Some(CredentialVault::new(&config.vault.encryption_key)?)
        };

        Ok(Self {
            config,
            services,
            store,
            health_checker,
            telemetry,
            vault,
            latest_health: DashMap::new(),
            latest_metrics: DashMap::new(),
        })
    }

    pub fn into_handle(self) -> MonitorHandle {
        MonitorHandle { inner: Arc::new(self) }
    }

    async fn enabled_services(&self, errors: &mut Vec<String>) -> Vec<ServiceDefinition> {
        match self.services.list_enabled_services().await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "failed to list services");
                errors.push(format!("services list: {e}"));
                Vec::new()
            }
        }
    }

    fn batch_size(&self) -> usize {
        self.config.polling.max_concurrency.max(1)
    }

    /// Probes every enabled service once and persists each result.
    pub async fn check_all_health(&self) -> HealthReport {
        let started = Instant::now();
        let mut errors = Vec::new();
        let services = self.enabled_services(&mut errors).await;
        debug!("Running health checks for {} services", services.len());

        let mut results = Vec::with_capacity(services.len());
        for chunk in services.chunks(self.batch_size()) {
            let futures = chunk.iter().map(|service| self.check_service_health(service));
            results.extend(join_all(futures).await);
        }

        for result in &results {
            if let Some(err) = &result.error {
                warn!("❌ {} is down: {}", result.service_id, err);
                errors.push(format!("{}: {}", result.service_id, err));
            } else {
                debug!("✅ {} up - {}ms", result.service_id, result.latency_ms);
            }
            if let Err(e) = self.store.append_health_result(result).await {
                warn!(service = %result.service_id, error = %e, "failed to persist health result");
                errors.push(format!("{}: store: {}", result.service_id, e));
            }
            metrics::record_health_result(result);
            self.latest_health.insert(result.service_id.clone(), result.clone());
        }

        let up = results.iter().filter(|r| r.ok).count();
        let summary = HealthSummary {
            total: results.len(),
            up,
            down: results.len() - up,
            checked_at: Utc::now(),
        };
        metrics::observe_poll_cycle(PollKind::Health.as_str(), started.elapsed().as_secs_f64(), errors.len());
        HealthReport { summary, results, errors }
    }

    async fn check_service_health(&self, service: &ServiceDefinition) -> HealthCheckResult {
        let creds = match (&service.credentials, &self.vault) {
            (None, _) => None,
            (Some(_), None) => {
                return credential_failure(&service.slug, "encryption key not configured".into());
            }
            (Some(sealed), Some(vault)) => match vault.open(sealed) {
                Ok(bundle) => Some(bundle),
                Err(e) => return credential_failure(&service.slug, e.to_string()),
            },
        };

        let defaults = &self.config.probe;
        let expected = service
            .expected_status
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.default_expected_status.as_slice());
        let request = ProbeRequest {
            service_id: &service.slug,
            url: service.probe_url(),
            method: parse_method(service.method.as_deref().or(Some(defaults.default_method.as_str()))),
            timeout: Duration::from_millis(service.timeout_ms.unwrap_or(defaults.default_timeout_ms)),
            expected_statuses: expected,
        };
        self.health_checker.probe(&request, creds.as_ref()).await
    }

    /// Resolves every enabled service against the telemetry backend and
    /// persists one snapshot per service.
    pub async fn check_all_metrics(&self) -> MetricsReport {
        let started = Instant::now();
        let checked_at = Utc::now();
        let mut errors = Vec::new();
        let services = self.enabled_services(&mut errors).await;

        let results: Vec<ServiceMetricsEntry> = match &self.telemetry {
            Some(client) => self.collect_metrics(client, &services, &mut errors).await,
            None => {
                debug!("telemetry disabled, reporting empty metrics");
                services.iter().map(empty_entry).collect()
            }
        };

        for entry in &results {
            let snapshot = MetricsSnapshot {
                service_id: entry.id.clone(),
                system: entry.system.clone(),
                container: entry.container.clone(),
                checked_at,
            };
            if let Err(e) = self.store.append_metrics_snapshot(&snapshot).await {
                warn!(service = %entry.id, error = %e, "failed to persist metrics snapshot");
                errors.push(format!("{}: store: {}", entry.id, e));
            }
            metrics::record_resource_metrics(&entry.id, &entry.system, &entry.container);
            self.latest_metrics.insert(entry.id.clone(), entry.clone());
        }

        metrics::observe_poll_cycle(PollKind::Metrics.as_str(), started.elapsed().as_secs_f64(), errors.len());
        MetricsReport { checked_at, errors, results }
    }

    async fn collect_metrics(
        &self,
        client: &TelemetryClient,
        services: &[ServiceDefinition],
        errors: &mut Vec<String>,
    ) -> Vec<ServiceMetricsEntry> {
        let index = match resolver::load_index(client, self.config.telemetry.page_size).await {
            Ok(index) => {
                debug!(systems = index.len(), "loaded remote systems");
                Some(index)
            }
            Err(e) if e.is_disabled() => {
                debug!("telemetry credentials missing, skipping resolution");
                None
            }
            Err(e) => {
                warn!(error = %e, "systems list failed");
                errors.push(format!("systems list: {e}"));
                None
            }
        };

        let targets: Vec<MetricsTarget> = services.iter().map(|s| plan_target(s, index.as_ref())).collect();

        // host stats are shared by every service on the same system
        let system_ids: Vec<String> = {
            let mut seen = HashSet::new();
            targets
                .iter()
                .filter_map(|t| t.system_id.clone())
                .filter(|id| seen.insert(id.clone()))
                .collect()
        };
        let mut host_stats: HashMap<String, SystemMetrics> = HashMap::new();
        for chunk in system_ids.chunks(self.batch_size()) {
            let fetched = join_all(chunk.iter().map(|id| async move {
                (id, resolver::latest_stats(client, id).await)
            }))
            .await;
            for (id, outcome) in fetched {
                match outcome {
                    Ok(Some(record)) => {
                        host_stats.insert(id.clone(), extract_system_metrics(&record));
                    }
                    Ok(None) => debug!(system = %id, "no stats recorded yet"),
                    Err(e) => {
                        warn!(system = %id, error = %e, "system stats lookup failed");
                        errors.push(format!("system stats {id}: {e}"));
                    }
                }
            }
        }

        let mut results = Vec::with_capacity(targets.len());
        for chunk in targets.chunks(self.batch_size()) {
            let futures = chunk.iter().map(|t| self.service_metrics(client, t, &host_stats));
            for (entry, note) in join_all(futures).await {
                if let Some(note) = note {
                    errors.push(note);
                }
                results.push(entry);
            }
        }
        results
    }

    async fn service_metrics(
        &self,
        client: &TelemetryClient,
        target: &MetricsTarget<'_>,
        host_stats: &HashMap<String, SystemMetrics>,
    ) -> (ServiceMetricsEntry, Option<String>) {
        let service = target.service;
        let mut entry = empty_entry(service);
        let Some(system_id) = target.system_id.as_deref() else {
            return (entry, target.note.clone());
        };
        if let Some(stats) = host_stats.get(system_id) {
            entry.system = stats.clone();
        }

        let Some(container_name) = service.container.as_deref().filter(|c| !c.trim().is_empty()) else {
            return (entry, None);
        };
        let note = match resolver::resolve_container(client, system_id, container_name).await {
            Ok(Some(record)) => {
                entry.container = extract_container_metrics(&record);
                None
            }
            Ok(None) => {
                debug!(service = %service.slug, container = container_name, "container not found");
                Some(format!(
                    "{}: container '{}' not found on system '{}'",
                    service.slug,
                    container_name,
                    service.host.as_deref().unwrap_or_default()
                ))
            }
            Err(e) => {
                warn!(service = %service.slug, error = %e, "container lookup failed");
                Some(format!("{}: container lookup: {}", service.slug, e))
            }
        };
        (entry, note)
    }

    /// Latest liveness and metrics per enabled service, in configuration order.
    pub async fn overview(&self) -> Result<Vec<ServiceOverview>> {
        let services = self.services.list_enabled_services().await?;
        Ok(services
            .into_iter()
            .map(|s| ServiceOverview {
                health: self.latest_health.get(&s.slug).map(|r| r.value().clone()),
                metrics: self.latest_metrics.get(&s.slug).map(|r| r.value().clone()),
                id: s.slug,
                name: s.name,
                url: s.url,
                group: s.group,
            })
            .collect())
    }

    /// Lists the remote systems once and reports which configured hosts resolve.
    /// A listing failure is reported in `error` rather than failing the call.
    pub async fn telemetry_systems(&self) -> Result<SystemsReport> {
        let services = self.services.list_enabled_services().await?;
        let mut report = SystemsReport {
            enabled: self.telemetry.is_some(),
            error: None,
            systems: Vec::new(),
            services: Vec::new(),
        };

        let records = match &self.telemetry {
            Some(client) => {
                match client.list_all(resolver::SYSTEMS, self.config.telemetry.page_size, None, None).await {
                    Ok(records) => records,
                    Err(e) if e.is_disabled() => {
                        report.enabled = false;
                        Vec::new()
                    }
                    Err(e) => {
                        warn!(error = %e, "systems list failed");
                        report.error = Some(e.to_string());
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        report.systems = records
            .iter()
            .filter_map(|rec| {
                let name = rec.get("name")?.as_str()?;
                Some(RemoteSystem {
                    id: resolver::record_id(rec).map(str::to_string),
                    name: name.to_string(),
                    key: normalize(name),
                })
            })
            .collect();

        let index = SystemIndex::build(records);
        report.services = services
            .iter()
            .filter_map(|s| {
                let host = s.host.as_deref().filter(|h| !h.trim().is_empty())?;
                Some(HostMatch {
                    id: s.slug.clone(),
                    host: host.to_string(),
                    key: normalize(host),
                    matched: index.resolve(host).is_some(),
                })
            })
            .collect();
        Ok(report)
    }

    async fn poll_loop(self: Arc<Self>, kind: PollKind, mut shutdown: watch::Receiver<bool>) {
        let period = match kind {
            PollKind::Health => self.config.polling.health_interval_seconds,
            PollKind::Metrics => self.config.polling.metrics_interval_seconds,
        };
        let mut ticker = interval(Duration::from_secs(period.max(1)));
        // a cycle that overruns its period drops the missed ticks
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("🔍 Starting {} polling every {}s", kind.as_str(), period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            let span = tracing::info_span!("poll_cycle", kind = kind.as_str(), cycle_id = %Uuid::new_v4());
            match kind {
                PollKind::Health => {
                    let report = self.check_all_health().instrument(span).await;
                    info!(
                        up = report.summary.up,
                        down = report.summary.down,
                        errors = report.errors.len(),
                        "health cycle complete"
                    );
                }
                PollKind::Metrics => {
                    let report = self.check_all_metrics().instrument(span).await;
                    info!(
                        services = report.results.len(),
                        errors = report.errors.len(),
                        "metrics cycle complete"
                    );
                }
            }
        }
        info!("{} polling stopped", kind.as_str());
    }
}

fn credential_failure(service_id: &str, reason: String) -> HealthCheckResult {
    HealthCheckResult {
        service_id: service_id.to_string(),
        ok: false,
        status_code: None,
        latency_ms: 0,
        error: Some(format!("credentials: {reason}")),
        checked_at: Utc::now(),
    }
}

fn empty_entry(service: &ServiceDefinition) -> ServiceMetricsEntry {
    ServiceMetricsEntry {
        id: service.slug.clone(),
        host: service.host.clone(),
        container_name: service.container.clone(),
        system: SystemMetrics::default(),
        container: ContainerMetrics::default(),
    }
}

fn plan_target<'a>(service: &'a ServiceDefinition, index: Option<&SystemIndex>) -> MetricsTarget<'a> {
    let host = service.host.as_deref().filter(|h| !h.trim().is_empty());
    match (host, index) {
        (Some(host), Some(index)) => match index.resolve(host).and_then(resolver::record_id) {
            Some(id) => MetricsTarget { service, system_id: Some(id.to_string()), note: None },
            None => MetricsTarget {
                service,
                system_id: None,
                note: Some(format!("{}: system '{}' not found", service.slug, host)),
            },
        },
        _ => MetricsTarget { service, system_id: None, note: None },
    }
}

impl MonitorHandle {
    pub async fn check_all_health(&self) -> HealthReport {
        self.inner.check_all_health().await
    }

    pub async fn check_all_metrics(&self) -> MetricsReport {
        self.inner.check_all_metrics().await
    }

    pub async fn overview(&self) -> Result<Vec<ServiceOverview>> {
        self.inner.overview().await
    }

    pub async fn telemetry_systems(&self) -> Result<SystemsReport> {
        self.inner.telemetry_systems().await
    }

    /// Spawns the health and metrics loops. Both stop starting new cycles once
    /// `shutdown` flips to true; a cycle already running completes.
    pub fn spawn_polling(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.inner.clone().poll_loop(PollKind::Health, shutdown.clone())),
            tokio::spawn(self.inner.clone().poll_loop(PollKind::Metrics, shutdown)),
        ]
    }

    pub async fn close(&self) {
        self.inner.store.close().await;
    }
}
