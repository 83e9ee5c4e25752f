//! Append-only history for liveness results and metrics snapshots, plus the
//! source of service definitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{ContainerMetrics, ContainerState, HealthCheckResult, MetricsSnapshot, ServiceDefinition, SystemMetrics};

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn append_health_result(&self, result: &HealthCheckResult) -> Result<(), StoreError>;
    async fn append_metrics_snapshot(&self, snapshot: &MetricsSnapshot) -> Result<(), StoreError>;
    async fn close(&self) {}
}

#[async_trait]
pub trait ServiceSource: Send + Sync {
    async fn list_enabled_services(&self) -> Result<Vec<ServiceDefinition>, StoreError>;
}

/// Services taken straight from configuration.
pub struct StaticServiceSource {
    services: Vec<ServiceDefinition>,
}

impl StaticServiceSource {
    pub fn new(services: Vec<ServiceDefinition>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl ServiceSource for StaticServiceSource {
    async fn list_enabled_services(&self) -> Result<Vec<ServiceDefinition>, StoreError> {
        Ok(self.services.iter().filter(|s| s.enabled).cloned().collect())
    }
}

/// In-process history, capped per service (oldest entries dropped first).
pub struct MemorySnapshotStore {
    limit: usize,
    health: Arc<DashMap<String, Vec<HealthCheckResult>>>,
    metrics: Arc<DashMap<String, Vec<MetricsSnapshot>>>,
}

impl MemorySnapshotStore {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            health: Arc::new(DashMap::new()),
            metrics: Arc::new(DashMap::new()),
        }
    }

    pub fn health_history(&self, service_id: &str) -> Vec<HealthCheckResult> {
        self.health.get(service_id).map(|v| v.value().clone()).unwrap_or_default()
    }

    pub fn metrics_history(&self, service_id: &str) -> Vec<MetricsSnapshot> {
        self.metrics.get(service_id).map(|v| v.value().clone()).unwrap_or_default()
    }
}

fn push_capped<T>(entries: &mut Vec<T>, item: T, limit: usize) {
    entries.push(item);
    if entries.len() > limit {
        let excess = entries.len() - limit;
        entries.drain(0..excess);
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn append_health_result(&self, result: &HealthCheckResult) -> Result<(), StoreError> {
        let mut entry = self.health.entry(result.service_id.clone()).or_insert_with(Vec::new);
        push_capped(entry.value_mut(), result.clone(), self.limit);
        Ok(())
    }

    async fn append_metrics_snapshot(&self, snapshot: &MetricsSnapshot) -> Result<(), StoreError> {
        let mut entry = self.metrics.entry(snapshot.service_id.clone()).or_insert_with(Vec::new);
        push_capped(entry.value_mut(), snapshot.clone(), self.limit);
        Ok(())
    }
}

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS check_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        service_id TEXT NOT NULL,
        checked_at INTEGER NOT NULL,
        ok INTEGER NOT NULL,
        status_code INTEGER,
        latency_ms INTEGER,
        error TEXT
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_check_results_service ON check_results (service_id, checked_at)",
    r#"CREATE TABLE IF NOT EXISTS metrics_snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        service_id TEXT NOT NULL,
        checked_at INTEGER NOT NULL,
        host_cpu REAL,
        host_mem_used_bytes REAL,
        host_mem_total_bytes REAL,
        host_mem_pct REAL,
        ctr_state TEXT,
        ctr_uptime TEXT,
        ctr_cpu REAL,
        ctr_mem_used_bytes REAL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_metrics_snapshots_service ON metrics_snapshots (service_id, checked_at)",
];

/// SQLite-backed history.
#[derive(Clone)]
pub struct SqliteSnapshotStore {
    pool: SqlitePool,
}

impl SqliteSnapshotStore {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        let in_memory = db_path == Path::new(":memory:");
        info!("Opening snapshot database at {:?}", db_path);

        if !in_memory {
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.map_err(|e| StoreError::Setup {
                    path: db_path.display().to_string(),
                    reason: e.to_string(),
                })?;
            }
        }

        let path_str = db_path.to_str().ok_or_else(|| StoreError::Setup {
            path: db_path.display().to_string(),
            reason: "path is not valid UTF-8".into(),
        })?;
        let options = SqliteConnectOptions::from_str(path_str)?.create_if_missing(true);

        // every :memory: connection is its own database, so keep exactly one
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(options)
            .await?;

        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub async fn health_history(&self, service_id: &str) -> Result<Vec<HealthCheckResult>, StoreError> {
        let rows = sqlx::query(
            "SELECT service_id, checked_at, ok, status_code, latency_ms, error
             FROM check_results WHERE service_id = ? ORDER BY id",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| HealthCheckResult {
                service_id: row.get("service_id"),
                ok: row.get::<i64, _>("ok") != 0,
                status_code: row.get::<Option<i64>, _>("status_code").map(|c| c as u16),
                latency_ms: row.get::<Option<i64>, _>("latency_ms").unwrap_or(0) as u64,
                error: row.get("error"),
                checked_at: from_epoch(row.get("checked_at")),
            })
            .collect())
    }

    pub async fn metrics_history(&self, service_id: &str) -> Result<Vec<MetricsSnapshot>, StoreError> {
        let rows = sqlx::query(
            "SELECT service_id, checked_at, host_cpu, host_mem_used_bytes, host_mem_total_bytes, host_mem_pct,
                    ctr_state, ctr_uptime, ctr_cpu, ctr_mem_used_bytes
             FROM metrics_snapshots WHERE service_id = ? ORDER BY id",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| MetricsSnapshot {
                service_id: row.get("service_id"),
                system: SystemMetrics {
                    cpu: row.get("host_cpu"),
                    mem_used: row.get("host_mem_used_bytes"),
                    mem_total: row.get("host_mem_total_bytes"),
                    mem_percent: row.get("host_mem_pct"),
                },
                container: ContainerMetrics {
                    state: row.get::<Option<String>, _>("ctr_state").as_deref().and_then(parse_state),
                    uptime: row.get("ctr_uptime"),
                    cpu: row.get("ctr_cpu"),
                    mem_used: row.get("ctr_mem_used_bytes"),
                },
                checked_at: from_epoch(row.get("checked_at")),
            })
            .collect())
    }
}

fn from_epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn parse_state(raw: &str) -> Option<ContainerState> {
    match raw {
        "healthy" => Some(ContainerState::Healthy),
        "unhealthy" => Some(ContainerState::Unhealthy),
        "unknown" => Some(ContainerState::Unknown),
        _ => None,
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn append_health_result(&self, r: &HealthCheckResult) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO check_results (service_id, checked_at, ok, status_code, latency_ms, error)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&r.service_id)
        .bind(r.checked_at.timestamp())
        .bind(r.ok)
        .bind(r.status_code.map(i64::from))
        .bind(r.latency_ms as i64)
        .bind(r.error.as_deref())
        .execute(&self.pool)
        .await?;
        debug!(service = %r.service_id, "health result stored");
        Ok(())
    }

    async fn append_metrics_snapshot(&self, s: &MetricsSnapshot) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO metrics_snapshots (service_id, checked_at, host_cpu, host_mem_used_bytes,
                host_mem_total_bytes, host_mem_pct, ctr_state, ctr_uptime, ctr_cpu, ctr_mem_used_bytes)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&s.service_id)
        .bind(s.checked_at.timestamp())
        .bind(s.system.cpu)
        .bind(s.system.mem_used)
        .bind(s.system.mem_total)
        .bind(s.system.mem_percent)
        .bind(s.container.state.map(|st| st.as_str()))
        .bind(s.container.uptime.as_deref())
        .bind(s.container.cpu)
        .bind(s.container.mem_used)
        .execute(&self.pool)
        .await?;
        debug!(service = %s.service_id, "metrics snapshot stored");
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
