//! Matches configured host/container names against remote telemetry records.

use std::collections::HashMap;
use tracing::debug;

use crate::error::TelemetryError;
use crate::normalize::normalize;
use crate::telemetry::{filter_literal, Record, TelemetryClient};

pub const SYSTEMS: &str = "systems";
pub const SYSTEM_STATS: &str = "system_stats";
pub const CONTAINERS: &str = "containers";

/// Remote systems keyed by canonical name. Built once per cycle.
///
/// Two remote names that normalize to the same key collide; the later record in
/// listing order wins.
#[derive(Debug, Default, Clone)]
pub struct SystemIndex {
    by_key: HashMap<String, Record>,
}

impl SystemIndex {
    pub fn build(records: impl IntoIterator<Item = Record>) -> Self {
        let mut by_key = HashMap::new();
        for rec in records {
            let Some(name) = rec.get("name").and_then(|v| v.as_str()) else { continue };
            let key = normalize(name);
            if key.is_empty() {
                continue;
            }
            if by_key.insert(key.clone(), rec).is_some() {
                debug!(%key, "duplicate remote system name, keeping last");
            }
        }
        Self { by_key }
    }

    pub fn resolve(&self, host: &str) -> Option<&Record> {
        let key = normalize(host);
        if key.is_empty() {
            return None;
        }
        self.by_key.get(&key)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

pub fn record_id(rec: &Record) -> Option<&str> {
    rec.get("id").and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

/// Fetches every remote system and indexes it.
pub async fn load_index(client: &TelemetryClient, per_page: u32) -> Result<SystemIndex, TelemetryError> {
    let records = client.list_all(SYSTEMS, per_page, None, None).await?;
    Ok(SystemIndex::build(records))
}

/// Latest stats record for a system.
pub async fn latest_stats(client: &TelemetryClient, system_id: &str) -> Result<Option<Record>, TelemetryError> {
    let filter = format!("system={}", filter_literal(system_id));
    client.first_record(SYSTEM_STATS, Some(&filter), Some("-created")).await
}

/// Exact match on system id and container name; no fuzzy matching here.
pub async fn resolve_container(
    client: &TelemetryClient,
    system_id: &str,
    container_name: &str,
) -> Result<Option<Record>, TelemetryError> {
    let filter = format!(
        "system={} && name={}",
        filter_literal(system_id),
        filter_literal(container_name)
    );
    client.first_record(CONTAINERS, Some(&filter), None).await
}
