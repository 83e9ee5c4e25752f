//! Canonical metrics from raw telemetry records.
//!
//! Field names differ between backend versions, so each logical field has an
//! ordered alias list; the first present, non-null alias is used.

use serde_json::Value;
use tracing::debug;

use crate::models::{ContainerMetrics, ContainerState, SystemMetrics};
use crate::telemetry::Record;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const MIB: f64 = 1024.0 * 1024.0;

/// Host CPU, percent.
pub const CPU_ALIASES: &[&str] = &["cpu", "cpu_percent", "cpuPct"];
/// Host memory used, GiB.
pub const MEM_USED_ALIASES: &[&str] = &["mu", "mem_used", "memUsed"];
/// Host memory total, GiB.
pub const MEM_TOTAL_ALIASES: &[&str] = &["m", "mem_total", "memTotal"];
/// Host memory used, percent.
pub const MEM_PERCENT_ALIASES: &[&str] = &["mp", "mem_percent", "memPct"];

pub const CONTAINER_HEALTH_ALIASES: &[&str] = &["health"];
pub const CONTAINER_STATUS_ALIASES: &[&str] = &["status", "uptime"];
pub const CONTAINER_CPU_ALIASES: &[&str] = &["cpu", "c"];
/// Container memory used, MiB.
pub const CONTAINER_MEM_ALIASES: &[&str] = &["memory", "m"];

fn first_present<'a>(obj: &'a serde_json::Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    aliases
        .iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

/// Numbers and numeric strings; anything else is a conversion miss.
fn as_number(v: &Value, field: &str) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    if n.is_none() {
        debug!(field, value = %v, "non-numeric metric field");
    }
    n.filter(|x| x.is_finite())
}

fn number_field(obj: &serde_json::Map<String, Value>, aliases: &[&str], field: &str) -> Option<f64> {
    first_present(obj, aliases).and_then(|v| as_number(v, field))
}

/// Reads the nested `stats` object of a `system_stats` record.
pub fn extract_system_metrics(stats_record: &Record) -> SystemMetrics {
    let Some(stats) = stats_record.get("stats").and_then(|v| v.as_object()) else {
        return SystemMetrics::default();
    };
    SystemMetrics {
        cpu: number_field(stats, CPU_ALIASES, "cpu"),
        mem_used: number_field(stats, MEM_USED_ALIASES, "mem_used").map(|g| g * GIB),
        mem_total: number_field(stats, MEM_TOTAL_ALIASES, "mem_total").map(|g| g * GIB),
        mem_percent: number_field(stats, MEM_PERCENT_ALIASES, "mem_percent"),
    }
}

/// Absent or null health is unknown, a numeric `0` unhealthy, anything else
/// healthy. Strings are never coerced, so `"0"` counts as healthy.
pub fn container_state(health: Option<&Value>) -> ContainerState {
    match health {
        None | Some(Value::Null) => ContainerState::Unknown,
        Some(Value::Number(n)) if n.as_f64() == Some(0.0) => ContainerState::Unhealthy,
        Some(_) => ContainerState::Healthy,
    }
}

pub fn extract_container_metrics(container: &Record) -> ContainerMetrics {
    let uptime = first_present(container, CONTAINER_STATUS_ALIASES)
        .and_then(|v| v.as_str())
        .map(str::to_string);
    // memory is only trusted when the backend sent an actual number
    let mem_used = first_present(container, CONTAINER_MEM_ALIASES)
        .and_then(|v| v.as_f64())
        .map(|mb| mb * MIB);
    ContainerMetrics {
        state: Some(container_state(first_present(container, CONTAINER_HEALTH_ALIASES))),
        uptime,
        cpu: number_field(container, CONTAINER_CPU_ALIASES, "container_cpu"),
        mem_used,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: serde_json::Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn gib_fields_become_bytes() {
        let m = extract_system_metrics(&rec(json!({"stats": {"cpu": 12.5, "mu": 2.0, "m": 8.0, "mp": 25.0}})));
        assert_eq!(m.cpu, Some(12.5));
        assert_eq!(m.mem_used, Some(2.0 * 1024.0 * 1024.0 * 1024.0));
        assert_eq!(m.mem_total, Some(8.0 * 1024.0 * 1024.0 * 1024.0));
        assert_eq!(m.mem_percent, Some(25.0));
    }

    #[test]
    fn aliases_take_first_non_null() {
        let m = extract_system_metrics(&rec(json!({"stats": {"mu": null, "mem_used": 1.0, "memUsed": 4.0}})));
        assert_eq!(m.mem_used, Some(GIB));
        assert_eq!(m.cpu, None);
    }

    #[test]
    fn non_numeric_degrades_to_none() {
        let m = extract_system_metrics(&rec(json!({"stats": {"cpu": "n/a", "mu": "3", "m": [1], "mp": true}})));
        assert_eq!(m.cpu, None);
        assert_eq!(m.mem_used, Some(3.0 * GIB));
        assert_eq!(m.mem_total, None);
        assert_eq!(m.mem_percent, None);
    }

    #[test]
    fn missing_stats_object() {
        assert_eq!(extract_system_metrics(&rec(json!({"id": "x"}))), SystemMetrics::default());
        assert_eq!(extract_system_metrics(&rec(json!({"stats": "oops"}))), SystemMetrics::default());
    }

    #[test]
    fn health_polarity() {
        assert_eq!(container_state(None), ContainerState::Unknown);
        assert_eq!(container_state(Some(&Value::Null)), ContainerState::Unknown);
        assert_eq!(container_state(Some(&json!(0))), ContainerState::Unhealthy);
        assert_eq!(container_state(Some(&json!(0.0))), ContainerState::Unhealthy);
        assert_eq!(container_state(Some(&json!(2))), ContainerState::Healthy);
    }

    #[test]
    fn non_numeric_health_is_healthy() {
        assert_eq!(container_state(Some(&json!("starting"))), ContainerState::Healthy);
        assert_eq!(container_state(Some(&json!(true))), ContainerState::Healthy);
        assert_eq!(container_state(Some(&json!("0"))), ContainerState::Healthy);
        let c = extract_container_metrics(&rec(json!({"health": "0"})));
        assert_eq!(c.state, Some(ContainerState::Healthy));
    }

    #[test]
    fn container_memory_in_mib() {
        let c = extract_container_metrics(&rec(json!({
            "system": "sys1", "name": "immich_server", "health": 0,
            "memory": 96.88, "cpu": 1.5, "status": "Up 7 days"
        })));
        assert_eq!(c.state, Some(ContainerState::Unhealthy));
        assert_eq!(c.mem_used, Some(96.88 * 1024.0 * 1024.0));
        assert_eq!(c.cpu, Some(1.5));
        assert_eq!(c.uptime.as_deref(), Some("Up 7 days"));
    }

    #[test]
    fn container_memory_string_ignored() {
        let c = extract_container_metrics(&rec(json!({"memory": "96.88"})));
        assert_eq!(c.mem_used, None);
        assert_eq!(c.state, Some(ContainerState::Unknown));
    }
}
