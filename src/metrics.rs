use once_cell::sync::Lazy;
use prometheus::{GaugeVec, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Registry};

use crate::models::{ContainerMetrics, HealthCheckResult, SystemMetrics};

// Global Prometheus registry
pub static PROMETHEUS_REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();

    registry
        .register(Box::new(SERVICE_UP.clone()))
        .expect("Failed to register service_up");
    registry
        .register(Box::new(PROBE_LATENCY.clone()))
        .expect("Failed to register probe_latency");
    registry
        .register(Box::new(HEALTH_CHECK_TOTAL.clone()))
        .expect("Failed to register health_check_total");
    registry
        .register(Box::new(TOKEN_EXCHANGE_TOTAL.clone()))
        .expect("Failed to register token_exchange_total");
    registry
        .register(Box::new(TELEMETRY_REQUEST_TOTAL.clone()))
        .expect("Failed to register telemetry_request_total");
    registry
        .register(Box::new(POLL_CYCLE_DURATION_SECONDS.clone()))
        .expect("Failed to register poll_cycle_duration_seconds");
    registry
        .register(Box::new(POLL_CYCLE_ERRORS_TOTAL.clone()))
        .expect("Failed to register poll_cycle_errors_total");
    registry
        .register(Box::new(MONITOR_UPTIME.clone()))
        .expect("Failed to register monitor_uptime");
    registry
        .register(Box::new(HTTP_REQUEST_TOTAL.clone()))
        .expect("Failed to register http_request_total");
    registry
        .register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()))
        .expect("Failed to register http_request_duration_seconds");
    // Resource gauges
    registry.register(Box::new(HOST_CPU_PERCENT.clone())).ok();
    registry.register(Box::new(HOST_MEMORY_USED_BYTES.clone())).ok();
    registry.register(Box::new(HOST_MEMORY_PERCENT.clone())).ok();
    registry.register(Box::new(CONTAINER_CPU_PERCENT.clone())).ok();
    registry.register(Box::new(CONTAINER_MEMORY_USED_BYTES.clone())).ok();

    registry
});

// 1 when the last probe matched an expected status
pub static SERVICE_UP: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        prometheus::Opts::new("homedash_service_up", "Whether the last liveness probe succeeded (1) or not (0)"),
        &["service_id"],
    ).expect("Failed to create service_up metric")
});

pub static PROBE_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "homedash_probe_latency_seconds",
            "Latency of liveness probes until response headers, in seconds",
        ).buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["service_id"],
    ).expect("Failed to create probe_latency metric")
});

pub static HEALTH_CHECK_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new("homedash_health_checks_total", "Total number of liveness probes performed"),
        &["service_id", "outcome"],
    ).expect("Failed to create health_checks_total metric")
});

pub static TOKEN_EXCHANGE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "homedash_telemetry_token_exchanges_total",
        "Number of password-grant token exchanges against the telemetry backend",
    ).expect("Failed to create token_exchange_total metric")
});

pub static TELEMETRY_REQUEST_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new("homedash_telemetry_requests_total", "Record listing calls against the telemetry backend"),
        &["collection", "outcome"],
    ).expect("Failed to create telemetry_requests_total metric")
});

pub static POLL_CYCLE_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new("homedash_poll_cycle_duration_seconds", "Wall-clock duration of poll cycles")
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["kind"],
    ).expect("poll_cycle_duration_seconds")
});

pub static POLL_CYCLE_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new("homedash_poll_cycle_errors_total", "Non-fatal errors recorded by poll cycles"),
        &["kind"],
    ).expect("poll_cycle_errors_total")
});

pub static MONITOR_UPTIME: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("homedash_uptime_seconds_total", "Total uptime of the dashboard in seconds")
        .expect("Failed to create monitor_uptime metric")
});

pub static HTTP_REQUEST_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new("homedash_http_requests_total", "Total HTTP requests received"),
        &["method", "path", "status"],
    ).expect("Failed to create http_requests_total metric")
});

pub static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new("homedash_http_request_duration_seconds", "HTTP request duration in seconds")
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["method", "path"],
    ).expect("Failed to create http_request_duration_seconds histogram")
});

static G_SERVICE_LABELS: [&str; 1] = ["service_id"];
pub static HOST_CPU_PERCENT: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(prometheus::Opts::new("homedash_host_cpu_percent", "Host CPU usage percent"), &G_SERVICE_LABELS).expect("host cpu")
});
pub static HOST_MEMORY_USED_BYTES: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(prometheus::Opts::new("homedash_host_memory_used_bytes", "Host memory used in bytes"), &G_SERVICE_LABELS).expect("host mem")
});
pub static HOST_MEMORY_PERCENT: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(prometheus::Opts::new("homedash_host_memory_percent", "Host memory used percent"), &G_SERVICE_LABELS).expect("host mem pct")
});
pub static CONTAINER_CPU_PERCENT: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(prometheus::Opts::new("homedash_container_cpu_percent", "Container CPU usage percent"), &G_SERVICE_LABELS).expect("ctr cpu")
});
pub static CONTAINER_MEMORY_USED_BYTES: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(prometheus::Opts::new("homedash_container_memory_used_bytes", "Container memory used in bytes"), &G_SERVICE_LABELS).expect("ctr mem")
});

pub fn record_health_result(result: &HealthCheckResult) {
    let id = result.service_id.as_str();
    SERVICE_UP.with_label_values(&[id]).set(i64::from(result.ok));
    PROBE_LATENCY.with_label_values(&[id]).observe(result.latency_ms as f64 / 1000.0);
    let outcome = match (result.ok, result.status_code, result.error.as_deref()) {
        (true, _, _) => "up",
        (false, _, Some("Timeout")) => "timeout",
        (false, Some(_), _) => "unexpected_status",
        (false, None, _) => "error",
    };
    HEALTH_CHECK_TOTAL.with_label_values(&[id, outcome]).inc();
}

/// Unresolved fields drop their series so stale readings are not exported.
pub fn record_resource_metrics(service_id: &str, system: &SystemMetrics, container: &ContainerMetrics) {
    set_or_clear(&HOST_CPU_PERCENT, service_id, system.cpu);
    set_or_clear(&HOST_MEMORY_USED_BYTES, service_id, system.mem_used);
    set_or_clear(&HOST_MEMORY_PERCENT, service_id, system.mem_percent);
    set_or_clear(&CONTAINER_CPU_PERCENT, service_id, container.cpu);
    set_or_clear(&CONTAINER_MEMORY_USED_BYTES, service_id, container.mem_used);
}

fn set_or_clear(gauge: &GaugeVec, service_id: &str, value: Option<f64>) {
    match value {
        Some(v) => gauge.with_label_values(&[service_id]).set(v),
        // not-found just means there was no series yet
        None => {
            let _ = gauge.remove_label_values(&[service_id]);
        }
    }
}

pub fn increment_token_exchange() {
    TOKEN_EXCHANGE_TOTAL.inc();
}

pub fn increment_telemetry_request(collection: &str, outcome: &str) {
    TELEMETRY_REQUEST_TOTAL.with_label_values(&[collection, outcome]).inc();
}

pub fn observe_poll_cycle(kind: &str, seconds: f64, errors: usize) {
    POLL_CYCLE_DURATION_SECONDS.with_label_values(&[kind]).observe(seconds);
    if errors > 0 {
        POLL_CYCLE_ERRORS_TOTAL.with_label_values(&[kind]).inc_by(errors as u64);
    }
}

pub fn record_http_request(method: &str, path: &str, status: u16) {
    HTTP_REQUEST_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
}

pub fn observe_http_request_duration(method: &str, path: &str, seconds: f64) {
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(seconds);
}

/// Prometheus text exposition of the global registry.
pub fn render() -> String {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = PROMETHEUS_REGISTRY.gather();
    encoder.encode_to_string(&metric_families).unwrap_or_else(|e| {
        tracing::error!("Failed to encode Prometheus metrics: {}", e);
        String::new()
    })
}

pub fn start_uptime_tracking() {
    tokio::spawn(async {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(1));
        loop {
            interval.tick().await;
            MONITOR_UPTIME.inc();
        }
    });
}
