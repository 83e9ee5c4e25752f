use axum::{
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::metrics;
use crate::models::{HealthReport, MetricsReport};
use crate::monitor::MonitorHandle;

pub fn router(monitor: MonitorHandle) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/health", get(check_health_handler))
        .route("/api/metrics", get(check_metrics_handler))
        .route("/api/services", get(services_handler))
        .route("/api/telemetry/systems", get(telemetry_systems_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(http_metrics_middleware)),
        )
        .with_state(monitor)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "homedash",
        "timestamp": chrono::Utc::now().timestamp()
    }))
}

async fn metrics_handler() -> String {
    metrics::render()
}

async fn check_health_handler(State(monitor): State<MonitorHandle>) -> Json<HealthReport> {
    Json(monitor.check_all_health().await)
}

async fn check_metrics_handler(State(monitor): State<MonitorHandle>) -> Json<MetricsReport> {
    Json(monitor.check_all_metrics().await)
}

async fn services_handler(State(monitor): State<MonitorHandle>) -> Response {
    match monitor.overview().await {
        Ok(list) => Json(list).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to list services");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
        }
    }
}

async fn telemetry_systems_handler(State(monitor): State<MonitorHandle>) -> Response {
    match monitor.telemetry_systems().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to list telemetry systems");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
        }
    }
}

async fn http_metrics_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let method = req.method().to_string();
    // matched route keeps label cardinality bounded
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();
    let resp = next.run(req).await;
    metrics::record_http_request(&method, &path, resp.status().as_u16());
    metrics::observe_http_request_duration(&method, &path, start.elapsed().as_secs_f64());
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::monitor::ServiceMonitor;
    use crate::store::{MemorySnapshotStore, StaticServiceSource};
    use axum::body::{to_bytes, Body};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> Router {
        let config = Config::default();
        let source = Arc::new(StaticServiceSource::new(Vec::new()));
        let store = Arc::new(MemorySnapshotStore::new(10));
        let monitor = ServiceMonitor::new(config, source, store).unwrap().into_handle();
        router(monitor)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).method("GET").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn own_liveness() {
        let (status, v) = get_json(app(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v["status"], "healthy");
    }

    #[tokio::test]
    async fn empty_health_report() {
        let (status, v) = get_json(app(), "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v["summary"]["total"], 0);
        assert!(v["results"].as_array().unwrap().is_empty());
        assert!(v["summary"]["checked_at"].is_i64());
    }

    #[tokio::test]
    async fn http_requests_labelled_by_route() {
        let _ = get_json(app(), "/api/services").await;
        let families = metrics::PROMETHEUS_REGISTRY.gather();
        let http_total = families
            .iter()
            .find(|m| m.name() == "homedash_http_requests_total")
            .expect("missing http metric");
        let seen = http_total
            .get_metric()
            .iter()
            .any(|mc| mc.get_label().iter().any(|lp| lp.name() == "path" && lp.value() == "/api/services"));
        assert!(seen);
    }
}
