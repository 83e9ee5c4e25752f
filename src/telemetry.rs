//! Client for the fleet-telemetry backend (PocketBase-style collection API).
//!
//! The bearer token is cached inside the client and refreshed lazily once its
//! TTL has elapsed. A `401` on a listing call drops the cached token and the call
//! is retried once with a fresh one.

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, Instrument};

use crate::config::TelemetryConfig;
use crate::error::TelemetryError;
use crate::metrics;

/// One record as returned by the backend. Read-only, schema-less.
pub type Record = serde_json::Map<String, Value>;

#[derive(Debug, Clone)]
struct AuthToken {
    value: String,
    acquired_at: Instant,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub per_page: u32,
    #[serde(default)]
    pub total_items: i64,
    #[serde(default)]
    pub total_pages: i64,
    #[serde(default)]
    pub items: Vec<Record>,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: Option<String>,
}

pub struct TelemetryClient {
    client: Client,
    base_url: String,
    identity: String,
    password: String,
    ttl: Duration,
    token: Mutex<Option<AuthToken>>,
}

impl TelemetryClient {
    pub fn new(cfg: &TelemetryConfig) -> Result<Self, TelemetryError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(TelemetryError::Transport)?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            identity: cfg.identity.clone(),
            password: cfg.password.clone(),
            ttl: Duration::from_secs(cfg.token_ttl_seconds),
            token: Mutex::new(None),
        })
    }

    /// Overrides the token lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the cached token while it is younger than the TTL, otherwise
    /// exchanges the configured identity/password for a new one.
    ///
    /// The lock is held across the exchange so concurrent callers at cycle
    /// start share a single exchange.
    pub async fn get_token(&self) -> Result<String, TelemetryError> {
        if self.identity.is_empty() || self.password.is_empty() {
            return Err(TelemetryError::MissingCredentials);
        }
        let mut guard = self.token.lock().await;
        if let Some(tok) = guard.as_ref() {
            if tok.acquired_at.elapsed() < self.ttl {
                return Ok(tok.value.clone());
            }
        }
        let value = self.exchange().await?;
        *guard = Some(AuthToken { value: value.clone(), acquired_at: Instant::now() });
        Ok(value)
    }

    async fn exchange(&self) -> Result<String, TelemetryError> {
        let url = format!("{}/api/collections/_superusers/auth-with-password", self.base_url);
        debug!(%url, "exchanging telemetry credentials for token");
        metrics::increment_token_exchange();
        let resp = self
            .client
            .post(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&json!({ "identity": self.identity, "password": self.password }))
            .send()
            .instrument(tracing::info_span!("telemetry_auth"))
            .await
            .map_err(|e| TelemetryError::Auth { reason: format!("token exchange failed: {e}") })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TelemetryError::Auth { reason: format!("HTTP {} from auth endpoint", status.as_u16()) });
        }
        let body: AuthResponse = resp
            .json()
            .await
            .map_err(|e| TelemetryError::Auth { reason: format!("undecodable auth response: {e}") })?;
        match body.token {
            Some(t) if !t.is_empty() => {
                info!("telemetry token refreshed");
                Ok(t)
            }
            _ => Err(TelemetryError::Auth { reason: "no token in auth response".into() }),
        }
    }

    async fn invalidate(&self, stale: &str) {
        let mut guard = self.token.lock().await;
        if guard.as_ref().map(|t| t.value == stale).unwrap_or(false) {
            *guard = None;
        }
    }

    /// One page of `collection`, optionally filtered and sorted server-side.
    pub async fn list_records(
        &self,
        collection: &str,
        page: u32,
        per_page: u32,
        filter: Option<&str>,
        sort: Option<&str>,
    ) -> Result<Page, TelemetryError> {
        let url = format!("{}/api/collections/{}/records", self.base_url, collection);
        let mut query: Vec<(&str, String)> = vec![("perPage", per_page.to_string()), ("page", page.to_string())];
        if let Some(f) = filter.filter(|f| !f.is_empty()) {
            query.push(("filter", f.to_string()));
        }
        if let Some(s) = sort.filter(|s| !s.is_empty()) {
            query.push(("sort", s.to_string()));
        }

        let mut retried = false;
        loop {
            let token = self.get_token().await?;
            let resp = self
                .client
                .get(&url)
                .query(&query)
                .header(reqwest::header::ACCEPT, "application/json")
                .bearer_auth(&token)
                .send()
                .instrument(tracing::info_span!("telemetry_list", %collection, page))
                .await
                .map_err(|e| {
                    metrics::increment_telemetry_request(collection, "error");
                    TelemetryError::from_reqwest(e, &url)
                })?;

            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED && !retried {
                debug!(%collection, "token rejected, refreshing once");
                self.invalidate(&token).await;
                retried = true;
                continue;
            }
            if !status.is_success() {
                metrics::increment_telemetry_request(collection, "error");
                return Err(TelemetryError::Http { status: status.as_u16(), url });
            }
            let body: Page = resp.json().await.map_err(|e| {
                metrics::increment_telemetry_request(collection, "error");
                TelemetryError::Malformed { reason: e.to_string() }
            })?;
            metrics::increment_telemetry_request(collection, "ok");
            return Ok(body);
        }
    }

    /// First matching record, or `None` when the collection has no such row.
    pub async fn first_record(
        &self,
        collection: &str,
        filter: Option<&str>,
        sort: Option<&str>,
    ) -> Result<Option<Record>, TelemetryError> {
        let page = self.list_records(collection, 1, 1, filter, sort).await?;
        Ok(page.items.into_iter().next())
    }

    /// Every record of `collection`, walking pages until the backend runs out.
    pub async fn list_all(
        &self,
        collection: &str,
        per_page: u32,
        filter: Option<&str>,
        sort: Option<&str>,
    ) -> Result<Vec<Record>, TelemetryError> {
        let mut out = Vec::new();
        let mut page_no = 1u32;
        loop {
            let page = self.list_records(collection, page_no, per_page, filter, sort).await?;
            let got = page.items.len();
            out.extend(page.items);
            let more_pages = page.total_pages < 0 || page.total_pages > page_no as i64;
            if got == 0 || got < per_page as usize || !more_pages {
                break;
            }
            page_no += 1;
        }
        Ok(out)
    }
}

/// Quotes a value for use inside a filter expression.
pub fn filter_literal(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn cfg(base_url: String) -> TelemetryConfig {
        TelemetryConfig {
            base_url,
            identity: "ops@example.com".into(),
            password: "pw".into(),
            ..TelemetryConfig::default()
        }
    }

    #[tokio::test]
    async fn missing_credentials_is_disabled() {
        let client = TelemetryClient::new(&TelemetryConfig { base_url: "http://127.0.0.1:1".into(), ..Default::default() }).unwrap();
        let err = client.get_token().await.unwrap_err();
        assert!(err.is_disabled());
    }

    #[tokio::test]
    async fn token_cached_within_ttl() {
        let server = MockServer::start_async().await;
        let auth = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/collections/_superusers/auth-with-password")
                    .json_body(serde_json::json!({"identity": "ops@example.com", "password": "pw"}));
                then.status(200).json_body(serde_json::json!({"token": "tok-1"}));
            })
            .await;
        let client = TelemetryClient::new(&cfg(server.base_url())).unwrap();
        assert_eq!(client.get_token().await.unwrap(), "tok-1");
        assert_eq!(client.get_token().await.unwrap(), "tok-1");
        auth.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn token_refreshed_after_ttl() {
        let server = MockServer::start_async().await;
        let auth = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/collections/_superusers/auth-with-password");
                then.status(200).json_body(serde_json::json!({"token": "tok"}));
            })
            .await;
        let client = TelemetryClient::new(&cfg(server.base_url())).unwrap().with_ttl(Duration::from_millis(50));
        client.get_token().await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        client.get_token().await.unwrap();
        auth.assert_hits_async(2).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_exchange() {
        let server = MockServer::start_async().await;
        let auth = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/collections/_superusers/auth-with-password");
                then.status(200)
                    .delay(Duration::from_millis(150))
                    .json_body(serde_json::json!({"token": "shared"}));
            })
            .await;
        let client = std::sync::Arc::new(TelemetryClient::new(&cfg(server.base_url())).unwrap());
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.get_token().await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "shared");
        }
        auth.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn exchange_timeout_is_auth_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/collections/_superusers/auth-with-password");
                then.status(200)
                    .delay(Duration::from_millis(500))
                    .json_body(serde_json::json!({"token": "late"}));
            })
            .await;
        let client = TelemetryClient::new(&TelemetryConfig { timeout_ms: 100, ..cfg(server.base_url()) }).unwrap();
        let err = client.get_token().await.unwrap_err();
        assert!(matches!(err, TelemetryError::Auth { .. }), "got {err:?}");

        let unreachable = TelemetryClient::new(&cfg("http://127.0.0.1:9".into())).unwrap();
        assert!(unreachable.get_token().await.unwrap_err().is_auth());
    }

    #[tokio::test]
    async fn missing_token_field_is_auth_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/collections/_superusers/auth-with-password");
                then.status(200).json_body(serde_json::json!({"record": {}}));
            })
            .await;
        let client = TelemetryClient::new(&cfg(server.base_url())).unwrap();
        let err = client.get_token().await.unwrap_err();
        assert!(matches!(err, TelemetryError::Auth { .. }));
    }

    #[tokio::test]
    async fn rejected_credentials_is_auth_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/collections/_superusers/auth-with-password");
                then.status(400);
            })
            .await;
        let client = TelemetryClient::new(&cfg(server.base_url())).unwrap();
        assert!(client.get_token().await.unwrap_err().is_auth());
    }

    #[tokio::test]
    async fn list_records_sends_query_and_bearer() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/collections/_superusers/auth-with-password");
                then.status(200).json_body(serde_json::json!({"token": "abc"}));
            })
            .await;
        let list = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/collections/system_stats/records")
                    .header("authorization", "Bearer abc")
                    .query_param("perPage", "1")
                    .query_param("page", "1")
                    .query_param("filter", "system=\"sys1\"")
                    .query_param("sort", "-created");
                then.status(200).json_body(serde_json::json!({
                    "page": 1, "perPage": 1, "totalItems": 1, "totalPages": 1,
                    "items": [{"id": "s1", "stats": {"cpu": 3.5}}]
                }));
            })
            .await;
        let client = TelemetryClient::new(&cfg(server.base_url())).unwrap();
        let filter = format!("system={}", filter_literal("sys1"));
        let rec = client
            .first_record("system_stats", Some(&filter), Some("-created"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec["id"], "s1");
        list.assert_async().await;
    }

    #[tokio::test]
    async fn first_record_absent_is_none() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/collections/_superusers/auth-with-password");
                then.status(200).json_body(serde_json::json!({"token": "abc"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/collections/containers/records");
                then.status(200).json_body(serde_json::json!({"items": []}));
            })
            .await;
        let client = TelemetryClient::new(&cfg(server.base_url())).unwrap();
        assert!(client.first_record("containers", None, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_success_listing_is_http_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/collections/_superusers/auth-with-password");
                then.status(200).json_body(serde_json::json!({"token": "abc"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/collections/systems/records");
                then.status(403);
            })
            .await;
        let client = TelemetryClient::new(&cfg(server.base_url())).unwrap();
        let err = client.list_records("systems", 1, 200, None, None).await.unwrap_err();
        assert!(matches!(err, TelemetryError::Http { status: 403, .. }));
    }

    #[tokio::test]
    async fn unauthorized_listing_refreshes_once() {
        let server = MockServer::start_async().await;
        let auth = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/collections/_superusers/auth-with-password");
                then.status(200).json_body(serde_json::json!({"token": "abc"}));
            })
            .await;
        let list = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/collections/systems/records");
                then.status(401);
            })
            .await;
        let client = TelemetryClient::new(&cfg(server.base_url())).unwrap();
        let err = client.list_records("systems", 1, 200, None, None).await.unwrap_err();
        assert!(matches!(err, TelemetryError::Http { status: 401, .. }));
        auth.assert_hits_async(2).await;
        list.assert_hits_async(2).await;
    }

    #[tokio::test]
    async fn listing_timeout_is_timeout_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/collections/_superusers/auth-with-password");
                then.status(200).json_body(serde_json::json!({"token": "abc"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/collections/systems/records");
                then.status(200).delay(Duration::from_millis(500)).json_body(serde_json::json!({"items": []}));
            })
            .await;
        let client = TelemetryClient::new(&TelemetryConfig { timeout_ms: 100, ..cfg(server.base_url()) }).unwrap();
        let err = client.list_records("systems", 1, 200, None, None).await.unwrap_err();
        assert!(matches!(err, TelemetryError::Timeout { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn list_all_walks_pages() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/collections/_superusers/auth-with-password");
                then.status(200).json_body(serde_json::json!({"token": "abc"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/collections/systems/records").query_param("page", "1");
                then.status(200).json_body(serde_json::json!({
                    "page": 1, "perPage": 2, "totalPages": 2,
                    "items": [{"id": "a", "name": "one"}, {"id": "b", "name": "two"}]
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/collections/systems/records").query_param("page", "2");
                then.status(200).json_body(serde_json::json!({
                    "page": 2, "perPage": 2, "totalPages": 2,
                    "items": [{"id": "c", "name": "three"}]
                }));
            })
            .await;
        let client = TelemetryClient::new(&cfg(server.base_url())).unwrap();
        let all = client.list_all("systems", 2, None, None).await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| r["id"].as_str().unwrap().to_string()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn filter_literal_escapes_quotes() {
        assert_eq!(filter_literal("immich_server"), "\"immich_server\"");
        assert_eq!(filter_literal("a\"b"), "\"a\\\"b\"");
    }
}
