use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::{Duration, sleep};

pub const PATH_OK: &str = "/ok";
pub const PATH_FAIL: &str = "/fail";
pub const PATH_SLOW: &str = "/slow";
pub const PATH_ECHO: &str = "/echo";

/// Latency injected by the `/slow` handler.
pub const SLOW_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default)]
pub struct TestServerStats {
    requests_total: Arc<AtomicU64>,
    saw_test_id: Arc<AtomicU64>,
    saw_correlation_token: Arc<AtomicU64>,
    saw_json_content_type: Arc<AtomicU64>,
    saw_custom_header: Arc<AtomicU64>,
    saw_json_body: Arc<AtomicU64>,
}

impl TestServerStats {
    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    /// Requests that carried a non-empty `testid` query parameter.
    pub fn saw_test_id(&self) -> u64 {
        self.saw_test_id.load(Ordering::Relaxed)
    }

    /// Requests that carried a non-empty `random` query parameter.
    pub fn saw_correlation_token(&self) -> u64 {
        self.saw_correlation_token.load(Ordering::Relaxed)
    }

    pub fn saw_json_content_type(&self) -> u64 {
        self.saw_json_content_type.load(Ordering::Relaxed)
    }

    /// Requests with `x-test: 1`.
    pub fn saw_custom_header(&self) -> u64 {
        self.saw_custom_header.load(Ordering::Relaxed)
    }

    /// Requests whose body parsed as JSON.
    pub fn saw_json_body(&self) -> u64 {
        self.saw_json_body.load(Ordering::Relaxed)
    }

    fn observe(&self, query: &HashMap<String, String>, headers: &HeaderMap, body: &[u8]) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        if query.get("testid").is_some_and(|v| !v.is_empty()) {
            self.saw_test_id.fetch_add(1, Ordering::Relaxed);
        }
        if query.get("random").is_some_and(|v| !v.is_empty()) {
            self.saw_correlation_token.fetch_add(1, Ordering::Relaxed);
        }
        if headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().starts_with("application/json"))
        {
            self.saw_json_content_type.fetch_add(1, Ordering::Relaxed);
        }
        if headers.get("x-test").and_then(|v| v.to_str().ok()) == Some("1") {
            self.saw_custom_header.fetch_add(1, Ordering::Relaxed);
        }
        if serde_json::from_slice::<serde_json::Value>(body).is_ok() {
            self.saw_json_body.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn handle_ok(
    State(stats): State<TestServerStats>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> &'static str {
    stats.observe(&query, &headers, &body);
    "ok"
}

async fn handle_fail(
    State(stats): State<TestServerStats>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    stats.observe(&query, &headers, &body);
    (StatusCode::INTERNAL_SERVER_ERROR, "{\"error\":\"boom\"}")
}

async fn handle_slow(
    State(stats): State<TestServerStats>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> &'static str {
    stats.observe(&query, &headers, &body);
    sleep(SLOW_DELAY).await;
    "slow"
}

async fn handle_echo(
    State(stats): State<TestServerStats>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Bytes {
    stats.observe(&query, &headers, &body);
    body
}

pub fn router(stats: TestServerStats) -> Router {
    Router::new()
        .route(PATH_OK, post(handle_ok))
        .route(PATH_FAIL, post(handle_fail))
        .route(PATH_SLOW, post(handle_slow))
        .route(PATH_ECHO, post(handle_echo))
        .with_state(stats)
}

pub struct TestServer {
    base_url: String,
    stats: TestServerStats,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let stats = TestServerStats::default();
        let app = router(stats.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            let _ = serve.await;
        });

        Ok(Self {
            base_url: format!("http://{addr}"),
            stats,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub fn stats(&self) -> &TestServerStats {
        &self.stats
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if self.shutdown_tx.is_some()
            && let Some(task) = self.task.take()
        {
            task.abort();
        }
    }
}
