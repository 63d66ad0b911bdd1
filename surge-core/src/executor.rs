use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use surge_http::{HttpRequest, HttpResponse};

use crate::error::{Error, Result};
use crate::target::WeightedTargetPool;
use crate::transport::Transport;

const CORRELATION_TOKEN_LEN: usize = 10;
const LOGGED_BODY_LIMIT: usize = 512;

/// Why a dispatched request did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ErrorClass {
    /// The server answered with a status code >= 300.
    Status(u16),
    /// The transport failed before a response was read (timeout, refused connection, ...).
    Fault(String),
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(code) => write!(f, "{code}"),
            Self::Fault(kind) => f.write_str(kind),
        }
    }
}

impl From<ErrorClass> for String {
    fn from(value: ErrorClass) -> Self {
        value.to_string()
    }
}

impl From<String> for ErrorClass {
    fn from(value: String) -> Self {
        match value.parse::<u16>() {
            Ok(code) => Self::Status(code),
            Err(_) => Self::Fault(value),
        }
    }
}

/// Outcome of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchUnit {
    pub endpoint: String,
    pub error: Option<ErrorClass>,
    pub latency_ms: f64,
}

/// Settings applied to every request of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    pub base_url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Sent as the `testid` query parameter for server-side correlation.
    #[serde(default)]
    pub test_id: Option<String>,
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let lower = self.base_url.to_ascii_lowercase();
        if !(lower.starts_with("http://") || lower.starts_with("https://")) {
            return Err(Error::InvalidBaseUrl(self.base_url.clone()));
        }
        Ok(())
    }

    /// `base_url + path` with `testid` and `random` appended as percent-encoded query
    /// pairs, after any query the path already carries.
    pub fn url_for(&self, path: &str, token: &str) -> String {
        let raw = format!("{}{path}", self.base_url);
        let Ok(mut url) = url::Url::parse(&raw) else {
            // Handed to the transport as-is; it reports `invalid_url`.
            return raw;
        };
        {
            let mut query = url.query_pairs_mut();
            if let Some(id) = &self.test_id {
                query.append_pair("testid", id);
            }
            query.append_pair("random", token);
        }
        url.into()
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }
}

fn correlation_token<R: Rng + ?Sized>(rng: &mut R) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(CORRELATION_TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Runs one request at a time over a private transport session.
pub struct RequestExecutor<T> {
    targets: Arc<WeightedTargetPool>,
    options: Arc<RequestOptions>,
    session: T,
    rng: StdRng,
}

impl<T: Transport> RequestExecutor<T> {
    pub fn new(targets: Arc<WeightedTargetPool>, options: Arc<RequestOptions>, session: T) -> Self {
        Self {
            targets,
            options,
            session,
            rng: StdRng::from_entropy(),
        }
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Draws a target, sends it and classifies the outcome. Never fails: every fault ends
    /// up in [`DispatchUnit::error`].
    pub async fn execute(&mut self) -> DispatchUnit {
        let target = self.targets.select(&mut self.rng);
        let endpoint = target.name().to_string();
        let spec = target.generate();
        let token = correlation_token(&mut self.rng);
        let url = self.options.url_for(&spec.path, &token);

        let body = serde_json::to_vec(&spec.body).unwrap_or_default();
        let mut req = HttpRequest::post(url, body).with_timeout(self.options.timeout);
        if !self.options.has_header("content-type") {
            req = req.with_header("content-type", "application/json");
        }
        req = req.with_headers(self.options.headers.iter().cloned());

        let started = Instant::now();
        let outcome = self.session.send(req).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let error = classify(&endpoint, outcome);
        DispatchUnit {
            endpoint,
            error,
            latency_ms,
        }
    }
}

fn classify(endpoint: &str, outcome: surge_http::Result<HttpResponse>) -> Option<ErrorClass> {
    match outcome {
        Ok(res) if res.is_success() => None,
        Ok(res) => {
            let body = String::from_utf8_lossy(&res.body);
            let body = match body.char_indices().nth(LOGGED_BODY_LIMIT) {
                Some((idx, _)) => &body[..idx],
                None => &body,
            };
            tracing::warn!(endpoint, status = res.status, body, "request failed");
            Some(ErrorClass::Status(res.status))
        }
        Err(err) => {
            tracing::debug!(endpoint, error = %err, "transport fault");
            Some(ErrorClass::Fault(err.transport_error_kind().to_string()))
        }
    }
}
