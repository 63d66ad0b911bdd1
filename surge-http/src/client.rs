use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::Request;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

use super::{Error, HttpRequest, HttpResponse, Result};

/// A keep-alive HTTP/1.1 client.
///
/// Every instance owns its own connection pool. Cloning shares the pool, so callers that
/// want isolated sessions should construct a fresh client instead of cloning one.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl Default for HttpClient {
    fn default() -> Self {
        // The OS-level TCP connect timeout can be very long (tens of seconds), which would
        // stall a worker for most of a short run when the target host is unreachable.
        Self::new(Some(Duration::from_secs(3)))
    }
}

impl HttpClient {
    #[must_use]
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_connect_timeout(connect_timeout);
        http_connector.set_nodelay(true);

        let https_connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let inner = Client::builder(TokioExecutor::new()).build(https_connector);

        Self { inner }
    }

    pub async fn request(&self, req: HttpRequest) -> Result<HttpResponse> {
        match req.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.exchange(req)).await {
                Ok(res) => res,
                Err(_) => Err(Error::Timeout(timeout)),
            },
            None => self.exchange(req).await,
        }
    }

    pub async fn post(&self, url: &str, body: impl Into<Bytes>) -> Result<HttpResponse> {
        self.request(HttpRequest::post(url, body)).await
    }

    async fn exchange(&self, req: HttpRequest) -> Result<HttpResponse> {
        let parsed = url::Url::parse(&req.url).map_err(|_| Error::InvalidUrl(req.url.clone()))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(Error::UnsupportedScheme(req.url));
        }

        let uri: hyper::Uri = req
            .url
            .parse()
            .map_err(|_| Error::InvalidUrl(req.url.clone()))?;

        let mut builder = Request::builder().method(req.method).uri(uri);
        for (k, v) in &req.headers {
            let name = http::header::HeaderName::from_bytes(k.as_bytes())?;
            let value = http::header::HeaderValue::from_str(v)?;
            builder = builder.header(name, value);
        }

        let request: Request<Full<Bytes>> = builder.body(Full::new(req.body))?;
        let (parts, body) = self.inner.request(request).await?.into_parts();
        let body = body.collect().await?.to_bytes();

        Ok(HttpResponse {
            status: parts.status.as_u16(),
            body,
        })
    }
}
