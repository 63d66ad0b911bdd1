use std::future::Future;

use surge_http::{HttpClient, HttpRequest, HttpResponse};

/// The network collaborator used by a worker. One instance is one session: it is owned by
/// exactly one worker and never shared.
pub trait Transport: Send + 'static {
    fn send(
        &mut self,
        req: HttpRequest,
    ) -> impl Future<Output = surge_http::Result<HttpResponse>> + Send;
}

impl Transport for HttpClient {
    fn send(
        &mut self,
        req: HttpRequest,
    ) -> impl Future<Output = surge_http::Result<HttpResponse>> + Send {
        self.request(req)
    }
}
