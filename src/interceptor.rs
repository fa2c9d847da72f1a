//! Per-request capture in front of the forwarder
//!
//! Every request is turned into a [`RequestRecord`] and handed to the
//! [`Recorder`] before it is forwarded. When the recorder is fail-closed and
//! recording fails, the request is answered with a 500 and never reaches the
//! backend. Otherwise forwarding always proceeds.

use crate::error::ProxyError;
use crate::pool::{Forwarder, ProxyBody};
use crate::record::RequestRecord;
use crate::recorder::Recorder;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

pub struct Interceptor<F> {
    recorder: Arc<Recorder>,
    forwarder: F,
    request_timeout: Duration,
}

impl<F> Interceptor<F> {
    pub fn new(recorder: Arc<Recorder>, forwarder: F, request_timeout: Duration) -> Self {
        Self {
            recorder,
            forwarder,
            request_timeout,
        }
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    pub fn forwarder(&self) -> &F {
        &self.forwarder
    }

    /// Record then forward one request
    pub async fn handle<B>(&self, mut req: Request<B>, client_addr: SocketAddr) -> Response<ProxyBody>
    where
        F: Forwarder<B>,
        B: Send,
    {
        let record = RequestRecord::from_request(&req, client_addr);

        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        debug!(
            method = %req.method(),
            uri = %req.uri(),
            client = %client_addr,
            browser = record.browser(),
            request_id,
            "Incoming request"
        );

        if let Err(e) = self.recorder.record(record).await {
            if self.recorder.is_fail_closed() {
                error!(request_id, error = %e, "Failed to record request, rejecting it");
                return ProxyError::from(e).into_response(&request_id);
            }
            warn!(request_id, error = %e, "Failed to record request, forwarding anyway");
        }

        set_forwarding_headers(req.headers_mut(), &request_id, client_addr);

        match tokio::time::timeout(self.request_timeout, self.forwarder.forward(req)).await {
            Ok(Ok(response)) => {
                debug!(request_id, status = %response.status(), "Backend responded");
                response
            }
            Ok(Err(e)) => {
                let err = ProxyError::from(e);
                error!(request_id, error = %err, "Failed to forward request");
                err.into_response(&request_id)
            }
            Err(_) => {
                let err = ProxyError::Timeout(self.request_timeout);
                warn!(
                    request_id,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                err.into_response(&request_id)
            }
        }
    }
}

/// Add proxy headers to the outgoing request.
///
/// X-Forwarded-* values are overwritten rather than appended so a client
/// cannot spoof them; this proxy is assumed to be the first trusted hop.
fn set_forwarding_headers(headers: &mut HeaderMap, request_id: &str, client_addr: SocketAddr) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}
