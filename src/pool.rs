//! Connection pool and forwarding to the target origin
//!
//! [`Forwarder`] is the seam between request capture and transport: forward
//! one request, stream back one response with status and headers intact.
//! [`ConnectionPool`] is the production implementation, reusing keep-alive
//! connections to the single backend origin.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, CONNECTION};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Body type of every response the proxy returns
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Headers that only describe the client connection and are never forwarded
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Error type for forwarding operations
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Error from the HTTP client
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building the backend request
    #[error("Request build error: {0}")]
    RequestBuild(String),
}

/// Forwards a request to the backend and returns its response
pub trait Forwarder<B>: Send + Sync + 'static {
    fn forward(
        &self,
        req: Request<B>,
    ) -> impl Future<Output = Result<Response<ProxyBody>, ForwardError>> + Send;
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests sent to the backend
    pub total_requests: AtomicU64,
    /// Requests that failed before a response arrived
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections kept to the backend
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A pooled HTTP client bound to one backend origin
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    origin: Uri,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a pool forwarding to `origin` (an absolute `http` URI)
    pub fn new(origin: Uri, config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            origin = %origin,
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            origin,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn origin(&self) -> &Uri {
        &self.origin
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request to the origin through the pool
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let uri = backend_uri(&self.origin, req.uri())?;

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(uri)
            .version(hyper::Version::HTTP_11);

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        if let Some(target) = builder.headers_mut() {
            *target = headers;
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| ForwardError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = match self.client.request(backend_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

impl Forwarder<Incoming> for ConnectionPool {
    async fn forward(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, ForwardError> {
        self.send_request(req).await
    }
}

/// Rewrite a request target onto the origin.
///
/// The origin's path is a prefix joined with exactly one slash, and its query
/// is placed before the request's own query.
pub fn backend_uri(origin: &Uri, request: &Uri) -> Result<Uri, ForwardError> {
    let path = join_path(origin.path(), request.path());
    let query = match (origin.query(), request.query()) {
        (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some(format!("{}&{}", a, b)),
        (Some(a), _) if !a.is_empty() => Some(a.to_string()),
        (_, Some(b)) => Some(b.to_string()),
        _ => None,
    };

    let path_and_query = match query {
        Some(q) => format!("{}?{}", path, q),
        None => path,
    };

    let mut parts = origin.clone().into_parts();
    parts.path_and_query = Some(
        path_and_query
            .parse()
            .map_err(|e| ForwardError::RequestBuild(format!("invalid path: {}", e)))?,
    );
    Uri::from_parts(parts).map_err(|e| ForwardError::RequestBuild(e.to_string()))
}

fn join_path(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();
        assert_eq!(stats.get_total_requests(), 0);

        stats.record_request();
        stats.record_request();
        stats.record_failure();
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_failed_requests(), 1);
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let origin: Uri = "http://127.0.0.1:3000".parse().unwrap();
        let config = PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        };

        let pool = ConnectionPool::new(origin.clone(), config);
        assert_eq!(pool.origin(), &origin);
        assert_eq!(pool.config().max_idle_per_host, 5);
        assert_eq!(pool.stats().get_total_requests(), 0);
    }

    #[test]
    fn test_backend_uri_plain_origin() {
        let origin: Uri = "http://127.0.0.1:3000".parse().unwrap();
        let request: Uri = "/test?x=1".parse().unwrap();
        let uri = backend_uri(&origin, &request).unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:3000/test?x=1");
    }

    #[test]
    fn test_backend_uri_joins_base_path() {
        let request: Uri = "/users/7".parse().unwrap();

        let origin: Uri = "http://backend/api".parse().unwrap();
        assert_eq!(
            backend_uri(&origin, &request).unwrap().to_string(),
            "http://backend/api/users/7"
        );

        let origin: Uri = "http://backend/api/".parse().unwrap();
        assert_eq!(
            backend_uri(&origin, &request).unwrap().to_string(),
            "http://backend/api/users/7"
        );
    }

    #[test]
    fn test_backend_uri_merges_queries() {
        let origin: Uri = "http://backend/?key=abc".parse().unwrap();

        let request: Uri = "/search?q=rust".parse().unwrap();
        assert_eq!(
            backend_uri(&origin, &request).unwrap().to_string(),
            "http://backend/search?key=abc&q=rust"
        );

        let request: Uri = "/search".parse().unwrap();
        assert_eq!(
            backend_uri(&origin, &request).unwrap().to_string(),
            "http://backend/search?key=abc"
        );
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-session-hint"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session-hint", HeaderValue::from_static("abc"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("accept", HeaderValue::from_static("*/*"));
        headers.insert("host", HeaderValue::from_static("example.com"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 2);
        assert!(headers.contains_key("accept"));
        assert!(headers.contains_key("host"));
    }
}
