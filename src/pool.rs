//! Pooled HTTP client for upstream hops
//!
//! Both proxy stages forward through one shared client so connections to
//! dev servers and API origins are reused across requests.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error type for upstream forwarding
#[derive(Debug)]
pub enum ForwardError {
    /// Error from the HTTP client (connect/read failures)
    Client(hyper_util::client::legacy::Error),
    /// The upstream origin or rebuilt request was invalid
    RequestBuild(String),
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::Client(e) => write!(f, "Client error: {}", e),
            ForwardError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for ForwardError {}

impl From<hyper_util::client::legacy::Error> for ForwardError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        ForwardError::Client(err)
    }
}

/// Statistics for the shared client
#[derive(Debug, Default)]
pub struct ClientStats {
    /// Total number of requests forwarded upstream
    pub total_requests: AtomicU64,
}

impl ClientStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the shared client's connection pool
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum idle connections per upstream host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A pooled HTTP client forwarding requests to arbitrary upstream origins
pub struct ProxyClient {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<ClientStats>,
    config: ClientConfig,
}

impl ProxyClient {
    pub fn new(config: ClientConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream client initialized"
        );

        Self {
            client,
            stats: Arc::new(ClientStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<ClientStats> {
        Arc::clone(&self.stats)
    }

    /// Forward a request to the given upstream origin.
    ///
    /// The request's path and query are kept; scheme and authority come
    /// from `origin`. The Host header is rewritten to the upstream
    /// authority, matching what a browser talking to the origin directly
    /// would send.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        origin: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
        let uri = build_upstream_uri(origin, &req)?;
        let authority = uri
            .authority()
            .ok_or_else(|| ForwardError::RequestBuild(format!("origin '{}' has no host", origin)))?
            .to_string();

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        for (key, value) in parts.headers.iter() {
            if key == HOST {
                continue;
            }
            builder = builder.header(key, value);
        }
        builder = builder.header(
            HOST,
            HeaderValue::from_str(&authority)
                .map_err(|e| ForwardError::RequestBuild(e.to_string()))?,
        );

        let upstream_req = builder
            .body(body)
            .map_err(|e| ForwardError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = self.client.request(upstream_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Combine an upstream origin with the inbound request's path and query
fn build_upstream_uri<B>(origin: &str, req: &Request<B>) -> Result<Uri, ForwardError> {
    let base = origin.trim_end_matches('/');
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{}{}", base, path)
        .parse()
        .map_err(|e| ForwardError::RequestBuild(format!("invalid upstream uri: {}", e)))
}
