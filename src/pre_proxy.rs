//! Pre-proxy: forwards an environment's browser traffic to its dev server
//!
//! One `PreProxy` is installed per port listener. Every forwarded request
//! and WebSocket upgrade is tagged with the owning environment's port so
//! the post-proxy can correlate follow-up API calls without trusting the
//! browser's Host header. The environment record is re-resolved from the
//! catalog on every request, so a dev-server reassignment takes effect on
//! the next request without a listener restart.

use crate::catalog::{Catalog, DevServer, Environment};
use crate::cookies;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::ProxyClient;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Header tagging a forwarded request with its owning environment's port.
/// Set here, read by the post-proxy.
pub const API_SERVER_HEADER: &str = "x-api-server";

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Upper bound on one upstream round trip. Generous because a dev server's
/// cold build can hold the first request for a long time.
pub const UPSTREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Per-environment browser-traffic proxy
pub struct PreProxy {
    env_id: String,
    catalog: Arc<Catalog>,
    client: Arc<ProxyClient>,
    cookie_marker: String,
}

impl PreProxy {
    pub fn new(
        env_id: String,
        catalog: Arc<Catalog>,
        client: Arc<ProxyClient>,
        cookie_marker: String,
    ) -> Self {
        Self {
            env_id,
            catalog,
            client,
            cookie_marker,
        }
    }

    pub async fn handle(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let env = match self.catalog.find_environment(&self.env_id) {
            Some(env) => env,
            None => {
                warn!(env = %self.env_id, "Environment vanished from catalog");
                return Ok(json_error_response(
                    ProxyErrorCode::UnknownEnvironment,
                    "Environment no longer exists",
                ));
            }
        };

        let dev_server = match self.catalog.resolve_dev_server(&env) {
            Some(dev_server) => dev_server,
            None => {
                return Ok(json_error_response(
                    ProxyErrorCode::NoDevServer,
                    "No dev server is configured",
                ));
            }
        };

        if is_upgrade_request(&req) {
            return self.handle_upgrade(req, &env, &dev_server).await;
        }

        debug!(
            env = %env.id,
            method = %req.method(),
            uri = %req.uri(),
            dev_server = %dev_server.name,
            "Forwarding browser request"
        );

        // Tag with the owning port and the usual forwarding headers.
        // Client-provided values are overwritten; this proxy is the first
        // trusted hop.
        let headers = req.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&env.port.to_string()) {
            headers.insert(API_SERVER_HEADER, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

        if env.enable_cookie_proxy {
            cookies::rewrite_cookie_header(req.headers_mut(), env.port, &self.cookie_marker);
        }

        let result = tokio::time::timeout(
            UPSTREAM_REQUEST_TIMEOUT,
            self.client.forward(req, &dev_server.url),
        )
        .await;

        match result {
            Ok(Ok(mut response)) => {
                if env.enable_cookie_proxy {
                    cookies::append_set_cookie_shadows(
                        response.headers_mut(),
                        env.port,
                        &self.cookie_marker,
                    );
                }
                Ok(response)
            }
            Ok(Err(e)) => {
                error!(env = %env.id, dev_server = %dev_server.url, error = %e, "Failed to reach dev server");
                Ok(json_error_response(
                    ProxyErrorCode::UpstreamUnreachable,
                    "Failed to reach dev server",
                ))
            }
            Err(_) => {
                warn!(
                    env = %env.id,
                    dev_server = %dev_server.url,
                    timeout_secs = UPSTREAM_REQUEST_TIMEOUT.as_secs(),
                    "Dev server request timed out"
                );
                Ok(json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!(
                        "Dev server did not answer within {} seconds",
                        UPSTREAM_REQUEST_TIMEOUT.as_secs()
                    ),
                ))
            }
        }
    }

    /// Proxy a WebSocket upgrade transparently to the dev server.
    ///
    /// The identity header is set on the upgrade request too; cookies pass
    /// through unmodified on upgrades.
    async fn handle_upgrade(
        &self,
        mut req: Request<Incoming>,
        env: &Environment,
        dev_server: &DevServer,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        if let Ok(value) = HeaderValue::from_str(&env.port.to_string()) {
            req.headers_mut().insert(API_SERVER_HEADER, value);
        }
        proxy_upgrade(req, &dev_server.url, &env.id).await
    }
}

/// Check if a request is a WebSocket/HTTP upgrade request
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Authority (`host:port`) of an upstream origin
fn origin_authority(origin: &str) -> Option<String> {
    let uri: Uri = origin.parse().ok()?;
    let authority = uri.authority()?;
    let host = authority.host();
    let port = authority.port_u16().unwrap_or(80);
    Some(format!("{}:{}", host, port))
}

/// Build the raw HTTP upgrade request to send upstream
fn build_upgrade_request<B>(req: &Request<B>, authority: &str) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    // Forward all headers except Host, which must name the upstream.
    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}\r\n", authority));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the upstream's HTTP response head, looking for 101 Switching Protocols
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Forward bytes bidirectionally between the upgraded client connection and
/// the upstream socket
async fn forward_bidirectional(client: Upgraded, upstream: TcpStream, env_id: &str) {
    let mut client_io = TokioIo::new(client);
    let mut upstream_io = upstream;

    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
        Ok((client_to_upstream, upstream_to_client)) => {
            debug!(
                env = %env_id,
                client_to_upstream,
                upstream_to_client,
                "WebSocket connection closed normally"
            );
        }
        Err(e) => {
            debug!(env = %env_id, error = %e, "WebSocket connection closed with error");
        }
    }
}

/// Handle a WebSocket upgrade by splicing raw bytes to the upstream origin.
///
/// Shared by both proxy stages: the pre-proxy splices to the dev server,
/// the post-proxy splices tagged upgrades to the API origin.
pub async fn proxy_upgrade(
    req: Request<Incoming>,
    origin: &str,
    env_id: &str,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let authority = match origin_authority(origin) {
        Some(authority) => authority,
        None => {
            error!(env = %env_id, origin, "Upgrade target origin is invalid");
            return Ok(json_error_response(
                ProxyErrorCode::UpstreamUnreachable,
                "Upgrade target origin is invalid",
            ));
        }
    };

    debug!(env = %env_id, authority = %authority, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, &authority);

    let mut upstream_stream = match TcpStream::connect(&authority).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(env = %env_id, authority = %authority, error = %e, "Failed to connect upstream for upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::UpstreamUnreachable,
                format!("Failed to connect upstream: {}", e),
            ));
        }
    };

    if let Err(e) = upstream_stream.write_all(&raw_request).await {
        error!(env = %env_id, error = %e, "Failed to send upgrade request upstream");
        return Ok(json_error_response(
            ProxyErrorCode::UpstreamUnreachable,
            format!("Failed to send upgrade request: {}", e),
        ));
    }

    let mut response_buf = vec![0u8; 4096];
    let n = match upstream_stream.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        Ok(_) => {
            error!(env = %env_id, "Upstream closed connection before answering upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::UpstreamUnreachable,
                "Upstream closed connection",
            ));
        }
        Err(e) => {
            error!(env = %env_id, error = %e, "Failed to read upgrade response from upstream");
            return Ok(json_error_response(
                ProxyErrorCode::UpstreamUnreachable,
                format!("Failed to read upstream response: {}", e),
            ));
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&response_buf[..n]) {
        Some(parsed) => parsed,
        None => {
            error!(env = %env_id, "Failed to parse upstream upgrade response");
            return Ok(json_error_response(
                ProxyErrorCode::UpstreamUnreachable,
                "Invalid upgrade response from upstream",
            ));
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(env = %env_id, status = %status, "Upstream rejected upgrade request");
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"));
    }

    info!(env = %env_id, authority = %authority, "WebSocket upgrade successful");

    // Relay the 101 back, minus hop-by-hop framing headers hyper owns.
    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    let env_id = env_id.to_string();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(env = %env_id, "Client upgrade complete, starting forwarding");
                forward_bidirectional(upgraded, upstream_stream, &env_id).await;
            }
            Err(e) => {
                error!(env = %env_id, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Empty;

    fn upgrade_request() -> Request<Empty<Bytes>> {
        Request::builder()
            .uri("http://localhost:3000/ws")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .body(Empty::new())
            .unwrap()
    }

    #[test]
    fn test_is_upgrade_request() {
        assert!(is_upgrade_request(&upgrade_request()));

        let plain = Request::builder()
            .uri("http://localhost:3000/")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert!(!is_upgrade_request(&plain));

        let keep_alive = Request::builder()
            .uri("http://localhost:3000/")
            .header("Connection", "keep-alive")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert!(!is_upgrade_request(&keep_alive));
    }

    #[test]
    fn test_origin_authority() {
        assert_eq!(
            origin_authority("http://localhost:5173").as_deref(),
            Some("localhost:5173")
        );
        assert_eq!(
            origin_authority("http://127.0.0.1").as_deref(),
            Some("127.0.0.1:80")
        );
        assert!(origin_authority("not a uri").is_none());
    }

    #[test]
    fn test_build_upgrade_request_rewrites_host() {
        let mut req = upgrade_request();
        req.headers_mut()
            .insert("Host", HeaderValue::from_static("localhost:3000"));
        req.headers_mut()
            .insert(API_SERVER_HEADER, HeaderValue::from_static("3000"));

        let raw = build_upgrade_request(&req, "localhost:5173");
        let text = String::from_utf8(raw).unwrap();

        assert!(text.starts_with("GET /ws HTTP/1.1\r\n"));
        assert!(text.contains("x-api-server: 3000\r\n"));
        assert!(text.contains("Host: localhost:5173\r\n"));
        assert!(!text.contains("localhost:3000"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_upgrade_response() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: abc123\r\n\r\n";
        let (status, headers) = parse_upgrade_response(raw).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert!(headers
            .iter()
            .any(|(n, v)| n == "Sec-WebSocket-Accept" && v == "abc123"));
    }

    #[test]
    fn test_parse_upgrade_response_rejects_garbage() {
        assert!(parse_upgrade_response(b"\xff\xfe").is_none());
        assert!(parse_upgrade_response(b"nonsense").is_none());
    }
}
