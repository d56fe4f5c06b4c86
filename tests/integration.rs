//! Integration tests for Envgate
//!
//! Each test wires a real gateway out of the library pieces: in-test
//! upstream servers stand in for dev servers and API origins, and raw
//! TCP clients play the browser.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use envgate::catalog::{Catalog, EnvStatus};
use envgate::config::{Config, Settings};
use envgate::pool::{ClientConfig, ProxyClient};
use envgate::post_proxy::{ensure_management_port_free, PostProxyServer};
use envgate::reconcile::Reconciler;
use envgate::registry::{ListenerRegistry, StartOutcome};
use envgate::ws::NotificationHub;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

// ============================================================================
// Upstream stub
// ============================================================================

#[derive(Debug, Clone)]
struct RecordedRequest {
    path: String,
    headers: Vec<(String, String)>,
}

impl RecordedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Minimal HTTP upstream recording every request it serves
struct Upstream {
    port: u16,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl Upstream {
    fn origin(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    fn request(&self, idx: usize) -> RecordedRequest {
        self.requests.lock()[idx].clone()
    }

    fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

/// Spawn an upstream that answers 200 with the given body, attaching the
/// given Set-Cookie headers to every response.
async fn spawn_upstream(set_cookies: Vec<String>, body: &'static str) -> Upstream {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::new(Mutex::new(Vec::new()));

    let recorded = Arc::clone(&requests);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let recorded = Arc::clone(&recorded);
            let set_cookies = set_cookies.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            buf.extend_from_slice(&chunk[..n]);
                            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }

                let text = String::from_utf8_lossy(&buf);
                let mut lines = text.lines();
                let path = lines
                    .next()
                    .and_then(|l| l.split(' ').nth(1))
                    .unwrap_or("/")
                    .to_string();
                let headers = lines
                    .take_while(|l| !l.is_empty())
                    .filter_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        Some((name.trim().to_lowercase(), value.trim().to_string()))
                    })
                    .collect();
                recorded.lock().push(RecordedRequest { path, headers });

                let mut response = String::from("HTTP/1.1 200 OK\r\n");
                for cookie in &set_cookies {
                    response.push_str(&format!("Set-Cookie: {}\r\n", cookie));
                }
                response.push_str(&format!(
                    "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                ));
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    Upstream { port, requests }
}

// ============================================================================
// Raw HTTP client helpers
// ============================================================================

async fn http_get(port: u16, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    http_request(port, "GET", path, &[], None).await
}

async fn http_get_with_headers(
    port: u16,
    path: &str,
    headers: &[(&str, &str)],
) -> Result<String, Box<dyn std::error::Error>> {
    http_request(port, "GET", path, headers, None).await
}

async fn http_post_json(
    port: u16,
    path: &str,
    body: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    http_request(
        port,
        "POST",
        path,
        &[("Content-Type", "application/json")],
        Some(body),
    )
    .await
}

async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: Option<&str>,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n",
        method, path, port
    );
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    if let Some(body) = body {
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    request.push_str("\r\n");
    if let Some(body) = body {
        request.push_str(body);
    }
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

fn response_status(raw: &str) -> u16 {
    raw.lines()
        .next()
        .and_then(|l| l.split(' ').nth(1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn response_headers(raw: &str) -> Vec<(String, String)> {
    raw.lines()
        .skip(1)
        .take_while(|l| !l.is_empty())
        .filter_map(|l| {
            let (name, value) = l.split_once(':')?;
            Some((name.trim().to_lowercase(), value.trim().to_string()))
        })
        .collect()
}

fn set_cookie_values(raw: &str) -> Vec<String> {
    response_headers(raw)
        .into_iter()
        .filter(|(n, _)| n == "set-cookie")
        .map(|(_, v)| v)
        .collect()
}

/// Merge a response's Set-Cookie headers into a name→value jar, the way a
/// browser would for one cookie domain.
fn merge_into_jar(jar: &mut HashMap<String, String>, raw: &str) {
    for value in set_cookie_values(raw) {
        let pair = value.split(';').next().unwrap_or("");
        if let Some((name, value)) = pair.split_once('=') {
            jar.insert(name.trim().to_string(), value.trim().to_string());
        }
    }
}

fn jar_header(jar: &HashMap<String, String>) -> String {
    jar.iter()
        .map(|(n, v)| format!("{}={}", n, v))
        .collect::<Vec<_>>()
        .join("; ")
}

async fn free_port() -> u16 {
    let probe = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);
    port
}

async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

// ============================================================================
// Gateway harness
// ============================================================================

struct Gateway {
    catalog: Arc<Catalog>,
    registry: Arc<ListenerRegistry>,
    reconciler: Arc<Reconciler>,
    hub: Arc<NotificationHub>,
    settings: Arc<Settings>,
    management_port: u16,
    _shutdown_tx: watch::Sender<bool>,
}

/// Build a full gateway from a config document and spawn its post-proxy.
async fn spawn_gateway(config_toml: &str) -> Gateway {
    let config: Config = toml::from_str(config_toml).unwrap();
    config.validate().unwrap();

    let settings = Arc::new(Settings::from_config(
        &config,
        PathBuf::from("envgate-test.toml"),
    ));
    let catalog = Arc::new(Catalog::new());
    let client = Arc::new(ProxyClient::new(ClientConfig::default()));
    let registry = ListenerRegistry::new(
        Arc::clone(&catalog),
        Arc::clone(&client),
        Arc::clone(&settings),
    );
    let reconciler = Reconciler::new(
        Arc::clone(&catalog),
        Arc::clone(&registry),
        Arc::clone(&settings),
    );
    reconciler.apply(&config);

    let hub = NotificationHub::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let post_proxy = PostProxyServer::new(
        Arc::clone(&settings),
        Arc::clone(&catalog),
        Arc::clone(&registry),
        Arc::clone(&client),
        Arc::clone(&hub),
        shutdown_rx,
    );
    let management_port = settings.management_port;
    tokio::spawn(async move {
        let _ = post_proxy.run().await;
    });
    assert!(
        wait_for_port(management_port, Duration::from_secs(5)).await,
        "post-proxy did not come up"
    );

    Gateway {
        catalog,
        registry,
        reconciler,
        hub,
        settings,
        management_port,
        _shutdown_tx: shutdown_tx,
    }
}

impl Gateway {
    /// Start the environment registered under `(name, port)`
    async fn start_env(&self, name: &str, port: u16) -> StartOutcome {
        let env = self
            .catalog
            .find_environment_by_name_port(name, port)
            .expect("environment in catalog");
        self.registry.start(&env).await.expect("start succeeds")
    }
}

fn two_env_config(
    management_port: u16,
    port_a: u16,
    port_b: u16,
    dev_origin: &str,
    api_a: &str,
    api_b: &str,
) -> String {
    format!(
        r#"
[server]
port = {management_port}

[[dev_server]]
name = "vite"
url = "{dev_origin}"

[[env]]
name = "a"
port = {port_a}
api_base_url = "{api_a}"

[[env]]
name = "b"
port = {port_b}
api_base_url = "{api_b}"
"#
    )
}

// ============================================================================
// Pre-proxy behavior
// ============================================================================

#[tokio::test]
async fn test_pre_proxy_forwards_and_tags() {
    let dev = spawn_upstream(vec![], "dev page").await;
    let (management_port, port_a, port_b) = (free_port().await, free_port().await, free_port().await);
    let config = two_env_config(
        management_port,
        port_a,
        port_b,
        &dev.origin(),
        "http://127.0.0.1:1",
        "http://127.0.0.1:1",
    );
    let gateway = spawn_gateway(&config).await;
    gateway.start_env("a", port_a).await;

    let response = http_get(port_a, "/app/index.html?x=1").await.unwrap();
    assert_eq!(response_status(&response), 200);
    assert!(response.ends_with("dev page"));

    let seen = dev.request(0);
    assert_eq!(seen.path, "/app/index.html?x=1");
    // The identity tag carries the owning port for the post-proxy hop.
    assert_eq!(seen.header("x-api-server"), Some(port_a.to_string().as_str()));
    // Host names the dev server, not the environment port.
    assert_eq!(seen.header("host"), Some(format!("127.0.0.1:{}", dev.port).as_str()));
    assert!(seen.header("x-forwarded-for").is_some());
}

#[tokio::test]
async fn test_pre_proxy_rewrites_cookies_outbound() {
    let dev = spawn_upstream(vec![], "ok").await;
    let (management_port, port_a, port_b) = (free_port().await, free_port().await, free_port().await);
    let config = two_env_config(
        management_port,
        port_a,
        port_b,
        &dev.origin(),
        "http://127.0.0.1:1",
        "http://127.0.0.1:1",
    );
    let gateway = spawn_gateway(&config).await;
    gateway.start_env("a", port_a).await;

    let cookie = format!("session=stale; session-{}-envm=fresh", port_a);
    let response = http_get_with_headers(port_a, "/", &[("Cookie", &cookie)])
        .await
        .unwrap();
    assert_eq!(response_status(&response), 200);

    // The shadow's value replaced the plain one; no shadow leaked upstream.
    assert_eq!(dev.request(0).header("cookie"), Some("session=fresh"));
}

#[tokio::test]
async fn test_pre_proxy_shadows_set_cookie_inbound() {
    let dev = spawn_upstream(vec!["session=abc; Path=/".to_string()], "ok").await;
    let (management_port, port_a, port_b) = (free_port().await, free_port().await, free_port().await);
    let config = two_env_config(
        management_port,
        port_a,
        port_b,
        &dev.origin(),
        "http://127.0.0.1:1",
        "http://127.0.0.1:1",
    );
    let gateway = spawn_gateway(&config).await;
    gateway.start_env("a", port_a).await;

    let response = http_get(port_a, "/login").await.unwrap();
    let cookies = set_cookie_values(&response);

    assert!(cookies.contains(&"session=abc; Path=/".to_string()));
    assert!(cookies.contains(&format!("session-{}-envm=abc; Path=/", port_a)));
}

#[tokio::test]
async fn test_cookie_proxy_disabled_passes_through() {
    let dev = spawn_upstream(vec!["session=abc".to_string()], "ok").await;
    let (management_port, port_a) = (free_port().await, free_port().await);
    let config = format!(
        r#"
[server]
port = {management_port}

[[dev_server]]
name = "vite"
url = "{dev_origin}"

[[env]]
name = "a"
port = {port_a}
api_base_url = "http://127.0.0.1:1"
enable_cookie_proxy = false
"#,
        dev_origin = dev.origin(),
    );
    let gateway = spawn_gateway(&config).await;
    gateway.start_env("a", port_a).await;

    let cookie = format!("session=plain; session-{}-envm=shadow", port_a);
    let response = http_get_with_headers(port_a, "/", &[("Cookie", &cookie)])
        .await
        .unwrap();

    // Both directions untouched when the flag is off.
    assert_eq!(dev.request(0).header("cookie"), Some(cookie.as_str()));
    assert_eq!(set_cookie_values(&response), vec!["session=abc".to_string()]);
}

#[tokio::test]
async fn test_pre_proxy_reports_unreachable_dev_server() {
    let dead_port = free_port().await;
    let (management_port, port_a, port_b) = (free_port().await, free_port().await, free_port().await);
    let config = two_env_config(
        management_port,
        port_a,
        port_b,
        &format!("http://127.0.0.1:{}", dead_port),
        "http://127.0.0.1:1",
        "http://127.0.0.1:1",
    );
    let gateway = spawn_gateway(&config).await;
    gateway.start_env("a", port_a).await;

    let response = http_get(port_a, "/").await.unwrap();
    assert_eq!(response_status(&response), 502);
    assert!(response.contains("UPSTREAM_UNREACHABLE"));
}

#[tokio::test]
async fn test_pre_proxy_without_any_dev_server() {
    let (management_port, port_a) = (free_port().await, free_port().await);
    let config = format!(
        r#"
[server]
port = {management_port}

[[env]]
name = "a"
port = {port_a}
api_base_url = "http://127.0.0.1:1"
"#
    );
    let gateway = spawn_gateway(&config).await;
    gateway.start_env("a", port_a).await;

    let response = http_get(port_a, "/").await.unwrap();
    assert_eq!(response_status(&response), 502);
    assert!(response.contains("NO_DEV_SERVER"));
}

// ============================================================================
// Cookie isolation scenario
// ============================================================================

#[tokio::test]
async fn test_cookie_isolation_between_two_environments() {
    // Two environments share one dev server; logins yield different tokens.
    let dev_a = spawn_upstream(vec!["session=tokenA".to_string()], "A").await;
    let dev_b = spawn_upstream(vec!["session=tokenB".to_string()], "B").await;
    let (management_port, port_a, port_b) = (free_port().await, free_port().await, free_port().await);

    let config = format!(
        r#"
[server]
port = {management_port}

[[dev_server]]
name = "upstream-a"
url = "{origin_a}"

[[dev_server]]
name = "upstream-b"
url = "{origin_b}"

[[env]]
name = "a"
port = {port_a}
api_base_url = "http://127.0.0.1:1"
dev_server = "upstream-a"

[[env]]
name = "b"
port = {port_b}
api_base_url = "http://127.0.0.1:1"
dev_server = "upstream-b"
"#,
        origin_a = dev_a.origin(),
        origin_b = dev_b.origin(),
    );
    let gateway = spawn_gateway(&config).await;
    gateway.start_env("a", port_a).await;
    gateway.start_env("b", port_b).await;

    // One browser jar shared across both ports.
    let mut jar: HashMap<String, String> = HashMap::new();

    // Log into B, then into A. The plain `session` ends up as tokenA.
    let response = http_get(port_b, "/login").await.unwrap();
    merge_into_jar(&mut jar, &response);
    let response = http_get_with_headers(port_a, "/login", &[("Cookie", &jar_header(&jar))])
        .await
        .unwrap();
    merge_into_jar(&mut jar, &response);

    assert_eq!(jar.get("session"), Some(&"tokenA".to_string()));
    assert_eq!(
        jar.get(&format!("session-{}-envm", port_b)),
        Some(&"tokenB".to_string())
    );

    // B still observes its own session on the next request.
    http_get_with_headers(port_b, "/api/me", &[("Cookie", &jar_header(&jar))])
        .await
        .unwrap();
    let seen = dev_b.request(dev_b.request_count() - 1);
    assert_eq!(seen.header("cookie"), Some("session=tokenB"));

    // And A observes its own.
    http_get_with_headers(port_a, "/api/me", &[("Cookie", &jar_header(&jar))])
        .await
        .unwrap();
    let seen = dev_a.request(dev_a.request_count() - 1);
    assert_eq!(seen.header("cookie"), Some("session=tokenA"));
}

// ============================================================================
// Post-proxy behavior
// ============================================================================

#[tokio::test]
async fn test_post_proxy_forwards_tagged_requests() {
    let dev = spawn_upstream(vec![], "dev").await;
    let api = spawn_upstream(vec!["session=api-token".to_string()], "api data").await;
    let (management_port, port_a, port_b) = (free_port().await, free_port().await, free_port().await);
    let config = two_env_config(
        management_port,
        port_a,
        port_b,
        &dev.origin(),
        &api.origin(),
        "http://127.0.0.1:1",
    );
    let gateway = spawn_gateway(&config).await;
    gateway.start_env("a", port_a).await;

    let tag = port_a.to_string();
    let response = http_get_with_headers(
        gateway.management_port,
        "/api/user",
        &[("x-api-server", &tag)],
    )
    .await
    .unwrap();

    assert_eq!(response_status(&response), 200);
    assert!(response.ends_with("api data"));
    assert_eq!(api.request(0).path, "/api/user");

    // The response-side rewrite keys on the environment's port.
    let cookies = set_cookie_values(&response);
    assert!(cookies.contains(&"session=api-token".to_string()));
    assert!(cookies.contains(&format!("session-{}-envm=api-token", port_a)));
}

#[tokio::test]
async fn test_post_proxy_rejects_unknown_tag_and_keeps_serving() {
    let dev = spawn_upstream(vec![], "dev").await;
    let (management_port, port_a, port_b) = (free_port().await, free_port().await, free_port().await);
    let config = two_env_config(
        management_port,
        port_a,
        port_b,
        &dev.origin(),
        "http://127.0.0.1:1",
        "http://127.0.0.1:1",
    );
    let gateway = spawn_gateway(&config).await;

    // No environment is running on port_a; the tagged request fails alone.
    let tag = port_a.to_string();
    let response = http_get_with_headers(
        gateway.management_port,
        "/api/user",
        &[("x-api-server", &tag)],
    )
    .await
    .unwrap();
    assert_eq!(response_status(&response), 502);
    assert!(response.contains("UNKNOWN_ENVIRONMENT"));

    // The listener is unaffected; the health probe still answers.
    let base = &gateway.settings.base_path;
    let response = http_get(gateway.management_port, &format!("{base}/are-you-ok"))
        .await
        .unwrap();
    assert_eq!(response_status(&response), 200);
}

#[tokio::test]
async fn test_untagged_request_serves_admin_page() {
    let dev = spawn_upstream(vec![], "dev").await;
    let (management_port, port_a, port_b) = (free_port().await, free_port().await, free_port().await);
    let config = two_env_config(
        management_port,
        port_a,
        port_b,
        &dev.origin(),
        "http://127.0.0.1:1",
        "http://127.0.0.1:1",
    );
    let gateway = spawn_gateway(&config).await;

    let response = http_get(gateway.management_port, "/").await.unwrap();
    assert_eq!(response_status(&response), 200);
    assert!(response.contains("text/html"));
    assert!(response.contains("envgate environments"));
}

// ============================================================================
// Management surface
// ============================================================================

#[tokio::test]
async fn test_management_health_probe() {
    let (management_port, port_a, port_b) = (free_port().await, free_port().await, free_port().await);
    let config = two_env_config(
        management_port,
        port_a,
        port_b,
        "http://127.0.0.1:1",
        "http://127.0.0.1:1",
        "http://127.0.0.1:1",
    );
    let gateway = spawn_gateway(&config).await;

    let base = &gateway.settings.base_path;
    let response = http_get(gateway.management_port, &format!("{base}/are-you-ok"))
        .await
        .unwrap();
    assert_eq!(response_status(&response), 200);
    assert!(response.contains("\"name\":\"envgate\""));
    assert!(response.contains("\"version\""));
}

#[tokio::test]
async fn test_management_start_stop_roundtrip() {
    let dev = spawn_upstream(vec![], "dev").await;
    let (management_port, port_a, port_b) = (free_port().await, free_port().await, free_port().await);
    let config = two_env_config(
        management_port,
        port_a,
        port_b,
        &dev.origin(),
        "http://127.0.0.1:1",
        "http://127.0.0.1:1",
    );
    let gateway = spawn_gateway(&config).await;
    let base = gateway.settings.base_path.clone();

    // Everything starts stopped.
    let list = http_get(gateway.management_port, &format!("{base}/getlist"))
        .await
        .unwrap();
    assert!(list.contains("\"status\":\"stopped\""));
    assert!(!list.contains("\"status\":\"running\""));

    // Start env "a" through the REST surface.
    let body = format!(r#"{{"action":"start","name":"a","port":{port_a}}}"#);
    let response = http_post_json(
        gateway.management_port,
        &format!("{base}/manage-server"),
        &body,
    )
    .await
    .unwrap();
    assert_eq!(response_status(&response), 200);
    assert!(wait_for_port(port_a, Duration::from_secs(5)).await);

    let list = http_get(gateway.management_port, &format!("{base}/getlist"))
        .await
        .unwrap();
    assert!(list.contains("\"status\":\"running\""));

    // Starting again is a no-op, not an error.
    let response = http_post_json(
        gateway.management_port,
        &format!("{base}/manage-server"),
        &body,
    )
    .await
    .unwrap();
    assert_eq!(response_status(&response), 200);
    assert!(response.contains("already running"));

    // Stop it; stopping a second time reports not-running.
    let body = format!(r#"{{"action":"stop","name":"a","port":{port_a}}}"#);
    let response = http_post_json(
        gateway.management_port,
        &format!("{base}/manage-server"),
        &body,
    )
    .await
    .unwrap();
    assert_eq!(response_status(&response), 200);
    assert_eq!(
        gateway
            .catalog
            .find_environment_by_name_port("a", port_a)
            .unwrap()
            .status,
        EnvStatus::Stopped
    );

    let response = http_post_json(
        gateway.management_port,
        &format!("{base}/manage-server"),
        &body,
    )
    .await
    .unwrap();
    assert_eq!(response_status(&response), 400);
    assert!(response.contains("not running"));
}

#[tokio::test]
async fn test_dev_server_switch_takes_effect_immediately() {
    let old_dev = spawn_upstream(vec![], "old").await;
    let new_dev = spawn_upstream(vec![], "new").await;
    let (management_port, port_a) = (free_port().await, free_port().await);

    let config = format!(
        r#"
[server]
port = {management_port}

[[dev_server]]
name = "old"
url = "{old_origin}"

[[dev_server]]
name = "new"
url = "{new_origin}"

[[env]]
name = "a"
port = {port_a}
api_base_url = "http://127.0.0.1:1"
dev_server = "old"
"#,
        old_origin = old_dev.origin(),
        new_origin = new_dev.origin(),
    );
    let gateway = spawn_gateway(&config).await;
    gateway.start_env("a", port_a).await;

    let response = http_get(port_a, "/").await.unwrap();
    assert!(response.ends_with("old"));

    let base = &gateway.settings.base_path;
    let body = format!(r#"{{"name":"a","port":{port_a},"dev_server":"new"}}"#);
    let response = http_post_json(
        gateway.management_port,
        &format!("{base}/update-dev-server-id"),
        &body,
    )
    .await
    .unwrap();
    assert_eq!(response_status(&response), 200);

    // No listener restart needed; the next request goes to the new server.
    let response = http_get(port_a, "/").await.unwrap();
    assert!(response.ends_with("new"));
    assert_eq!(old_dev.request_count(), 1);
    assert_eq!(new_dev.request_count(), 1);
}

#[tokio::test]
async fn test_startup_self_check_detects_running_instance() {
    let (management_port, port_a, port_b) = (free_port().await, free_port().await, free_port().await);
    let config = two_env_config(
        management_port,
        port_a,
        port_b,
        "http://127.0.0.1:1",
        "http://127.0.0.1:1",
        "http://127.0.0.1:1",
    );
    let gateway = spawn_gateway(&config).await;

    // A second instance on the same management port must refuse to start.
    let err = ensure_management_port_free(&gateway.settings)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already running"));

    // A free port passes the check.
    let free_settings = Settings {
        management_port: free_port().await,
        ..(*gateway.settings).clone()
    };
    ensure_management_port_free(&free_settings).await.unwrap();
}

// ============================================================================
// Reconciliation through the live stack
// ============================================================================

#[tokio::test]
async fn test_reconciliation_preserves_untouched_and_stops_removed() {
    let dev = spawn_upstream(vec![], "dev").await;
    let (management_port, port_a, port_b) = (free_port().await, free_port().await, free_port().await);
    let config = two_env_config(
        management_port,
        port_a,
        port_b,
        &dev.origin(),
        "http://127.0.0.1:1",
        "http://127.0.0.1:1",
    );
    let gateway = spawn_gateway(&config).await;
    gateway.start_env("a", port_a).await;
    gateway.start_env("b", port_b).await;

    // Adding a third environment disturbs nothing that is running.
    let port_c = free_port().await;
    let with_c = format!(
        "{}\n[[env]]\nname = \"c\"\nport = {}\napi_base_url = \"http://127.0.0.1:1\"\n",
        two_env_config(
            management_port,
            port_a,
            port_b,
            &dev.origin(),
            "http://127.0.0.1:1",
            "http://127.0.0.1:1",
        ),
        port_c
    );
    let summary = gateway.reconciler.apply(&toml::from_str(&with_c).unwrap());
    assert!(summary.stopped.is_empty());
    assert!(gateway.registry.is_running(&format!("a+{}", port_a)));
    assert!(gateway.registry.is_running(&format!("b+{}", port_b)));
    assert_eq!(
        gateway
            .catalog
            .find_environment_by_name_port("c", port_c)
            .unwrap()
            .status,
        EnvStatus::Stopped
    );

    // Dropping "a" while it runs stops exactly that listener.
    let only_b = format!(
        r#"
[server]
port = {management_port}

[[dev_server]]
name = "vite"
url = "{dev_origin}"

[[env]]
name = "b"
port = {port_b}
api_base_url = "http://127.0.0.1:1"
"#,
        dev_origin = dev.origin(),
    );
    let summary = gateway.reconciler.apply(&toml::from_str(&only_b).unwrap());
    assert_eq!(summary.stopped, vec![format!("a+{}", port_a)]);
    assert!(!gateway.registry.is_running(&format!("a+{}", port_a)));
    assert!(gateway.registry.is_running(&format!("b+{}", port_b)));

    // The stopped port no longer accepts connections.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(format!("127.0.0.1:{}", port_a))
        .await
        .is_err());
}

// ============================================================================
// Notification socket
// ============================================================================

/// Compute Sec-WebSocket-Accept from client key
fn compute_accept_key(key: &str) -> String {
    use base64::Engine;
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

#[tokio::test]
async fn test_notification_socket_receives_reload_events() {
    let (management_port, port_a, port_b) = (free_port().await, free_port().await, free_port().await);
    let config = two_env_config(
        management_port,
        port_a,
        port_b,
        "http://127.0.0.1:1",
        "http://127.0.0.1:1",
        "http://127.0.0.1:1",
    );
    let gateway = spawn_gateway(&config).await;

    // Handshake against the management base path.
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", gateway.management_port))
        .await
        .unwrap();
    let key = "dGhlIHNhbXBsZSBub25jZQ==";
    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: 127.0.0.1:{}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        gateway.settings.base_path, gateway.management_port, key
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf[..n]).to_string();
    assert!(response.starts_with("HTTP/1.1 101"));
    assert!(response.contains(&compute_accept_key(key)));

    // Wait for the hub to adopt the upgraded connection.
    let start = std::time::Instant::now();
    while gateway.hub.client_count() == 0 && start.elapsed() < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(gateway.hub.client_count(), 1);

    gateway.hub.broadcast(r#"{"action":"filechange"}"#);

    let n = stream.read(&mut buf).await.unwrap();
    // Text frame: FIN+text opcode, length, then the JSON payload.
    assert_eq!(buf[0], 0x81);
    let payload = String::from_utf8_lossy(&buf[2..n]).to_string();
    assert_eq!(payload, r#"{"action":"filechange"}"#);
}
