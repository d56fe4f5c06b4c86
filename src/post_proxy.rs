//! Post-proxy: the shared management listener and second proxy hop
//!
//! One public entry point on the management port. Requests carrying the
//! identity header set by a pre-proxy are forwarded to the tagged
//! environment's API origin; everything else falls through to the
//! notification WebSocket, the management REST surface or the embedded
//! admin page. A tagged request whose environment is gone fails alone
//! with a 502-class error; the listener keeps serving.

use crate::catalog::Catalog;
use crate::config::Settings;
use crate::cookies;
use crate::dashboard;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::manage::{self, ManageContext};
use crate::pool::ProxyClient;
use crate::pre_proxy::{self, is_upgrade_request, API_SERVER_HEADER, UPSTREAM_REQUEST_TIMEOUT};
use crate::registry::ListenerRegistry;
use crate::ws::NotificationHub;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Shared dispatch context for post-proxy connections
struct PostContext {
    settings: Arc<Settings>,
    catalog: Arc<Catalog>,
    registry: Arc<ListenerRegistry>,
    client: Arc<ProxyClient>,
    hub: Arc<NotificationHub>,
    manage: ManageContext,
}

/// The shared post-proxy and management server
pub struct PostProxyServer {
    ctx: Arc<PostContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PostProxyServer {
    pub fn new(
        settings: Arc<Settings>,
        catalog: Arc<Catalog>,
        registry: Arc<ListenerRegistry>,
        client: Arc<ProxyClient>,
        hub: Arc<NotificationHub>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let manage = ManageContext {
            catalog: Arc::clone(&catalog),
            registry: Arc::clone(&registry),
            settings: Arc::clone(&settings),
        };
        Self {
            ctx: Arc::new(PostContext {
                settings,
                catalog,
                registry,
                client,
                hub,
                manage,
            }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = (
            self.ctx.settings.bind.as_str(),
            self.ctx.settings.management_port,
        );
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            anyhow::anyhow!(
                "failed to bind management port {}: {}",
                self.ctx.settings.management_port,
                e
            )
        })?;
        info!(
            bind = %self.ctx.settings.bind,
            port = self.ctx.settings.management_port,
            base_path = %self.ctx.settings.base_path,
            "Post-proxy listening"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let ctx = Arc::clone(&ctx);
                                    async move { dispatch(req, &ctx).await }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .http1()
                                    .preserve_header_case(true)
                                    .http2()
                                    .max_concurrent_streams(250)
                                    .serve_connection_with_upgrades(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Post-proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn dispatch(
    req: Request<Incoming>,
    ctx: &PostContext,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Only tagged requests are proxy-hop candidates.
    if req.headers().contains_key(API_SERVER_HEADER) {
        return proxy_hop(req, ctx).await;
    }

    let path = req.uri().path().to_string();
    let base_path = &ctx.settings.base_path;

    if let Some(sub_path) = strip_base_path(&path, base_path) {
        if is_upgrade_request(&req) {
            // Out-of-band change notifications, not proxied traffic.
            return Ok(ctx.hub.handle_upgrade(req));
        }
        return manage::handle_request(req, &sub_path, &ctx.manage).await;
    }

    Ok(dashboard::serve_admin_page(base_path))
}

/// Strip the management base path, normalizing the remainder to start
/// with `/`. Returns `None` for paths outside the management surface.
fn strip_base_path(path: &str, base_path: &str) -> Option<String> {
    let rest = path.strip_prefix(base_path)?;
    if rest.is_empty() {
        return Some("/".to_string());
    }
    if !rest.starts_with('/') {
        return None;
    }
    Some(rest.to_string())
}

/// Second hop: forward a tagged request to its environment's API origin
async fn proxy_hop(
    req: Request<Incoming>,
    ctx: &PostContext,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let tag = req
        .headers()
        .get(API_SERVER_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let Ok(port) = tag.parse::<u16>() else {
        warn!(tag, "Tagged request with unparseable identity header");
        return Ok(json_error_response(
            ProxyErrorCode::UnknownEnvironment,
            format!("Invalid identity header '{}'", tag),
        ));
    };

    // The identity header names the pre-proxy port; the live listener on
    // that port identifies the owning environment.
    let Some(info) = ctx.registry.find_by_port(port) else {
        warn!(port, "Tagged request for a port with no running environment");
        return Ok(json_error_response(
            ProxyErrorCode::UnknownEnvironment,
            format!("No environment is running on port {}", port),
        ));
    };

    let Some(env) = ctx.catalog.find_environment(&info.env_id) else {
        return Ok(json_error_response(
            ProxyErrorCode::UnknownEnvironment,
            "Environment no longer exists",
        ));
    };

    if is_upgrade_request(&req) {
        return pre_proxy::proxy_upgrade(req, &env.api_base_url, &env.id).await;
    }

    debug!(
        env = %env.id,
        method = %req.method(),
        uri = %req.uri(),
        api = %env.api_base_url,
        "Forwarding API request"
    );

    let result = tokio::time::timeout(
        UPSTREAM_REQUEST_TIMEOUT,
        ctx.client.forward(req, &env.api_base_url),
    )
    .await;

    match result {
        Ok(Ok(mut response)) => {
            if env.enable_cookie_proxy {
                cookies::append_set_cookie_shadows(
                    response.headers_mut(),
                    env.port,
                    &ctx.settings.cookie_suffix,
                );
            }
            Ok(response)
        }
        Ok(Err(e)) => {
            error!(env = %env.id, api = %env.api_base_url, error = %e, "Failed to reach API origin");
            Ok(json_error_response(
                ProxyErrorCode::UpstreamUnreachable,
                "Failed to reach API origin",
            ))
        }
        Err(_) => {
            warn!(
                env = %env.id,
                api = %env.api_base_url,
                timeout_secs = UPSTREAM_REQUEST_TIMEOUT.as_secs(),
                "API request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "API origin did not answer within {} seconds",
                    UPSTREAM_REQUEST_TIMEOUT.as_secs()
                ),
            ))
        }
    }
}

/// Startup self-check: refuse to start when the management port is taken.
///
/// When something already listens there, ask its health probe whether it
/// is another instance of this tool to produce an actionable message.
pub async fn ensure_management_port_free(settings: &Settings) -> anyhow::Result<()> {
    let addr = format!("{}:{}", settings.bind, settings.management_port);
    let connect = tokio::time::timeout(Duration::from_secs(1), TcpStream::connect(&addr)).await;

    let mut stream = match connect {
        Ok(Ok(stream)) => stream,
        // Connection refused or timed out: nothing is listening.
        Ok(Err(_)) | Err(_) => return Ok(()),
    };

    let request = format!(
        "GET {}/are-you-ok HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        settings.base_path, addr
    );
    let probe = tokio::time::timeout(Duration::from_secs(2), async {
        stream.write_all(request.as_bytes()).await?;
        let mut response = String::new();
        stream.read_to_string(&mut response).await?;
        Ok::<_, std::io::Error>(response)
    })
    .await;

    match probe {
        Ok(Ok(response)) if response.contains(manage::PKG_NAME) => {
            anyhow::bail!(
                "another {} instance is already running on port {}",
                manage::PKG_NAME,
                settings.management_port
            )
        }
        _ => anyhow::bail!(
            "management port {} is occupied by another process",
            settings.management_port
        ),
    }
}
