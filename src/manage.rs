//! Management REST surface
//!
//! Mounted by the post-proxy under the configured base path. Every
//! response uses the `{code, message, data}` envelope the admin page
//! expects; the HTTP status mirrors the envelope code.

use crate::catalog::{Catalog, DevServer, EnvOrigin, EnvStatus, Environment, EnvironmentPatch};
use crate::config::Settings;
use crate::error::GatewayError;
use crate::registry::{ListenerRegistry, StartOutcome};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Version information reported by the health probe
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Shared context for the management handlers
pub struct ManageContext {
    pub catalog: Arc<Catalog>,
    pub registry: Arc<ListenerRegistry>,
    pub settings: Arc<Settings>,
}

/// Envelope helper: `{code, message, data}` with matching HTTP status
fn envelope(
    status: StatusCode,
    message: &str,
    data: serde_json::Value,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = serde_json::json!({
        "code": status.as_u16(),
        "message": message,
        "data": data,
    });
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(
            Full::new(Bytes::from(body.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static header")
}

fn success(data: serde_json::Value) -> Response<BoxBody<Bytes, hyper::Error>> {
    envelope(StatusCode::OK, "success", data)
}

fn failure(status: StatusCode, message: impl AsRef<str>) -> Response<BoxBody<Bytes, hyper::Error>> {
    envelope(status, message.as_ref(), serde_json::Value::Null)
}

fn gateway_error_response(err: &GatewayError) -> Response<BoxBody<Bytes, hyper::Error>> {
    let status = match err {
        GatewayError::EnvNotFound(_) | GatewayError::DevServerNotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::DuplicateReference(_)
        | GatewayError::DevServerInUse(_)
        | GatewayError::PortInUse { .. }
        | GatewayError::NotRunning(_)
        | GatewayError::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
        GatewayError::BindFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    failure(status, err.to_string())
}

#[derive(Debug, Deserialize)]
struct ManageServerRequest {
    action: String,
    name: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct UpdateDevServerIdRequest {
    name: String,
    port: u16,
    dev_server: String,
}

#[derive(Debug, Deserialize)]
struct CreateEnvRequest {
    name: String,
    port: u16,
    api_base_url: String,
    dev_server: Option<String>,
    index_page: Option<String>,
    enable_cookie_proxy: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct UpdateEnvRequest {
    id: String,
    api_base_url: Option<String>,
    dev_server: Option<String>,
    index_page: Option<String>,
    enable_cookie_proxy: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct DeleteEnvRequest {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DevServerRequest {
    name: String,
    url: Option<String>,
}

/// Dispatch one management request. `path` is already stripped of the
/// base path.
pub async fn handle_request(
    req: Request<Incoming>,
    path: &str,
    ctx: &ManageContext,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let method = req.method().clone();
    debug!(%method, path, "Management request");

    let response = match (&method, path) {
        // Health probe used by the startup self-check (and curl-friendly)
        (&Method::GET, "/are-you-ok") => success(serde_json::json!({
            "name": PKG_NAME,
            "version": VERSION,
            "config_path": ctx.settings.config_path.display().to_string(),
        })),

        (&Method::GET, "/getlist") => {
            let list: Vec<serde_json::Value> = ctx
                .catalog
                .all_environments()
                .into_iter()
                .map(|env| env_view(&env))
                .collect();
            success(serde_json::json!({ "list": list }))
        }

        (&Method::GET, "/get-dev-server-list") => {
            let list = ctx.catalog.all_dev_servers();
            success(serde_json::json!({ "list": list }))
        }

        (&Method::POST, "/manage-server") => {
            let body = req.collect().await?.to_bytes();
            match serde_json::from_slice::<ManageServerRequest>(&body) {
                Ok(manage) => handle_manage_server(manage, ctx).await,
                Err(e) => failure(StatusCode::BAD_REQUEST, format!("invalid request body: {}", e)),
            }
        }

        (&Method::POST, "/update-dev-server-id") => {
            let body = req.collect().await?.to_bytes();
            match serde_json::from_slice::<UpdateDevServerIdRequest>(&body) {
                Ok(update) => handle_update_dev_server_id(update, ctx),
                Err(e) => failure(StatusCode::BAD_REQUEST, format!("invalid request body: {}", e)),
            }
        }

        (&Method::POST, "/env") => {
            let body = req.collect().await?.to_bytes();
            match serde_json::from_slice::<CreateEnvRequest>(&body) {
                Ok(create) => handle_create_env(create, ctx),
                Err(e) => failure(StatusCode::BAD_REQUEST, format!("invalid request body: {}", e)),
            }
        }

        (&Method::PUT, "/env") => {
            let body = req.collect().await?.to_bytes();
            match serde_json::from_slice::<UpdateEnvRequest>(&body) {
                Ok(update) => handle_update_env(update, ctx),
                Err(e) => failure(StatusCode::BAD_REQUEST, format!("invalid request body: {}", e)),
            }
        }

        (&Method::DELETE, "/env") => {
            let body = req.collect().await?.to_bytes();
            match serde_json::from_slice::<DeleteEnvRequest>(&body) {
                Ok(delete) => handle_delete_env(delete, ctx),
                Err(e) => failure(StatusCode::BAD_REQUEST, format!("invalid request body: {}", e)),
            }
        }

        (&Method::POST, "/dev-server") => {
            let body = req.collect().await?.to_bytes();
            match serde_json::from_slice::<DevServerRequest>(&body) {
                Ok(create) => handle_create_dev_server(create, ctx),
                Err(e) => failure(StatusCode::BAD_REQUEST, format!("invalid request body: {}", e)),
            }
        }

        (&Method::PUT, "/dev-server") => {
            let body = req.collect().await?.to_bytes();
            match serde_json::from_slice::<DevServerRequest>(&body) {
                Ok(update) => handle_update_dev_server(update, ctx),
                Err(e) => failure(StatusCode::BAD_REQUEST, format!("invalid request body: {}", e)),
            }
        }

        (&Method::DELETE, "/dev-server") => {
            let body = req.collect().await?.to_bytes();
            match serde_json::from_slice::<DevServerRequest>(&body) {
                Ok(delete) => match ctx.catalog.remove_dev_server(&delete.name) {
                    Ok(removed) => success(serde_json::json!({ "removed": removed.name })),
                    Err(e) => gateway_error_response(&e),
                },
                Err(e) => failure(StatusCode::BAD_REQUEST, format!("invalid request body: {}", e)),
            }
        }

        _ => failure(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

fn env_view(env: &Environment) -> serde_json::Value {
    serde_json::json!({
        "id": env.id,
        "name": env.name,
        "port": env.port,
        "api_base_url": env.api_base_url,
        "dev_server": env.dev_server,
        "index_page": env.index_page,
        "enable_cookie_proxy": env.enable_cookie_proxy,
        "status": env.status,
        "origin": env.origin,
    })
}

async fn handle_manage_server(
    manage: ManageServerRequest,
    ctx: &ManageContext,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let Some(env) = ctx
        .catalog
        .find_environment_by_name_port(&manage.name, manage.port)
    else {
        return failure(
            StatusCode::NOT_FOUND,
            format!("environment '{}' on port {} not found", manage.name, manage.port),
        );
    };

    match manage.action.as_str() {
        "start" => match ctx.registry.start(&env).await {
            Ok(StartOutcome::Started) => success(serde_json::json!({
                "message": format!("environment '{}' started on port {}", env.name, env.port),
            })),
            Ok(StartOutcome::AlreadyRunning) => success(serde_json::json!({
                "message": format!("environment '{}' already running on port {}", env.name, env.port),
            })),
            Err(e) => {
                warn!(env = %env.id, error = %e, "Start request failed");
                gateway_error_response(&e)
            }
        },
        "stop" => match ctx.registry.stop(&env.id) {
            Ok(()) => success(serde_json::json!({
                "message": format!("environment '{}' on port {} stopped", env.name, env.port),
            })),
            Err(e) => gateway_error_response(&e),
        },
        other => failure(
            StatusCode::BAD_REQUEST,
            format!("invalid action '{}', expected 'start' or 'stop'", other),
        ),
    }
}

fn handle_update_dev_server_id(
    update: UpdateDevServerIdRequest,
    ctx: &ManageContext,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let Some(env) = ctx
        .catalog
        .find_environment_by_name_port(&update.name, update.port)
    else {
        return failure(
            StatusCode::NOT_FOUND,
            format!("environment '{}' on port {} not found", update.name, update.port),
        );
    };

    if ctx.catalog.find_dev_server(&update.dev_server).is_none() {
        return failure(
            StatusCode::NOT_FOUND,
            format!("dev server '{}' not found", update.dev_server),
        );
    }

    let patch = EnvironmentPatch {
        dev_server: Some(update.dev_server.clone()),
        ..Default::default()
    };
    match ctx.catalog.update_environment(&env.id, patch) {
        Ok(env) => success(serde_json::json!({
            "message": format!(
                "environment '{}' on port {} switched to '{}'",
                env.name, env.port, update.dev_server
            ),
        })),
        Err(e) => gateway_error_response(&e),
    }
}

fn handle_create_env(
    create: CreateEnvRequest,
    ctx: &ManageContext,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    if create.name.is_empty() || create.port == 0 || create.api_base_url.is_empty() {
        return failure(
            StatusCode::BAD_REQUEST,
            "name, port and api_base_url are required",
        );
    }
    if create.port == ctx.settings.management_port {
        return failure(
            StatusCode::BAD_REQUEST,
            format!("port {} collides with the management port", create.port),
        );
    }

    let env = Environment {
        id: uuid::Uuid::new_v4().to_string(),
        name: create.name,
        port: create.port,
        api_base_url: create.api_base_url,
        dev_server: create.dev_server,
        index_page: create
            .index_page
            .unwrap_or_else(|| ctx.settings.index_page.clone()),
        enable_cookie_proxy: create
            .enable_cookie_proxy
            .unwrap_or(ctx.settings.enable_cookie_proxy),
        status: EnvStatus::Stopped,
        origin: EnvOrigin::Api,
    };

    match ctx.catalog.insert_environment(env.clone()) {
        Ok(()) => success(env_view(&env)),
        Err(e) => gateway_error_response(&e),
    }
}

fn handle_update_env(
    update: UpdateEnvRequest,
    ctx: &ManageContext,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let patch = EnvironmentPatch {
        api_base_url: update.api_base_url,
        dev_server: update.dev_server,
        index_page: update.index_page,
        enable_cookie_proxy: update.enable_cookie_proxy,
    };
    match ctx.catalog.update_environment(&update.id, patch) {
        Ok(env) => success(env_view(&env)),
        Err(e) => gateway_error_response(&e),
    }
}

fn handle_delete_env(
    delete: DeleteEnvRequest,
    ctx: &ManageContext,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    // A running environment loses its listener before the record goes.
    if ctx.registry.is_running(&delete.id) {
        let _ = ctx.registry.stop(&delete.id);
    }
    match ctx.catalog.remove_environment(&delete.id) {
        Ok(env) => success(serde_json::json!({ "removed": env.id })),
        Err(e) => gateway_error_response(&e),
    }
}

fn handle_create_dev_server(
    create: DevServerRequest,
    ctx: &ManageContext,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let Some(url) = create.url else {
        return failure(StatusCode::BAD_REQUEST, "url is required");
    };
    if create.name.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "name is required");
    }

    let dev_server = DevServer {
        name: create.name,
        url,
    };
    match ctx.catalog.insert_dev_server(dev_server.clone()) {
        Ok(()) => success(serde_json::json!(dev_server)),
        Err(e) => gateway_error_response(&e),
    }
}

fn handle_update_dev_server(
    update: DevServerRequest,
    ctx: &ManageContext,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let Some(url) = update.url else {
        return failure(StatusCode::BAD_REQUEST, "url is required");
    };
    match ctx.catalog.update_dev_server(&update.name, url) {
        Ok(dev_server) => success(serde_json::json!(dev_server)),
        Err(e) => gateway_error_response(&e),
    }
}
