//! Change-notification WebSocket
//!
//! The post-proxy exposes one upgrade endpoint under the management base
//! path. Connected admin clients receive a single event type — "the config
//! was reloaded" — so they can refresh their view. This socket is distinct
//! from proxied WebSocket traffic, which the proxies splice transparently.
//!
//! Server-push only: frames from clients are drained and ignored, and the
//! connection is dropped when the client closes or errors.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// WebSocket magic GUID for computing the accept key
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute Sec-WebSocket-Accept from the client's Sec-WebSocket-Key
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Encode one unmasked text frame (server-to-client)
fn text_frame(payload: &str) -> Vec<u8> {
    let bytes = payload.as_bytes();
    let mut frame = Vec::with_capacity(bytes.len() + 4);
    frame.push(0x81); // FIN + text opcode

    if bytes.len() < 126 {
        frame.push(bytes.len() as u8);
    } else {
        // Notification payloads are tiny; 16-bit length covers everything
        // this hub ever sends.
        frame.push(126);
        frame.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    }
    frame.extend_from_slice(bytes);
    frame
}

/// Registry of connected notification clients
pub struct NotificationHub {
    clients: DashMap<u64, mpsc::UnboundedSender<String>>,
    next_id: AtomicU64,
}

impl NotificationHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: DashMap::new(),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Push a text message to every connected client.
    ///
    /// Clients whose writer task has gone away are dropped here.
    pub fn broadcast(&self, message: &str) {
        let mut stale = Vec::new();
        for entry in self.clients.iter() {
            if entry.value().send(message.to_string()).is_err() {
                stale.push(*entry.key());
            }
        }
        for id in stale {
            self.clients.remove(&id);
        }
        debug!(clients = self.clients.len(), "Notification broadcast");
    }

    /// Answer a WebSocket handshake and adopt the connection.
    ///
    /// Returns the 101 response to send; the upgraded socket is driven by
    /// a spawned task that pushes broadcast frames and watches for EOF.
    pub fn handle_upgrade(
        self: &Arc<Self>,
        req: Request<Incoming>,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let Some(client_key) = req
            .headers()
            .get("sec-websocket-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        else {
            return Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
                .expect("valid response builder");
        };

        let accept = accept_key(&client_key);

        let hub = Arc::clone(self);
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => hub.serve_client(upgraded).await,
                Err(e) => warn!(error = %e, "Notification socket upgrade failed"),
            }
        });

        let mut response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(hyper::header::UPGRADE, "websocket")
            .header(hyper::header::CONNECTION, "Upgrade");
        if let Ok(value) = HeaderValue::from_str(&accept) {
            response = response.header("Sec-WebSocket-Accept", value);
        }
        response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder")
    }

    async fn serve_client(self: Arc<Self>, upgraded: hyper::upgrade::Upgraded) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.clients.insert(id, tx);
        debug!(client = id, "Notification client connected");

        let mut io = TokioIo::new(upgraded);
        let mut read_buf = [0u8; 512];

        loop {
            tokio::select! {
                message = rx.recv() => {
                    match message {
                        Some(message) => {
                            if let Err(e) = io.write_all(&text_frame(&message)).await {
                                debug!(client = id, error = %e, "Notification write failed");
                                break;
                            }
                        }
                        None => break,
                    }
                }
                result = io.read(&mut read_buf) => {
                    // Client frames (including close) end the session; this
                    // channel never consumes client input.
                    match result {
                        Ok(0) | Err(_) => break,
                        Ok(_) => continue,
                    }
                }
            }
        }

        self.clients.remove(&id);
        debug!(client = id, "Notification client disconnected");
    }
}
