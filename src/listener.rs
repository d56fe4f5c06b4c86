//! Per-environment port listener
//!
//! One `PortListener` owns one bound TCP port and the set of connections
//! accepted on it. The handle is the only mutator of its connection set:
//! connections register on accept, deregister when their serving task
//! finishes, and are force-aborted on [`PortListener::stop`]. Stop is
//! immediate rather than draining; instant feedback matters more than
//! in-flight completion for a development tool.

use crate::pre_proxy::PreProxy;
use dashmap::DashMap;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Sleep;
use tracing::{debug, error, info};

/// Idle window after which an abandoned client socket is force-closed
pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// A live listener bound to one environment's port
pub struct PortListener {
    port: u16,
    env_id: String,
    connections: Arc<DashMap<u64, AbortHandle>>,
    shutdown_tx: watch::Sender<bool>,
}

impl PortListener {
    /// Bind the environment's port and start accepting connections.
    ///
    /// Fails with the OS bind error when the port is held by a foreign
    /// process; the caller rolls back its registration in that case.
    pub async fn bind(
        bind_addr: &str,
        port: u16,
        env_id: String,
        proxy: Arc<PreProxy>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind((bind_addr, port)).await?;
        info!(env = %env_id, port, "Environment listener bound");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connections: Arc<DashMap<u64, AbortHandle>> = Arc::new(DashMap::new());

        let accept_connections = Arc::clone(&connections);
        let accept_env_id = env_id.clone();
        tokio::spawn(async move {
            accept_loop(listener, shutdown_rx, accept_connections, proxy, accept_env_id).await;
        });

        Ok(Self {
            port,
            env_id,
            connections,
            shutdown_tx,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn env_id(&self) -> &str {
        &self.env_id
    }

    /// Number of currently tracked connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Destroy every tracked connection and stop accepting.
    ///
    /// No drain grace period: serving tasks are aborted, which drops their
    /// sockets immediately.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        for entry in self.connections.iter() {
            entry.value().abort();
        }
        self.connections.clear();
        info!(env = %self.env_id, port = self.port, "Environment listener stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
    connections: Arc<DashMap<u64, AbortHandle>>,
    proxy: Arc<PreProxy>,
    env_id: String,
) {
    let next_conn_id = AtomicU64::new(0);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
                        let proxy = Arc::clone(&proxy);
                        let conn_set = Arc::clone(&connections);

                        let handle = tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, addr, proxy).await {
                                debug!(addr = %addr, error = %e, "Connection error");
                            }
                            conn_set.remove(&conn_id);
                        });

                        let abort = handle.abort_handle();
                        connections.insert(conn_id, abort);
                        // The task may already have finished and missed its
                        // own removal; re-check so the set never grows stale.
                        if handle.is_finished() {
                            connections.remove(&conn_id);
                        }
                    }
                    Err(e) => {
                        error!(env = %env_id, error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!(env = %env_id, "Accept loop exiting");
                    break;
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    proxy: Arc<PreProxy>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(IdleStream::new(stream, CLIENT_IDLE_TIMEOUT));

    let service = service_fn(move |req| {
        let proxy = Arc::clone(&proxy);
        async move { proxy.handle(req, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Stream wrapper that errors with `TimedOut` once no byte has moved in
/// either direction for the idle window. The deadline re-arms on every
/// successful read or write.
pub struct IdleStream<S> {
    inner: S,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl<S> IdleStream<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: Box::pin(tokio::time::sleep(timeout)),
        }
    }

    fn rearm(&mut self) {
        let timeout = self.timeout;
        self.deadline
            .as_mut()
            .reset(tokio::time::Instant::now() + timeout);
    }

    fn poll_deadline(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "client connection idle timeout",
            )));
        }
        Poll::Pending
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.rearm();
                Poll::Ready(result)
            }
            Poll::Pending => this.poll_deadline(cx),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.rearm();
                Poll::Ready(result)
            }
            Poll::Pending => match this.poll_deadline(cx) {
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                _ => Poll::Pending,
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
