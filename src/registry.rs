//! Listener registry and lifecycle manager
//!
//! Tracks which environments currently have a live port listener and
//! enforces at-most-one listener per port. Start and stop serialize per
//! port through atomic map-entry reservation: a starting environment
//! claims its port in the registry before the (awaited) bind, so two
//! concurrent starts can never race two listeners onto one port. Cross-
//! port operations proceed concurrently.

use crate::catalog::{Catalog, EnvStatus, Environment};
use crate::config::Settings;
use crate::error::GatewayError;
use crate::listener::PortListener;
use crate::pool::ProxyClient;
use crate::pre_proxy::PreProxy;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of a successful start call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new listener was bound
    Started,
    /// This environment already held a listener; nothing changed
    AlreadyRunning,
}

/// Registry slot for one port.
///
/// `listener` is `None` while the owning start call is between reserving
/// the port and completing the bind.
struct ListenerEntry {
    env_id: String,
    env_name: String,
    listener: Option<PortListener>,
}

/// Snapshot of a live listener for inspection
#[derive(Debug, Clone)]
pub struct ListenerInfo {
    pub port: u16,
    pub env_id: String,
    pub connections: usize,
}

/// Port-keyed registry of live listeners
pub struct ListenerRegistry {
    listeners: DashMap<u16, ListenerEntry>,
    catalog: Arc<Catalog>,
    client: Arc<ProxyClient>,
    settings: Arc<Settings>,
}

impl ListenerRegistry {
    pub fn new(catalog: Arc<Catalog>, client: Arc<ProxyClient>, settings: Arc<Settings>) -> Arc<Self> {
        Arc::new(Self {
            listeners: DashMap::new(),
            catalog,
            client,
            settings,
        })
    }

    /// Start a listener for the environment.
    ///
    /// Idempotent per environment identity; a port held by a *different*
    /// environment fails with `PortInUse`, and a foreign process on the
    /// port surfaces as `BindFailure`. Either failure leaves the
    /// environment `Stopped` and the registry unchanged.
    pub async fn start(&self, env: &Environment) -> Result<StartOutcome, GatewayError> {
        match self.listeners.entry(env.port) {
            Entry::Occupied(entry) => {
                let holder = entry.get();
                if holder.env_id == env.id {
                    info!(env = %env.id, port = env.port, "Environment already running");
                    return Ok(StartOutcome::AlreadyRunning);
                }
                return Err(GatewayError::PortInUse {
                    port: env.port,
                    holder: holder.env_name.clone(),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(ListenerEntry {
                    env_id: env.id.clone(),
                    env_name: env.name.clone(),
                    listener: None,
                });
            }
        }

        let proxy = Arc::new(PreProxy::new(
            env.id.clone(),
            Arc::clone(&self.catalog),
            Arc::clone(&self.client),
            self.settings.cookie_suffix.clone(),
        ));

        match PortListener::bind(&self.settings.bind, env.port, env.id.clone(), proxy).await {
            Ok(listener) => {
                if let Some(mut entry) = self.listeners.get_mut(&env.port) {
                    entry.listener = Some(listener);
                } else {
                    // The reservation was evicted while binding (stop or
                    // reconcile won the race); shut the fresh listener down.
                    warn!(env = %env.id, port = env.port, "Listener evicted during start");
                    listener.stop();
                    return Err(GatewayError::NotRunning(env.id.clone()));
                }
                self.catalog.set_status(&env.id, EnvStatus::Running);
                info!(env = %env.id, name = %env.name, port = env.port, "Environment started");
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                self.listeners.remove(&env.port);
                warn!(env = %env.id, port = env.port, error = %e, "Failed to bind environment port");
                Err(GatewayError::BindFailure {
                    port: env.port,
                    source: e,
                })
            }
        }
    }

    /// Stop the environment's listener, destroying its tracked sockets.
    ///
    /// Returns `NotRunning` when no listener exists for the identity;
    /// callers treat that as a report, not a failure.
    pub fn stop(&self, env_id: &str) -> Result<(), GatewayError> {
        let port = self
            .listeners
            .iter()
            .find(|entry| entry.value().env_id == env_id)
            .map(|entry| *entry.key());

        let Some(port) = port else {
            return Err(GatewayError::NotRunning(env_id.to_string()));
        };

        if let Some((_, entry)) = self.listeners.remove(&port) {
            if let Some(listener) = entry.listener {
                listener.stop();
            }
        }
        self.catalog.set_status(env_id, EnvStatus::Stopped);
        info!(env = %env_id, port, "Environment stopped");
        Ok(())
    }

    /// Look up the live listener on a port
    pub fn find_by_port(&self, port: u16) -> Option<ListenerInfo> {
        self.listeners.get(&port).map(|entry| ListenerInfo {
            port,
            env_id: entry.env_id.clone(),
            connections: entry
                .listener
                .as_ref()
                .map(|l| l.connection_count())
                .unwrap_or(0),
        })
    }

    pub fn is_running(&self, env_id: &str) -> bool {
        self.listeners
            .iter()
            .any(|entry| entry.value().env_id == env_id)
    }

    pub fn running_count(&self) -> usize {
        self.listeners.len()
    }

    /// Stop every listener (process shutdown path)
    pub fn stop_all(&self) {
        let env_ids: Vec<String> = self
            .listeners
            .iter()
            .map(|entry| entry.value().env_id.clone())
            .collect();
        for env_id in env_ids {
            let _ = self.stop(&env_id);
        }
    }
}
