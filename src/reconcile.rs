//! Config hot-reload and reconciliation
//!
//! The reconciler diffs a freshly loaded environment list against the
//! listener registry: environments removed from config while running are
//! stopped, everything else keeps its state, and new entries stay stopped
//! until started explicitly. A malformed file leaves the last-known-good
//! config active in full; reconciled state never partially mutates.
//!
//! Reloads are triggered by a debounced file watcher or SIGHUP.

use crate::catalog::{config_identity, Catalog};
use crate::config::{Config, Settings};
use crate::error::GatewayError;
use crate::registry::ListenerRegistry;
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

/// Debounce window coalescing rapid successive config writes
pub const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

/// Event published on every successful reconciliation
#[derive(Debug, Clone)]
pub struct ReloadEvent;

/// Summary of one reconciliation pass
#[derive(Debug, Clone, Default)]
pub struct ReloadSummary {
    /// Environments newly present (left stopped)
    pub added: Vec<String>,
    /// Environments present before and after
    pub kept: Vec<String>,
    /// Environments stopped because config dropped them while running
    pub stopped: Vec<String>,
}

/// Applies config changes to the catalog and registry
pub struct Reconciler {
    catalog: Arc<Catalog>,
    registry: Arc<ListenerRegistry>,
    settings: Arc<Settings>,
    reload_tx: broadcast::Sender<ReloadEvent>,
}

impl Reconciler {
    pub fn new(
        catalog: Arc<Catalog>,
        registry: Arc<ListenerRegistry>,
        settings: Arc<Settings>,
    ) -> Arc<Self> {
        let (reload_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            catalog,
            registry,
            settings,
            reload_tx,
        })
    }

    /// Subscribe to reconciliation events
    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.reload_tx.subscribe()
    }

    /// Reload the config file and reconcile.
    ///
    /// Load or validation failure rejects the reload wholesale; the
    /// previously applied config stays live.
    pub async fn reload(&self) -> Result<ReloadSummary, GatewayError> {
        let config = Config::load(&self.settings.config_path)
            .map_err(|e| GatewayError::ConfigInvalid(e.to_string()))?;
        Ok(self.apply(&config))
    }

    /// Reconcile an already validated config against the running state
    pub fn apply(&self, config: &Config) -> ReloadSummary {
        let mut summary = ReloadSummary::default();

        // Identity set of the incoming config, mirroring the dedup the
        // catalog applies (first entry per (name, port) wins).
        let mut new_ids = HashSet::new();
        for env in &config.envs {
            new_ids.insert(config_identity(&env.name, env.port));
        }

        // Stop config-driven environments that were dropped while running.
        // API-created environments are not config-managed and are left
        // alone.
        for env in self.catalog.all_environments() {
            if env.origin == crate::catalog::EnvOrigin::ConfigFile
                && !new_ids.contains(&env.id)
                && self.registry.is_running(&env.id)
            {
                info!(env = %env.id, port = env.port, "Stopping environment removed from config");
                if let Err(e) = self.registry.stop(&env.id) {
                    warn!(env = %env.id, error = %e, "Failed to stop removed environment");
                }
                summary.stopped.push(env.id);
            }
        }

        let applied = self.catalog.apply_config(config, &self.settings);
        summary.added = applied.added;
        summary.kept = applied.kept;

        info!(
            added = summary.added.len(),
            kept = summary.kept.len(),
            stopped = summary.stopped.len(),
            "Configuration reconciled"
        );

        let _ = self.reload_tx.send(ReloadEvent);
        summary
    }
}

/// Handle that keeps the file watcher alive
pub struct WatcherHandle {
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    _thread: std::thread::JoinHandle<()>,
}

/// Watch the config file for changes, forwarding debounced hits into a
/// tokio channel.
///
/// The parent directory is watched non-recursively so editors that replace
/// the file (write-to-temp-then-rename) are seen too.
pub fn spawn_config_watcher(
    config_path: PathBuf,
    changed_tx: mpsc::Sender<()>,
) -> anyhow::Result<WatcherHandle> {
    // Watch events report absolute paths; compare against the same.
    let config_path = config_path.canonicalize().unwrap_or(config_path);
    let watch_dir = config_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    let (tx, rx) = std_mpsc::channel();
    let mut debouncer = new_debouncer(RELOAD_DEBOUNCE, tx)?;
    debouncer
        .watcher()
        .watch(&watch_dir, RecursiveMode::NonRecursive)?;

    let thread = std::thread::spawn(move || {
        for result in rx {
            match result {
                Ok(events) => {
                    let relevant = events
                        .iter()
                        .any(|event| event.path == config_path || event.path == watch_dir);
                    if relevant && changed_tx.blocking_send(()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = ?e, "Config watch error");
                }
            }
        }
    });

    Ok(WatcherHandle {
        _debouncer: debouncer,
        _thread: thread,
    })
}

/// Drive the reconciler from watcher hits until the channel closes
pub async fn reload_loop(reconciler: Arc<Reconciler>, mut changed_rx: mpsc::Receiver<()>) {
    while changed_rx.recv().await.is_some() {
        info!("Config file changed, reloading");
        match reconciler.reload().await {
            Ok(summary) => {
                if !summary.stopped.is_empty() {
                    info!(stopped = ?summary.stopped, "Environments stopped by reload");
                }
            }
            Err(e) => {
                error!(error = %e, "Config reload rejected, keeping previous config");
            }
        }
    }
}
