use envgate::catalog::Catalog;
use envgate::config::{Config, Settings};
use envgate::manage::{PKG_NAME, VERSION};
use envgate::pool::{ClientConfig, ProxyClient};
use envgate::post_proxy::{ensure_management_port_free, PostProxyServer};
use envgate::reconcile::{self, Reconciler};
use envgate::registry::ListenerRegistry;
use envgate::ws::NotificationHub;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("envgate=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("envgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    let settings = Arc::new(Settings::from_config(&config, config_path.clone()));

    // Refuse to race another instance (or a foreign process) for the
    // management port.
    ensure_management_port_free(&settings).await?;

    print_startup_banner(&config, &settings);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

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

    // Seed the catalog; environments start stopped until managed.
    reconciler.apply(&config);

    // Bridge reconciliation events onto the notification socket
    let hub = NotificationHub::new();
    let mut reload_rx = reconciler.subscribe();
    let bridge_hub = Arc::clone(&hub);
    let mut bridge_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = reload_rx.recv() => match result {
                    Ok(_) => bridge_hub.broadcast(r#"{"action":"filechange"}"#),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = bridge_shutdown.changed() => {
                    if *bridge_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    // Watch the config file for hot reloads
    let (changed_tx, changed_rx) = mpsc::channel(8);
    let _watcher = reconcile::spawn_config_watcher(config_path.clone(), changed_tx)
        .map_err(|e| anyhow::anyhow!("failed to watch config file: {}", e))?;
    tokio::spawn(reconcile::reload_loop(Arc::clone(&reconciler), changed_rx));

    // Spawn the shared post-proxy / management server
    let post_proxy = PostProxyServer::new(
        Arc::clone(&settings),
        Arc::clone(&catalog),
        Arc::clone(&registry),
        Arc::clone(&client),
        Arc::clone(&hub),
        shutdown_rx.clone(),
    );
    let post_proxy_handle = tokio::spawn(async move {
        if let Err(e) = post_proxy.run().await {
            error!(error = %e, "Post-proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                    match reconciler.reload().await {
                        Ok(summary) => {
                            info!(
                                added = summary.added.len(),
                                kept = summary.kept.len(),
                                stopped = summary.stopped.len(),
                                "Configuration reloaded successfully"
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to reload configuration");
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Stop all environment listeners
    info!("Stopping all environments...");
    registry.stop_all();

    // Wait for the post-proxy to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), post_proxy_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config, settings: &Settings) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %settings.bind,
        management_port = settings.management_port,
        base_path = %settings.base_path,
        cookie_suffix = %settings.cookie_suffix,
        "Server configuration"
    );
    info!(
        env_count = config.envs.len(),
        envs = ?config.envs.iter().map(|e| format!("{}:{}", e.name, e.port)).collect::<Vec<_>>(),
        dev_server_count = config.dev_servers.len(),
        dev_servers = ?config.dev_servers.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
        "Configured environments"
    );
}
