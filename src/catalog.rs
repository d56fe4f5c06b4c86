//! In-memory environment and dev-server catalog
//!
//! The catalog is the single source of truth for environment and dev-server
//! records. It owns uniqueness constraints (one record per `(name, port)`,
//! one dev server per name) and referential integrity (a dev server cannot
//! be deleted while an environment references it). Config-file-driven
//! records are rebuilt on every reload through [`Catalog::apply_config`];
//! records created through the management API survive reloads untouched.

use crate::config::{Config, Settings};
use crate::error::GatewayError;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

/// Lifecycle status of an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvStatus {
    /// No live listener
    Stopped,
    /// A listener is bound to the environment's port
    Running,
}

/// Where an environment record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvOrigin {
    /// Declared in the config file; identity derives from `(name, port)`
    ConfigFile,
    /// Created through the management API; identity is a generated id
    Api,
}

/// A named, port-bound development target
#[derive(Debug, Clone, Serialize)]
pub struct Environment {
    /// Opaque identity, stable across reloads
    pub id: String,
    pub name: String,
    /// Public listening port for this environment
    pub port: u16,
    /// Upstream API origin for the post-proxy hop
    pub api_base_url: String,
    /// Selected dev server by name; resolved with first-server fallback
    pub dev_server: Option<String>,
    pub index_page: String,
    pub enable_cookie_proxy: bool,
    pub status: EnvStatus,
    pub origin: EnvOrigin,
}

/// A reusable front-end dev-server origin
#[derive(Debug, Clone, Serialize)]
pub struct DevServer {
    pub name: String,
    pub url: String,
}

/// Identity of a config-file-driven environment
pub fn config_identity(name: &str, port: u16) -> String {
    format!("{}+{}", name, port)
}

/// Outcome of applying a freshly loaded config to the catalog
#[derive(Debug, Clone, Default)]
pub struct AppliedConfig {
    /// Identities newly present (start `Stopped`, never auto-started)
    pub added: Vec<String>,
    /// Identities present before and after (status preserved)
    pub kept: Vec<String>,
    /// Config-driven identities no longer present (records dropped)
    pub removed: Vec<String>,
}

/// In-memory catalog guarded by `RwLock`s.
///
/// Vectors keep insertion order, which the default-dev-server fallback
/// ("first in the list") depends on. Lookups are linear; a developer
/// machine runs a handful of environments, not thousands.
pub struct Catalog {
    envs: RwLock<Vec<Environment>>,
    dev_servers: RwLock<Vec<DevServer>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            envs: RwLock::new(Vec::new()),
            dev_servers: RwLock::new(Vec::new()),
        }
    }

    // === Environments ===

    pub fn all_environments(&self) -> Vec<Environment> {
        self.envs.read().clone()
    }

    pub fn find_environment(&self, id: &str) -> Option<Environment> {
        self.envs.read().iter().find(|e| e.id == id).cloned()
    }

    pub fn find_environment_by_name_port(&self, name: &str, port: u16) -> Option<Environment> {
        self.envs
            .read()
            .iter()
            .find(|e| e.name == name && e.port == port)
            .cloned()
    }

    /// Update an environment's lifecycle status.
    ///
    /// Only the lifecycle manager calls this; at-most-one-writer-wins per
    /// identity is inherited from the registry's per-port serialization.
    pub fn set_status(&self, id: &str, status: EnvStatus) -> bool {
        let mut envs = self.envs.write();
        match envs.iter_mut().find(|e| e.id == id) {
            Some(env) => {
                env.status = status;
                true
            }
            None => false,
        }
    }

    /// Insert an API-created environment.
    ///
    /// Rejects a duplicate `(name, port)` with `DuplicateReference`; the
    /// start-time port check separately guarantees at most one *running*
    /// environment per port.
    pub fn insert_environment(&self, env: Environment) -> Result<(), GatewayError> {
        let mut envs = self.envs.write();
        if envs
            .iter()
            .any(|e| e.name == env.name && e.port == env.port)
        {
            return Err(GatewayError::DuplicateReference(format!(
                "environment '{}' on port {}",
                env.name, env.port
            )));
        }
        info!(name = %env.name, port = env.port, id = %env.id, "Environment added");
        envs.push(env);
        Ok(())
    }

    /// Patch mutable attributes of an environment
    pub fn update_environment(
        &self,
        id: &str,
        patch: EnvironmentPatch,
    ) -> Result<Environment, GatewayError> {
        let mut envs = self.envs.write();
        let env = envs
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| GatewayError::EnvNotFound(id.to_string()))?;

        if let Some(api_base_url) = patch.api_base_url {
            env.api_base_url = api_base_url;
        }
        if let Some(dev_server) = patch.dev_server {
            env.dev_server = Some(dev_server);
        }
        if let Some(index_page) = patch.index_page {
            env.index_page = index_page;
        }
        if let Some(enable_cookie_proxy) = patch.enable_cookie_proxy {
            env.enable_cookie_proxy = enable_cookie_proxy;
        }
        Ok(env.clone())
    }

    pub fn remove_environment(&self, id: &str) -> Result<Environment, GatewayError> {
        let mut envs = self.envs.write();
        let idx = envs
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| GatewayError::EnvNotFound(id.to_string()))?;
        let env = envs.remove(idx);
        info!(name = %env.name, port = env.port, "Environment removed");
        Ok(env)
    }

    // === Dev servers ===

    pub fn all_dev_servers(&self) -> Vec<DevServer> {
        self.dev_servers.read().clone()
    }

    pub fn find_dev_server(&self, name: &str) -> Option<DevServer> {
        self.dev_servers
            .read()
            .iter()
            .find(|d| d.name == name)
            .cloned()
    }

    pub fn first_dev_server(&self) -> Option<DevServer> {
        self.dev_servers.read().first().cloned()
    }

    /// Resolve the dev server an environment forwards to.
    ///
    /// Stable default-selection policy: a stale or absent reference falls
    /// back to the first dev server, so no environment is left without a
    /// forwarding target while any dev server exists.
    pub fn resolve_dev_server(&self, env: &Environment) -> Option<DevServer> {
        match &env.dev_server {
            Some(name) => self
                .find_dev_server(name)
                .or_else(|| self.first_dev_server()),
            None => self.first_dev_server(),
        }
    }

    pub fn insert_dev_server(&self, dev_server: DevServer) -> Result<(), GatewayError> {
        let mut dev_servers = self.dev_servers.write();
        if dev_servers.iter().any(|d| d.name == dev_server.name) {
            return Err(GatewayError::DuplicateReference(format!(
                "dev server '{}'",
                dev_server.name
            )));
        }
        info!(name = %dev_server.name, url = %dev_server.url, "Dev server added");
        dev_servers.push(dev_server);
        Ok(())
    }

    pub fn update_dev_server(&self, name: &str, url: String) -> Result<DevServer, GatewayError> {
        let mut dev_servers = self.dev_servers.write();
        let dev_server = dev_servers
            .iter_mut()
            .find(|d| d.name == name)
            .ok_or_else(|| GatewayError::DevServerNotFound(name.to_string()))?;
        dev_server.url = url;
        Ok(dev_server.clone())
    }

    /// Delete a dev server; rejected while any environment references it
    pub fn remove_dev_server(&self, name: &str) -> Result<DevServer, GatewayError> {
        if self
            .envs
            .read()
            .iter()
            .any(|e| e.dev_server.as_deref() == Some(name))
        {
            return Err(GatewayError::DevServerInUse(name.to_string()));
        }
        let mut dev_servers = self.dev_servers.write();
        let idx = dev_servers
            .iter()
            .position(|d| d.name == name)
            .ok_or_else(|| GatewayError::DevServerNotFound(name.to_string()))?;
        Ok(dev_servers.remove(idx))
    }

    // === Config application ===

    /// Rebuild the config-driven records from a freshly loaded config.
    ///
    /// Duplicate `(name, port)` entries are dropped keeping the first.
    /// Environments present before and after keep their status and any
    /// runtime dev-server reassignment; stale dev-server references fall
    /// back to the first dev server in the new list. API-created records
    /// are carried over untouched unless a config entry now claims their
    /// `(name, port)` identity, in which case the config entry is skipped.
    pub fn apply_config(&self, config: &Config, settings: &Settings) -> AppliedConfig {
        let mut outcome = AppliedConfig::default();

        let mut new_dev_servers: Vec<DevServer> = Vec::new();
        for dev_server in &config.dev_servers {
            if new_dev_servers.iter().any(|d| d.name == dev_server.name) {
                debug!(name = %dev_server.name, "Dropping duplicate dev server entry");
                continue;
            }
            new_dev_servers.push(DevServer {
                name: dev_server.name.clone(),
                url: dev_server.url.clone(),
            });
        }
        let default_dev_server = new_dev_servers.first().map(|d| d.name.clone());

        let old_envs = self.envs.read().clone();
        let mut new_envs: Vec<Environment> = old_envs
            .iter()
            .filter(|e| e.origin == EnvOrigin::Api)
            .cloned()
            .collect();

        for env in &config.envs {
            let id = config_identity(&env.name, env.port);
            if new_envs
                .iter()
                .any(|e| e.name == env.name && e.port == env.port)
            {
                debug!(name = %env.name, port = env.port, "Dropping duplicate env entry");
                continue;
            }

            let previous = old_envs.iter().find(|e| e.id == id);

            // A runtime reassignment (update-dev-server-id) survives the
            // reload as long as the referenced server still exists.
            let configured = previous
                .and_then(|p| p.dev_server.clone())
                .or_else(|| env.dev_server.clone());
            let dev_server = match configured {
                Some(name) if new_dev_servers.iter().any(|d| d.name == name) => Some(name),
                _ => default_dev_server.clone(),
            };

            let status = previous.map(|p| p.status).unwrap_or(EnvStatus::Stopped);
            match previous {
                Some(_) => outcome.kept.push(id.clone()),
                None => outcome.added.push(id.clone()),
            }

            new_envs.push(Environment {
                id,
                name: env.name.clone(),
                port: env.port,
                api_base_url: env.api_base_url.clone(),
                dev_server,
                index_page: env
                    .index_page
                    .clone()
                    .unwrap_or_else(|| settings.index_page.clone()),
                enable_cookie_proxy: env
                    .enable_cookie_proxy
                    .unwrap_or(settings.enable_cookie_proxy),
                status,
                origin: EnvOrigin::ConfigFile,
            });
        }

        for old in &old_envs {
            if old.origin == EnvOrigin::ConfigFile && !new_envs.iter().any(|e| e.id == old.id) {
                outcome.removed.push(old.id.clone());
            }
        }

        *self.dev_servers.write() = new_dev_servers;
        *self.envs.write() = new_envs;

        info!(
            added = outcome.added.len(),
            kept = outcome.kept.len(),
            removed = outcome.removed.len(),
            "Catalog updated from config"
        );
        outcome
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Partial update for an environment record
#[derive(Debug, Clone, Default)]
pub struct EnvironmentPatch {
    pub api_base_url: Option<String>,
    pub dev_server: Option<String>,
    pub index_page: Option<String>,
    pub enable_cookie_proxy: Option<bool>,
}
