use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Declarative gateway configuration loaded from a TOML file
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Shared post-proxy / management server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Dev servers environments can forward browser traffic to
    #[serde(default, rename = "dev_server")]
    pub dev_servers: Vec<DevServerConfig>,

    /// Environments, each bound to its own public port
    #[serde(default, rename = "env")]
    pub envs: Vec<EnvConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port of the shared post-proxy and management server (default: 3099)
    #[serde(default = "default_management_port")]
    pub port: u16,

    /// Bind address for every listener (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Base path of the management REST surface and notification socket
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Default home page for environments that do not set their own
    #[serde(default = "default_index_page")]
    pub index_page: String,

    /// Marker combined with an environment's port to form its cookie
    /// suffix. Changing it orphans existing per-environment cookies.
    #[serde(default = "default_cookie_suffix")]
    pub cookie_suffix: String,

    /// Default for environments that do not set their own cookie-proxy flag
    #[serde(default = "default_true")]
    pub enable_cookie_proxy: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_management_port(),
            bind: default_bind_address(),
            base_path: default_base_path(),
            index_page: default_index_page(),
            cookie_suffix: default_cookie_suffix(),
            enable_cookie_proxy: true,
        }
    }
}

/// A reusable front-end dev-server origin
#[derive(Debug, Deserialize, Clone)]
pub struct DevServerConfig {
    /// Unique name, used as the dev server's identity
    pub name: String,

    /// Origin browser traffic is forwarded to, e.g. `http://localhost:5173`
    pub url: String,
}

/// One environment: a public port, a dev-server choice and an API origin
#[derive(Debug, Deserialize, Clone)]
pub struct EnvConfig {
    /// Environment name; `(name, port)` is the environment's identity
    pub name: String,

    /// Public port this environment listens on
    pub port: u16,

    /// API origin tagged requests are forwarded to by the post-proxy
    pub api_base_url: String,

    /// Name of the dev server to forward browser traffic to.
    /// Falls back to the first configured dev server when absent or stale.
    pub dev_server: Option<String>,

    /// Home page override for this environment
    pub index_page: Option<String>,

    /// Cookie isolation override for this environment
    pub enable_cookie_proxy: Option<bool>,
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("failed to read config file {}: {}", path.display(), e)
        })?;
        let config: Config = toml::from_str(&raw).map_err(|e| {
            anyhow::anyhow!("failed to parse config file {}: {}", path.display(), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, accumulating every problem into one error
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be greater than 0".to_string());
        }
        if !self.server.base_path.starts_with('/') {
            errors.push(format!(
                "server.base_path '{}' must start with '/'",
                self.server.base_path
            ));
        }
        if self.server.cookie_suffix.is_empty() {
            errors.push("server.cookie_suffix must not be empty".to_string());
        }

        for dev_server in &self.dev_servers {
            if dev_server.name.is_empty() {
                errors.push("dev_server entry with empty name".to_string());
            }
            if let Err(e) = validate_origin(&dev_server.url) {
                errors.push(format!(
                    "dev_server '{}' has invalid url '{}': {}",
                    dev_server.name, dev_server.url, e
                ));
            }
        }

        for env in &self.envs {
            if env.name.is_empty() {
                errors.push("env entry with empty name".to_string());
            }
            if env.port == 0 {
                errors.push(format!("env '{}': port must be greater than 0", env.name));
            }
            if env.port == self.server.port {
                errors.push(format!(
                    "env '{}': port {} collides with the management port",
                    env.name, env.port
                ));
            }
            if let Err(e) = validate_origin(&env.api_base_url) {
                errors.push(format!(
                    "env '{}' has invalid api_base_url '{}': {}",
                    env.name, env.api_base_url, e
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("configuration errors:\n  - {}", errors.join("\n  - "))
        }
    }
}

/// An origin must parse as an absolute http(s) URI with an authority
fn validate_origin(origin: &str) -> Result<(), String> {
    let uri: hyper::Uri = origin
        .parse()
        .map_err(|e| format!("not a valid URI: {}", e))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        Some(other) => return Err(format!("unsupported scheme '{}'", other)),
        None => return Err("missing scheme".to_string()),
    }
    if uri.authority().is_none() {
        return Err("missing host".to_string());
    }
    Ok(())
}

/// Process-wide settings fixed at startup.
///
/// Environment and dev-server lists hot-reload through the reconciler;
/// these do not. The cookie suffix in particular must stay stable for the
/// life of the process so both rewrite directions agree.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind: String,
    pub management_port: u16,
    pub base_path: String,
    pub index_page: String,
    pub cookie_suffix: String,
    pub enable_cookie_proxy: bool,
    pub config_path: PathBuf,
}

impl Settings {
    pub fn from_config(config: &Config, config_path: PathBuf) -> Self {
        Self {
            bind: config.server.bind.clone(),
            management_port: config.server.port,
            base_path: config.server.base_path.clone(),
            index_page: config.server.index_page.clone(),
            cookie_suffix: config.server.cookie_suffix.clone(),
            enable_cookie_proxy: config.server.enable_cookie_proxy,
            config_path,
        }
    }
}

fn default_management_port() -> u16 {
    3099
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_base_path() -> String {
    "/dev-manage-api".to_string()
}

fn default_index_page() -> String {
    "/".to_string()
}

fn default_cookie_suffix() -> String {
    "envm".to_string()
}

fn default_true() -> bool {
    true
}
