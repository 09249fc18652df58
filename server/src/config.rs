//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `DEVLINK_API_KEY`, `DEVLINK_LISTEN`,
//!    `DEVLINK_BACKEND_ENDPOINT`, `DEVLINK_BACKEND_TOKEN`
//! 2. **Config file**: path via `--config <path>`, or `devlink-server.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! max_concurrency = 64
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [backend]
//! kind = "graphql"                          # or "memory"
//! endpoint = "https://api.example.com/ws_123"
//! token = "service-token"
//! device_role = "Device"
//! seed_codes = []                           # memory backend only
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

const DEFAULT_CONFIG_FILE: &str = "devlink-server.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum requests handled at once (default 64).
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Host key the platform presents as a Bearer token. Override with
    /// `DEVLINK_API_KEY`. Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Which data store the resolver talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Graphql,
    Memory,
}

/// Backend settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    /// Workspace GraphQL endpoint (graphql backend).
    pub endpoint: Option<String>,
    /// Service token with permission to manage codes, tokens and devices.
    pub token: Option<String>,
    /// Role granted to minted device tokens (default `Device`).
    #[serde(default = "default_device_role")]
    pub device_role: String,
    /// Registration codes loaded into the memory backend at startup.
    #[serde(default)]
    pub seed_codes: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_max_concurrency() -> usize {
    64
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_device_role() -> String {
    "Device".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            endpoint: None,
            token: None,
            device_role: default_device_role(),
            seed_codes: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `devlink-server.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Config::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;
        toml::from_str(&content)
            .map_err(|e| format!("Failed to parse config file {}: {e}", path.display()))
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(key) = var("DEVLINK_API_KEY") {
            self.auth.api_key = key;
        }
        if let Some(listen) = var("DEVLINK_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(endpoint) = var("DEVLINK_BACKEND_ENDPOINT") {
            self.backend.endpoint = Some(endpoint);
        }
        if let Some(token) = var("DEVLINK_BACKEND_TOKEN") {
            self.backend.token = Some(token);
        }
    }
}
