//! Configuration loading for devlink.
//!
//! Configuration is resolved from three fallback sources (tried in order):
//!
//! 1. **JSON file** via `--config <path>` CLI flag
//! 2. **JSON file** via `DEVLINK_CONFIG` environment variable
//! 3. **Environment variables**: `DEVLINK_ENDPOINT` and `DEVLINK_CREDENTIALS`
//!
//! The `--endpoint` and `--credentials` flags override whichever source was
//! used. The credentials path defaults to `~/.devlink/credentials.json`. The
//! endpoint is only required by the remote functions; `status` and
//! `unregister` work without one.
//!
//! ```json
//! {
//!   "config_version": 1,
//!   "endpoint": "https://api.example.com/workspace-id",
//!   "credentials_path": "~/.devlink/credentials.json"
//! }
//! ```

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Bump this when the config format changes (new required fields, renamed keys, etc.).
/// devlink will warn if the on-disk version is older, so users know to update.
pub const CONFIG_VERSION: u32 = 1;

/// Default credential document location (before `~` expansion).
pub const DEFAULT_CREDENTIALS_PATH: &str = "~/.devlink/credentials.json";

/// CLI arguments parsed by `clap`.
#[derive(Parser)]
#[command(
    name = "devlink",
    version,
    about = "Register this device and submit telemetry readings"
)]
pub struct Cli {
    /// Path to config file (JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// GraphQL endpoint (overrides config)
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    /// Path to the credential document (overrides config)
    #[arg(long, global = true)]
    pub credentials: Option<PathBuf>,

    #[command(subcommand)]
    pub function: Function,
}

/// Device functions, addressed by name.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Function {
    /// Exchange a registration code for device credentials
    #[command(name = "registerDevice", alias = "register-device")]
    RegisterDevice {
        /// Single-use registration code
        code: String,
    },
    /// Submit one integer reading
    #[command(name = "sendActivity", alias = "send-activity")]
    SendActivity {
        /// Reading value (integer)
        #[arg(allow_hyphen_values = true)]
        value: String,
    },
    /// List all stored readings
    #[command(name = "readActivity", alias = "read-activity")]
    ReadActivity {
        /// Ignored; accepted so every function takes the same argument shape
        #[arg(hide = true)]
        _unused: Option<String>,
    },
    /// Remove the stored credentials
    Unregister,
    /// Show whether this device is registered
    Status,
}

/// Raw JSON config file structure.
#[derive(Deserialize)]
pub struct DeviceConfig {
    /// Config format version: checked against `CONFIG_VERSION` to detect stale files.
    pub config_version: Option<u32>,
    pub endpoint: Option<String>,
    pub credentials_path: Option<String>,
}

/// Validated configuration ready for building the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub endpoint: Option<String>,
    pub credentials_path: PathBuf,
}

/// Load and validate configuration from CLI args, env vars, or config file.
pub fn load_config(cli: &Cli) -> Result<ResolvedConfig, String> {
    let (endpoint, credentials) = if let Some(path) = &cli.config {
        load_from_file(&expand_tilde(path))?
    } else if let Ok(path) = std::env::var("DEVLINK_CONFIG") {
        load_from_file(&expand_tilde(Path::new(&path)))?
    } else {
        (
            std::env::var("DEVLINK_ENDPOINT").ok(),
            std::env::var("DEVLINK_CREDENTIALS").ok(),
        )
    };

    let endpoint = cli
        .endpoint
        .clone()
        .or(endpoint)
        .map(|e| validate_endpoint(&e))
        .transpose()?;

    let credentials_path = match &cli.credentials {
        Some(p) => expand_tilde(p),
        None => expand_tilde(Path::new(
            credentials.as_deref().unwrap_or(DEFAULT_CREDENTIALS_PATH),
        )),
    };

    Ok(ResolvedConfig {
        endpoint,
        credentials_path,
    })
}

/// Expand a leading `~` to `$HOME`.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

fn validate_endpoint(endpoint: &str) -> Result<String, String> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err("Endpoint is empty".into());
    }
    if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
        return Err(format!(
            "Endpoint '{}' must start with http:// or https://",
            endpoint
        ));
    }
    Ok(endpoint.to_string())
}

fn load_from_file(path: &Path) -> Result<(Option<String>, Option<String>), String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;
    parse_config(&contents, path)
}

fn parse_config(contents: &str, path: &Path) -> Result<(Option<String>, Option<String>), String> {
    let config: DeviceConfig = serde_json::from_str(contents)
        .map_err(|e| format!("Failed to parse config file {}: {}", path.display(), e))?;

    // Warn about missing or outdated config version
    match config.config_version {
        None => warn!(
            "{} has no config_version field (expected {})",
            path.display(),
            CONFIG_VERSION
        ),
        Some(v) if v < CONFIG_VERSION => warn!(
            "{} has config_version {} but devlink expects {}",
            path.display(),
            v,
            CONFIG_VERSION
        ),
        _ => {}
    }

    Ok((config.endpoint, config.credentials_path))
}
