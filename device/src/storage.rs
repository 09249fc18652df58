//! Local credential store.
//!
//! [`CredentialStore`] persists the device's identity (`id`) and bearer token
//! (`apiToken`) in a single JSON document. The document is read on every call
//! and written back whole on every update, so the file is always the source of
//! truth and nothing is cached between calls.
//!
//! ## Semantics
//!
//! - **Missing file**: treated as an empty document; `get` returns `None`.
//! - **Invalid file**: a file that is not a JSON object is a [`StoreError::Parse`].
//!   It is never silently overwritten.
//! - **Updates**: [`CredentialStore::set`] shallow-merges the given keys into
//!   the current document. Writes go to a temp file that is renamed over the
//!   target, so readers never see a partial document.
//!
//! There is no locking: two processes updating the same file concurrently may
//! lose one of the updates. The CLI runs one command at a time.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Document key holding the device id.
pub const ID_KEY: &str = "id";
/// Document key holding the bearer token.
pub const API_TOKEN_KEY: &str = "apiToken";

/// Credentials issued to this device at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    #[serde(rename = "apiToken")]
    pub api_token: String,
}

/// JSON-file backed key-value store for device credentials.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Create a store backed by the document at `path`. The file is not
    /// touched until the first read or write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Value stored under `key`, or `None` if the key or the file is absent.
    pub fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.read_document()?.remove(key))
    }

    /// Shallow-merge `partial` into the document and write it back.
    pub fn set(&self, partial: Map<String, Value>) -> Result<(), StoreError> {
        let mut document = self.read_document()?;
        let keys: Vec<&str> = partial.keys().map(String::as_str).collect();
        debug!(path = %self.path.display(), ?keys, "updating credential store");

        for (key, value) in partial {
            document.insert(key, value);
        }
        self.write_document(&document)
    }

    /// Persist a full credential (both `id` and `apiToken`).
    pub fn store_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        let mut partial = Map::new();
        partial.insert(ID_KEY.to_string(), Value::String(credential.id.clone()));
        partial.insert(
            API_TOKEN_KEY.to_string(),
            Value::String(credential.api_token.clone()),
        );
        self.set(partial)
    }

    /// The stored credential, if both fields are present and non-empty.
    pub fn credential(&self) -> Result<Option<Credential>, StoreError> {
        let document = self.read_document()?;
        let id = non_empty_str(document.get(ID_KEY));
        let api_token = non_empty_str(document.get(API_TOKEN_KEY));
        Ok(match (id, api_token) {
            (Some(id), Some(api_token)) => Some(Credential { id, api_token }),
            _ => None,
        })
    }

    /// The bearer token, if one is stored. An empty string counts as absent.
    pub fn api_token(&self) -> Result<Option<String>, StoreError> {
        Ok(non_empty_str(self.get(API_TOKEN_KEY)?.as_ref()))
    }

    /// The device id, if one is stored.
    pub fn device_id(&self) -> Result<Option<String>, StoreError> {
        Ok(non_empty_str(self.get(ID_KEY)?.as_ref()))
    }

    /// Delete the backing document. Returns `false` if there was nothing to remove.
    pub fn clear(&self) -> Result<bool, StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn read_document(&self) -> Result<Map<String, Value>, StoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        if contents.trim().is_empty() {
            return Ok(Map::new());
        }

        match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(StoreError::Parse {
                path: self.path.clone(),
                message: "expected a JSON object".to_string(),
            }),
            Err(e) => Err(StoreError::Parse {
                path: self.path.clone(),
                message: e.to_string(),
            }),
        }
    }

    fn write_document(&self, document: &Map<String, Value>) -> Result<(), StoreError> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(|e| self.io_error(e))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "credentials.json".to_string());
        let temp_path = parent.join(format!(".{}.tmp.{}", file_name, std::process::id()));

        let body = serde_json::to_string(document).map_err(|e| StoreError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        std::fs::write(&temp_path, body).map_err(|e| self.io_error(e))?;
        restrict_permissions(&temp_path).map_err(|e| self.io_error(e))?;

        if let Err(e) = std::fs::rename(&temp_path, &self.path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(self.io_error(e));
        }
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// The document holds a bearer token; keep it owner-readable only.
#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Errors returned by [`CredentialStore`] methods.
#[derive(Debug)]
pub enum StoreError {
    /// The document could not be read or written.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The document exists but is not a JSON object.
    Parse { path: PathBuf, message: String },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io { path, source } => {
                write!(f, "Credential store {} I/O error: {}", path.display(), source)
            }
            StoreError::Parse { path, message } => {
                write!(f, "Credential store {} is corrupt: {}", path.display(), message)
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io { source, .. } => Some(source),
            StoreError::Parse { .. } => None,
        }
    }
}
