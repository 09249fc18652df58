//! Data-store seam for the registration resolver.
//!
//! The resolver never talks to storage directly. It calls the four operations
//! of [`Backend`]:
//!
//! | Operation                  | Platform GraphQL operation  |
//! |----------------------------|-----------------------------|
//! | `find_registration_code`   | `registrationCode(code)`    |
//! | `create_api_token`         | `apiTokenCreate`            |
//! | `create_device`            | `deviceCreate`              |
//! | `delete_api_token`         | `apiTokenDelete`            |
//!
//! Two implementations exist:
//!
//! - [`graphql::GraphqlBackend`]: the workspace GraphQL API, authenticated
//!   with a service token (permission checks bypassed server-side).
//! - [`memory::MemoryBackend`]: in-process maps, for local invocation and tests.

pub mod graphql;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{BackendConfig, BackendKind};

/// Reference to another record by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRef {
    pub id: String,
}

/// Device linked to a registration code, with the token it was created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedDevice {
    pub id: String,
    #[serde(rename = "apiToken", default)]
    pub api_token: Option<RecordRef>,
}

impl LinkedDevice {
    /// Whether this device was created with the token `token_id`.
    pub fn uses_token(&self, token_id: &str) -> bool {
        self.api_token.as_ref().is_some_and(|t| t.id == token_id)
    }
}

/// A single-use registration code. Consumed once `device` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationCode {
    pub id: String,
    pub code: String,
    #[serde(default)]
    pub device: Option<LinkedDevice>,
}

impl RegistrationCode {
    /// Whether a device has already been created with this code.
    pub fn is_consumed(&self) -> bool {
        self.device.is_some()
    }
}

/// A freshly minted API token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiToken {
    pub id: String,
    pub token: String,
}

/// A created device record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

/// Input for [`Backend::create_device`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDevice {
    pub name: String,
    pub api_token_id: String,
    pub registration_code_id: String,
}

/// Storage operations the resolver depends on.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name reported by the health endpoint.
    fn kind(&self) -> &'static str;

    /// Look up a registration code by its value.
    async fn find_registration_code(
        &self,
        code: &str,
    ) -> Result<Option<RegistrationCode>, BackendError>;

    /// Mint a token named `name` bound to `role`.
    async fn create_api_token(&self, name: &str, role: &str) -> Result<ApiToken, BackendError>;

    /// Create a device linked to a token and a registration code.
    ///
    /// Implementations that can detect the code being linked already return
    /// [`BackendError::Conflict`].
    async fn create_device(&self, device: &NewDevice) -> Result<Device, BackendError>;

    /// Delete a token (compensation for a failed registration).
    async fn delete_api_token(&self, token_id: &str) -> Result<(), BackendError>;
}

/// Build the backend selected by configuration.
pub fn build_backend(config: &BackendConfig) -> Result<Arc<dyn Backend>, String> {
    match config.kind {
        BackendKind::Graphql => {
            let endpoint = config
                .endpoint
                .clone()
                .filter(|e| !e.trim().is_empty())
                .ok_or("backend.endpoint is required for the graphql backend")?;
            let token = config
                .token
                .clone()
                .filter(|t| !t.is_empty())
                .ok_or("backend.token is required for the graphql backend")?;
            let backend = graphql::GraphqlBackend::new(endpoint, token)
                .map_err(|e| format!("Failed to build GraphQL backend: {e}"))?;
            Ok(Arc::new(backend))
        }
        BackendKind::Memory => Ok(Arc::new(memory::MemoryBackend::with_codes(
            config.seed_codes.iter().cloned(),
        ))),
    }
}

/// Errors returned by [`Backend`] operations.
#[derive(Debug)]
pub enum BackendError {
    /// HTTP transport error talking to the platform.
    Request(reqwest::Error),
    /// The platform answered with GraphQL errors (or a non-2xx status).
    Graphql(String),
    /// The platform's response did not have the expected shape.
    Protocol(String),
    /// The registration code is already linked to a device.
    Conflict(String),
    /// The referenced record does not exist.
    NotFound(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Request(e) => write!(f, "Backend request failed: {}", e),
            BackendError::Graphql(msg) => write!(f, "Backend GraphQL error: {}", msg),
            BackendError::Protocol(msg) => write!(f, "Backend protocol error: {}", msg),
            BackendError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            BackendError::NotFound(msg) => write!(f, "Not found: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackendError::Request(e) => Some(e),
            _ => None,
        }
    }
}
