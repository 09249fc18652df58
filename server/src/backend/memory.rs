//! In-process backend.
//!
//! Holds registration codes, tokens, and devices in maps behind one
//! `tokio::sync::Mutex`. `create_device` checks and links the code under the
//! same lock, so one code can never end up with two devices even when two
//! registrations race past the resolver's lookup.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use super::{
    ApiToken, Backend, BackendError, Device, LinkedDevice, NewDevice, RecordRef, RegistrationCode,
};

struct StoredCode {
    id: String,
    device_id: Option<String>,
}

struct StoredToken {
    token: String,
    name: String,
    role: String,
}

struct StoredDevice {
    name: String,
    created_at: String,
    api_token_id: String,
    registration_code_id: String,
}

#[derive(Default)]
struct MemoryState {
    /// Keyed by code value.
    codes: HashMap<String, StoredCode>,
    tokens: HashMap<String, StoredToken>,
    devices: HashMap<String, StoredDevice>,
    next_id: u64,
}

impl MemoryState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}_{}", prefix, self.next_id)
    }

    /// Insert an unconsumed code, or return the id of the existing one.
    fn insert_code(&mut self, code: String) -> (String, bool) {
        if let Some(existing) = self.codes.get(&code) {
            return (existing.id.clone(), false);
        }
        let id = self.next_id("code");
        self.codes.insert(
            code,
            StoredCode {
                id: id.clone(),
                device_id: None,
            },
        );
        (id, true)
    }
}

/// Summary of one stored device, for inspection in tests and local runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub api_token_id: String,
    pub registration_code_id: String,
}

/// Backend that keeps everything in memory.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend pre-seeded with unconsumed registration codes. Repeated
    /// codes are seeded once.
    pub fn with_codes<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = MemoryState::default();
        for code in codes {
            let code = code.into();
            if !state.insert_code(code.clone()).1 {
                warn!(code = %code, "duplicate seed registration code ignored");
            }
        }
        Self {
            state: Mutex::new(state),
        }
    }

    /// Add an unconsumed registration code and return its record id. Adding an
    /// existing code returns the existing record's id and leaves it unchanged.
    pub async fn add_code(&self, code: &str) -> String {
        self.state.lock().await.insert_code(code.to_string()).0
    }

    /// Number of registration codes stored.
    pub async fn code_count(&self) -> usize {
        self.state.lock().await.codes.len()
    }

    /// Number of devices created so far.
    pub async fn device_count(&self) -> usize {
        self.state.lock().await.devices.len()
    }

    /// Number of tokens currently stored.
    pub async fn token_count(&self) -> usize {
        self.state.lock().await.tokens.len()
    }

    /// Whether a token with this value exists.
    pub async fn token_exists(&self, token: &str) -> bool {
        self.state
            .lock()
            .await
            .tokens
            .values()
            .any(|t| t.token == token)
    }

    /// The device linked to `code`, if any.
    pub async fn device_for_code(&self, code: &str) -> Option<DeviceRecord> {
        let state = self.state.lock().await;
        let device_id = state.codes.get(code)?.device_id.clone()?;
        let device = state.devices.get(&device_id)?;
        Some(DeviceRecord {
            id: device_id,
            name: device.name.clone(),
            created_at: device.created_at.clone(),
            api_token_id: device.api_token_id.clone(),
            registration_code_id: device.registration_code_id.clone(),
        })
    }

    /// Name and role of a stored token.
    pub async fn token_details(&self, token_id: &str) -> Option<(String, String)> {
        let state = self.state.lock().await;
        state
            .tokens
            .get(token_id)
            .map(|t| (t.name.clone(), t.role.clone()))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn find_registration_code(
        &self,
        code: &str,
    ) -> Result<Option<RegistrationCode>, BackendError> {
        let state = self.state.lock().await;
        Ok(state.codes.get(code).map(|c| RegistrationCode {
            id: c.id.clone(),
            code: code.to_string(),
            device: c.device_id.as_ref().map(|id| LinkedDevice {
                id: id.clone(),
                api_token: state.devices.get(id).map(|d| RecordRef {
                    id: d.api_token_id.clone(),
                }),
            }),
        }))
    }

    async fn create_api_token(&self, name: &str, role: &str) -> Result<ApiToken, BackendError> {
        let mut state = self.state.lock().await;
        let id = state.next_id("tok");
        let token = uuid::Uuid::new_v4().simple().to_string();
        state.tokens.insert(
            id.clone(),
            StoredToken {
                token: token.clone(),
                name: name.to_string(),
                role: role.to_string(),
            },
        );
        Ok(ApiToken { id, token })
    }

    async fn create_device(&self, device: &NewDevice) -> Result<Device, BackendError> {
        let mut state = self.state.lock().await;
        if !state.tokens.contains_key(&device.api_token_id) {
            return Err(BackendError::NotFound(format!(
                "api token {}",
                device.api_token_id
            )));
        }

        let code_key = state
            .codes
            .iter()
            .find(|(_, c)| c.id == device.registration_code_id)
            .map(|(k, c)| (k.clone(), c.device_id.clone()));
        let code_key = match code_key {
            None => {
                return Err(BackendError::NotFound(format!(
                    "registration code {}",
                    device.registration_code_id
                )))
            }
            Some((_, Some(existing))) => {
                return Err(BackendError::Conflict(format!(
                    "registration code {} is already linked to device {}",
                    device.registration_code_id, existing
                )))
            }
            Some((key, None)) => key,
        };

        let id = state.next_id("dev");
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        state.devices.insert(
            id.clone(),
            StoredDevice {
                name: device.name.clone(),
                created_at: created_at.clone(),
                api_token_id: device.api_token_id.clone(),
                registration_code_id: device.registration_code_id.clone(),
            },
        );
        if let Some(code) = state.codes.get_mut(&code_key) {
            code.device_id = Some(id.clone());
        }

        Ok(Device { id, created_at })
    }

    async fn delete_api_token(&self, token_id: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if state.devices.values().any(|d| d.api_token_id == token_id) {
            return Err(BackendError::Conflict(format!(
                "api token {token_id} is linked to a device"
            )));
        }
        match state.tokens.remove(token_id) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(format!("api token {token_id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_codes_are_unconsumed() {
        let backend = MemoryBackend::with_codes(["ABC123"]);
        let code = backend.find_registration_code("ABC123").await.unwrap().unwrap();
        assert_eq!(code.code, "ABC123");
        assert!(!code.is_consumed());
        assert!(backend.find_registration_code("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_device_links_code_once() {
        let backend = MemoryBackend::new();
        let code_id = backend.add_code("ABC123").await;
        let t1 = backend.create_api_token("T1", "Device").await.unwrap();
        let t2 = backend.create_api_token("T2", "Device").await.unwrap();
        assert_ne!(t1.token, t2.token);

        let device = backend
            .create_device(&NewDevice {
                name: "DEVICE_ABC123".into(),
                api_token_id: t1.id.clone(),
                registration_code_id: code_id.clone(),
            })
            .await
            .unwrap();
        assert!(device.created_at.ends_with('Z'));

        let second = backend
            .create_device(&NewDevice {
                name: "DEVICE_ABC123".into(),
                api_token_id: t2.id,
                registration_code_id: code_id,
            })
            .await;
        assert!(matches!(second, Err(BackendError::Conflict(_))));
        assert_eq!(backend.device_count().await, 1);

        let code = backend.find_registration_code("ABC123").await.unwrap().unwrap();
        let linked = code.device.unwrap();
        assert_eq!(linked.id, device.id);
        assert!(linked.uses_token(&t1.id));
    }

    #[tokio::test]
    async fn duplicate_codes_are_seeded_once() {
        let backend = MemoryBackend::with_codes(["ABC123", "XYZ789", "ABC123"]);
        assert_eq!(backend.code_count().await, 2);

        let first = backend.find_registration_code("ABC123").await.unwrap().unwrap();
        assert_eq!(backend.add_code("ABC123").await, first.id);
        assert_eq!(backend.code_count().await, 2);
    }

    #[tokio::test]
    async fn linked_tokens_cannot_be_deleted() {
        let backend = MemoryBackend::new();
        let code_id = backend.add_code("C").await;
        let token = backend.create_api_token("T", "Device").await.unwrap();
        backend
            .create_device(&NewDevice {
                name: "D".into(),
                api_token_id: token.id.clone(),
                registration_code_id: code_id,
            })
            .await
            .unwrap();
        assert!(backend.delete_api_token(&token.id).await.is_err());
        assert!(matches!(
            backend.delete_api_token("tok_missing").await,
            Err(BackendError::NotFound(_))
        ));
    }
}
