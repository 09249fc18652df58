//! The `registerDevice` resolver.
//!
//! Exchanges a single-use registration code for device credentials:
//!
//! 1. look the code up; unknown codes fail with `code_not_found`
//! 2. codes already linked to a device fail with `code_assigned`
//! 3. mint an API token bound to the device role
//! 4. create the device linking the token and the code
//!
//! Domain failures are reported inside [`ResolverResponse::errors`]. Backend
//! failures are returned as [`BackendError`] and never leave a minted token
//! behind without a device: the token is deleted again, and if that delete
//! fails too (or the code cannot be re-checked) its id is logged with an
//! `orphaned_token` marker.
//!
//! When device creation reports an error the code is looked up again. A code
//! now linked to a device created with this attempt's token means the write
//! committed and only the response was lost, so the registration succeeds. A
//! code linked through any other token lost a race and is `code_assigned`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::backend::{Backend, BackendError, NewDevice, RegistrationCode};

const CODE_NOT_FOUND_MESSAGE: &str = "The submitted registration code was not found.";
const CODE_ASSIGNED_MESSAGE: &str = "The submitted registration code was already used.";

/// Invocation event: `{"data": {"code": "..."}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationEvent {
    pub data: RegistrationInput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationInput {
    pub code: String,
}

impl RegistrationEvent {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            data: RegistrationInput { code: code.into() },
        }
    }
}

/// Resolver output: `{"data": {"id"?, "apiToken"}, "errors": [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverResponse {
    pub data: RegistrationData,
    #[serde(default)]
    pub errors: Vec<ResolverError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "apiToken")]
    pub api_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverError {
    pub message: String,
    pub code: ErrorCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    CodeNotFound,
    CodeAssigned,
}

impl ResolverResponse {
    fn registered(id: String, api_token: String) -> Self {
        Self {
            data: RegistrationData {
                id: Some(id),
                api_token,
            },
            errors: Vec::new(),
        }
    }

    fn failed(code: ErrorCode) -> Self {
        let message = match code {
            ErrorCode::CodeNotFound => CODE_NOT_FOUND_MESSAGE,
            ErrorCode::CodeAssigned => CODE_ASSIGNED_MESSAGE,
        };
        Self {
            data: RegistrationData {
                id: None,
                api_token: String::new(),
            },
            errors: vec![ResolverError {
                message: message.to_string(),
                code,
            }],
        }
    }

    /// Whether the registration succeeded.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Who a registration code is linked to after a failed device creation.
enum Link {
    /// The device created with this attempt's token.
    Ours(String),
    Other,
    Free,
    /// The re-check failed; the token may or may not be in use.
    Unknown,
}

/// Runs registrations against a [`Backend`].
#[derive(Clone)]
pub struct Resolver {
    backend: Arc<dyn Backend>,
    device_role: String,
}

impl Resolver {
    pub fn new(backend: Arc<dyn Backend>, device_role: impl Into<String>) -> Self {
        Self {
            backend,
            device_role: device_role.into(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Handle one `registerDevice` invocation.
    pub async fn register_device(
        &self,
        event: &RegistrationEvent,
    ) -> Result<ResolverResponse, BackendError> {
        let code = event.data.code.trim();
        if code.is_empty() {
            return Ok(ResolverResponse::failed(ErrorCode::CodeNotFound));
        }

        let Some(registration) = self.backend.find_registration_code(code).await? else {
            info!(code, "registration code not found");
            return Ok(ResolverResponse::failed(ErrorCode::CodeNotFound));
        };
        if registration.is_consumed() {
            info!(code, "registration code already used");
            return Ok(ResolverResponse::failed(ErrorCode::CodeAssigned));
        }

        let token = self
            .backend
            .create_api_token(&format!("DEVICE_{code}_TOKEN"), &self.device_role)
            .await?;

        let new_device = NewDevice {
            name: format!("DEVICE_{code}"),
            api_token_id: token.id.clone(),
            registration_code_id: registration.id.clone(),
        };
        match self.backend.create_device(&new_device).await {
            Ok(device) => {
                info!(
                    "Token added to device with ID {} at {}",
                    device.id, device.created_at
                );
                Ok(ResolverResponse::registered(device.id, token.token))
            }
            Err(e) => {
                let link = if matches!(e, BackendError::Conflict(_)) {
                    Link::Other
                } else {
                    self.recheck(code, &token.id).await
                };
                match link {
                    Link::Ours(device_id) => {
                        warn!(
                            code,
                            device_id = %device_id,
                            "device creation reported an error but the device exists: {e}"
                        );
                        Ok(ResolverResponse::registered(device_id, token.token))
                    }
                    Link::Other => {
                        self.revoke_token(&token.id).await;
                        warn!(code, "registration code was used by a concurrent registration");
                        Ok(ResolverResponse::failed(ErrorCode::CodeAssigned))
                    }
                    Link::Free => {
                        self.revoke_token(&token.id).await;
                        Err(e)
                    }
                    Link::Unknown => {
                        error!(
                            orphaned_token = %token.id,
                            "device creation failed and the code could not be re-checked: {e}"
                        );
                        Err(e)
                    }
                }
            }
        }
    }

    /// Look a code up again after a failed device creation.
    async fn recheck(&self, code: &str, token_id: &str) -> Link {
        match self.backend.find_registration_code(code).await {
            Ok(Some(RegistrationCode {
                device: Some(device),
                ..
            })) if device.uses_token(token_id) => Link::Ours(device.id),
            Ok(Some(RegistrationCode {
                device: Some(_), ..
            })) => Link::Other,
            Ok(_) => Link::Free,
            Err(e) => {
                warn!(code, "re-checking registration code failed: {e}");
                Link::Unknown
            }
        }
    }

    async fn revoke_token(&self, token_id: &str) {
        if let Err(e) = self.backend.delete_api_token(token_id).await {
            error!(
                orphaned_token = token_id,
                "failed to delete API token after device creation failed: {e}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::{ApiToken, Device};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn resolver(backend: &Arc<MemoryBackend>) -> Resolver {
        Resolver::new(backend.clone(), "Device")
    }

    #[tokio::test]
    async fn valid_code_registers_device() {
        let backend = Arc::new(MemoryBackend::with_codes(["ABC123"]));
        let resp = resolver(&backend)
            .register_device(&RegistrationEvent::new("ABC123"))
            .await
            .unwrap();

        assert!(resp.is_success());
        assert!(!resp.data.api_token.is_empty());
        let id = resp.data.id.clone().unwrap();

        let device = backend.device_for_code("ABC123").await.unwrap();
        assert_eq!(device.id, id);
        assert_eq!(device.name, "DEVICE_ABC123");
        assert_eq!(
            backend.token_details(&device.api_token_id).await,
            Some(("DEVICE_ABC123_TOKEN".to_string(), "Device".to_string()))
        );
        assert!(backend.token_exists(&resp.data.api_token).await);
    }

    #[tokio::test]
    async fn unknown_code_is_not_found() {
        let backend = Arc::new(MemoryBackend::new());
        let resp = resolver(&backend)
            .register_device(&RegistrationEvent::new("nope"))
            .await
            .unwrap();

        assert_eq!(resp.data.api_token, "");
        assert_eq!(resp.data.id, None);
        assert_eq!(resp.errors[0].code, ErrorCode::CodeNotFound);
        assert_eq!(resp.errors[0].message, CODE_NOT_FOUND_MESSAGE);
        assert_eq!(backend.token_count().await, 0);
    }

    #[tokio::test]
    async fn blank_code_is_not_found() {
        let backend = Arc::new(MemoryBackend::with_codes([""]));
        let resp = resolver(&backend)
            .register_device(&RegistrationEvent::new("   "))
            .await
            .unwrap();
        assert_eq!(resp.errors[0].code, ErrorCode::CodeNotFound);
        assert_eq!(backend.device_count().await, 0);
    }

    #[tokio::test]
    async fn surrounding_whitespace_is_trimmed() {
        let backend = Arc::new(MemoryBackend::with_codes(["ABC123"]));
        let resp = resolver(&backend)
            .register_device(&RegistrationEvent::new(" ABC123\n"))
            .await
            .unwrap();
        assert!(resp.is_success());
    }

    #[tokio::test]
    async fn second_submission_is_rejected() {
        let backend = Arc::new(MemoryBackend::with_codes(["ABC123"]));
        let resolver = resolver(&backend);
        let event = RegistrationEvent::new("ABC123");

        let first = resolver.register_device(&event).await.unwrap();
        assert!(first.is_success());

        let second = resolver.register_device(&event).await.unwrap();
        assert_eq!(
            serde_json::to_value(&second).unwrap(),
            json!({
                "data": {"apiToken": ""},
                "errors": [{
                    "message": "The submitted registration code was already used.",
                    "code": "code_assigned"
                }]
            })
        );
        assert_eq!(backend.device_count().await, 1);
        assert_eq!(backend.token_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_registrations_create_one_device() {
        let backend = Arc::new(MemoryBackend::with_codes(["RACE"]));
        let resolver = resolver(&backend);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let resolver = resolver.clone();
                tokio::spawn(async move {
                    resolver
                        .register_device(&RegistrationEvent::new("RACE"))
                        .await
                        .unwrap()
                })
            })
            .collect();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(results.iter().filter(|r| r.is_success()).count(), 1);
        assert!(results
            .iter()
            .filter(|r| !r.is_success())
            .all(|r| r.errors[0].code == ErrorCode::CodeAssigned));
        assert_eq!(backend.device_count().await, 1);
        assert_eq!(backend.token_count().await, 1);
    }

    #[test]
    fn event_and_response_wire_shape() {
        let event: RegistrationEvent =
            serde_json::from_value(json!({"data": {"code": "X1"}})).unwrap();
        assert_eq!(event.data.code, "X1");

        let ok = ResolverResponse::registered("dev_1".into(), "tok".into());
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"data": {"id": "dev_1", "apiToken": "tok"}, "errors": []})
        );
    }

    /// How [`ScriptedDevices::create_device`] misbehaves.
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum DeviceScript {
        /// Nothing is written; the call fails.
        Unavailable,
        /// As `Unavailable`, and every later code lookup fails too.
        UnavailableThenBlind,
        /// The device is written but the response is lost.
        LoseResponse,
        /// Another registration links the code first; its conflict is reported.
        RivalFirst,
        /// As `RivalFirst`, but the conflict arrives as a generic GraphQL error.
        RivalFirstOpaque,
    }

    /// Delegates to a memory backend, with scripted device creation.
    struct ScriptedDevices {
        inner: MemoryBackend,
        script: DeviceScript,
        fail_delete: bool,
        created: AtomicBool,
    }

    impl ScriptedDevices {
        fn new(script: DeviceScript) -> Self {
            Self {
                inner: MemoryBackend::with_codes(["ABC123"]),
                script,
                fail_delete: false,
                created: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Backend for ScriptedDevices {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        async fn find_registration_code(
            &self,
            code: &str,
        ) -> Result<Option<RegistrationCode>, BackendError> {
            if self.script == DeviceScript::UnavailableThenBlind
                && self.created.load(Ordering::SeqCst)
            {
                return Err(BackendError::Protocol("lookup unavailable".into()));
            }
            self.inner.find_registration_code(code).await
        }

        async fn create_api_token(&self, name: &str, role: &str) -> Result<ApiToken, BackendError> {
            self.inner.create_api_token(name, role).await
        }

        async fn create_device(&self, device: &NewDevice) -> Result<Device, BackendError> {
            self.created.store(true, Ordering::SeqCst);
            match self.script {
                DeviceScript::Unavailable | DeviceScript::UnavailableThenBlind => {
                    Err(BackendError::Graphql("deviceCreate unavailable".into()))
                }
                DeviceScript::LoseResponse => {
                    self.inner.create_device(device).await?;
                    Err(BackendError::Protocol("response lost".into()))
                }
                DeviceScript::RivalFirst | DeviceScript::RivalFirstOpaque => {
                    let rival = self.inner.create_api_token("RIVAL", "Device").await?;
                    self.inner
                        .create_device(&NewDevice {
                            name: device.name.clone(),
                            api_token_id: rival.id,
                            registration_code_id: device.registration_code_id.clone(),
                        })
                        .await?;
                    match self.inner.create_device(device).await {
                        Err(BackendError::Conflict(msg))
                            if self.script == DeviceScript::RivalFirstOpaque =>
                        {
                            Err(BackendError::Graphql(msg))
                        }
                        other => other,
                    }
                }
            }
        }

        async fn delete_api_token(&self, token_id: &str) -> Result<(), BackendError> {
            if self.fail_delete {
                return Err(BackendError::Graphql("apiTokenDelete unavailable".into()));
            }
            self.inner.delete_api_token(token_id).await
        }
    }

    async fn register_scripted(
        backend: &Arc<ScriptedDevices>,
    ) -> Result<ResolverResponse, BackendError> {
        Resolver::new(backend.clone(), "Device")
            .register_device(&RegistrationEvent::new("ABC123"))
            .await
    }

    #[tokio::test]
    async fn failed_device_creation_deletes_token() {
        let backend = Arc::new(ScriptedDevices::new(DeviceScript::Unavailable));
        let err = register_scripted(&backend).await.unwrap_err();
        assert!(matches!(err, BackendError::Graphql(_)));
        assert_eq!(backend.inner.token_count().await, 0);
    }

    #[tokio::test]
    async fn failed_compensation_still_reports_device_error() {
        let mut scripted = ScriptedDevices::new(DeviceScript::Unavailable);
        scripted.fail_delete = true;
        let backend = Arc::new(scripted);

        let err = register_scripted(&backend).await.unwrap_err();
        assert!(err.to_string().contains("deviceCreate unavailable"));
        assert_eq!(backend.inner.token_count().await, 1);
    }

    #[tokio::test]
    async fn lost_device_response_still_registers() {
        let backend = Arc::new(ScriptedDevices::new(DeviceScript::LoseResponse));
        let resp = register_scripted(&backend).await.unwrap();

        assert!(resp.is_success());
        let device = backend.inner.device_for_code("ABC123").await.unwrap();
        assert_eq!(resp.data.id.as_deref(), Some(device.id.as_str()));
        assert!(backend.inner.token_exists(&resp.data.api_token).await);
        assert_eq!(backend.inner.device_count().await, 1);
        assert_eq!(backend.inner.token_count().await, 1);
    }

    #[tokio::test]
    async fn conflicting_device_creation_is_code_assigned() {
        let backend = Arc::new(ScriptedDevices::new(DeviceScript::RivalFirst));
        let resp = register_scripted(&backend).await.unwrap();

        assert_eq!(resp.errors[0].code, ErrorCode::CodeAssigned);
        assert_eq!(resp.data.api_token, "");
        assert_eq!(backend.inner.device_count().await, 1);
        // Only the rival's token is left.
        assert_eq!(backend.inner.token_count().await, 1);
        let device = backend.inner.device_for_code("ABC123").await.unwrap();
        assert_eq!(
            backend.inner.token_details(&device.api_token_id).await,
            Some(("RIVAL".to_string(), "Device".to_string()))
        );
    }

    #[tokio::test]
    async fn code_linked_by_another_token_is_code_assigned() {
        let backend = Arc::new(ScriptedDevices::new(DeviceScript::RivalFirstOpaque));
        let resp = register_scripted(&backend).await.unwrap();

        assert_eq!(resp.errors[0].code, ErrorCode::CodeAssigned);
        assert_eq!(backend.inner.device_count().await, 1);
        assert_eq!(backend.inner.token_count().await, 1);
    }

    #[tokio::test]
    async fn unverifiable_failure_keeps_token() {
        let backend = Arc::new(ScriptedDevices::new(DeviceScript::UnavailableThenBlind));
        let err = register_scripted(&backend).await.unwrap_err();

        assert!(err.to_string().contains("deviceCreate unavailable"));
        assert_eq!(backend.inner.token_count().await, 1);
    }
}
