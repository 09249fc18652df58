//! One-shot local invocation.
//!
//! Reads an event document such as `{"data": {"code": "ABC123"}}` from a file,
//! runs the resolver once and returns the response, the same document the HTTP
//! endpoint would answer with.

use std::path::Path;

use crate::resolver::{RegistrationEvent, Resolver, ResolverResponse};
use crate::util::expand_tilde;

/// Read and parse an event file (leading `~` expanded).
pub fn read_event(path: &str) -> Result<RegistrationEvent, String> {
    let path = expand_tilde(path);
    let content = std::fs::read_to_string(Path::new(path.as_ref()))
        .map_err(|e| format!("Failed to read event file {path}: {e}"))?;
    serde_json::from_str(&content).map_err(|e| format!("Invalid event file {path}: {e}"))
}

/// Run the resolver once for `event`.
pub async fn invoke(
    resolver: &Resolver,
    event: &RegistrationEvent,
) -> Result<ResolverResponse, String> {
    resolver
        .register_device(event)
        .await
        .map_err(|e| format!("registerDevice failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use std::io::Write;
    use std::sync::Arc;

    #[tokio::test]
    async fn invokes_from_event_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"data": {{"code": "ABC123"}}}}"#).unwrap();

        let event = read_event(file.path().to_str().unwrap()).unwrap();
        let resolver = Resolver::new(Arc::new(MemoryBackend::with_codes(["ABC123"])), "Device");
        let resp = invoke(&resolver, &event).await.unwrap();
        assert!(resp.is_success());
    }

    #[test]
    fn rejects_malformed_event() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"code": "ABC123"}}"#).unwrap();
        let err = read_event(file.path().to_str().unwrap()).unwrap_err();
        assert!(err.starts_with("Invalid event file"));

        assert!(read_event("/nonexistent/event.json").is_err());
    }
}
