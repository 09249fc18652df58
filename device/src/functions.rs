//! Device functions invoked by the CLI runner.
//!
//! Each remote function issues exactly one GraphQL operation through
//! [`GraphqlClient`] and turns the response into a plain value. Failures are
//! returned as [`FunctionError`]; presenting them is the runner's job.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::client::{decode_field, ClientError, GraphqlClient, GraphqlRequest};
use crate::storage::{Credential, CredentialStore, StoreError};

const REGISTER_DEVICE: &str = r"
mutation($code: String!) {
  registerDevice(code: $code) {
    id
    apiToken
  }
}";

const CREATE_DATA_ENTRY: &str = r"
mutation($id: ID!, $val: Int!) {
  deviceUpdate(data: { id: $id, dataEntries: { create: { value: $val } } }) {
    id
  }
}";

const READ_DATA_ENTRIES: &str = r"
query {
  dataEntriesList {
    items {
      createdAt
      value
    }
  }
}";

/// One telemetry sample as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEntry {
    #[serde(rename = "createdAt")]
    pub created_at: String,
    pub value: i64,
}

#[derive(Deserialize)]
struct RegisteredDevice {
    id: String,
    #[serde(rename = "apiToken")]
    api_token: String,
}

#[derive(Deserialize)]
struct UpdatedDevice {
    id: String,
}

#[derive(Deserialize)]
struct EntryList {
    items: Vec<DataEntry>,
}

/// Local view of the device's registration state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub registered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub credentials_path: String,
}

/// `registerDevice <code>`: exchange a registration code for credentials and
/// store them.
pub async fn register_device(client: &GraphqlClient, code: &str) -> Result<String, FunctionError> {
    let request = GraphqlRequest::new(REGISTER_DEVICE).variables(json!({ "code": code }));
    let data = client.mutate(&request).await?;
    let registered: RegisteredDevice = decode_field(&data, "registerDevice")?;

    // The resolver reports failures with an empty token; never persist one
    if registered.api_token.is_empty() {
        return Err(FunctionError::Client(ClientError::Protocol(
            "registerDevice returned an empty apiToken".into(),
        )));
    }

    client.store().store_credential(&Credential {
        id: registered.id.clone(),
        api_token: registered.api_token,
    })?;
    info!(device_id = %registered.id, "device registered");

    Ok("Device registered".to_string())
}

/// `sendActivity <value>`: append one data entry to this device.
pub async fn send_activity(client: &GraphqlClient, input: &str) -> Result<String, FunctionError> {
    let id = client
        .store()
        .device_id()?
        .ok_or(FunctionError::NotRegistered)?;
    let val = parse_value(input)?;

    let request =
        GraphqlRequest::new(CREATE_DATA_ENTRY).variables(json!({ "id": id, "val": val }));
    let data = client.mutate(&request).await?;
    let updated: UpdatedDevice = decode_field(&data, "deviceUpdate")?;

    Ok(format!("Entry {} saved to device {}", val, updated.id))
}

/// `readActivity`: every stored data entry, unfiltered.
pub async fn read_activity(client: &GraphqlClient) -> Result<Vec<DataEntry>, FunctionError> {
    let data = client.query(&GraphqlRequest::new(READ_DATA_ENTRIES)).await?;
    let list: EntryList = decode_field(&data, "dataEntriesList")?;
    Ok(list.items)
}

/// `unregister`: forget the stored credentials. Local only.
pub fn unregister(store: &CredentialStore) -> Result<String, FunctionError> {
    if store.clear()? {
        info!(path = %store.path().display(), "credentials removed");
        Ok("Device credentials removed".to_string())
    } else {
        Ok("No stored credentials".to_string())
    }
}

/// `status`: whether this device holds credentials. Never exposes the token.
pub fn status(store: &CredentialStore) -> Result<DeviceStatus, FunctionError> {
    let credential = store.credential()?;
    Ok(DeviceStatus {
        registered: credential.is_some(),
        device_id: credential.map(|c| c.id),
        credentials_path: store.path().display().to_string(),
    })
}

/// Parse a reading as a GraphQL `Int` (signed 32-bit).
fn parse_value(input: &str) -> Result<i32, FunctionError> {
    input
        .trim()
        .parse::<i32>()
        .map_err(|_| FunctionError::InvalidValue(input.to_string()))
}

/// Errors returned by device functions.
#[derive(Debug)]
pub enum FunctionError {
    /// The GraphQL call failed.
    Client(ClientError),
    /// The credential store could not be read or written.
    Store(StoreError),
    /// The function needs a device id but none is stored.
    NotRegistered,
    /// The reading is not an integer.
    InvalidValue(String),
    /// A remote function was called without a GraphQL endpoint.
    NoEndpoint,
}

impl From<ClientError> for FunctionError {
    fn from(e: ClientError) -> Self {
        FunctionError::Client(e)
    }
}

impl From<StoreError> for FunctionError {
    fn from(e: StoreError) -> Self {
        FunctionError::Store(e)
    }
}

impl std::fmt::Display for FunctionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FunctionError::Client(e) => write!(f, "{}", e),
            FunctionError::Store(e) => write!(f, "{}", e),
            FunctionError::NotRegistered => {
                write!(f, "Device is not registered (run registerDevice first)")
            }
            FunctionError::InvalidValue(v) => {
                write!(f, "Invalid reading '{}': expected a 32-bit integer", v)
            }
            FunctionError::NoEndpoint => write!(
                f,
                "No endpoint configured (use --endpoint, a config file, or DEVLINK_ENDPOINT)"
            ),
        }
    }
}

impl std::error::Error for FunctionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FunctionError::Client(e) => Some(e),
            FunctionError::Store(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, dir: &TempDir) -> GraphqlClient {
        let store = CredentialStore::new(dir.path().join("credentials.json"));
        GraphqlClient::new(server.uri(), store).unwrap()
    }

    fn registered(client: &GraphqlClient, id: &str, token: &str) {
        client
            .store()
            .store_credential(&Credential {
                id: id.into(),
                api_token: token.into(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn register_device_stores_credentials() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let client = client_for(&server, &dir);

        Mock::given(method("POST"))
            .and(body_partial_json(json!({"variables": {"code": "ABC123"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"registerDevice": {"id": "dev_1", "apiToken": "tok_xyz"}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let out = register_device(&client, "ABC123").await.unwrap();
        assert_eq!(out, "Device registered");
        let cred = client.store().credential().unwrap().unwrap();
        assert_eq!(cred.id, "dev_1");
        assert_eq!(cred.api_token, "tok_xyz");
    }

    #[tokio::test]
    async fn register_device_failure_leaves_store_untouched() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let client = client_for(&server, &dir);

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"registerDevice": null},
                "errors": [{
                    "message": "The submitted registration code was already used.",
                    "code": "code_assigned"
                }]
            })))
            .mount(&server)
            .await;

        let err = register_device(&client, "ABC123").await.unwrap_err();
        match err {
            FunctionError::Client(e) => assert_eq!(e.graphql_code(), Some("code_assigned")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!client.store().path().exists());
    }

    #[tokio::test]
    async fn register_device_rejects_empty_token() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let client = client_for(&server, &dir);

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"registerDevice": {"id": "", "apiToken": ""}}
            })))
            .mount(&server)
            .await;

        assert!(register_device(&client, "X").await.is_err());
        assert_eq!(client.store().credential().unwrap(), None);
    }

    #[tokio::test]
    async fn send_activity_posts_id_and_value() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let client = client_for(&server, &dir);
        registered(&client, "d1", "t1");

        Mock::given(method("POST"))
            .and(header("authorization", "Bearer t1"))
            .and(body_partial_json(json!({"variables": {"id": "d1", "val": 42}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"deviceUpdate": {"id": "d1"}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let out = send_activity(&client, "42").await.unwrap();
        assert_eq!(out, "Entry 42 saved to device d1");
    }

    #[tokio::test]
    async fn send_activity_rejects_non_integer_without_request() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let client = client_for(&server, &dir);
        registered(&client, "d1", "t1");

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = send_activity(&client, "forty-two").await.unwrap_err();
        assert!(matches!(err, FunctionError::InvalidValue(v) if v == "forty-two"));
    }

    #[tokio::test]
    async fn send_activity_requires_registration() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let client = client_for(&server, &dir);

        let err = send_activity(&client, "42").await.unwrap_err();
        assert!(matches!(err, FunctionError::NotRegistered));
    }

    #[tokio::test]
    async fn read_activity_returns_all_items() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let client = client_for(&server, &dir);
        registered(&client, "d1", "t1");

        Mock::given(method("POST"))
            .and(header("authorization", "Bearer t1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"dataEntriesList": {"items": [
                    {"createdAt": "2026-01-01T00:00:00.000Z", "value": 1},
                    {"createdAt": "2026-01-01T00:01:00.000Z", "value": -7}
                ]}}
            })))
            .mount(&server)
            .await;

        let entries = read_activity(&client).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].value, -7);
        assert_eq!(entries[0].created_at, "2026-01-01T00:00:00.000Z");
    }

    #[test]
    fn status_and_unregister_are_local() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));

        assert!(!status(&store).unwrap().registered);
        store
            .store_credential(&Credential {
                id: "d1".into(),
                api_token: "t1".into(),
            })
            .unwrap();
        let st = status(&store).unwrap();
        assert!(st.registered);
        assert_eq!(st.device_id.as_deref(), Some("d1"));

        assert_eq!(unregister(&store).unwrap(), "Device credentials removed");
        assert_eq!(unregister(&store).unwrap(), "No stored credentials");
    }

    #[test]
    fn parse_value_bounds() {
        assert_eq!(parse_value(" 42 ").unwrap(), 42);
        assert_eq!(parse_value("-3").unwrap(), -3);
        assert!(parse_value("4.5").is_err());
        assert!(parse_value("99999999999").is_err());
        assert!(parse_value("").is_err());
    }
}
