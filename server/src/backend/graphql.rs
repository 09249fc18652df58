//! Backend over the platform's workspace GraphQL API.
//!
//! Every request carries the configured service token as a Bearer credential.
//! The service token belongs to a role with permission to read registration
//! codes and create tokens and devices, which is what lets the resolver act on
//! behalf of a device that has no credentials yet.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{ApiToken, Backend, BackendError, Device, NewDevice, RegistrationCode};

const REGISTRATION_CODE_QUERY: &str = r"
query($code: String!) {
  registrationCode(code: $code) {
    id
    code
    device {
      id
      apiToken {
        id
      }
    }
  }
}";

const CREATE_API_TOKEN_MUTATION: &str = r"
mutation($name: String!, $role: String!) {
  apiTokenCreate(data: { name: $name, roles: { connect: { name: $role } } }) {
    id
    token
  }
}";

const CREATE_DEVICE_MUTATION: &str = r"
mutation($tokenId: ID!, $codeId: ID!, $name: String!) {
  deviceCreate(
    data: {
      name: $name
      apiToken: { connect: { id: $tokenId } }
      registrationCode: { connect: { id: $codeId } }
    }
  ) {
    id
    createdAt
  }
}";

const DELETE_API_TOKEN_MUTATION: &str = r"
mutation($id: ID!) {
  apiTokenDelete(data: { id: $id }) {
    success
  }
}";

#[derive(Deserialize)]
struct GraphqlResponse {
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphqlErrorEntry>,
}

#[derive(Deserialize)]
struct GraphqlErrorEntry {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Deserialize)]
struct DeleteResult {
    success: bool,
}

/// [`Backend`] implementation that calls the workspace GraphQL endpoint.
pub struct GraphqlBackend {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl GraphqlBackend {
    /// Create a backend for `endpoint`, authenticating with the service `token`.
    pub fn new(endpoint: String, token: String) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("devlink-server/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(BackendError::Request)?;
        Ok(Self {
            http,
            endpoint,
            token,
        })
    }

    /// Post one GraphQL document and return the `data` object.
    async fn request(&self, query: &str, variables: Value) -> Result<Value, BackendError> {
        debug!(endpoint = %self.endpoint, "backend GraphQL request");
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(BackendError::Request)?;

        let status = resp.status();
        let body = resp.text().await.map_err(BackendError::Request)?;
        let parsed = serde_json::from_str::<GraphqlResponse>(&body);

        match parsed {
            Ok(r) if !r.errors.is_empty() => Err(BackendError::Graphql(join_errors(&r.errors))),
            Ok(r) if status.is_success() => r
                .data
                .filter(|d| !d.is_null())
                .ok_or_else(|| BackendError::Protocol("response has no data".into())),
            Ok(_) => Err(BackendError::Graphql(format!("HTTP {}", status.as_u16()))),
            Err(_) if !status.is_success() => Err(BackendError::Graphql(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body
            ))),
            Err(e) => Err(BackendError::Protocol(format!(
                "Invalid GraphQL response: {e}"
            ))),
        }
    }
}

fn join_errors(errors: &[GraphqlErrorEntry]) -> String {
    errors
        .iter()
        .map(|e| match &e.code {
            Some(code) => format!("{} ({})", e.message, code),
            None => e.message.clone(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Deserialize `data[name]`, treating `null` as `None`.
fn field<T: DeserializeOwned>(data: &Value, name: &str) -> Result<Option<T>, BackendError> {
    match data.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|e| BackendError::Protocol(format!("Unexpected shape for '{name}': {e}"))),
    }
}

fn required<T: DeserializeOwned>(data: &Value, name: &str) -> Result<T, BackendError> {
    field(data, name)?.ok_or_else(|| BackendError::Protocol(format!("Response is missing '{name}'")))
}

#[async_trait]
impl Backend for GraphqlBackend {
    fn kind(&self) -> &'static str {
        "graphql"
    }

    async fn find_registration_code(
        &self,
        code: &str,
    ) -> Result<Option<RegistrationCode>, BackendError> {
        let data = self
            .request(REGISTRATION_CODE_QUERY, json!({ "code": code }))
            .await?;
        field(&data, "registrationCode")
    }

    async fn create_api_token(&self, name: &str, role: &str) -> Result<ApiToken, BackendError> {
        let data = self
            .request(
                CREATE_API_TOKEN_MUTATION,
                json!({ "name": name, "role": role }),
            )
            .await?;
        required(&data, "apiTokenCreate")
    }

    async fn create_device(&self, device: &NewDevice) -> Result<Device, BackendError> {
        let data = self
            .request(
                CREATE_DEVICE_MUTATION,
                json!({
                    "tokenId": device.api_token_id,
                    "codeId": device.registration_code_id,
                    "name": device.name,
                }),
            )
            .await?;
        required(&data, "deviceCreate")
    }

    async fn delete_api_token(&self, token_id: &str) -> Result<(), BackendError> {
        let data = self
            .request(DELETE_API_TOKEN_MUTATION, json!({ "id": token_id }))
            .await?;
        let result: DeleteResult = required(&data, "apiTokenDelete")?;
        if result.success {
            Ok(())
        } else {
            Err(BackendError::Graphql(format!(
                "apiTokenDelete reported failure for {token_id}"
            )))
        }
    }
}
