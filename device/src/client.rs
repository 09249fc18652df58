//! GraphQL client for the backend workspace API.
//!
//! [`GraphqlClient`] wraps `reqwest::Client` and posts GraphQL documents to a
//! single endpoint. Responses are returned as the raw `data` object
//! (`serde_json::Value`); callers pick out the fields they asked for with
//! [`decode_field`].
//!
//! ## Authentication
//!
//! The client holds the device's [`CredentialStore`] and reads `apiToken` from
//! it before every request. When a token is stored it is sent verbatim as
//! `Authorization: Bearer <token>`; otherwise the request goes out
//! unauthenticated (this is how `registerDevice` reaches the backend before the
//! device has a token).
//!
//! ## Error handling
//!
//! - Transport failures (connection refused, timeout, DNS) → [`ClientError::Request`]
//! - Non-2xx responses without a GraphQL body → [`ClientError::Http`]
//! - A non-empty `errors` array → [`ClientError::Graphql`]
//! - A body that is not a GraphQL response → [`ClientError::Protocol`]
//!
//! Nothing is retried.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::storage::{CredentialStore, StoreError};

/// A GraphQL document plus its variables, serialized as the request body.
#[derive(Debug, Clone, Serialize)]
pub struct GraphqlRequest {
    pub query: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub variables: Value,
}

impl GraphqlRequest {
    /// A request without variables.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: Value::Null,
        }
    }

    /// Attach the variables object.
    #[must_use]
    pub fn variables(mut self, variables: Value) -> Self {
        self.variables = variables;
        self
    }
}

/// One entry of a GraphQL `errors` array.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GraphqlError {
    pub message: String,
    /// Top-level error code, as custom resolvers report it.
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub extensions: Option<Value>,
}

impl GraphqlError {
    /// The error code, taken from `code` or `extensions.code`.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref().or_else(|| {
            self.extensions
                .as_ref()
                .and_then(|e| e.get("code"))
                .and_then(Value::as_str)
        })
    }
}

impl std::fmt::Display for GraphqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code() {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

#[derive(Deserialize)]
struct GraphqlResponse {
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

/// HTTP client for the backend's GraphQL endpoint.
pub struct GraphqlClient {
    http: reqwest::Client,
    endpoint: String,
    store: CredentialStore,
}

impl GraphqlClient {
    /// Create a client for `endpoint` that authenticates with the token held in `store`.
    pub fn new(endpoint: String, store: CredentialStore) -> Result<Self, ClientError> {
        let mut default_headers = reqwest::header::HeaderMap::new();
        default_headers.insert(
            reqwest::header::HeaderName::from_static("x-devlink-client"),
            reqwest::header::HeaderValue::from_static("device"),
        );
        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .user_agent(concat!("devlink/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(ClientError::Request)?;
        Ok(Self {
            http,
            endpoint,
            store,
        })
    }

    /// The GraphQL endpoint URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The credential store the bearer token is read from.
    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Run a GraphQL query and return its `data` object.
    pub async fn query(&self, request: &GraphqlRequest) -> Result<Value, ClientError> {
        self.execute("query", request).await
    }

    /// Run a GraphQL mutation and return its `data` object.
    pub async fn mutate(&self, request: &GraphqlRequest) -> Result<Value, ClientError> {
        self.execute("mutation", request).await
    }

    async fn execute(&self, kind: &str, request: &GraphqlRequest) -> Result<Value, ClientError> {
        let token = self.store.api_token().map_err(ClientError::Store)?;
        debug!(
            endpoint = %self.endpoint,
            kind,
            authenticated = token.is_some(),
            "sending GraphQL request"
        );

        let mut builder = self.http.post(&self.endpoint).json(request);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        let resp = builder.send().await.map_err(ClientError::Request)?;
        Self::handle_response(resp).await
    }

    /// Parse an HTTP response into the GraphQL `data` object, or a
    /// [`ClientError`] describing why there is none.
    async fn handle_response(resp: reqwest::Response) -> Result<Value, ClientError> {
        let status = resp.status();
        let body = resp.text().await.map_err(ClientError::Request)?;

        let parsed = serde_json::from_str::<GraphqlResponse>(&body);
        if !status.is_success() {
            // GraphQL servers may report errors with a 4xx status; keep them typed
            return match parsed {
                Ok(r) if !r.errors.is_empty() => Err(ClientError::Graphql(r.errors)),
                _ => Err(ClientError::Http {
                    status: status.as_u16(),
                    message: body,
                }),
            };
        }

        let parsed = parsed
            .map_err(|e| ClientError::Protocol(format!("Invalid GraphQL response: {e}")))?;
        if !parsed.errors.is_empty() {
            return Err(ClientError::Graphql(parsed.errors));
        }
        match parsed.data {
            Some(data) if !data.is_null() => Ok(data),
            _ => Err(ClientError::Protocol("GraphQL response has no data".into())),
        }
    }
}

/// Deserialize the top-level field `name` out of a `data` object.
pub fn decode_field<T: DeserializeOwned>(data: &Value, name: &str) -> Result<T, ClientError> {
    let field = data
        .get(name)
        .filter(|v| !v.is_null())
        .ok_or_else(|| ClientError::Protocol(format!("Response is missing '{name}'")))?;
    serde_json::from_value(field.clone())
        .map_err(|e| ClientError::Protocol(format!("Unexpected shape for '{name}': {e}")))
}

/// Errors returned by [`GraphqlClient`] methods.
#[derive(Debug)]
pub enum ClientError {
    /// HTTP transport error (connection refused, timeout, DNS failure, etc.).
    Request(reqwest::Error),
    /// The endpoint returned a non-2xx status without GraphQL errors.
    Http { status: u16, message: String },
    /// The backend answered with a GraphQL `errors` array.
    Graphql(Vec<GraphqlError>),
    /// The response was not a usable GraphQL response.
    Protocol(String),
    /// The bearer token could not be read.
    Store(StoreError),
}

impl ClientError {
    /// The first GraphQL error code, if this is a GraphQL error.
    pub fn graphql_code(&self) -> Option<&str> {
        match self {
            ClientError::Graphql(errors) => errors.iter().find_map(GraphqlError::code),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Request(e) => write!(f, "HTTP request failed: {}", e),
            ClientError::Http { status, message } => {
                write!(f, "Backend error (HTTP {}): {}", status, message)
            }
            ClientError::Graphql(errors) => {
                let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
                write!(f, "GraphQL error: {}", joined.join("; "))
            }
            ClientError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ClientError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Request(e) => Some(e),
            ClientError::Store(e) => Some(e),
            _ => None,
        }
    }
}
