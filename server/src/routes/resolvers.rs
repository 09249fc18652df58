//! Resolver invocation endpoints.
//!
//! - `POST /api/resolvers/registerDevice`: exchange a registration code for
//!   device credentials

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::error;

use crate::resolver::{RegistrationEvent, ResolverResponse};
use crate::AppState;

/// `POST /api/resolvers/registerDevice`
///
/// Domain failures (`code_not_found`, `code_assigned`) are a `200` with the
/// `errors` array filled in, as the platform expects from a resolver.
///
/// # Errors
///
/// - `502 Bad Gateway` with `{"code":"BACKEND_ERROR"}`: the data store call failed
pub async fn register_device(
    State(state): State<AppState>,
    Json(event): Json<RegistrationEvent>,
) -> Result<Json<ResolverResponse>, (StatusCode, Json<Value>)> {
    match state.resolver.register_device(&event).await {
        Ok(resp) => Ok(Json(resp)),
        Err(e) => {
            error!("registerDevice failed: {e}");
            Err((
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": e.to_string(), "code": "BACKEND_ERROR"})),
            ))
        }
    }
}
