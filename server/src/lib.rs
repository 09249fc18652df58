#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

//! devlink-server library: the registration resolver and its HTTP host.
//!
//! - `resolver`: the `registerDevice` state machine
//! - `backend`: data-store seam (platform GraphQL API or in-memory)
//! - `auth`: host key authentication middleware
//! - `config`: configuration loading
//! - `routes`: REST route handlers
//! - `invoke`: one-shot local invocation from an event file

pub mod auth;
pub mod backend;
pub mod config;
pub mod invoke;
pub mod resolver;
pub mod routes;
pub mod state;
pub mod util;

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

// Re-export key types at crate root for convenience.
pub use auth::HostKey;
pub use config::Config;
pub use resolver::{RegistrationEvent, Resolver, ResolverResponse};
pub use state::AppState;

/// Build the HTTP router: `/api/health` is public, resolver routes require the
/// host key.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route(
            "/api/resolvers/registerDevice",
            post(routes::resolvers::register_device),
        )
        .layer(middleware::from_fn(auth::require_host_key));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(Extension(HostKey(state.config.auth.api_key.clone())))
        .layer(GlobalConcurrencyLimitLayer::new(
            state.config.server.max_concurrency.max(1),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
