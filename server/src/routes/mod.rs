//! HTTP route handlers.
//!
//! All handlers except [`health`] require authentication via the
//! [`crate::auth::require_host_key`] middleware.

pub mod health;
pub mod resolvers;
