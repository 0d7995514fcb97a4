//! Courier API - REST API server
//!
//! This crate provides the HTTP surface for Courier, including API key
//! authentication, delivery endpoints, preferences and provider dashboards.

pub mod auth;
pub mod handlers;
pub mod openapi;
pub mod routes;

pub use auth::{seed_bootstrap_keys, AppState, AuthContext};
pub use openapi::create_openapi_routes;
pub use routes::create_router;
