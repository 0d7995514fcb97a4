//! Courier Storage - Database, cache and repository abstraction
//!
//! Email logs, preferences and API keys live in PostgreSQL (with
//! in-memory implementations for tests and database-less deployments).
//! Daily send counters live in a TTL cache (in-memory or Redis).

pub mod cache;
pub mod db;
pub mod models;
pub mod repository;

pub use cache::{Cache, InMemoryCache, RedisCache};
pub use db::DatabasePool;
pub use models::*;
pub use repository::*;
