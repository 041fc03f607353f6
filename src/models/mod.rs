//! Core data models of the space storage engine.
//!
//! Persisted entities map to SQLite rows via `sqlx::FromRow`; everything that
//! crosses the HTTP boundary serializes as camelCase JSON via `serde`.

pub mod permission;
pub mod space;
pub mod ticket;
pub mod transfer;
pub mod trash;
