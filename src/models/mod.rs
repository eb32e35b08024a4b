//! Core data models for the image upload service.
//!
//! Sessions and images map to SQLite tables via `sqlx::FromRow`; the API
//! envelopes are shared by the HTTP handlers and the upload client so both
//! sides agree on the wire shape.

pub mod api;
pub mod image;
pub mod session;
