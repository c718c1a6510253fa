//! HTTP route handlers for the ingest server.

pub mod traces;

/// Health check endpoint.
pub async fn health() -> &'static str {
    "OK"
}
