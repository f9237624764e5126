//! Error types for the CouchDB client.
//!
//! # Design
//! `Server` wraps the database's own `{"error": ..., "reason": ...}` envelope
//! together with the HTTP status, because callers most often need to tell a
//! missing document or a revision conflict apart from a broken connection.
//! Transport and serialization failures carry their message only, so the
//! public error type does not expose the HTTP library in use.

use std::fmt;

use serde_json::Value;

/// Errors returned by `CouchClient` operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CouchError {
    /// The client was built without an HTTP transport.
    #[error("no HTTP transport available")]
    TransportUnavailable,

    /// The method is not one of GET, POST, PUT or DELETE.
    #[error("unsupported HTTP method: {0:?}")]
    UnsupportedMethod(String),

    /// The configured host is not a usable base URL.
    #[error("invalid host URL {host:?}: {reason}")]
    InvalidHost { host: String, reason: String },

    /// Connect, timeout, DNS, TLS or redirect-limit failure.
    #[error("transport failed: {0}")]
    Transport(String),

    /// The request body could not be serialized to JSON.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The server answered with an error envelope.
    #[error("{0}")]
    Server(ServerError),

    /// The response decoded but lacked the fields the operation needs.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// A decoded `{"error": ..., "reason": ...}` response body.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerError {
    pub status: u16,
    pub error: String,
    pub reason: Option<String>,
    /// The whole decoded response, including any fields beyond `error`/`reason`.
    pub body: Value,
}

impl ServerError {
    /// Returns `Some` when `body` is an object carrying an `error` key.
    pub fn from_body(status: u16, body: &Value) -> Option<Self> {
        let error = body.as_object()?.get("error")?;
        Some(Self {
            status,
            error: match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            reason: body.get("reason").and_then(Value::as_str).map(str::to_string),
            body: body.clone(),
        })
    }

    pub fn is_not_found(&self) -> bool {
        self.error == "not_found"
    }

    pub fn is_conflict(&self) -> bool {
        self.error == "conflict"
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "server error {} ({}): {reason}", self.error, self.status),
            None => write!(f, "server error {} ({})", self.error, self.status),
        }
    }
}
