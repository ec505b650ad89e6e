//! Error types for the Bayeux client

use serde_json::Value;
use thiserror::Error;

/// Errors that can occur when talking to a Bayeux server.
///
/// Every variant maps to a protocol error code, available through
/// [`BayeuxError::code`]. Variants own their payloads so the type stays
/// `Clone` and can travel over broadcast error streams.
#[derive(Debug, Clone, Error)]
pub enum BayeuxError {
    /// Transport-level failure: connect failed, send failed, no transport
    /// selected, or the server response had an unusable shape.
    #[error("Network error: {0}")]
    Network(String),

    /// A frame could not be parsed, or a value failed validation at the
    /// client boundary.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A channel string was rejected by the grammar.
    #[error("Invalid channel '{channel}': {reason}")]
    Channel { channel: String, reason: String },

    /// The server rejected the client's credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The server rejected a `/meta/subscribe`.
    #[error("Subscription to '{subscription}' failed: {message}")]
    Subscription {
        subscription: String,
        message: String,
    },

    /// The server rejected a publish.
    #[error("Publish to '{channel}' failed: {message}")]
    Publication { channel: String, message: String },

    /// Non-200 HTTP reply, passed through with status and body.
    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },

    /// An awaited response did not arrive in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The client has been shut down; pending operations were cancelled.
    #[error("Client closed")]
    Closed,
}

impl BayeuxError {
    /// Protocol error code for this error kind.
    pub fn code(&self) -> u16 {
        match self {
            BayeuxError::Network(_) => 0,
            BayeuxError::Protocol(_) => 400,
            BayeuxError::Channel { .. } => 400,
            BayeuxError::Authentication(_) => 401,
            BayeuxError::Subscription { .. } => 403,
            BayeuxError::Publication { .. } => 403,
            BayeuxError::Http { status, .. } => *status,
            BayeuxError::Timeout(_) => 408,
            BayeuxError::Closed => 0,
        }
    }

    /// Build an error from a Bayeux response `error` field.
    ///
    /// The wire carries either a string `"code:params:message"` or a map
    /// `{code, message, params}`. Unknown codes fall back to
    /// [`BayeuxError::Network`].
    pub fn from_error_field(error: &Value) -> Self {
        let (code, params, message) = match error {
            Value::String(raw) => {
                let mut parts = raw.splitn(3, ':');
                let code = parts
                    .next()
                    .and_then(|c| c.trim().parse::<u16>().ok())
                    .unwrap_or(0);
                let params = parts.next().unwrap_or("").to_string();
                let message = match parts.next() {
                    Some(m) if !m.is_empty() => m.to_string(),
                    _ => raw.clone(),
                };
                (code, params, message)
            }
            Value::Object(map) => {
                let code = map.get("code").and_then(Value::as_u64).unwrap_or(0) as u16;
                let params = match map.get("params") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Array(items)) => items
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(","),
                    _ => String::new(),
                };
                let message = map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                (code, params, message)
            }
            other => (0, String::new(), other.to_string()),
        };

        match code {
            400 => BayeuxError::Protocol(message),
            401 => BayeuxError::Authentication(message),
            403 => BayeuxError::Subscription {
                subscription: params,
                message,
            },
            408 => BayeuxError::Timeout(message),
            404 | 405 | 500 | 503 => BayeuxError::Http {
                status: code,
                body: message,
            },
            _ => BayeuxError::Network(message),
        }
    }
}

/// Result type for Bayeux operations
pub type Result<T> = std::result::Result<T, BayeuxError>;
