//! # Error definitions
//!
//! The central ledger of wire-level failures. These describe traffic that
//! could not be understood at all; failures *reported by* a peer travel as
//! [`crate::ErrorObject`] values inside well-formed responses.

/// Failures while classifying or encoding wire traffic.
#[derive(Debug, Clone)]
pub enum WireError {
    /// The payload was not a JSON object (string, number, null, ...).
    NotAnObject,
    /// The payload was a JSON array; batch requests are not part of the protocol.
    ArrayMessage,
    /// The object was neither a request nor a response.
    UnknownShape,
    /// A recognized method carried parameters that did not match its shape.
    InvalidParams { method: String, detail: String },
    /// Serialization to or from JSON failed.
    Json(String),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAnObject => write!(f, "message is not a JSON object"),
            Self::ArrayMessage => write!(f, "array messages are not supported"),
            Self::UnknownShape => write!(f, "message is neither a request nor a response"),
            Self::InvalidParams { method, detail } => {
                write!(f, "invalid parameters for '{}': {}", method, detail)
            }
            Self::Json(msg) => write!(f, "JSON error: {}", msg),
        }
    }
}

impl std::error::Error for WireError {}

impl From<serde_json::Error> for WireError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;
