//! # JSON-RPC 2.0 messages
//!
//! Wire shapes for both multiplex channels. Classification is strict:
//! non-objects and arrays are rejected outright, and an object must look
//! like exactly one of request or response.
//!
//! ## Invariants
//! - A response carries exactly one of `result` or `error`.
//! - A message with an `error` field and no id is not a response to anything
//!   in flight; it is an out-of-band error pushed by the peer.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::error::WireError;
use crate::id::RequestId;

pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes used on the command channel.
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Errors raised by snap code itself (evaluation throws, handler rejects).
pub const SNAP_ERROR: i64 = -32000;

/// A JSON-RPC request.
///
/// `id` is optional on the wire; the worker drops id-less requests without
/// responding, so callers that expect an answer must set one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }
}

/// The error member of a failed response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Unrecognized command '{}'", method))
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, detail)
    }

    pub fn snap_error(message: impl Into<String>) -> Self {
        Self::new(SNAP_ERROR, message)
    }
}

// Display is the surface callers see when a remote error is re-raised as a
// rejection, so it is just the message.
impl std::fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// A JSON-RPC response.
///
/// `id: None` encodes both a missing and a `null` id; paired with a present
/// `error` it marks the message as out-of-band.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    /// A successful response tagged with the request id.
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// A failed response tagged with the request id.
    pub fn err(id: RequestId, error: ErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: None,
            error: Some(error),
        }
    }

    /// True when this message has an error but no id: it is not a response
    /// to anything in flight.
    pub fn is_out_of_band(&self) -> bool {
        self.id.is_none() && self.error.is_some()
    }
}

/// A classified inbound message.
#[derive(Clone, Debug)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    /// Classifies a raw JSON value.
    ///
    /// An object with a `method` member is a request; one with `result` or
    /// `error` is a response. Anything else is rejected.
    pub fn classify(value: Value) -> Result<Self> {
        let object = match &value {
            Value::Object(map) => map,
            Value::Array(_) => return Err(WireError::ArrayMessage),
            _ => return Err(WireError::NotAnObject),
        };

        if object.contains_key("method") {
            let request: Request = serde_json::from_value(value)?;
            return Ok(Self::Request(request));
        }

        if object.contains_key("result") || object.contains_key("error") {
            let response: Response = serde_json::from_value(value)?;
            return Ok(Self::Response(response));
        }

        Err(WireError::UnknownShape)
    }
}
