//! # The command channel vocabulary
//!
//! The commands the host may send a worker form a closed set, modeled as a
//! tagged variant rather than open string dispatch. An unknown method is
//! itself a variant, so dispatch stays total: every inbound request maps to
//! exactly one arm, and `Unrecognized` yields the method-not-found response.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::error::WireError;
use crate::id::RequestId;
use crate::id::SnapId;
use crate::message::Request;

/// Parameters of `executeSnap`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecuteSnapParams {
    pub snap_id: SnapId,
    pub source_code: String,
}

/// Parameters of `snapRpc`: an origin-tagged request routed to a target snap.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapRpcParams {
    pub origin: String,
    pub request: Value,
    pub target: SnapId,
}

/// A command recognized (or explicitly not) by the worker controller.
#[derive(Clone, Debug)]
pub enum Command {
    /// Liveness probe; parameters are ignored.
    Ping,
    /// Evaluate snap source in a fresh compartment.
    ExecuteSnap(ExecuteSnapParams),
    /// Invoke the target snap's registered RPC handler.
    SnapRpc(SnapRpcParams),
    /// Anything else. Carries the method name for the error response.
    Unrecognized(String),
}

impl Command {
    /// Parses a request into the command set.
    ///
    /// Unknown methods parse successfully (to `Unrecognized`); recognized
    /// methods with malformed parameters do not.
    pub fn from_request(request: &Request) -> Result<Self> {
        match request.method.as_str() {
            "ping" => Ok(Self::Ping),
            "executeSnap" => {
                let params = parse_params(&request.method, request.params.as_ref())?;
                Ok(Self::ExecuteSnap(params))
            }
            "snapRpc" => {
                let params = parse_params(&request.method, request.params.as_ref())?;
                Ok(Self::SnapRpc(params))
            }
            other => Ok(Self::Unrecognized(other.to_string())),
        }
    }

    /// The wire method name.
    pub fn method(&self) -> &str {
        match self {
            Self::Ping => "ping",
            Self::ExecuteSnap(_) => "executeSnap",
            Self::SnapRpc(_) => "snapRpc",
            Self::Unrecognized(method) => method,
        }
    }

    /// The wire parameter object, if the command carries one.
    pub fn params(&self) -> Option<Value> {
        match self {
            Self::Ping | Self::Unrecognized(_) => None,
            Self::ExecuteSnap(p) => serde_json::to_value(p).ok(),
            Self::SnapRpc(p) => serde_json::to_value(p).ok(),
        }
    }

    /// Builds the outbound request for this command.
    pub fn into_request(self, id: RequestId) -> Request {
        let params = self.params();
        Request::new(id, self.method().to_string(), params)
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(method: &str, params: Option<&Value>) -> Result<T> {
    let value = params.cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| WireError::InvalidParams {
        method: method.to_string(),
        detail: e.to_string(),
    })
}
