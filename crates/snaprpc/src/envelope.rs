//! # Multiplex envelopes
//!
//! One transport carries N named substreams; each wire message is an
//! envelope naming its channel. The channel identifiers are compiled into
//! both the host and worker builds and must match exactly.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Control-plane channel: the closed command set.
pub const COMMAND_CHANNEL: &str = "command";
/// Snap-provider channel: opaque wallet traffic, piped but never interpreted.
pub const JSON_RPC_CHANNEL: &str = "jsonRpc";

/// A channel-tagged message on the parent transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(channel: impl Into<String>, payload: Value) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
