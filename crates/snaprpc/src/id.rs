//! # Identifiers
//!
//! Strong types for the two identifiers that cross the wire: snap ids
//! (assigned by the host's higher-level controllers, opaque here) and
//! JSON-RPC request ids (minted fresh per outbound request).

use serde::Deserialize;
use serde::Serialize;

/// Stable, opaque identifier for a unit of third-party code.
///
/// Unique per host; the execution environment never interprets its contents.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapId(String);

impl SnapId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for SnapId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SnapId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A JSON-RPC request id: string or number, never null on requests that
/// expect a response.
///
/// Responses are correlated by id and may arrive out of order, so freshly
/// minted ids must be collision-resistant: [`RequestId::fresh`] uses v4
/// UUIDs rather than a counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Num(i64),
    Str(String),
}

impl RequestId {
    /// Mints a fresh collision-resistant id.
    pub fn fresh() -> Self {
        Self::Str(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{}", n),
            Self::Str(s) => write!(f, "{}", s),
        }
    }
}
