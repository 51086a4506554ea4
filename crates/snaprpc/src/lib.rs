//! # SnapRPC
//!
//! The JSON-RPC 2.0 wire vocabulary shared by the host-side execution
//! environment service and the isolate-side worker controller.
//!
//! ## Architecture
//!
//! Everything on the wire is a single JSON object. This crate owns the
//! message shapes, the closed command set spoken on the command channel,
//! the multiplex envelope, and id minting. It contains no I/O.

mod command;
mod envelope;
mod error;
mod id;
mod message;

#[cfg(test)]
mod tests;

pub use command::Command;
pub use command::ExecuteSnapParams;
pub use command::SnapRpcParams;
pub use envelope::Envelope;
pub use envelope::COMMAND_CHANNEL;
pub use envelope::JSON_RPC_CHANNEL;
pub use error::Result;
pub use error::WireError;
pub use id::RequestId;
pub use id::SnapId;
pub use message::ErrorObject;
pub use message::Message;
pub use message::Request;
pub use message::Response;
pub use message::JSONRPC_VERSION;
pub use message::METHOD_NOT_FOUND;
pub use message::INVALID_PARAMS;
pub use message::INTERNAL_ERROR;
pub use message::SNAP_ERROR;
