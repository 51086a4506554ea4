//! # Worker controller
//!
//! The isolate-side half of the isolation protocol. It owns the command
//! loop: classify inbound messages, dispatch the closed command set, and
//! answer every identified request with exactly one tagged response.
//! Malformed traffic — non-objects, arrays, id-less requests — is logged
//! and dropped, never answered.
//!
//! The controller exclusively owns the compartments it evaluates and the
//! registry mapping snap ids to them.

pub mod compartment;
pub mod endowment;
pub mod provider;

use std::collections::HashMap;

use serde_json::json;
use serde_json::Value;

use snaprpc::Command;
use snaprpc::ErrorObject;
use snaprpc::ExecuteSnapParams;
use snaprpc::Message;
use snaprpc::Request;
use snaprpc::RequestId;
use snaprpc::Response;
use snaprpc::SnapId;
use snaprpc::SnapRpcParams;
use snaprpc::COMMAND_CHANNEL;
use snaprpc::JSON_RPC_CHANNEL;

use crate::engine::RpcEngine;
use crate::mux;
use crate::mux::ObjectMultiplexer;
use crate::mux::Substream;
use crate::transport::Transport;
use crate::worker::compartment::Compartment;
use crate::worker::compartment::Lockdown;
use crate::worker::compartment::LockdownConfig;
use crate::worker::endowment::Endowments;
use crate::worker::provider::SnapProvider;

#[derive(Debug)]
pub enum Error {
    /// Installing a binding into the linker failed.
    Link(wasmtime::Error),
    /// Building the shared engine failed.
    Engine(wasmtime::Error),
    Lockdown(String),
    /// The snap threw while being evaluated.
    Evaluation(String),
    /// The snap's handler trapped.
    Handler(String),
    /// The snap's handler rejected with this message.
    Snap(String),
    NoHandler(SnapId),
    UnknownTarget(SnapId),
    AlreadyExecuting(SnapId),
    MissingExport(&'static str),
    OutOfBounds,
    MalformedEnvelope,
    Codec(String),
    Endowment(String),
    EmptyParam(&'static str),
    Mux(mux::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Link(e) => write!(f, "linker error: {}", e),
            Self::Engine(e) => write!(f, "engine error: {}", e),
            Self::Lockdown(msg) => write!(f, "lockdown error: {}", msg),
            Self::Evaluation(msg) => write!(f, "snap evaluation failed: {}", msg),
            Self::Handler(msg) => write!(f, "snap handler trapped: {}", msg),
            // The snap's own rejection message, verbatim.
            Self::Snap(msg) => write!(f, "{}", msg),
            Self::NoHandler(id) => write!(f, "no RPC handler registered for snap '{}'", id),
            Self::UnknownTarget(id) => write!(f, "no snap executing with id '{}'", id),
            Self::AlreadyExecuting(id) => {
                write!(f, "snap '{}' is already executing in this worker", id)
            }
            Self::MissingExport(name) => write!(f, "snap does not export '{}'", name),
            Self::OutOfBounds => write!(f, "snap returned an out-of-bounds pointer"),
            Self::MalformedEnvelope => write!(f, "snap returned a malformed response envelope"),
            Self::Codec(msg) => write!(f, "codec error: {}", msg),
            Self::Endowment(msg) => write!(f, "endowment error: {}", msg),
            Self::EmptyParam(field) => write!(f, "'{}' must be a non-empty string", field),
            Self::Mux(e) => write!(f, "stream error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<mux::Error> for Error {
    fn from(e: mux::Error) -> Self {
        Self::Mux(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The wire error for a command that failed with this error.
    fn to_error_object(&self) -> ErrorObject {
        match self {
            Self::EmptyParam(_) => ErrorObject::invalid_params(self.to_string()),
            _ => ErrorObject::snap_error(self.to_string()),
        }
    }
}

/// The isolate-side controller: one per isolate, at most one snap.
pub struct WorkerController {
    command: Substream,
    provider_engine: RpcEngine,
    snaps: HashMap<SnapId, Compartment>,
    lockdown: &'static Lockdown,
}

impl WorkerController {
    /// Connects to the host transport with the default lockdown.
    pub fn new(transport: Box<dyn Transport>) -> Result<Self> {
        Self::with_lockdown(transport, LockdownConfig::default())
    }

    /// Connects to the host transport, installing (or agreeing with) the
    /// process-wide lockdown first: no snap evaluates before it.
    pub fn with_lockdown(transport: Box<dyn Transport>, config: LockdownConfig) -> Result<Self> {
        let lockdown = compartment::lockdown(config)?;

        let mux = ObjectMultiplexer::new(transport);
        let command = mux.substream(COMMAND_CHANNEL)?;
        let json_rpc = mux.substream(JSON_RPC_CHANNEL)?;

        // The provider speaks over its own engine so snap-originated calls
        // correlate independently of host commands.
        let provider_engine = RpcEngine::new(json_rpc, |error| {
            tracing::debug!(error = %error, "out-of-band error on provider channel");
        });

        Ok(Self {
            command,
            provider_engine,
            snaps: HashMap::new(),
            lockdown,
        })
    }

    /// Serves commands until the host closes the transport. The worker side
    /// shuts itself down when the stream ends.
    pub async fn run(mut self) {
        tracing::debug!("worker controller started");
        while let Some(payload) = self.command.recv().await {
            self.handle(payload).await;
        }
        tracing::debug!("command stream closed; worker shutting down");
    }

    async fn handle(&mut self, payload: Value) {
        let request = match Message::classify(payload) {
            Ok(Message::Request(request)) => request,
            Ok(Message::Response(_)) => {
                tracing::warn!("dropping unexpected response on command channel");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed command message");
                return;
            }
        };

        // No id means no way to correlate an answer: log and stay silent.
        let Some(id) = request.id.clone() else {
            tracing::warn!(method = %request.method, "dropping id-less command");
            return;
        };

        let response = self.dispatch(&request, id).await;
        let payload = match serde_json::to_value(&response) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode response");
                return;
            }
        };

        if let Err(e) = self.command.send(payload).await {
            tracing::warn!(error = %e, "failed to send response");
        }
    }

    async fn dispatch(&mut self, request: &Request, id: RequestId) -> Response {
        let command = match Command::from_request(request) {
            Ok(command) => command,
            Err(e) => return Response::err(id, ErrorObject::invalid_params(e.to_string())),
        };

        match command {
            Command::Ping => Response::ok(id, json!("OK")),
            Command::ExecuteSnap(params) => match self.execute_snap(params).await {
                Ok(()) => Response::ok(id, json!("OK")),
                Err(e) => Response::err(id, e.to_error_object()),
            },
            Command::SnapRpc(params) => match self.snap_rpc(params).await {
                Ok(result) => Response::ok(id, result),
                Err(e) => Response::err(id, e.to_error_object()),
            },
            Command::Unrecognized(method) => {
                Response::err(id, ErrorObject::method_not_found(&method))
            }
        }
    }

    async fn execute_snap(&mut self, params: ExecuteSnapParams) -> Result<()> {
        if params.snap_id.is_empty() {
            return Err(Error::EmptyParam("snapId"));
        }
        if params.source_code.is_empty() {
            return Err(Error::EmptyParam("sourceCode"));
        }
        if self.snaps.contains_key(&params.snap_id) {
            return Err(Error::AlreadyExecuting(params.snap_id));
        }

        let provider = SnapProvider::new(self.provider_engine.clone());
        let endowments = Endowments::new(provider, &self.lockdown.config);

        match Compartment::evaluate(
            self.lockdown,
            endowments,
            params.snap_id.clone(),
            &params.source_code,
        )
        .await
        {
            Ok(compartment) => {
                self.snaps.insert(params.snap_id, compartment);
                Ok(())
            }
            Err(e) => {
                // The failed compartment is gone, and with it any handler
                // the snap registered before throwing.
                tracing::error!(snap = %params.snap_id, error = %e, "snap evaluation failed");
                Err(e)
            }
        }
    }

    async fn snap_rpc(&mut self, params: SnapRpcParams) -> Result<Value> {
        let compartment = self
            .snaps
            .get_mut(&params.target)
            .ok_or_else(|| Error::UnknownTarget(params.target.clone()))?;

        compartment
            .invoke_handler(&params.origin, &params.request)
            .await
    }
}
