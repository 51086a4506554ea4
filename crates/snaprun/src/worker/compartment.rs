//! # Compartment and lockdown
//!
//! A compartment is a sealed evaluation context: a store whose only
//! reachable bindings are the endowment map linked into it. Evaluating snap
//! source means compiling the UTF-8 text, instantiating it against that
//! map, and running its exported `_start` — the snap's top-level code.
//!
//! The lockdown is a process-wide, one-time hardening of the engine the
//! compartments share. It must run before any snap evaluates; attempting to
//! re-run it with a different taming configuration is an error.

use std::sync::OnceLock;

use serde_json::Value;
use wasmtime::Engine;
use wasmtime::Instance;
use wasmtime::Linker;
use wasmtime::Memory;
use wasmtime::Module;
use wasmtime::Store;
use wasmtime::TypedFunc;

use crate::worker::endowment::Endowments;
use crate::worker::endowment::SnapCtx;
use crate::worker::Error;
use crate::worker::Result;

/// How far an intrinsic is softened inside the compartment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Taming {
    /// The capability behaves deterministically or is silenced.
    Safe,
    /// The capability passes through to the real platform behavior.
    Unsafe,
}

/// How strictly the compartment rejects bindings outside the endowment map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverrideTaming {
    /// Unknown imports become trapping stubs: evaluation succeeds until the
    /// snap actually touches one.
    Moderate,
    /// Unknown imports fail instantiation outright.
    Severe,
}

/// Lockdown configuration. The worker installs the defaults on startup:
/// console unsafe, error unsafe, math unsafe, date unsafe, override severe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockdownConfig {
    pub console_taming: Taming,
    pub error_taming: Taming,
    pub math_taming: Taming,
    pub date_taming: Taming,
    pub override_taming: OverrideTaming,
}

impl Default for LockdownConfig {
    fn default() -> Self {
        Self {
            console_taming: Taming::Unsafe,
            error_taming: Taming::Unsafe,
            math_taming: Taming::Unsafe,
            date_taming: Taming::Unsafe,
            override_taming: OverrideTaming::Severe,
        }
    }
}

/// The hardened engine every compartment in this process shares.
pub struct Lockdown {
    pub(crate) engine: Engine,
    pub(crate) config: LockdownConfig,
}

static LOCKDOWN: OnceLock<Lockdown> = OnceLock::new();

/// Installs the process-wide lockdown, or returns the existing one.
///
/// The first caller's configuration wins; later calls must agree with it.
pub fn lockdown(config: LockdownConfig) -> Result<&'static Lockdown> {
    if LOCKDOWN.get().is_none() {
        let mut engine_config = wasmtime::Config::new();
        engine_config.async_support(true);
        let engine = Engine::new(&engine_config).map_err(Error::Engine)?;
        // A concurrent installer may win the race; the config check below
        // covers both outcomes.
        let _ = LOCKDOWN.set(Lockdown {
            engine,
            config: config.clone(),
        });
    }

    let installed = match LOCKDOWN.get() {
        Some(installed) => installed,
        None => return Err(Error::Lockdown("lockdown initialization failed".into())),
    };

    if installed.config != config {
        return Err(Error::Lockdown(
            "lockdown is already installed with a different configuration".into(),
        ));
    }

    Ok(installed)
}

/// A sealed evaluation context holding one evaluated snap.
///
/// Owns the store exclusively; all access to the snap's exports goes
/// through `&mut self`, which serializes intra-compartment work.
pub struct Compartment {
    store: Store<SnapCtx>,
    instance: Instance,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    error_taming: Taming,
}

impl Compartment {
    /// Compiles and evaluates snap source against the endowment map.
    ///
    /// Evaluation is instantiation plus the module's exported `_start`, if
    /// present. Any throw along the way drops the partially built
    /// compartment — including any handler registered before the throw.
    pub async fn evaluate(
        lockdown: &'static Lockdown,
        endowments: Endowments,
        snap_id: snaprpc::SnapId,
        source_code: &str,
    ) -> Result<Self> {
        let error_taming = lockdown.config.error_taming;
        let fail = |e: wasmtime::Error| Error::Evaluation(render_trap(error_taming, e));

        let module = Module::new(&lockdown.engine, source_code).map_err(fail)?;

        let mut linker: Linker<SnapCtx> = Linker::new(&lockdown.engine);
        endowments.link(&mut linker)?;
        if lockdown.config.override_taming == OverrideTaming::Moderate {
            linker
                .define_unknown_imports_as_traps(&module)
                .map_err(Error::Link)?;
        }

        let ctx = endowments.into_ctx(snap_id, &lockdown.config)?;
        let mut store = Store::new(&lockdown.engine, ctx);

        let instance = linker
            .instantiate_async(&mut store, &module)
            .await
            .map_err(fail)?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or(Error::MissingExport("memory"))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, "alloc")
            .map_err(|_| Error::MissingExport("alloc"))?;

        if let Some(start) = instance.get_func(&mut store, "_start") {
            let start = start
                .typed::<(), ()>(&store)
                .map_err(|_| Error::MissingExport("_start"))?;
            start.call_async(&mut store, ()).await.map_err(fail)?;
        }

        Ok(Self {
            store,
            instance,
            memory,
            alloc,
            error_taming,
        })
    }

    /// The handler name the snap registered during evaluation, if any.
    pub fn handler(&self) -> Option<&str> {
        self.store.data().handler.as_deref()
    }

    /// Invokes the snap's registered RPC handler with an origin-tagged
    /// request. Resolves to the value the handler returned in its `ok`
    /// envelope; an `err` envelope or a trap rejects.
    pub async fn invoke_handler(&mut self, origin: &str, request: &Value) -> Result<Value> {
        let name = match self.store.data().handler.clone() {
            Some(name) => name,
            None => return Err(Error::NoHandler(self.store.data().snap_id.clone())),
        };

        let handler = self
            .instance
            .get_typed_func::<(i32, i32, i32, i32), i64>(&mut self.store, &name)
            .map_err(|_| Error::MissingExport("rpc handler"))?;

        let request_bytes =
            serde_json::to_vec(request).map_err(|e| Error::Codec(e.to_string()))?;
        let origin_arg = self.copy_in(origin.as_bytes()).await?;
        let request_arg = self.copy_in(&request_bytes).await?;

        let packed = handler
            .call_async(
                &mut self.store,
                (origin_arg.0, origin_arg.1, request_arg.0, request_arg.1),
            )
            .await
            .map_err(|e| Error::Handler(render_trap(self.error_taming, e)))?;

        let bytes = self.copy_out(packed)?;
        let envelope: Value =
            serde_json::from_slice(&bytes).map_err(|_| Error::MalformedEnvelope)?;
        unwrap_envelope(envelope)
    }

    /// Allocates guest memory via the snap's `alloc` and copies bytes in.
    async fn copy_in(&mut self, bytes: &[u8]) -> Result<(i32, i32)> {
        let ptr = self
            .alloc
            .call_async(&mut self.store, bytes.len() as i32)
            .await
            .map_err(|e| Error::Handler(render_trap(self.error_taming, e)))?;

        self.memory
            .write(&mut self.store, ptr as u32 as usize, bytes)
            .map_err(|_| Error::OutOfBounds)?;

        Ok((ptr, bytes.len() as i32))
    }

    /// Copies a packed pointer/length of guest bytes out.
    fn copy_out(&self, packed: i64) -> Result<Vec<u8>> {
        let ptr = (packed as u64 >> 32) as usize;
        let len = (packed as u64 & 0xFFFF_FFFF) as usize;

        self.memory
            .data(&self.store)
            .get(ptr..ptr + len)
            .map(|slice| slice.to_vec())
            .ok_or(Error::OutOfBounds)
    }
}

/// Interprets a handler's returned envelope.
fn unwrap_envelope(envelope: Value) -> Result<Value> {
    let Value::Object(mut map) = envelope else {
        return Err(Error::MalformedEnvelope);
    };

    if let Some(err) = map.get("err") {
        let message = err.as_str().ok_or(Error::MalformedEnvelope)?;
        return Err(Error::Snap(message.to_string()));
    }

    map.remove("ok").ok_or(Error::MalformedEnvelope)
}

/// Renders a trap for reporting, honoring the error taming: unsafe passes
/// the full trap text through, safe redacts it.
fn render_trap(taming: Taming, error: wasmtime::Error) -> String {
    match taming {
        Taming::Unsafe => format!("{:#}", error),
        Taming::Safe => "snap execution failed".to_string(),
    }
}
