//! # Snap provider
//!
//! The `wallet` endowment: the one object a snap uses to talk back to the
//! host. It carries exactly two bindings — handler registration, and
//! request forwarding over the snap-provider channel.

use serde_json::Value;
use wasmtime::Caller;
use wasmtime::Extern;
use wasmtime::Linker;

use crate::engine::RpcEngine;
use crate::worker::endowment::read_guest;
use crate::worker::endowment::write_guest_alloc;
use crate::worker::endowment::SnapCtx;
use crate::worker::Error;
use crate::worker::Result;

/// JSON-RPC inpage provider bound to the `jsonRpc` substream, exposed to
/// the compartment under the name `wallet`.
#[derive(Clone)]
pub struct SnapProvider {
    engine: RpcEngine,
}

impl SnapProvider {
    pub fn new(engine: RpcEngine) -> Self {
        Self { engine }
    }

    pub(crate) fn link(&self, linker: &mut Linker<SnapCtx>) -> Result<()> {
        self.link_register(linker)?;
        self.link_request(linker)?;
        Ok(())
    }

    /// `wallet.register_rpc_handler(name)` — records the named export as
    /// the snap's RPC handler.
    ///
    /// # Invariants
    /// - The name must refer to an exported function of the calling module.
    /// - Registration happens at most once per snap; a second call is a
    ///   fatal snap error (trap).
    fn link_register(&self, linker: &mut Linker<SnapCtx>) -> Result<()> {
        linker
            .func_wrap(
                "wallet",
                "register_rpc_handler",
                |mut caller: Caller<'_, SnapCtx>, ptr: i32, len: i32| -> anyhow::Result<()> {
                    let bytes = read_guest(&mut caller, ptr, len)?;
                    let name = String::from_utf8(bytes)
                        .map_err(|_| anyhow::anyhow!("handler name is not UTF-8"))?;

                    match caller.get_export(&name) {
                        Some(Extern::Func(_)) => {}
                        _ => anyhow::bail!("'{}' is not an exported function", name),
                    }

                    let ctx = caller.data_mut();
                    if ctx.handler.is_some() {
                        anyhow::bail!("RPC message handler already registered");
                    }
                    ctx.handler = Some(name);
                    Ok(())
                },
            )
            .map_err(Error::Link)?;
        Ok(())
    }

    /// `wallet.request(bytes)` — forwards a `{method, params?}` request to
    /// the host over the snap-provider channel and returns the correlated
    /// outcome as an `{"ok": ...}` / `{"err": ...}` envelope.
    fn link_request(&self, linker: &mut Linker<SnapCtx>) -> Result<()> {
        let engine = self.engine.clone();
        linker
            .func_wrap_async(
                "wallet",
                "request",
                move |mut caller: Caller<'_, SnapCtx>, (ptr, len): (i32, i32)| {
                    let engine = engine.clone();
                    Box::new(async move {
                        let bytes = read_guest(&mut caller, ptr, len)?;
                        let envelope = match forward(&engine, &bytes).await {
                            Ok(result) => serde_json::json!({ "ok": result }),
                            Err(message) => serde_json::json!({ "err": message }),
                        };

                        let bytes = serde_json::to_vec(&envelope)
                            .map_err(|e| anyhow::anyhow!("encoding provider response: {}", e))?;
                        write_guest_alloc(&mut caller, &bytes).await
                    })
                },
            )
            .map_err(Error::Link)?;
        Ok(())
    }
}

/// Decodes a guest request and drives it through the provider engine. The
/// provider assigns the JSON-RPC id; guests only name a method and params.
async fn forward(engine: &RpcEngine, bytes: &[u8]) -> std::result::Result<Value, String> {
    let request: Value =
        serde_json::from_slice(bytes).map_err(|e| format!("malformed request: {}", e))?;

    let method = request
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| "request has no method".to_string())?
        .to_string();
    let params = request.get("params").cloned();

    engine
        .call_method(method, params)
        .await
        .map_err(|e| e.to_string())
}
