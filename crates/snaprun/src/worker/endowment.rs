//! # Endowments
//!
//! The closed set of capabilities a snap may see. Each endowment is a host
//! component that links its bindings under its own import module; anything
//! not linked here is simply not reachable from inside the compartment.
//! Integer bignums and byte buffers need no binding at all: they are native
//! to the compartment primitive (i64 and linear memory).
//!
//! Every binding is also aliased under the shadow module `window`, so
//! modules that probe `window` for a capability still link.

use std::collections::HashMap;

use rand::rngs::OsRng;
use rand::rngs::StdRng;
use rand::Rng as _;
use rand::RngCore;
use rand::SeedableRng;
use sha2::Digest;
use sha2::Sha256;
use tokio::net::TcpStream;
use wasmtime::Caller;
use wasmtime::Extern;
use wasmtime::Linker;

use snaprpc::SnapId;

use crate::worker::compartment::Taming;
use crate::worker::provider::SnapProvider;
use crate::worker::Error;
use crate::worker::Result;

/// Per-compartment state reachable from host bindings.
pub struct SnapCtx {
    pub(crate) snap_id: SnapId,
    /// Name of the exported function registered as the snap's RPC handler.
    pub(crate) handler: Option<String>,
    pub(crate) rng: StdRng,
    pub(crate) http: reqwest::Client,
    pub(crate) sockets: HashMap<u32, TcpStream>,
    pub(crate) next_socket: u32,
}

/// The endowment map: an enumerated, closed record. Building a compartment
/// means linking exactly these fields; nothing else resolves.
pub struct Endowments {
    pub console: Console,
    pub crypto: Crypto,
    pub date: Clock,
    pub math: Math,
    pub timer: Timer,
    pub http: Http,
    pub socket: Socket,
    pub wallet: SnapProvider,
}

/// Import modules carried by the endowment map, in link order. The same
/// list is aliased under `window`.
const ENDOWMENT_MODULES: &[&str] = &[
    "console", "crypto", "date", "math", "timer", "http", "socket", "wallet",
];

impl Endowments {
    /// Assembles the endowment map for one snap, shaped by the lockdown
    /// tamings.
    pub fn new(wallet: SnapProvider, config: &crate::worker::compartment::LockdownConfig) -> Self {
        Self {
            console: Console {
                forward: matches!(config.console_taming, Taming::Unsafe),
            },
            crypto: Crypto,
            date: Clock {
                real: matches!(config.date_taming, Taming::Unsafe),
            },
            math: Math,
            timer: Timer,
            http: Http,
            socket: Socket,
            wallet,
        }
    }

    /// Installs every endowment into the linker, then mirrors the whole set
    /// under the `window` shadow module.
    pub fn link(&self, linker: &mut Linker<SnapCtx>) -> Result<()> {
        self.console.link(linker)?;
        self.crypto.link(linker)?;
        self.date.link(linker)?;
        self.math.link(linker)?;
        self.timer.link(linker)?;
        self.http.link(linker)?;
        self.socket.link(linker)?;
        self.wallet.link(linker)?;

        for module in ENDOWMENT_MODULES {
            linker
                .alias_module(module, "window")
                .map_err(Error::Link)?;
        }

        Ok(())
    }

    /// Builds the store context backing the bindings. The math taming picks
    /// the entropy source: OS entropy, or a fixed seed for deterministic
    /// replay.
    pub fn into_ctx(
        self,
        snap_id: SnapId,
        config: &crate::worker::compartment::LockdownConfig,
    ) -> Result<SnapCtx> {
        let rng = match config.math_taming {
            Taming::Unsafe => StdRng::from_entropy(),
            Taming::Safe => StdRng::seed_from_u64(0),
        };

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Endowment(e.to_string()))?;

        Ok(SnapCtx {
            snap_id,
            handler: None,
            rng,
            http,
            sockets: HashMap::new(),
            next_socket: 1,
        })
    }
}

/// Console endowment: guest log lines, forwarded to host logging unless
/// tamed away.
pub struct Console {
    forward: bool,
}

impl Console {
    fn link(&self, linker: &mut Linker<SnapCtx>) -> Result<()> {
        let forward = self.forward;
        linker
            .func_wrap(
                "console",
                "log",
                move |mut caller: Caller<'_, SnapCtx>, level: i32, ptr: i32, len: i32| -> anyhow::Result<()> {
                    let bytes = read_guest(&mut caller, ptr, len)?;
                    if forward {
                        let snap_id = caller.data().snap_id.clone();
                        let line = String::from_utf8_lossy(&bytes).into_owned();
                        match level {
                            0 => tracing::debug!(snap = %snap_id, "{}", line),
                            1 => tracing::info!(snap = %snap_id, "{}", line),
                            2 => tracing::warn!(snap = %snap_id, "{}", line),
                            _ => tracing::error!(snap = %snap_id, "{}", line),
                        }
                    }
                    Ok(())
                },
            )
            .map_err(Error::Link)?;
        Ok(())
    }
}

/// Crypto endowment: platform entropy plus a subtle-crypto digest.
pub struct Crypto;

impl Crypto {
    fn link(&self, linker: &mut Linker<SnapCtx>) -> Result<()> {
        linker
            .func_wrap(
                "crypto",
                "random_fill",
                |mut caller: Caller<'_, SnapCtx>, ptr: i32, len: i32| -> anyhow::Result<()> {
                    let mut buf = vec![0u8; len as u32 as usize];
                    OsRng.fill_bytes(&mut buf);
                    write_guest_at(&mut caller, ptr, &buf)
                },
            )
            .map_err(Error::Link)?;

        linker
            .func_wrap(
                "crypto",
                "digest",
                |mut caller: Caller<'_, SnapCtx>, ptr: i32, len: i32, out_ptr: i32| -> anyhow::Result<()> {
                    let bytes = read_guest(&mut caller, ptr, len)?;
                    let digest = Sha256::digest(&bytes);
                    write_guest_at(&mut caller, out_ptr, &digest)
                },
            )
            .map_err(Error::Link)?;

        Ok(())
    }
}

/// Date endowment: wall-clock milliseconds, or a fixed epoch when tamed.
pub struct Clock {
    real: bool,
}

impl Clock {
    fn link(&self, linker: &mut Linker<SnapCtx>) -> Result<()> {
        let real = self.real;
        linker
            .func_wrap("date", "now_ms", move |_caller: Caller<'_, SnapCtx>| {
                if real {
                    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
                        Ok(elapsed) => elapsed.as_millis() as f64,
                        Err(_) => 0.0,
                    }
                } else {
                    0.0
                }
            })
            .map_err(Error::Link)?;
        Ok(())
    }
}

/// Math endowment: uniform doubles in `[0, 1)` from the store's generator.
pub struct Math;

impl Math {
    fn link(&self, linker: &mut Linker<SnapCtx>) -> Result<()> {
        linker
            .func_wrap("math", "random", |mut caller: Caller<'_, SnapCtx>| {
                caller.data_mut().rng.gen::<f64>()
            })
            .map_err(Error::Link)?;
        Ok(())
    }
}

/// Timer endowment: cooperative delay on the isolate's event loop.
pub struct Timer;

impl Timer {
    fn link(&self, linker: &mut Linker<SnapCtx>) -> Result<()> {
        linker
            .func_wrap_async(
                "timer",
                "sleep_ms",
                |_caller: Caller<'_, SnapCtx>, (ms,): (i64,)| {
                    Box::new(async move {
                        tokio::time::sleep(std::time::Duration::from_millis(ms as u64)).await;
                        anyhow::Ok(())
                    })
                },
            )
            .map_err(Error::Link)?;
        Ok(())
    }
}

/// Fetch/XHR endowment: HTTP bound to the worker scope. Failures come back
/// as error envelopes rather than traps so snaps can handle them.
pub struct Http;

impl Http {
    fn link(&self, linker: &mut Linker<SnapCtx>) -> Result<()> {
        linker
            .func_wrap_async(
                "http",
                "fetch",
                |mut caller: Caller<'_, SnapCtx>,
                 (method_ptr, method_len, url_ptr, url_len, body_ptr, body_len): (
                    i32,
                    i32,
                    i32,
                    i32,
                    i32,
                    i32,
                )| {
                    Box::new(async move {
                        let method = read_guest(&mut caller, method_ptr, method_len)?;
                        let url = read_guest(&mut caller, url_ptr, url_len)?;
                        let body = read_guest(&mut caller, body_ptr, body_len)?;
                        let method = String::from_utf8_lossy(&method).into_owned();
                        let url = String::from_utf8_lossy(&url).into_owned();

                        let client = caller.data().http.clone();
                        let envelope = match fetch(&client, &method, &url, body).await {
                            Ok(value) => serde_json::json!({ "ok": value }),
                            Err(message) => serde_json::json!({ "err": message }),
                        };

                        let bytes = serde_json::to_vec(&envelope)
                            .map_err(|e| anyhow::anyhow!("encoding fetch response: {}", e))?;
                        write_guest_alloc(&mut caller, &bytes).await
                    })
                },
            )
            .map_err(Error::Link)?;
        Ok(())
    }
}

async fn fetch(
    client: &reqwest::Client,
    method: &str,
    url: &str,
    body: Vec<u8>,
) -> std::result::Result<serde_json::Value, String> {
    let method =
        reqwest::Method::from_bytes(method.as_bytes()).map_err(|e| e.to_string())?;
    let mut request = client.request(method, url);
    if !body.is_empty() {
        request = request.body(body);
    }
    let response = request.send().await.map_err(|e| e.to_string())?;
    let status = response.status().as_u16();
    let body = response.text().await.map_err(|e| e.to_string())?;
    Ok(serde_json::json!({ "status": status, "body": body }))
}

/// Socket endowment: byte-stream connections in the worker scope.
pub struct Socket;

impl Socket {
    fn link(&self, linker: &mut Linker<SnapCtx>) -> Result<()> {
        linker
            .func_wrap_async(
                "socket",
                "connect",
                |mut caller: Caller<'_, SnapCtx>, (addr_ptr, addr_len): (i32, i32)| {
                    Box::new(async move {
                        let addr = read_guest(&mut caller, addr_ptr, addr_len)?;
                        let addr = String::from_utf8_lossy(&addr).into_owned();
                        let stream = TcpStream::connect(&addr)
                            .await
                            .map_err(|e| anyhow::anyhow!("connect {}: {}", addr, e))?;

                        let ctx = caller.data_mut();
                        let handle = ctx.next_socket;
                        ctx.next_socket += 1;
                        ctx.sockets.insert(handle, stream);
                        anyhow::Ok(handle as i32)
                    })
                },
            )
            .map_err(Error::Link)?;

        linker
            .func_wrap_async(
                "socket",
                "send",
                |mut caller: Caller<'_, SnapCtx>, (handle, ptr, len): (i32, i32, i32)| {
                    Box::new(async move {
                        use tokio::io::AsyncWriteExt;

                        let bytes = read_guest(&mut caller, ptr, len)?;
                        let stream = caller
                            .data_mut()
                            .sockets
                            .get_mut(&(handle as u32))
                            .ok_or_else(|| anyhow::anyhow!("unknown socket handle {}", handle))?;
                        stream
                            .write_all(&bytes)
                            .await
                            .map_err(|e| anyhow::anyhow!("socket send: {}", e))?;
                        anyhow::Ok(())
                    })
                },
            )
            .map_err(Error::Link)?;

        linker
            .func_wrap_async(
                "socket",
                "recv",
                |mut caller: Caller<'_, SnapCtx>, (handle, max_len): (i32, i32)| {
                    Box::new(async move {
                        use tokio::io::AsyncReadExt;

                        let mut buf = vec![0u8; max_len as u32 as usize];
                        let n = {
                            let stream = caller
                                .data_mut()
                                .sockets
                                .get_mut(&(handle as u32))
                                .ok_or_else(|| anyhow::anyhow!("unknown socket handle {}", handle))?;
                            stream
                                .read(&mut buf)
                                .await
                                .map_err(|e| anyhow::anyhow!("socket recv: {}", e))?
                        };
                        write_guest_alloc(&mut caller, &buf[..n]).await
                    })
                },
            )
            .map_err(Error::Link)?;

        linker
            .func_wrap(
                "socket",
                "close",
                |mut caller: Caller<'_, SnapCtx>, handle: i32| -> anyhow::Result<()> {
                    caller.data_mut().sockets.remove(&(handle as u32));
                    Ok(())
                },
            )
            .map_err(Error::Link)?;

        Ok(())
    }
}

/// Packs a guest pointer and length into the i64 handler ABI value.
pub(crate) fn pack(ptr: i32, len: usize) -> i64 {
    (((ptr as u32 as u64) << 32) | (len as u32 as u64)) as i64
}

/// Copies `len` bytes out of the calling instance's exported memory.
pub(crate) fn read_guest(
    caller: &mut Caller<'_, SnapCtx>,
    ptr: i32,
    len: i32,
) -> anyhow::Result<Vec<u8>> {
    let memory = caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow::anyhow!("snap does not export a memory"))?;

    let start = ptr as u32 as usize;
    let end = start + len as u32 as usize;
    memory
        .data(&caller)
        .get(start..end)
        .map(|slice| slice.to_vec())
        .ok_or_else(|| anyhow::anyhow!("guest pointer out of bounds"))
}

/// Writes bytes into the calling instance's memory at a caller-provided
/// location.
pub(crate) fn write_guest_at(
    caller: &mut Caller<'_, SnapCtx>,
    ptr: i32,
    bytes: &[u8],
) -> anyhow::Result<()> {
    let memory = caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow::anyhow!("snap does not export a memory"))?;

    memory
        .write(&mut *caller, ptr as u32 as usize, bytes)
        .map_err(|_| anyhow::anyhow!("guest pointer out of bounds"))
}

/// Allocates space in the calling instance via its exported `alloc`, writes
/// the bytes there, and returns the packed pointer/length.
pub(crate) async fn write_guest_alloc(
    caller: &mut Caller<'_, SnapCtx>,
    bytes: &[u8],
) -> anyhow::Result<i64> {
    let alloc = caller
        .get_export("alloc")
        .and_then(Extern::into_func)
        .ok_or_else(|| anyhow::anyhow!("snap does not export alloc"))?;
    let alloc = alloc.typed::<i32, i32>(&*caller)?;

    let ptr = alloc.call_async(&mut *caller, bytes.len() as i32).await?;
    write_guest_at(caller, ptr, bytes)?;
    Ok(pack(ptr, bytes.len()))
}
