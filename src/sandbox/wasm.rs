//! WASI sandbox backed by wasmtime
//!
//! Every spawn gets its own `Store` and WASI context. The child sees only
//! the directories its permission set preopens; preview1 offers no socket
//! or process API, so nothing else is reachable from inside the guest.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use wasmtime::{Config, Engine, Linker, Module, Store};
use wasmtime_wasi::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, WasiCtxBuilder};

use super::error::{SandboxError, SandboxResult};
use super::handle::{
    ExitStatus, LogStream, SandboxEntry, SandboxEvent, SandboxEventSink, SandboxHandle,
};
use super::permissions::PermissionSet;
use super::SandboxBridge;

/// Settings for [`WasmSandbox`]
#[derive(Debug, Clone)]
pub struct WasmSandboxConfig {
    /// Interval between epoch ticks; bounds how long a forced stop takes
    pub epoch_tick: Duration,
    /// Capacity of each captured output stream
    pub max_output_bytes: usize,
    /// Host directories every grant must lie within
    pub host_roots: Vec<PathBuf>,
}

impl Default for WasmSandboxConfig {
    fn default() -> Self {
        Self {
            epoch_tick: Duration::from_millis(10),
            max_output_bytes: 1024 * 1024,
            host_roots: Vec::new(),
        }
    }
}

struct EpochTicker {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine, tick: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("deckrun-epoch".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(tick);
                    engine.increment_epoch();
                }
            })
            .ok();
        Self { stop, thread }
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Sandbox bridge running WASI preview1 modules
pub struct WasmSandbox {
    engine: Engine,
    modules: Mutex<HashMap<PathBuf, Module>>,
    config: WasmSandboxConfig,
    _ticker: EpochTicker,
}

impl WasmSandbox {
    pub fn new(config: WasmSandboxConfig) -> SandboxResult<Self> {
        let mut wasm_config = Config::new();
        wasm_config.async_support(true);
        wasm_config.epoch_interruption(true);

        let engine = Engine::new(&wasm_config)
            .map_err(|e| SandboxError::wasm_load(format!("Failed to create WASM engine: {}", e)))?;
        let ticker = EpochTicker::start(engine.clone(), config.epoch_tick);

        Ok(Self {
            engine,
            modules: Mutex::new(HashMap::new()),
            config,
            _ticker: ticker,
        })
    }

    pub fn config(&self) -> &WasmSandboxConfig {
        &self.config
    }

    /// Compile a module, reusing the cached copy for a path seen before
    pub fn module(&self, path: &Path) -> SandboxResult<Module> {
        let key = path
            .canonicalize()
            .map_err(|_| SandboxError::ModuleNotFound(path.to_path_buf()))?;

        let mut modules = self
            .modules
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(module) = modules.get(&key) {
            return Ok(module.clone());
        }

        let module = Module::from_file(&self.engine, &key).map_err(|e| {
            SandboxError::wasm_load(format!("Failed to compile {}: {}", key.display(), e))
        })?;
        debug!(target: "deckrun::sandbox", module = %key.display(), "module compiled");
        modules.insert(key, module.clone());
        Ok(module)
    }

    fn build_context(
        &self,
        entry: &SandboxEntry,
        granted: &PermissionSet,
        input: &Value,
        stdout: &MemoryOutputPipe,
        stderr: &MemoryOutputPipe,
    ) -> SandboxResult<WasiP1Ctx> {
        let stdin = serde_json::to_vec(input)
            .map_err(|e| SandboxError::spawn(format!("Failed to encode child input: {}", e)))?;

        let mut builder = WasiCtxBuilder::new();
        builder
            .stdin(MemoryInputPipe::new(stdin))
            .stdout(stdout.clone())
            .stderr(stderr.clone())
            .args(&[entry.path.display().to_string()]);

        for dir in &granted.read {
            builder
                .preopened_dir(dir, dir.to_string_lossy(), DirPerms::READ, FilePerms::READ)
                .map_err(|e| preopen_error(dir, e))?;
        }
        for dir in &granted.write {
            builder
                .preopened_dir(dir, dir.to_string_lossy(), DirPerms::all(), FilePerms::all())
                .map_err(|e| preopen_error(dir, e))?;
        }

        Ok(builder.build_p1())
    }
}

#[async_trait]
impl SandboxBridge for WasmSandbox {
    async fn spawn(
        &self,
        entry: &SandboxEntry,
        permissions: &PermissionSet,
        input: Value,
    ) -> SandboxResult<SandboxHandle> {
        if !permissions.net.is_empty() {
            return Err(SandboxError::UnsupportedGrant(format!(
                "network access to {} (WASI children have no sockets)",
                permissions.net.join(", ")
            )));
        }
        if permissions.run {
            return Err(SandboxError::UnsupportedGrant(
                "subprocess execution (WASI children cannot spawn processes)".to_string(),
            ));
        }

        let granted = permissions.validate_within(&self.config.host_roots)?;
        let module = self.module(&entry.path)?;

        let stdout = MemoryOutputPipe::new(self.config.max_output_bytes);
        let stderr = MemoryOutputPipe::new(self.config.max_output_bytes);
        let ctx = self.build_context(entry, &granted, &input, &stdout, &stderr)?;

        let mut store = Store::new(&self.engine, ctx);
        store.epoch_deadline_async_yield_and_update(1);

        let mut linker: Linker<WasiP1Ctx> = Linker::new(&self.engine);
        preview1::add_to_linker_async(&mut linker, |ctx| ctx)
            .map_err(|e| SandboxError::wasm_load(format!("Failed to link WASI: {}", e)))?;

        let id = uuid::Uuid::new_v4().to_string();
        let (sink, handle) = SandboxHandle::channel(id.clone());
        debug!(
            target: "deckrun::sandbox",
            handle = %id,
            entry = %entry,
            read = granted.read.len(),
            write = granted.write.len(),
            "spawning child"
        );

        let task = tokio::spawn(run_child(store, linker, module, stdout, stderr, sink));
        handle.attach_task(task.abort_handle());
        Ok(handle)
    }

    fn name(&self) -> &str {
        "wasm"
    }
}

async fn run_child(
    mut store: Store<WasiP1Ctx>,
    linker: Linker<WasiP1Ctx>,
    module: Module,
    stdout: MemoryOutputPipe,
    stderr: MemoryOutputPipe,
    sink: SandboxEventSink,
) {
    let cancel = sink.cancellation();
    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        status = execute(&mut store, &linker, &module) => status,
    };

    for line in lines(&stdout.contents()) {
        sink.emit(parse_stdout_line(&line));
    }
    for line in lines(&stderr.contents()) {
        sink.emit(SandboxEvent::Log {
            stream: LogStream::Stderr,
            line,
        });
    }
    sink.emit(SandboxEvent::Finished { status });
}

async fn execute(
    store: &mut Store<WasiP1Ctx>,
    linker: &Linker<WasiP1Ctx>,
    module: &Module,
) -> ExitStatus {
    let instance = match linker.instantiate_async(&mut *store, module).await {
        Ok(instance) => instance,
        Err(e) => return ExitStatus::Trapped(format!("instantiation failed: {}", e)),
    };
    let start = match instance.get_typed_func::<(), ()>(&mut *store, "_start") {
        Ok(start) => start,
        Err(e) => return ExitStatus::Trapped(format!("missing _start export: {}", e)),
    };

    match start.call_async(&mut *store, ()).await {
        Ok(()) => ExitStatus::Success,
        Err(e) => match e.downcast_ref::<I32Exit>() {
            Some(I32Exit(0)) => ExitStatus::Success,
            Some(I32Exit(code)) => ExitStatus::Failed(*code),
            None => ExitStatus::Trapped(e.to_string()),
        },
    }
}

/// Decode one stdout line of the child protocol.
///
/// `{"type":"result","value":..}` and `{"type":"error","message":..}` are
/// structured; everything else is a log line.
pub fn parse_stdout_line(line: &str) -> SandboxEvent {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(line) {
        match map.get("type").and_then(Value::as_str) {
            Some("result") => {
                return SandboxEvent::Result {
                    value: map.get("value").cloned().unwrap_or(Value::Null),
                }
            }
            Some("error") => {
                let message = map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("child reported an error")
                    .to_string();
                return SandboxEvent::Error { message };
            }
            _ => {}
        }
    }
    SandboxEvent::Log {
        stream: LogStream::Stdout,
        line: line.to_string(),
    }
}

fn lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect()
}

fn preopen_error(dir: &Path, err: impl std::fmt::Display) -> SandboxError {
    SandboxError::UnresolvedPath {
        path: dir.to_path_buf(),
        reason: err.to_string(),
    }
}
