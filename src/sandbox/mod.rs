//! Sandbox bridge for child deck executions
//!
//! A child runs behind a [`SandboxBridge`]. The bridge receives the entry
//! module, a default-deny [`PermissionSet`] and the JSON input, and returns a
//! [`SandboxHandle`] that streams [`SandboxEvent`]s until the child finishes
//! or is terminated.
//!
//! [`WasmSandbox`] is the production bridge: wasmtime with WASI preview1,
//! where the permission set becomes the set of preopened directories.

mod error;
mod handle;
mod permissions;
mod wasm;

pub use error::{SandboxError, SandboxResult};
pub use handle::{
    ExitStatus, LogStream, SandboxEntry, SandboxEvent, SandboxEventSink, SandboxHandle,
};
pub use permissions::PermissionSet;
pub use wasm::{parse_stdout_line, WasmSandbox, WasmSandboxConfig};

use async_trait::async_trait;
use serde_json::Value;

/// Creates and destroys isolated execution contexts
#[async_trait]
pub trait SandboxBridge: Send + Sync {
    /// Start a child. Permissions are fixed for the life of the execution.
    async fn spawn(
        &self,
        entry: &SandboxEntry,
        permissions: &PermissionSet,
        input: Value,
    ) -> SandboxResult<SandboxHandle>;

    /// Force a child to stop; a second call is a no-op
    async fn terminate(&self, handle: &SandboxHandle) -> SandboxResult<()> {
        handle.terminate();
        Ok(())
    }

    /// Bridge name for logs
    fn name(&self) -> &str;
}
