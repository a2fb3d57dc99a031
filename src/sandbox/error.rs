//! Sandbox error types

use std::path::PathBuf;
use thiserror::Error;

/// Result type for sandbox operations
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors raised while preparing or running a sandboxed child
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Module file missing
    #[error("Sandbox module not found: {0}")]
    ModuleNotFound(PathBuf),

    /// Module failed to compile or link
    #[error("WASM load error: {0}")]
    WasmLoad(String),

    /// A grant could not be resolved on the host
    #[error("Permission path '{path}' cannot be resolved: {reason}")]
    UnresolvedPath { path: PathBuf, reason: String },

    /// A grant lies outside every host root
    #[error("Permission path '{path}' is outside the allowed host roots")]
    OutsideBoundary { path: PathBuf },

    /// A grant the isolation boundary cannot express
    #[error("Unsupported grant: {0}")]
    UnsupportedGrant(String),

    /// Runtime failure while starting the child
    #[error("Sandbox spawn failed: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn spawn<S: Into<String>>(message: S) -> Self {
        Self::Spawn(message.into())
    }

    pub fn wasm_load<S: Into<String>>(message: S) -> Self {
        Self::WasmLoad(message.into())
    }

    /// True when the failure comes from the permission set, not the runtime
    pub fn is_permission_error(&self) -> bool {
        matches!(
            self,
            SandboxError::UnresolvedPath { .. }
                | SandboxError::OutsideBoundary { .. }
                | SandboxError::UnsupportedGrant(_)
        )
    }
}
