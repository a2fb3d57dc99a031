//! Default-deny permission sets for sandboxed children
//!
//! A [`PermissionSet`] lists exactly what a child may touch. Anything not
//! listed is denied. Paths are canonicalized before use so symlinks and
//! `..` segments cannot widen a grant.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::error::{SandboxError, SandboxResult};

/// Explicit allow-list of capabilities for one execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    /// Directories the child may read
    #[serde(default)]
    pub read: Vec<PathBuf>,
    /// Directories the child may read and write
    #[serde(default)]
    pub write: Vec<PathBuf>,
    /// Network hosts the child may contact
    #[serde(default)]
    pub net: Vec<String>,
    /// Whether the child may spawn subprocesses
    #[serde(default)]
    pub run: bool,
}

impl PermissionSet {
    /// Deny everything
    pub fn none() -> Self {
        Self::default()
    }

    pub fn allow_read(mut self, path: impl Into<PathBuf>) -> Self {
        self.read.push(path.into());
        self
    }

    pub fn allow_write(mut self, path: impl Into<PathBuf>) -> Self {
        self.write.push(path.into());
        self
    }

    pub fn allow_net(mut self, host: impl Into<String>) -> Self {
        self.net.push(host.into());
        self
    }

    pub fn allow_run(mut self) -> Self {
        self.run = true;
        self
    }

    /// True when nothing is granted
    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty() && self.net.is_empty() && !self.run
    }

    /// Anchor relative grants at `base`
    pub fn relative_to(&self, base: &Path) -> Self {
        let anchor = |p: &PathBuf| {
            if p.is_absolute() {
                p.clone()
            } else {
                base.join(p)
            }
        };
        Self {
            read: self.read.iter().map(anchor).collect(),
            write: self.write.iter().map(anchor).collect(),
            net: self.net.clone(),
            run: self.run,
        }
    }

    /// Canonicalize every path grant and check it lies inside one of
    /// `host_roots`.
    ///
    /// Write grants imply read access on the same directory. The returned
    /// set is the one handed to the sandbox.
    pub fn validate_within(&self, host_roots: &[PathBuf]) -> SandboxResult<PermissionSet> {
        let roots = host_roots
            .iter()
            .map(|root| canonical(root))
            .collect::<SandboxResult<Vec<_>>>()?;

        let contain = |path: &PathBuf| -> SandboxResult<PathBuf> {
            let resolved = canonical(path)?;
            if roots.iter().any(|root| resolved.starts_with(root)) {
                Ok(resolved)
            } else {
                Err(SandboxError::OutsideBoundary { path: path.clone() })
            }
        };

        let write = dedup(self.write.iter().map(contain).collect::<SandboxResult<_>>()?);
        let mut read: Vec<PathBuf> = self.read.iter().map(contain).collect::<SandboxResult<_>>()?;
        read.retain(|p| !write.contains(p));

        Ok(PermissionSet {
            read: dedup(read),
            write,
            net: self.net.clone(),
            run: self.run,
        })
    }

    /// Whether `path` is readable under this (validated) set
    pub fn permits_read(&self, path: &Path) -> bool {
        self.read
            .iter()
            .chain(self.write.iter())
            .any(|root| path.starts_with(root))
    }

    /// Whether `path` is writable under this (validated) set
    pub fn permits_write(&self, path: &Path) -> bool {
        self.write.iter().any(|root| path.starts_with(root))
    }
}

fn canonical(path: &Path) -> SandboxResult<PathBuf> {
    path.canonicalize()
        .map_err(|e| SandboxError::UnresolvedPath {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn dedup(mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen = Vec::with_capacity(paths.len());
    paths.retain(|p| {
        if seen.contains(p) {
            false
        } else {
            seen.push(p.clone());
            true
        }
    });
    paths
}
