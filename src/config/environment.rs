//! Environment overrides.
//!
//! Only host-level settings are read here. Provider credentials belong to
//! the provider adapters.

use std::env;
use std::path::{Path, PathBuf};

/// Overrides the session storage root
pub const HOME_VAR: &str = "DECKRUN_HOME";
/// Overrides `runtime.default_max_passes`
pub const MAX_PASSES_VAR: &str = "DECKRUN_MAX_PASSES";
/// Overrides `runtime.streaming`
pub const STREAMING_VAR: &str = "DECKRUN_STREAMING";

/// Loads environment variables from a .env file and the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentLoader {
    env_file: Option<PathBuf>,
}

impl EnvironmentLoader {
    /// Initialize the environment loader.
    ///
    /// # Arguments
    /// * `env_file` - Path to a .env file. Nothing is loaded when None, so
    ///   stray .env files in the working directory are never picked up.
    pub fn new(env_file: Option<&Path>) -> Self {
        if let Some(path) = env_file {
            if path.exists() {
                if let Err(e) = dotenv::from_path(path) {
                    tracing::warn!(target: "deckrun::config", path = %path.display(), error = %e, "failed to load .env file");
                }
            }
        }

        Self {
            env_file: env_file.map(Path::to_path_buf),
        }
    }

    pub fn env_file(&self) -> Option<&Path> {
        self.env_file.as_deref()
    }

    /// Session storage root override
    pub fn home(&self) -> Option<PathBuf> {
        env::var(HOME_VAR)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
    }

    /// Pass ceiling override; unparsable or zero values are ignored
    pub fn max_passes(&self) -> Option<u32> {
        env::var(MAX_PASSES_VAR)
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|&n| n > 0)
    }

    /// Streaming override (`true/false`, `1/0`, `yes/no`, `on/off`)
    pub fn streaming(&self) -> Option<bool> {
        let value = env::var(STREAMING_VAR).ok()?;
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    }
}
