//! TOML configuration parsing and management.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::environment::EnvironmentLoader;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub handlers: HandlersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Turn loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Pass ceiling for decks that set none
    pub default_max_passes: u32,
    /// Use streaming model calls when the provider supports them
    pub streaming: bool,
    /// `chat` or `item-based`
    pub session_format: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_max_passes: 50,
            streaming: true,
            session_format: "chat".to_string(),
        }
    }
}

/// Session storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Storage root (defaults to `~/.deckrun`)
    pub storage_dir: Option<PathBuf>,
    /// Events between snapshot rewrites
    pub snapshot_interval: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            snapshot_interval: 25,
        }
    }
}

/// Sandbox settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub epoch_tick_ms: u64,
    pub max_output_bytes: usize,
    /// Host roots child grants must lie within; empty means the project dir
    pub allowed_roots: Vec<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            epoch_tick_ms: 10,
            max_output_bytes: 1024 * 1024,
            allowed_roots: Vec::new(),
        }
    }
}

/// Default handler timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlersConfig {
    pub busy_delay_ms: u64,
    pub idle_delay_ms: u64,
}

impl Default for HandlersConfig {
    fn default() -> Self {
        Self {
            busy_delay_ms: 800,
            idle_delay_ms: 30_000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Run journal path; a temp file is used when unset
    pub log_file: Option<PathBuf>,
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_file: None,
            log_level: "INFO".to_string(),
        }
    }
}

impl Configuration {
    /// Fold environment overrides into this configuration.
    pub fn apply_environment(&mut self, env: &EnvironmentLoader) {
        if let Some(home) = env.home() {
            self.session.storage_dir = Some(home);
        }
        if let Some(max_passes) = env.max_passes() {
            self.runtime.default_max_passes = max_passes;
        }
        if let Some(streaming) = env.streaming() {
            self.runtime.streaming = streaming;
        }
    }

    /// Storage root: `session.storage_dir` or `~/.deckrun`
    pub fn storage_home(&self) -> Result<PathBuf> {
        match &self.session.storage_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::home_dir()
                .map(|home| home.join(".deckrun"))
                .context("Could not determine home directory"),
        }
    }

    pub fn busy_delay(&self) -> Duration {
        Duration::from_millis(self.handlers.busy_delay_ms)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.handlers.idle_delay_ms)
    }

    /// Host roots for child grants
    pub fn host_roots(&self, project_dir: &Path) -> Vec<PathBuf> {
        if self.sandbox.allowed_roots.is_empty() {
            vec![project_dir.to_path_buf()]
        } else {
            self.sandbox
                .allowed_roots
                .iter()
                .map(|root| {
                    if root.is_absolute() {
                        root.clone()
                    } else {
                        project_dir.join(root)
                    }
                })
                .collect()
        }
    }

    /// Configured session format
    #[cfg(feature = "session")]
    pub fn session_format(&self) -> Result<crate::session::SessionFormat> {
        crate::session::SessionFormat::parse(&self.runtime.session_format).with_context(|| {
            format!(
                "Unknown session format '{}' (expected chat or item-based)",
                self.runtime.session_format
            )
        })
    }

    /// Open the session store for a project
    #[cfg(feature = "session")]
    pub fn open_store(&self, project_dir: &Path) -> Result<crate::session::SessionStore> {
        let store = crate::session::SessionStore::new(self.storage_home()?, project_dir)
            .with_context(|| format!("Failed to open session store for {}", project_dir.display()))?;
        Ok(store.with_snapshot_interval(self.session.snapshot_interval))
    }

    /// WASI sandbox settings
    #[cfg(feature = "sandbox")]
    pub fn sandbox_config(&self, project_dir: &Path) -> crate::sandbox::WasmSandboxConfig {
        crate::sandbox::WasmSandboxConfig {
            epoch_tick: Duration::from_millis(self.sandbox.epoch_tick_ms.max(1)),
            max_output_bytes: self.sandbox.max_output_bytes,
            host_roots: self.host_roots(project_dir),
        }
    }

    /// Run journal at the configured path and level
    #[cfg(feature = "observability")]
    pub fn journal(&self) -> Result<crate::observability::Logger> {
        crate::observability::Logger::new(
            self.logging.log_file.as_deref(),
            Some(self.logging.log_level.as_str()),
        )
        .context("Failed to open run journal")
    }

    /// Deck resolution defaults
    #[cfg(feature = "orchestration")]
    pub fn resolve_options(&self, project_dir: &Path) -> crate::deck::ResolveOptions {
        crate::deck::ResolveOptions {
            default_max_passes: self.runtime.default_max_passes,
            busy_delay: self.busy_delay(),
            idle_delay: self.idle_delay(),
            host_roots: self.host_roots(project_dir),
        }
    }
}

/// Loads and manages TOML configuration.
#[derive(Debug)]
pub struct ConfigurationLoader {
    pub config_path: PathBuf,
    pub config: Configuration,
}

impl ConfigurationLoader {
    /// Initialize configuration loader.
    ///
    /// # Arguments
    /// * `config_path` - Path to TOML config file. If None, `deckrun.toml` is
    ///   tried; a missing file yields the defaults.
    pub fn new(config_path: Option<&Path>) -> Result<Self> {
        let config_path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("deckrun.toml"));

        let config = if config_path.exists() {
            Self::load_config(&config_path)?
        } else {
            Configuration::default()
        };

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Wrap an already parsed configuration.
    pub fn from_config(config: Configuration) -> Self {
        Self {
            config_path: PathBuf::from("deckrun.toml"),
            config,
        }
    }

    fn load_config(path: &Path) -> Result<Configuration> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
    }

    /// Get configuration value by dot-notation key.
    pub fn get_string(&self, key: &str) -> Option<String> {
        let config = &self.config;
        match key {
            "runtime.session_format" => Some(config.runtime.session_format.clone()),
            "session.storage_dir" => config
                .session
                .storage_dir
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            "logging.log_file" => config
                .logging
                .log_file
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            "logging.log_level" => Some(config.logging.log_level.clone()),
            _ => None,
        }
    }

    /// Get numeric configuration value.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        let config = &self.config;
        match key {
            "runtime.default_max_passes" => Some(config.runtime.default_max_passes as u64),
            "session.snapshot_interval" => Some(config.session.snapshot_interval),
            "sandbox.epoch_tick_ms" => Some(config.sandbox.epoch_tick_ms),
            "sandbox.max_output_bytes" => Some(config.sandbox.max_output_bytes as u64),
            "handlers.busy_delay_ms" => Some(config.handlers.busy_delay_ms),
            "handlers.idle_delay_ms" => Some(config.handlers.idle_delay_ms),
            _ => None,
        }
    }

    /// Get boolean configuration value.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match key {
            "runtime.streaming" => Some(self.config.runtime.streaming),
            _ => None,
        }
    }
}
