//! Runtime configuration.
//!
//! Settings come from a TOML file and a handful of environment overrides,
//! optionally loaded from an explicit `.env` file.
//!
//! # Example
//!
//! ```no_run
//! use deckrun::config::{ConfigurationLoader, EnvironmentLoader};
//! use std::path::Path;
//!
//! let env = EnvironmentLoader::new(Some(Path::new(".env")));
//! let mut loader = ConfigurationLoader::new(Some(Path::new("deckrun.toml"))).unwrap();
//! loader.config.apply_environment(&env);
//!
//! println!("Max passes: {}", loader.config.runtime.default_max_passes);
//! println!("Streaming: {}", loader.config.runtime.streaming);
//! ```

pub mod config;
pub mod environment;

pub use self::config::{
    Configuration, ConfigurationLoader, HandlersConfig, LoggingConfig, RuntimeConfig,
    SandboxConfig, SessionConfig,
};
pub use self::environment::EnvironmentLoader;
