//! Observability for deck runs.
//!
//! Console output goes through `tracing`; the library never installs a
//! subscriber. [`Logger`] additionally keeps a markdown journal of each run.
//!
//! # Example
//!
//! ```no_run
//! use deckrun::observability::Logger;
//! use serde_json::json;
//!
//! let logger = Logger::new(None, Some("DEBUG")).unwrap();
//! logger.log_run_start("run-1", "decks/triage.json", "hello").unwrap();
//! logger.log_model_call("run-1", 1, &[json!({"role": "user", "content": "hello"})], "gpt-4o").unwrap();
//! logger.log_completion("run-1", "replied", 1).unwrap();
//! ```

pub mod logger;

pub use logger::Logger;
