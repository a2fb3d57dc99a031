//! Markdown run journal.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Journal of deck runs.
///
/// Each run appends markdown sections to a single file: run start, model
/// calls and responses, tool executions, handler fires, errors and the final
/// status. Every entry is echoed to `tracing` under `deckrun::journal`.
#[derive(Debug)]
pub struct Logger {
    log_file: PathBuf,
    log_level: String,
}

impl Logger {
    /// Open or create a journal.
    ///
    /// # Arguments
    /// * `log_file` - Path to the journal. If None, a timestamped file is created in the temp directory.
    /// * `log_level` - Journal detail level (defaults to "INFO"). "DEBUG" includes full model history.
    pub fn new(log_file: Option<&Path>, log_level: Option<&str>) -> Result<Self> {
        let log_file = match log_file {
            Some(p) => p.to_path_buf(),
            None => {
                let dir = std::env::temp_dir().join("deckrun-logs");
                std::fs::create_dir_all(&dir).with_context(|| {
                    format!("Failed to create log directory: {}", dir.display())
                })?;
                dir.join(format!(
                    "run_{}_{}.md",
                    Utc::now().timestamp_millis(),
                    std::process::id()
                ))
            }
        };

        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
        }

        let logger = Self {
            log_file,
            log_level: log_level.unwrap_or("INFO").to_uppercase(),
        };

        if !logger.log_file.exists() {
            logger.initialize_log_file()?;
        }

        Ok(logger)
    }

    fn initialize_log_file(&self) -> Result<()> {
        let mut file = File::create(&self.log_file)
            .with_context(|| format!("Failed to create log file: {}", self.log_file.display()))?;

        let now: DateTime<Utc> = Utc::now();
        writeln!(file, "# Deck Run Journal\n")?;
        writeln!(file, "Log started: {}\n", now.to_rfc3339())?;
        writeln!(file, "---\n")?;
        Ok(())
    }

    fn append_to_log(&self, content: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .with_context(|| format!("Failed to open log file: {}", self.log_file.display()))?;

        write!(file, "{}", content).context("Failed to write to log file")?;
        Ok(())
    }

    fn is_debug(&self) -> bool {
        matches!(self.log_level.as_str(), "DEBUG" | "TRACE")
    }

    /// Log the start of a run.
    pub fn log_run_start(&self, run_id: &str, source: &str, input: &str) -> Result<()> {
        let now: DateTime<Utc> = Utc::now();
        let content = format!(
            "## Run Started - {}\n\n**Run:** {}\n**Deck:** {}\n**Input:**\n```\n{}\n```\n\n",
            now.to_rfc3339(),
            run_id,
            source,
            input
        );
        self.append_to_log(&content)?;
        info!(target: "deckrun::journal", run_id, source, "run started");
        Ok(())
    }

    /// Log a model call.
    ///
    /// Outside debug level only the history length is written.
    ///
    /// # Arguments
    /// * `run_id` - Run the call belongs to.
    /// * `pass` - 1-based pass number.
    /// * `history` - Entries sent to the model, as JSON.
    /// * `model` - Model name.
    pub fn log_model_call(&self, run_id: &str, pass: u32, history: &[Value], model: &str) -> Result<()> {
        let now: DateTime<Utc> = Utc::now();
        let history_block = if self.is_debug() {
            format!(
                "**History:**\n```json\n{}\n```\n\n",
                serde_json::to_string_pretty(history).unwrap_or_else(|_| "[]".to_string())
            )
        } else {
            format!("**History:** {} entries\n\n", history.len())
        };
        let content = format!(
            "### Model Call {} - {}\n\n**Run:** {}\n**Model:** {}\n\n{}",
            pass,
            now.to_rfc3339(),
            run_id,
            model,
            history_block
        );
        self.append_to_log(&content)?;
        debug!(target: "deckrun::journal", run_id, pass, model, entries = history.len(), "model call");
        Ok(())
    }

    /// Log a model response. Empty responses without tool calls are skipped.
    pub fn log_model_response(&self, text: Option<&str>, tool_calls: &[String], model: &str) -> Result<()> {
        let text = text.map(str::trim).unwrap_or_default();
        if text.is_empty() && tool_calls.is_empty() {
            debug!(target: "deckrun::journal", "skipping empty model response");
            return Ok(());
        }

        let now: DateTime<Utc> = Utc::now();
        let mut content = format!("### Model Response - {}\n\n**Model:** {}\n\n", now.to_rfc3339(), model);
        if !text.is_empty() {
            content.push_str(&format!("**Response:**\n```\n{}\n```\n\n", text));
        }
        if !tool_calls.is_empty() {
            content.push_str(&format!("**Tool calls:** {}\n\n", tool_calls.join(", ")));
        }
        self.append_to_log(&content)?;
        info!(target: "deckrun::journal", model, tool_calls = tool_calls.len(), "model response");
        Ok(())
    }

    /// Log tool execution with its result.
    ///
    /// # Arguments
    /// * `tool_name` - Name of the action.
    /// * `tool_args` - Raw arguments.
    /// * `result` - Output shown to the model.
    /// * `success` - Whether the action itself succeeded.
    pub fn log_tool_execution(&self, tool_name: &str, tool_args: &str, result: &str, success: bool) -> Result<()> {
        let now: DateTime<Utc> = Utc::now();
        let status = if success { "Result" } else { "Error" };
        let content = format!(
            "### Tool Execution - {}\n\n**Tool:** {}\n**Args:** {}\n**{}:** {}\n\n",
            now.to_rfc3339(),
            tool_name,
            tool_args,
            status,
            result
        );
        self.append_to_log(&content)?;
        Ok(())
    }

    /// Log a handler fire (`onBusy`, `onIdle`, `onError`).
    pub fn log_handler(&self, handler: &str, result: &str) -> Result<()> {
        let now: DateTime<Utc> = Utc::now();
        let content = format!(
            "### Handler {} - {}\n\n{}\n\n",
            handler,
            now.to_rfc3339(),
            result
        );
        self.append_to_log(&content)?;
        info!(target: "deckrun::journal", handler, "handler fired");
        Ok(())
    }

    /// Log error with context.
    pub fn log_error(&self, error: &str, context: Option<&HashMap<String, Value>>) -> Result<()> {
        let now: DateTime<Utc> = Utc::now();
        let mut content = format!("### Error - {}\n\n**Error:** {}\n\n", now.to_rfc3339(), error);

        if let Some(ctx) = context {
            content.push_str(&format!(
                "**Context:** {}\n\n",
                serde_json::to_string_pretty(ctx).unwrap_or_default()
            ));
        }

        self.append_to_log(&content)?;
        error!(target: "deckrun::journal", "{}", error);
        Ok(())
    }

    /// Log the end of a run.
    pub fn log_completion(&self, run_id: &str, status: &str, passes: u32) -> Result<()> {
        let now: DateTime<Utc> = Utc::now();
        let content = format!(
            "### Run Finished - {}\n\n**Run:** {}\n**Status:** {}\n**Passes:** {}\n\n---\n\n",
            now.to_rfc3339(),
            run_id,
            status,
            passes
        );
        self.append_to_log(&content)?;
        info!(target: "deckrun::journal", run_id, status, passes, "run finished");
        Ok(())
    }

    /// Log custom content.
    pub fn log_custom(&self, title: &str, content: &str, level: Option<&str>) -> Result<()> {
        let now: DateTime<Utc> = Utc::now();
        self.append_to_log(&format!("### {} - {}\n\n{}\n\n", title, now.to_rfc3339(), content))?;

        match level.unwrap_or("INFO") {
            "ERROR" => error!(target: "deckrun::journal", "{}: {}", title, content),
            "WARN" => warn!(target: "deckrun::journal", "{}: {}", title, content),
            _ => info!(target: "deckrun::journal", "{}: {}", title, content),
        }
        Ok(())
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

#[cfg(test)]
mod tests;
