//! Append-only events log
//!
//! `events.jsonl` holds one [`TraceEvent`] per line. It is the source of
//! truth for a session; the snapshot is only a cache of its replay.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use super::model::{TraceEvent, TraceKind};
use super::{StoreError, StoreResult};

/// Events log file handler
#[derive(Debug, Clone)]
pub struct EventsLog {
    path: PathBuf,
}

impl EventsLog {
    /// Create new events log handler for a session directory
    pub fn new(session_path: &Path) -> Self {
        Self {
            path: session_path.join("events.jsonl"),
        }
    }

    /// Get the path to the events file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if events file exists
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Append an event to the log and sync it to disk
    pub fn append(&self, event: &TraceEvent) -> StoreResult<()> {
        self.append_batch(std::slice::from_ref(event))
    }

    /// Append multiple events with a single sync
    pub fn append_batch(&self, events: &[TraceEvent]) -> StoreResult<()> {
        if events.is_empty() {
            return Ok(());
        }

        let lines: Vec<String> = events
            .iter()
            .map(|e| e.to_json_line())
            .collect::<StoreResult<Vec<_>>>()?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                StoreError::storage(format!(
                    "Failed to open events log {}: {}",
                    self.path.display(),
                    e
                ))
            })?;

        let mut buffer = String::new();
        for line in lines {
            buffer.push_str(&line);
            buffer.push('\n');
        }
        file.write_all(buffer.as_bytes())
            .map_err(|e| StoreError::storage(format!("Failed to write event: {}", e)))?;

        file.sync_all()
            .map_err(|e| StoreError::storage(format!("Failed to sync events log: {}", e)))?;

        Ok(())
    }

    /// Read all events from the log
    pub fn read_all(&self) -> StoreResult<Vec<TraceEvent>> {
        self.read_after(0)
    }

    /// Read events whose sequence is greater than `sequence`
    pub fn read_after(&self, sequence: u64) -> StoreResult<Vec<TraceEvent>> {
        if !self.exists() {
            return Ok(Vec::new());
        }

        let file = std::fs::File::open(&self.path).map_err(|e| {
            StoreError::storage(format!(
                "Failed to open events log {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let reader = std::io::BufReader::new(file);
        let mut events = Vec::new();

        for (line_num, line_result) in reader.lines().enumerate() {
            let line = line_result.map_err(|e| {
                StoreError::storage(format!(
                    "Failed to read line {} from events log: {}",
                    line_num + 1,
                    e
                ))
            })?;

            if line.trim().is_empty() {
                continue;
            }

            let event: TraceEvent = serde_json::from_str(&line).map_err(|e| {
                StoreError::corrupted(format!(
                    "Failed to parse event on line {}: {}",
                    line_num + 1,
                    e
                ))
            })?;

            if event.sequence > sequence {
                events.push(event);
            }
        }

        Ok(events)
    }

    /// Read events with filtering
    pub fn read_filtered(
        &self,
        kinds: Option<&[TraceKind]>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> StoreResult<Vec<TraceEvent>> {
        let filtered = self
            .read_all()?
            .into_iter()
            .filter(|e| kinds.map(|k| k.contains(&e.kind)).unwrap_or(true))
            .skip(offset.unwrap_or(0))
            .take(limit.unwrap_or(usize::MAX))
            .collect();

        Ok(filtered)
    }

    /// Count events in the log
    pub fn count(&self) -> StoreResult<usize> {
        if !self.exists() {
            return Ok(0);
        }

        let file = std::fs::File::open(&self.path)?;
        let reader = std::io::BufReader::new(file);
        let count = reader
            .lines()
            .filter_map(Result::ok)
            .filter(|l| !l.trim().is_empty())
            .count();

        Ok(count)
    }

    /// Get the highest sequence number (0 when empty)
    pub fn last_sequence(&self) -> StoreResult<u64> {
        let events = self.read_all()?;
        Ok(events.last().map(|e| e.sequence).unwrap_or(0))
    }
}
