//! Atomic file operations for snapshot writes

use super::{StoreError, StoreResult};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Atomic file writer that uses write-temp-rename pattern
pub struct AtomicFileWriter {
    target_path: PathBuf,
    temp_path: PathBuf,
}

impl AtomicFileWriter {
    /// Create a new atomic file writer for the target path
    pub fn new(target_path: &Path) -> StoreResult<Self> {
        let temp_path = Self::generate_temp_path(target_path)?;

        Ok(AtomicFileWriter {
            target_path: target_path.to_path_buf(),
            temp_path,
        })
    }

    /// Write bytes to the file atomically
    pub fn write_bytes(&self, content: &[u8]) -> StoreResult<()> {
        if let Some(parent) = self.target_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::File::create(&self.temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        drop(file);

        self.commit()
    }

    /// Commit the write by renaming temp file to target
    pub fn commit(&self) -> StoreResult<()> {
        fs::rename(&self.temp_path, &self.target_path).map_err(|e| {
            StoreError::storage(format!("Failed to commit atomic write: {}", e))
        })?;
        Ok(())
    }

    /// Delete the temp file if the write never committed
    fn abort(&self) -> StoreResult<()> {
        if self.temp_path.exists() {
            fs::remove_file(&self.temp_path)?;
        }
        Ok(())
    }

    fn generate_temp_path(target: &Path) -> StoreResult<PathBuf> {
        let parent = target
            .parent()
            .ok_or_else(|| StoreError::storage("Target path has no parent directory"))?;

        let filename = target
            .file_name()
            .ok_or_else(|| StoreError::storage("Target path has no filename"))?;

        let temp_name = format!("{}.tmp.{}", filename.to_string_lossy(), Uuid::new_v4());

        Ok(parent.join(temp_name))
    }
}

impl Drop for AtomicFileWriter {
    fn drop(&mut self) {
        let _ = self.abort();
    }
}

/// Atomic file operations utility functions
pub struct AtomicOps;

impl AtomicOps {
    /// Atomically write raw bytes to a file
    pub fn write_bytes(path: &Path, content: &[u8]) -> StoreResult<()> {
        AtomicFileWriter::new(path)?.write_bytes(content)
    }

    /// Read JSON data from a file
    pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> StoreResult<T> {
        let content = fs::read(path)?;
        let data = serde_json::from_slice(&content)?;
        Ok(data)
    }
}
