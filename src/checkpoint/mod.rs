//! Persisted crawl cursor
//!
//! A single JSON slot holding the page a crawl should resume from. The file
//! exists only while a crawl is in flight; its presence on startup means the
//! previous run did not finish.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while persisting a checkpoint
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to serialize checkpoint: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Where to resume a crawl
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Page number to fetch next (1-based)
    pub last_page: u32,

    /// URL of that page
    pub last_url: String,

    /// The query that wrote this checkpoint
    pub query_id: i64,

    #[serde(rename = "timestamp")]
    pub saved_at: DateTime<Utc>,
}

/// The on-disk checkpoint slot
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the checkpoint for a query
    ///
    /// # Returns
    ///
    /// * `Ok(Some(Checkpoint))` - A checkpoint written by this query
    /// * `Ok(None)` - No checkpoint, one for another query, or an unreadable file
    /// * `Err(CheckpointError)` - The file exists but could not be read
    pub fn load(&self, query_id: i64) -> Result<Option<Checkpoint>, CheckpointError> {
        let Some(checkpoint) = self.peek()? else {
            return Ok(None);
        };

        if checkpoint.query_id != query_id {
            tracing::info!(
                "Ignoring checkpoint for query {} (requested query {})",
                checkpoint.query_id,
                query_id
            );
            return Ok(None);
        }

        Ok(Some(checkpoint))
    }

    /// Reads whatever checkpoint is on disk, regardless of query
    pub fn peek(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };

        match serde_json::from_str(&contents) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                tracing::warn!(
                    "Discarding unreadable checkpoint at {}: {}",
                    self.path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    /// Overwrites the slot with a new cursor
    ///
    /// Writes to a sibling temp file and renames it over the slot, so a crash
    /// mid-write leaves the previous checkpoint intact.
    pub fn save(&self, page: u32, url: &str, query_id: i64) -> Result<(), CheckpointError> {
        let checkpoint = Checkpoint {
            last_page: page,
            last_url: url.to_string(),
            query_id,
            saved_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&checkpoint)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;

        tracing::debug!("Checkpoint saved: page {} ({})", page, url);
        Ok(())
    }

    /// Removes the slot; a missing file is not an error
    pub fn clear(&self) -> Result<(), CheckpointError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!("Checkpoint cleared");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn io_error(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
