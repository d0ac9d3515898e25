//! Append-only checkpoint log.
//!
//! One JSONL record per image that reached a terminal state. On startup the
//! log is replayed and images already present are skipped; records are only
//! appended, never rewritten, so a crash mid-run loses at most the in-flight
//! images. Last record wins when an image appears twice (a forced re-run).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::error::{CrystcapError, Result};

/// Terminal state of one image in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Succeeded,
    Failed,
}

/// One line of the checkpoint log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Normalized image path, the stable identity of the work item.
    pub image_path: String,
    pub terminal_state: TerminalState,
    pub attempt_count: u32,
    pub timestamp: DateTime<Utc>,
}

/// Single-writer append handle over the checkpoint file.
pub struct CheckpointLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl CheckpointLog {
    /// Open (or create) the log for appending.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CrystcapError::io(format!("creating {}", parent.display()), e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| CrystcapError::io(format!("opening checkpoint {}", path.display()), e))?;

        Ok(Self {
            path: path.to_owned(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Replay the log into a map of already-finished images.
    ///
    /// Malformed lines (a torn write from a crash) are skipped with a
    /// warning rather than aborting the run.
    pub fn load(path: &Path) -> Result<HashMap<String, TerminalState>> {
        let mut seen = HashMap::new();

        if !path.exists() {
            return Ok(seen);
        }

        let file = File::open(path)
            .map_err(|e| CrystcapError::io(format!("reading checkpoint {}", path.display()), e))?;

        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| {
                CrystcapError::io(format!("reading checkpoint {}", path.display()), e)
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CheckpointRecord>(&line) {
                Ok(record) => {
                    seen.insert(record.image_path, record.terminal_state);
                }
                Err(e) => {
                    warn!(line = lineno + 1, error = %e, "skipping malformed checkpoint line");
                }
            }
        }

        info!(path = %path.display(), entries = seen.len(), "checkpoint loaded");
        Ok(seen)
    }

    /// Append one terminal record and flush it to disk.
    pub fn record(&self, record: &CheckpointRecord) -> Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| CrystcapError::Internal(format!("serializing checkpoint: {e}")))?;

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| CrystcapError::Internal("checkpoint writer poisoned".to_string()))?;

        writeln!(writer, "{line}")
            .and_then(|_| writer.flush())
            .map_err(|e| CrystcapError::io(format!("appending to {}", self.path.display()), e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
