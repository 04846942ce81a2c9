//! Resumable progress log for long backfills.
//!
//! One JSON object per line, appended as each unit completes (success or
//! permanent failure). Reloading the log lets a restarted run skip the
//! units it already settled instead of re-fetching hundreds of rounds.

use crate::record::Category;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// One settled unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    /// Unit that was fetched.
    pub unit: u32,
    /// Product line the unit belongs to.
    pub category: Category,
    /// Whether the fetch produced records (`false` = failed after retries).
    pub ok: bool,
}

/// Append-only completion log, optionally backed by a file.
///
/// Without a path the log is in-memory only: dedup within the run still
/// works, but nothing survives a restart.
#[derive(Debug, Default)]
pub struct CheckpointLog {
    path: Option<PathBuf>,
    completed: HashSet<(Category, u32)>,
}

impl CheckpointLog {
    /// In-memory log with no backing file.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads (or starts) the log at `path`.
    ///
    /// Unparseable lines — typically one torn trailing line after a crash —
    /// are skipped, not fatal.
    pub fn load(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let mut completed = HashSet::new();
        match File::open(&path) {
            Ok(file) => {
                for line in BufReader::new(file).lines() {
                    let line = line?;
                    if let Ok(entry) = serde_json::from_str::<CheckpointEntry>(&line) {
                        completed.insert((entry.category, entry.unit));
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        Ok(Self {
            path: Some(path),
            completed,
        })
    }

    /// Backing file, when the log is durable.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether `unit` already completed (fetched or permanently failed)
    /// in this run or a resumed one.
    pub fn is_done(&self, category: Category, unit: u32) -> bool {
        self.completed.contains(&(category, unit))
    }

    /// Number of settled units.
    pub fn len(&self) -> usize {
        self.completed.len()
    }

    /// Whether nothing has been settled yet.
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    /// Records a settled unit, appending to the backing file when there is
    /// one.
    pub fn record(&mut self, entry: CheckpointEntry) -> io::Result<()> {
        if !self.completed.insert((entry.category, entry.unit)) {
            return Ok(());
        }
        if let Some(path) = &self.path {
            let mut file = OpenOptions::new().append(true).create(true).open(path)?;
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            file.write_all(line.as_bytes())?;
            file.flush()?;
        }
        Ok(())
    }
}
