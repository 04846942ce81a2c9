//! Persistence seams: local-state reads and idempotent sinks.

use crate::record::{Category, StoreRecord};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::io;
use std::sync::Mutex;
use tracing::{error, warn};

/// Errors surfaced by durable stores.
#[derive(Debug)]
pub enum StoreError {
    /// Underlying filesystem or database I/O failed.
    Io(io::Error),
    /// The store's on-disk shape was not recognizable.
    Corrupt(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "store io error: {err}"),
            Self::Corrupt(reason) => write!(f, "store corrupt: {reason}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Corrupt(_) => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// What a persistence call did with the batch it was handed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    /// Records appended to the store.
    pub written: usize,
    /// Records skipped because their dedup key was already present,
    /// either durably or earlier in the same batch.
    pub duplicates: usize,
}

impl PersistOutcome {
    /// Folds another outcome into this one.
    pub fn absorb(&mut self, other: PersistOutcome) {
        self.written += other.written;
        self.duplicates += other.duplicates;
    }
}

/// Read side of the durable store: what do we already know?
///
/// Reads must observe the store's latest committed write; a torn read must
/// never misreport a lower maximum than was actually committed.
#[async_trait]
pub trait LocalState: Send + Sync {
    /// Highest persisted unit for `category`, `0` when nothing is stored.
    async fn latest_known_unit(&self, category: Category) -> Result<u32, StoreError>;

    /// Dedup keys of every record persisted for `category`.
    async fn existing_dedup_keys(&self, category: Category)
        -> Result<HashSet<String>, StoreError>;
}

/// Idempotent append-only persistence keyed by [`StoreRecord::dedup_key`].
#[async_trait]
pub trait Sink: Send + Sync {
    /// Appends the records whose dedup key is not yet present.
    async fn persist(&self, records: &[StoreRecord]) -> Result<PersistOutcome, StoreError>;
}

/// Result of a flush, including records that could not be saved at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Records appended to the store.
    pub written: usize,
    /// Records skipped as duplicates.
    pub duplicates: usize,
    /// Records lost after both the batch write and their individual retry
    /// failed — a data-loss risk worth surfacing, not a crash.
    pub lost: usize,
}

/// Persists a batch, falling back to record-by-record writes on failure.
///
/// A single bad record must not sink an entire batch: when the batch write
/// errors, each record is retried on its own and only the ones that still
/// fail are counted as lost.
pub async fn persist_with_fallback<S: Sink + ?Sized>(
    sink: &S,
    records: &[StoreRecord],
) -> FlushOutcome {
    if records.is_empty() {
        return FlushOutcome::default();
    }

    match sink.persist(records).await {
        Ok(outcome) => FlushOutcome {
            written: outcome.written,
            duplicates: outcome.duplicates,
            lost: 0,
        },
        Err(err) => {
            warn!(
                batch = records.len(),
                error = %err,
                "batch persist failed, retrying records individually"
            );
            let mut flush = FlushOutcome::default();
            for record in records {
                match sink.persist(std::slice::from_ref(record)).await {
                    Ok(outcome) => {
                        flush.written += outcome.written;
                        flush.duplicates += outcome.duplicates;
                    }
                    Err(err) => {
                        flush.lost += 1;
                        error!(
                            unit = record.unit,
                            source_id = %record.source_id,
                            error = %err,
                            "record could not be persisted"
                        );
                    }
                }
            }
            flush
        }
    }
}

/// In-memory store backend implementing both persistence seams.
///
/// Useful as a scratch sink and as the test double for the orchestrator and
/// poll loop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, StoreRecord>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.lock().expect("memory store lock").len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the stored records for `category`, unordered.
    pub fn records_for(&self, category: Category) -> Vec<StoreRecord> {
        self.records
            .lock()
            .expect("memory store lock")
            .values()
            .filter(|record| record.category == category)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Sink for MemoryStore {
    async fn persist(&self, records: &[StoreRecord]) -> Result<PersistOutcome, StoreError> {
        let mut stored = self.records.lock().expect("memory store lock");
        let mut outcome = PersistOutcome::default();
        for record in records {
            let key = record.dedup_key();
            if stored.contains_key(&key) {
                outcome.duplicates += 1;
            } else {
                stored.insert(key, record.clone());
                outcome.written += 1;
            }
        }
        Ok(outcome)
    }
}

#[async_trait]
impl LocalState for MemoryStore {
    async fn latest_known_unit(&self, category: Category) -> Result<u32, StoreError> {
        let stored = self.records.lock().expect("memory store lock");
        Ok(stored
            .values()
            .filter(|record| record.category == category)
            .map(|record| record.unit)
            .max()
            .unwrap_or(0))
    }

    async fn existing_dedup_keys(
        &self,
        category: Category,
    ) -> Result<HashSet<String>, StoreError> {
        let stored = self.records.lock().expect("memory store lock");
        Ok(stored
            .values()
            .filter(|record| record.category == category)
            .map(StoreRecord::dedup_key)
            .collect())
    }
}
