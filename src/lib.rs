#![warn(missing_docs)]
//! Core library entry points for the lottosync winning-store sync engine.

pub mod checkpoint;
pub mod controls;
pub mod csv_store;
pub mod extract;
pub mod fetcher;
pub mod orchestrator;
pub mod poll;
pub mod probe;
pub mod record;
pub mod retry;
pub mod session;
pub mod state;
pub mod web;

pub use checkpoint::{CheckpointEntry, CheckpointLog};
pub use controls::{Cli, SyncControls};
pub use csv_store::CsvStore;
pub use extract::{extract_stores, Extraction};
pub use fetcher::{FetchError, UnitFetcher};
pub use orchestrator::{SyncError, SyncOrchestrator, SyncReport};
pub use poll::{Clock, PollLoop, PollOutcome, PollState, SystemClock};
pub use probe::{latest_remote_unit, ProbeError};
pub use record::{Category, StoreRecord};
pub use retry::RetryPolicy;
pub use session::{RemoteSession, SessionError, SessionFactory};
pub use state::{persist_with_fallback, LocalState, MemoryStore, PersistOutcome, Sink};
pub use web::{HttpSession, HttpSessionFactory};
