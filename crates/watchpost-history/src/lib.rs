//! watchpost-history — durable event history for Watchpost.
//!
//! Every check outcome is appended as one JSON object per line to a single
//! log file. On open the log is replayed into an in-memory index of
//! per-check series, which is what readers (API, CLI) query. The log file
//! is never read again after open.
//!
//! # Architecture
//!
//! ```text
//! HistoryStore (Clone, shared by all check runners)
//!   ├── mpsc queue ──► writer task (spawn_blocking, owns the File)
//!   │                    ├── resolve id / status / created_at / seq
//!   │                    ├── write + sync the whole batch
//!   │                    ├── apply batch to the index (write lock)
//!   │                    └── compaction (policy-driven or explicit)
//!   └── RwLock<Index> ◄── readers copy snapshots out (read lock)
//!         └── group → name → Series (ordered by time, id lookup)
//! ```
//!
//! # Identity
//!
//! Boolean checks keep one entry per UTC day: a second append on the same
//! day replaces the first. Metric checks keep every append as its own
//! entry, disambiguated by a store-wide sequence number.

pub mod clock;
pub mod codec;
pub mod compaction;
pub mod error;
pub mod index;
pub mod series;
pub mod store;
pub mod types;
mod writer;

pub use clock::{Clock, ManualClock, SystemClock, DAY_MS};
pub use compaction::CompactionPolicy;
pub use error::{HistoryError, HistoryResult};
pub use series::Series;
pub use store::{HistoryOptions, HistoryStats, HistoryStore};
pub use types::*;
