//! watchpost-checker — runs check commands on a schedule.
//!
//! # Architecture
//!
//! ```text
//! Supervisor
//!   ├── HistoryStore (shared)
//!   └── CheckRunner × N ──► tokio task per check
//!         loop {
//!           run_cycle: execute_once (sh -c, timeout, kill) + retries
//!           HistoryStore::append
//!           StatusNotifier::notify   (only when the status changed)
//!           sleep(interval) | shutdown
//!         }
//! ```

pub mod check;
pub mod error;
pub mod probe;
pub mod runner;
pub mod supervisor;

pub use check::CheckSpec;
pub use error::{CheckerError, CheckerResult};
pub use probe::{execute_once, run_cycle};
pub use runner::CheckRunner;
pub use supervisor::Supervisor;
