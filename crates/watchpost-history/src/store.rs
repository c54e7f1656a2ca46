//! HistoryStore — the public face of the event log.
//!
//! Opening a store replays the log into the index and starts the writer.
//! Appends are queued to the writer and awaited; reads copy snapshots out
//! of the index under a short read lock and never touch the file.

use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use watchpost_core::CheckKey;

use crate::clock::{Clock, SystemClock};
use crate::codec::decode_line;
use crate::compaction::CompactionPolicy;
use crate::error::{HistoryError, HistoryResult};
use crate::index::Index;
use crate::types::{Appended, Item, Observation};
use crate::writer::{AppendRequest, Command, Writer};

/// Everything needed to open a store.
#[derive(Debug, Clone)]
pub struct HistoryOptions {
    pub path: PathBuf,
    /// Retention bound per series.
    pub max_entries: usize,
    /// Depth of the writer queue.
    pub max_concurrent_writes: usize,
    pub compaction: CompactionPolicy,
    /// Checks considered live from the start.
    pub registered: Vec<CheckKey>,
    pub clock: Arc<dyn Clock>,
}

impl HistoryOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_entries: 100,
            max_concurrent_writes: 100,
            compaction: CompactionPolicy::disabled(),
            registered: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn max_concurrent_writes(mut self, max_concurrent_writes: usize) -> Self {
        self.max_concurrent_writes = max_concurrent_writes;
        self
    }

    pub fn compaction(mut self, policy: CompactionPolicy) -> Self {
        self.compaction = policy;
        self
    }

    pub fn register(mut self, group: &str, name: &str) -> Self {
        self.registered.push(CheckKey::new(group, name));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Counters describing the store's current contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    pub groups: usize,
    pub series: usize,
    pub items: usize,
    pub registered: usize,
    pub writes_since_compaction: u64,
}

/// Thread-safe handle to the event log. Cheap to clone.
#[derive(Clone)]
pub struct HistoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    tx: mpsc::Sender<Command>,
    index: Arc<RwLock<Index>>,
    registered: Arc<RwLock<HashSet<CheckKey>>>,
    writes_since_compaction: Arc<AtomicU64>,
    writer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl HistoryStore {
    /// Open (or create) the log at `options.path` and replay it.
    ///
    /// Must be called from within a tokio runtime; the writer runs on the
    /// runtime's blocking pool.
    pub fn open(options: HistoryOptions) -> HistoryResult<Self> {
        if options.max_entries == 0 {
            return Err(HistoryError::Options("max_entries must be at least 1".to_string()));
        }
        if options.max_concurrent_writes == 0 {
            return Err(HistoryError::Options(
                "max_concurrent_writes must be at least 1".to_string(),
            ));
        }

        let mut file = open_append(&options.path)?;
        let mut index = Index::new(options.max_entries);
        let replay = replay(&mut file, &mut index)?;

        if replay.lines == 0 {
            info!(path = ?options.path, "created new history file");
        } else {
            info!(
                path = ?options.path,
                groups = index.group_count(),
                items = index.item_count(),
                lines = replay.lines,
                "imported history"
            );
        }

        let index = Arc::new(RwLock::new(index));
        let registered = Arc::new(RwLock::new(
            options.registered.into_iter().collect::<HashSet<_>>(),
        ));
        let writes_since_compaction = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::channel(options.max_concurrent_writes);

        let writer = Writer {
            path: options.path.clone(),
            file,
            index: index.clone(),
            registered: registered.clone(),
            clock: options.clock,
            policy: options.compaction,
            next_seq: replay.next_seq,
            last_created_at: replay.last_created_at,
            writes_since_compaction: writes_since_compaction.clone(),
            last_compaction: Instant::now(),
            failed: None,
        };
        let handle = tokio::task::spawn_blocking(move || writer.run(rx));

        Ok(Self {
            inner: Arc::new(Inner {
                path: options.path,
                tx,
                index,
                registered,
                writes_since_compaction,
                writer: Mutex::new(Some(handle)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Durably append one observation.
    ///
    /// Waits until the writer has synced the entry to disk and applied it
    /// to the index, then returns the stored item.
    pub async fn append(&self, observation: Observation) -> HistoryResult<Appended> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(HistoryError::Closed);
        }
        let (reply, response) = oneshot::channel();
        self.inner
            .tx
            .send(Command::Append(AppendRequest { observation, reply }))
            .await
            .map_err(|_| HistoryError::Closed)?;
        response.await.map_err(|_| HistoryError::Closed)?
    }

    /// Rewrite the log, keeping only registered checks.
    ///
    /// Returns the number of entries kept.
    pub async fn compact(&self) -> HistoryResult<usize> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(HistoryError::Closed);
        }
        let (reply, response) = oneshot::channel();
        self.inner
            .tx
            .send(Command::Compact(reply))
            .await
            .map_err(|_| HistoryError::Closed)?;
        response.await.map_err(|_| HistoryError::Closed)?
    }

    /// Finish queued writes, stop the writer and release the file.
    ///
    /// Idempotent. Later appends fail with [`HistoryError::Closed`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (reply, done) = oneshot::channel();
        if self.inner.tx.send(Command::Close(reply)).await.is_ok() {
            let _ = done.await;
        }
        let handle = self
            .inner
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        debug!(path = ?self.inner.path, "history store closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // ── Registered checks ──────────────────────────────────────────

    /// Mark a check as live. Idempotent.
    pub fn register_check(&self, group: &str, name: &str) {
        let inserted = write_lock(&self.inner.registered).insert(CheckKey::new(group, name));
        if inserted {
            debug!(%group, %name, "check registered");
        }
    }

    /// Forget a check; its entries go away at the next compaction.
    pub fn unregister_check(&self, group: &str, name: &str) -> bool {
        write_lock(&self.inner.registered).remove(&CheckKey::new(group, name))
    }

    pub fn is_registered(&self, group: &str, name: &str) -> bool {
        read_lock(&self.inner.registered).contains(&CheckKey::new(group, name))
    }

    /// All registered checks, sorted.
    pub fn registered_checks(&self) -> Vec<CheckKey> {
        let mut keys: Vec<_> = read_lock(&self.inner.registered).iter().cloned().collect();
        keys.sort();
        keys
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Snapshot of one series, newest first. Empty if unknown.
    pub fn series(&self, group: &str, name: &str) -> Vec<Item> {
        read_lock(&self.inner.index)
            .series(group, name)
            .map(|s| s.snapshot())
            .unwrap_or_default()
    }

    /// Most recent item of one series.
    pub fn latest(&self, group: &str, name: &str) -> Option<Item> {
        read_lock(&self.inner.index).latest(group, name).cloned()
    }

    /// Snapshot of every series: group → name → items (newest first).
    pub fn all(&self) -> BTreeMap<String, BTreeMap<String, Vec<Item>>> {
        read_lock(&self.inner.index).snapshot_all()
    }

    /// Names of every group with history, sorted.
    pub fn groups(&self) -> Vec<String> {
        read_lock(&self.inner.index).groups().cloned().collect()
    }

    pub fn stats(&self) -> HistoryStats {
        let index = read_lock(&self.inner.index);
        HistoryStats {
            groups: index.group_count(),
            series: index.series_count(),
            items: index.item_count(),
            registered: read_lock(&self.inner.registered).len(),
            writes_since_compaction: self.inner.writes_since_compaction.load(Ordering::Relaxed),
        }
    }
}

struct Replay {
    lines: usize,
    next_seq: u64,
    last_created_at: u64,
}

/// Feed every log line through the index in file order.
fn replay(file: &mut File, index: &mut Index) -> HistoryResult<Replay> {
    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    let mut line_no = 0;
    let mut result = Replay {
        lines: 0,
        next_seq: 0,
        last_created_at: 0,
    };

    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .map_err(|e| HistoryError::Replay {
                line: line_no + 1,
                reason: e.to_string(),
            })?;
        if read == 0 {
            break;
        }
        line_no += 1;

        let content = line.strip_suffix(b"\n").unwrap_or(&line);
        if content.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let item = decode_line(content, line_no)?;
        result.lines += 1;
        result.next_seq = result.next_seq.max(item.seq + 1);
        result.last_created_at = result.last_created_at.max(item.created_at);
        index.apply(item);
    }

    Ok(result)
}

pub(crate) fn open_append(path: &Path) -> HistoryResult<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .map_err(|source| HistoryError::Open {
            path: path.to_path_buf(),
            source,
        })
}

// The index and registered set are only ever mutated whole by one writer,
// so a poisoned lock still guards consistent data.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
