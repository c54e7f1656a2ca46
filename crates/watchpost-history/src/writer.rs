//! The single background writer.
//!
//! Every mutation of the log file and of the index happens here, on one
//! blocking task. Appends are batched: after waking for one request the
//! writer drains whatever else is already queued, writes and syncs the
//! whole batch, and only then applies it to the index.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use watchpost_core::{CheckKey, CheckKind, Status};

use crate::clock::Clock;
use crate::codec::encode_line;
use crate::compaction::{self, CompactionPolicy};
use crate::error::{HistoryError, HistoryResult};
use crate::index::Index;
use crate::series::Upsert;
use crate::store::{open_append, read_lock, write_lock};
use crate::types::{Appended, Item, Observation};

pub(crate) struct AppendRequest {
    pub observation: Observation,
    pub reply: oneshot::Sender<HistoryResult<Appended>>,
}

pub(crate) enum Command {
    Append(AppendRequest),
    Compact(oneshot::Sender<HistoryResult<usize>>),
    Close(oneshot::Sender<()>),
}

pub(crate) struct Writer {
    pub path: PathBuf,
    pub file: File,
    pub index: Arc<RwLock<Index>>,
    pub registered: Arc<RwLock<HashSet<CheckKey>>>,
    pub clock: Arc<dyn Clock>,
    pub policy: CompactionPolicy,
    pub next_seq: u64,
    pub last_created_at: u64,
    pub writes_since_compaction: Arc<AtomicU64>,
    pub last_compaction: Instant,
    /// Set once the log may hold bytes the index does not. Appends are
    /// refused until a compaction rewrites the log from the index.
    pub failed: Option<String>,
}

impl Writer {
    /// Process commands until closed or every sender is gone.
    pub fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut deferred: Option<Command> = None;
        loop {
            let command = match deferred.take() {
                Some(command) => command,
                None => match rx.blocking_recv() {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                Command::Append(first) => {
                    let mut batch = vec![first];
                    while let Ok(next) = rx.try_recv() {
                        match next {
                            Command::Append(request) => batch.push(request),
                            other => {
                                deferred = Some(other);
                                break;
                            }
                        }
                    }
                    self.commit(batch);
                    self.maybe_compact();
                }
                Command::Compact(reply) => {
                    let _ = reply.send(self.compact());
                }
                Command::Close(reply) => {
                    self.drain_and_close(&mut rx);
                    let _ = reply.send(());
                    return;
                }
            }
        }
        info!(path = ?self.path, "history writer stopped");
    }

    /// Stop accepting requests, then finish everything already queued.
    fn drain_and_close(&mut self, rx: &mut mpsc::Receiver<Command>) {
        rx.close();
        let mut remaining = Vec::new();
        while let Ok(command) = rx.try_recv() {
            match command {
                Command::Append(request) => remaining.push(request),
                Command::Compact(reply) => {
                    let _ = reply.send(Err(HistoryError::Closed));
                }
                Command::Close(reply) => {
                    let _ = reply.send(());
                }
            }
        }
        if !remaining.is_empty() {
            debug!(records = remaining.len(), "draining queued writes before close");
            self.commit(remaining);
        }
        if let Err(e) = self.file.sync_all() {
            warn!(error = %e, "failed to sync history file on close");
        }
        info!(path = ?self.path, "closing history file");
    }

    fn commit(&mut self, batch: Vec<AppendRequest>) {
        if let Some(reason) = &self.failed {
            warn!(records = batch.len(), reason = %reason, "refusing writes to damaged history file");
            for request in batch {
                let _ = request.reply.send(Err(HistoryError::Write(reason.clone())));
            }
            return;
        }

        let mut buffer = Vec::new();
        let mut staged: Vec<Item> = Vec::with_capacity(batch.len());
        let mut replies = Vec::with_capacity(batch.len());

        {
            let index = read_lock(&self.index);
            for request in batch {
                let created_at = self.clock.now_ms().max(self.last_created_at);
                let (item, previous) =
                    resolve(&index, &staged, request.observation, created_at, self.next_seq);
                match encode_line(&item) {
                    Ok(line) => {
                        buffer.extend_from_slice(&line);
                        self.next_seq += 1;
                        self.last_created_at = created_at;
                        staged.push(item);
                        replies.push((request.reply, previous));
                    }
                    Err(e) => {
                        error!(item = %item, error = %e, "failed to serialize history item");
                        let _ = request.reply.send(Err(e));
                    }
                }
            }
        }

        if staged.is_empty() {
            return;
        }

        // Durable state first, index second.
        if let Err(e) = append_durably(&mut self.file, &buffer) {
            error!(path = ?self.path, error = %e, records = staged.len(), "failed to write history batch");
            if let AppendError::Torn { .. } = e {
                self.fail(e.to_string());
            }
            for (reply, _) in replies {
                let _ = reply.send(Err(HistoryError::Write(e.to_string())));
            }
            return;
        }

        {
            let mut index = write_lock(&self.index);
            for item in &staged {
                let (outcome, evicted) = index.apply(item.clone());
                match outcome {
                    Upsert::Inserted => debug!(item = %item, evicted, "inserted"),
                    Upsert::Replaced => debug!(item = %item, evicted, "replaced"),
                }
            }
        }

        self.writes_since_compaction
            .fetch_add(staged.len() as u64, Ordering::Relaxed);
        debug!(records = staged.len(), "wrote history batch");

        for (item, (reply, previous)) in staged.into_iter().zip(replies) {
            let _ = reply.send(Ok(Appended { item, previous }));
        }
    }

    fn fail(&mut self, reason: String) {
        error!(path = ?self.path, reason = %reason, "history file damaged, writes disabled until compaction");
        self.failed = Some(reason);
    }

    fn maybe_compact(&mut self) {
        let writes = self
            .writes_since_compaction
            .load(Ordering::Relaxed);
        if !self.policy.is_due(writes, self.last_compaction.elapsed()) {
            return;
        }
        debug!(writes, "compaction policy triggered");
        if let Err(e) = self.compact() {
            error!(error = %e, "automatic compaction failed");
        }
    }

    /// Rewrite the log from the index, dropping unregistered checks.
    pub fn compact(&mut self) -> HistoryResult<usize> {
        let registered = read_lock(&self.registered).clone();

        let kept = {
            let index = read_lock(&self.index);
            let survivors = index
                .iter()
                .filter(|(key, _)| registered.contains(key))
                .flat_map(|(_, series)| series.iter_oldest_first());
            compaction::rewrite(&self.path, survivors)?
        };

        // The old handle now points at the replaced file.
        self.file = match open_append(&self.path) {
            Ok(file) => file,
            Err(e) => {
                self.fail(format!("history file was compacted but could not be reopened: {e}"));
                return Err(e);
            }
        };
        if self.failed.take().is_some() {
            info!(path = ?self.path, "history file rewritten, writes enabled again");
        }

        let dropped = write_lock(&self.index).retain(|key| registered.contains(key));
        self.writes_since_compaction
            .store(0, Ordering::Relaxed);
        self.last_compaction = Instant::now();

        info!(path = ?self.path, kept, dropped_series = dropped, "history compacted");
        Ok(kept)
    }
}

/// What the writer needs from the log file.
pub(crate) trait LogFile: Write {
    fn len(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl LogFile for File {
    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

#[derive(Debug, Error)]
pub(crate) enum AppendError {
    /// Nothing from the batch is left in the log.
    #[error("{0}")]
    Failed(io::Error),

    /// Part of the batch may still be in the log.
    #[error("{write} (rollback also failed: {truncate})")]
    Torn { write: io::Error, truncate: io::Error },
}

/// Append `buffer` and sync it. A failed append is cut back off so the log
/// never keeps a partial line.
pub(crate) fn append_durably<F: LogFile>(file: &mut F, buffer: &[u8]) -> Result<(), AppendError> {
    let len = file.len().map_err(AppendError::Failed)?;
    let written = file
        .write_all(buffer)
        .and_then(|()| file.flush())
        .and_then(|()| file.sync());
    match written {
        Ok(()) => Ok(()),
        Err(write) => match file.truncate(len).and_then(|()| file.sync()) {
            Ok(()) => Err(AppendError::Failed(write)),
            Err(truncate) => Err(AppendError::Torn { write, truncate }),
        },
    }
}

/// Turn an observation into the item that will be stored.
///
/// `staged` holds items accepted earlier in the same batch; they are newer
/// than anything in the index and take precedence over it.
pub(crate) fn resolve(
    index: &Index,
    staged: &[Item],
    observation: Observation,
    created_at: u64,
    seq: u64,
) -> (Item, Option<Status>) {
    let Observation {
        group,
        name,
        kind,
        output,
        duration,
        metric_value,
        metric_unit,
        status,
        error,
    } = observation;

    let raw = if status.is_success() {
        Status::Healthy
    } else {
        Status::Unhealthy
    };

    let mut item = Item {
        id: String::new(),
        seq,
        group,
        name,
        kind,
        output: String::from_utf8_lossy(&output).into_owned(),
        created_at,
        duration_ms: duration.as_millis() as u64,
        metric_value,
        metric_unit: metric_unit.unwrap_or_default(),
        status: raw,
        error,
    };
    item.id = item.derive_id();

    let latest = staged
        .iter()
        .rev()
        .find(|s| s.belongs_to(&item.group, &item.name))
        .or_else(|| index.latest(&item.group, &item.name));
    let previous = latest.map(|l| l.status);

    if kind == CheckKind::Boolean && raw == Status::Healthy {
        let same_slot = staged
            .iter()
            .rev()
            .find(|s| s.id == item.id)
            .or_else(|| index.get(&item.group, &item.name, &item.id));
        let recovered = match same_slot {
            // Within a day, recovery sticks until the slot rolls over.
            Some(slot) => slot.status != Status::Healthy,
            // On a new day only an outright failure leads to recovery.
            None => previous == Some(Status::Unhealthy),
        };
        if recovered {
            item.status = Status::Recovered;
        }
    }

    (item, previous)
}
