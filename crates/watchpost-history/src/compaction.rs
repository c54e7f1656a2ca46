//! Log compaction.
//!
//! Compaction rewrites the log from the in-memory index, keeping only
//! series whose check is still registered. The new log is written to a
//! sibling temp file, synced, and renamed over the live log, so a crash
//! at any point leaves either the old or the new log intact.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::encode_line;
use crate::error::{HistoryError, HistoryResult};
use crate::types::Item;

/// When to compact automatically. Either trigger is sufficient.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionPolicy {
    /// Compact once this many writes happened since the last compaction.
    /// Zero disables the trigger.
    pub max_writes: u64,
    /// Compact once this much time passed since the last compaction.
    pub interval: Option<Duration>,
}

impl CompactionPolicy {
    /// Never compact automatically.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn every_writes(max_writes: u64) -> Self {
        Self {
            max_writes,
            interval: None,
        }
    }

    /// Whether a pass is due given the writes and time since the last one.
    ///
    /// The interval trigger only fires when something was written.
    pub fn is_due(&self, writes: u64, since_last: Duration) -> bool {
        let by_writes = self.max_writes > 0 && writes >= self.max_writes;
        let by_time = writes > 0 && self.interval.is_some_and(|i| since_last >= i);
        by_writes || by_time
    }
}

/// Path of the temp file used while rewriting `log`.
pub fn temp_path(log: &Path) -> PathBuf {
    let mut name = log.file_name().unwrap_or_default().to_os_string();
    name.push(".compact");
    log.with_file_name(name)
}

/// Atomically replace `log` with `items`, in order.
///
/// Returns the number of items written. On error the temp file is removed
/// and `log` is untouched.
pub fn rewrite<'a>(log: &Path, items: impl IntoIterator<Item = &'a Item>) -> HistoryResult<usize> {
    let tmp = temp_path(log);
    match write_items(&tmp, items) {
        Ok(count) => {
            std::fs::rename(&tmp, log).map_err(|e| {
                let _ = std::fs::remove_file(&tmp);
                HistoryError::Compact(format!("rename {} failed: {e}", tmp.display()))
            })?;
            sync_parent(log);
            Ok(count)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

fn write_items<'a>(path: &Path, items: impl IntoIterator<Item = &'a Item>) -> HistoryResult<usize> {
    let compact_err = |e: std::io::Error| HistoryError::Compact(format!("{}: {e}", path.display()));

    let file = File::create(path).map_err(compact_err)?;
    let mut writer = BufWriter::new(file);
    let mut count = 0;
    for item in items {
        writer.write_all(&encode_line(item)?).map_err(compact_err)?;
        count += 1;
    }
    let file = writer
        .into_inner()
        .map_err(|e| compact_err(e.into_error()))?;
    file.sync_all().map_err(compact_err)?;
    Ok(count)
}

/// Persist the rename itself. Best effort; not every platform allows it.
fn sync_parent(log: &Path) {
    if let Some(parent) = log.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}
