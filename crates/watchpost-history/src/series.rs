//! Per-check ordered history.
//!
//! Entries are kept in a `BTreeMap` keyed by `(created_at, seq)` so the
//! oldest entry is always the first key and eviction is `pop_first`. A
//! side map from id to order key gives O(1) slot lookup for upserts.

use std::collections::{BTreeMap, HashMap};

use crate::types::Item;

/// What happened when an item was put into a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
}

#[derive(Debug, Default, Clone)]
pub struct Series {
    entries: BTreeMap<(u64, u64), Item>,
    by_id: HashMap<String, (u64, u64)>,
}

impl Series {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry by its durable id.
    pub fn get(&self, id: &str) -> Option<&Item> {
        self.by_id.get(id).and_then(|key| self.entries.get(key))
    }

    /// The most recent entry.
    pub fn latest(&self) -> Option<&Item> {
        self.entries.last_key_value().map(|(_, item)| item)
    }

    /// Insert `item`, replacing any entry with the same id.
    ///
    /// A replaced entry is re-keyed by the new item's time, so ordering
    /// stays correct even when a slot is overwritten out of order.
    pub fn upsert(&mut self, item: Item) -> Upsert {
        let key = item.order_key();
        let outcome = match self.by_id.insert(item.id.clone(), key) {
            Some(old_key) => {
                self.entries.remove(&old_key);
                Upsert::Replaced
            }
            None => Upsert::Inserted,
        };
        self.entries.insert(key, item);
        outcome
    }

    /// Drop the oldest entries until at most `max` remain.
    pub fn evict_to(&mut self, max: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > max {
            if let Some((_, item)) = self.entries.pop_first() {
                self.by_id.remove(&item.id);
                evicted += 1;
            }
        }
        evicted
    }

    /// Copy out all entries, newest first.
    pub fn snapshot(&self) -> Vec<Item> {
        self.entries.values().rev().cloned().collect()
    }

    /// Iterate entries oldest first.
    pub fn iter_oldest_first(&self) -> impl Iterator<Item = &Item> {
        self.entries.values()
    }
}
