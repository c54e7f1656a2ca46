//! In-memory index of every series, grouped by check group.

use std::collections::BTreeMap;

use watchpost_core::CheckKey;

use crate::series::{Series, Upsert};
use crate::types::Item;

#[derive(Debug)]
pub struct Index {
    groups: BTreeMap<String, BTreeMap<String, Series>>,
    max_entries: usize,
}

impl Index {
    pub fn new(max_entries: usize) -> Self {
        Self {
            groups: BTreeMap::new(),
            max_entries,
        }
    }

    pub fn series(&self, group: &str, name: &str) -> Option<&Series> {
        self.groups.get(group).and_then(|names| names.get(name))
    }

    pub fn latest(&self, group: &str, name: &str) -> Option<&Item> {
        self.series(group, name).and_then(Series::latest)
    }

    pub fn get(&self, group: &str, name: &str, id: &str) -> Option<&Item> {
        self.series(group, name).and_then(|s| s.get(id))
    }

    /// Upsert an item into its series and enforce the retention bound.
    pub fn apply(&mut self, item: Item) -> (Upsert, usize) {
        let series = self
            .groups
            .entry(item.group.clone())
            .or_default()
            .entry(item.name.clone())
            .or_default();
        let outcome = series.upsert(item);
        let evicted = series.evict_to(self.max_entries);
        (outcome, evicted)
    }

    /// Drop every series for which `keep` returns false.
    ///
    /// Returns the number of series removed.
    pub fn retain(&mut self, mut keep: impl FnMut(&CheckKey) -> bool) -> usize {
        let mut removed = 0;
        for (group, names) in self.groups.iter_mut() {
            names.retain(|name, _| {
                let kept = keep(&CheckKey::new(group.as_str(), name.as_str()));
                if !kept {
                    removed += 1;
                }
                kept
            });
        }
        self.groups.retain(|_, names| !names.is_empty());
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (CheckKey, &Series)> {
        self.groups.iter().flat_map(|(group, names)| {
            names
                .iter()
                .map(move |(name, series)| (CheckKey::new(group.as_str(), name.as_str()), series))
        })
    }

    pub fn groups(&self) -> impl Iterator<Item = &String> {
        self.groups.keys()
    }

    pub fn snapshot_all(&self) -> BTreeMap<String, BTreeMap<String, Vec<Item>>> {
        self.groups
            .iter()
            .map(|(group, names)| {
                let series = names
                    .iter()
                    .map(|(name, s)| (name.clone(), s.snapshot()))
                    .collect();
                (group.clone(), series)
            })
            .collect()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn series_count(&self) -> usize {
        self.groups.values().map(BTreeMap::len).sum()
    }

    pub fn item_count(&self) -> usize {
        self.groups
            .values()
            .flat_map(BTreeMap::values)
            .map(Series::len)
            .sum()
    }
}
