//! Ordered container of index entries.
//!
//! One unified map with a per-item context tag replaces three parallel
//! structures for the main/cache/scan roles; the coordinator filters by
//! tag when it decides which entries belong into which output file.

use std::collections::BTreeMap;

use anyhow::{bail, Error};

use crate::index_file::EntryRef;

/// Role of the index an entry came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexContext {
    Main,
    Cache,
    Scan,
}

impl IndexContext {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexContext::Main => "main",
            IndexContext::Cache => "cache",
            IndexContext::Scan => "scan",
        }
    }
}

#[derive(Clone)]
pub struct EntryItem {
    pub entry: EntryRef,
    pub context: IndexContext,
}

impl EntryItem {
    pub fn is_deleted(&self) -> bool {
        self.entry.resolve().is_deleted()
    }
}

/// Collision strategy for [`EntryMap::merge_from`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeStrategy {
    /// The incoming entry overwrites an existing key.
    TheirsWins,
    /// An existing key keeps its entry.
    OursWins,
    /// Duplicate keys are an error.
    ErrorOnConflict,
}

/// Ordered map from relative path to `(entry reference, context)`.
///
/// Keys are owned copies of the entry paths, taken at insert time: the
/// mapped bytes a reference resolves into may be remapped away under the
/// container.
#[derive(Clone, Default)]
pub struct EntryMap {
    entries: BTreeMap<String, EntryItem>,
}

impl EntryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, path: String, item: EntryItem) -> Option<EntryItem> {
        self.entries.insert(path, item)
    }

    pub fn remove(&mut self, path: &str) -> Option<EntryItem> {
        self.entries.remove(path)
    }

    pub fn get(&self, path: &str) -> Option<&EntryItem> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Ascending iteration; reversible for backward cursors.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&str, &EntryItem)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn set_context(&mut self, path: &str, context: IndexContext) -> bool {
        match self.entries.get_mut(path) {
            Some(item) => {
                item.context = context;
                true
            }
            None => false,
        }
    }

    /// Keep only the entries the predicate accepts.
    pub fn retain<F: FnMut(&str, &EntryItem) -> bool>(&mut self, mut keep: F) {
        self.entries.retain(|k, v| keep(k.as_str(), v));
    }

    /// Merge another map into this one.
    pub fn merge_from(&mut self, other: EntryMap, strategy: MergeStrategy) -> Result<(), Error> {
        for (path, item) in other.entries {
            match self.entries.entry(path) {
                std::collections::btree_map::Entry::Vacant(slot) => {
                    slot.insert(item);
                }
                std::collections::btree_map::Entry::Occupied(mut slot) => match strategy {
                    MergeStrategy::TheirsWins => {
                        slot.insert(item);
                    }
                    MergeStrategy::OursWins => (),
                    MergeStrategy::ErrorOnConflict => {
                        bail!("conflicting entries for {:?}", slot.key());
                    }
                },
            }
        }
        Ok(())
    }
}

impl IntoIterator for EntryMap {
    type Item = (String, EntryItem);
    type IntoIter = std::collections::btree_map::IntoIter<String, EntryItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
