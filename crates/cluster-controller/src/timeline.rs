// Copyright (c) 2023 - 2025 Tidelog Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Offset-versioned maps backing the control plane's durable state.
//!
//! Every mutation is tagged with the offset of the committed record that
//! caused it, so readers lagging behind the replay cursor can take
//! consistent point-in-time reads with [`TimelineMap::get_at`]. Re-applying
//! a mutation at an offset that was already applied overwrites the previous
//! application, which makes record redelivery after a leadership change
//! harmless at the storage layer.

use std::hash::Hash;

use ahash::HashMap;

use tidelog_types::logs::LogOffset;

#[derive(Debug)]
struct History<V> {
    /// Ascending by offset. `None` marks a deletion.
    versions: Vec<(LogOffset, Option<V>)>,
}

impl<V> History<V> {
    fn apply(&mut self, offset: LogOffset, value: Option<V>) {
        // A redelivered or rewound record supersedes anything recorded at or
        // after its offset.
        self.versions.retain(|(recorded, _)| *recorded < offset);
        self.versions.push((offset, value));
    }

    fn current(&self) -> Option<&V> {
        self.versions
            .last()
            .and_then(|(_, value)| value.as_ref())
    }

    fn at(&self, offset: LogOffset) -> Option<&V> {
        self.versions
            .iter()
            .rev()
            .find(|(recorded, _)| *recorded <= offset)
            .and_then(|(_, value)| value.as_ref())
    }
}

/// A map whose entries can be read as of any previously applied log offset.
#[derive(Debug)]
pub struct TimelineMap<K, V> {
    entries: HashMap<K, History<V>>,
}

impl<K, V> Default for TimelineMap<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::default(),
        }
    }
}

impl<K, V> TimelineMap<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Inserts `value` as of `offset`, returning the previously current
    /// value.
    pub fn insert(&mut self, key: K, value: V, offset: LogOffset) -> Option<V>
    where
        V: Clone,
    {
        let history = self.entries.entry(key).or_insert_with(|| History {
            versions: Vec::new(),
        });
        let previous = history.current().cloned();
        history.apply(offset, Some(value));
        previous
    }

    /// Deletes the entry as of `offset`, returning the previously current
    /// value. The history keeps a tombstone so point-in-time reads before
    /// `offset` still observe the old value.
    pub fn remove(&mut self, key: &K, offset: LogOffset) -> Option<V>
    where
        V: Clone,
    {
        let history = self.entries.get_mut(key)?;
        let previous = history.current().cloned();
        if previous.is_some() {
            history.apply(offset, None);
        }
        previous
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).and_then(History::current)
    }

    /// Reads the entry as it was after applying every record up to and
    /// including `offset`.
    pub fn get_at(&self, key: &K, offset: LogOffset) -> Option<&V> {
        self.entries.get(key).and_then(|history| history.at(offset))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries
            .iter()
            .filter_map(|(key, history)| history.current().map(|value| (key, value)))
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops history no reader can need anymore: every version strictly
    /// before the last one at or below `offset`, and entries that are fully
    /// deleted by then.
    pub fn purge_up_to(&mut self, offset: LogOffset) {
        self.entries.retain(|_, history| {
            let effective = history
                .versions
                .iter()
                .rposition(|(recorded, _)| *recorded <= offset);
            if let Some(index) = effective {
                history.versions.drain(..index);
                if history.versions.len() == 1 && history.versions[0].1.is_none() {
                    return false;
                }
            }
            !history.versions.is_empty()
        });
    }
}
