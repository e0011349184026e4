//! Deletion log: tombstones that keep removed items from resurrecting.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::times::Timestamp;

/// Identity → time of permanent removal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionLog {
    records: BTreeMap<Uuid, Timestamp>,
}

impl DeletionLog {
    /// Empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a removal, keeping the later time if `id` is already logged.
    pub fn record(&mut self, id: Uuid, at: Timestamp) {
        self.records
            .entry(id)
            .and_modify(|existing| {
                if at > *existing {
                    *existing = at;
                }
            })
            .or_insert(at);
    }

    /// Removal time of `id`.
    #[must_use]
    pub fn deleted_at(&self, id: &Uuid) -> Option<Timestamp> {
        self.records.get(id).copied()
    }

    /// Whether `id` was removed at or after `modified`, i.e. the removal
    /// supersedes that version of the item.
    #[must_use]
    pub fn supersedes(&self, id: &Uuid, modified: &Timestamp) -> bool {
        self.records.get(id).is_some_and(|at| at >= modified)
    }

    /// Union with `other`; per identity the latest time wins.
    ///
    /// Returns the number of records added or moved forward.
    pub fn union(&mut self, other: &Self) -> usize {
        let mut changed = 0usize;
        for (id, at) in &other.records {
            if self.records.get(id).map_or(true, |mine| at > mine) {
                self.records.insert(*id, *at);
                changed = changed.saturating_add(1);
            }
        }
        changed
    }

    /// Iterate in identity order.
    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &Timestamp)> {
        self.records.iter()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
