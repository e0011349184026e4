//! Latest-wins reconciliation of items present on both sides.

use std::collections::BTreeSet;

use super::report::{MergeChange, MergeConflict, MergeReport};
use crate::attachments::BinaryPool;
use crate::digest::ContentHash;
use crate::entries::Entry;
use crate::groups::Group;
use crate::times::Timestamp;

type SnapshotKey = (Timestamp, ContentHash);

fn key(entry: &Entry, pool: &BinaryPool) -> SnapshotKey {
    (entry.times.last_modification, entry.content_hash(pool))
}

/// Union of two snapshot stacks, de-duplicated by (modification time,
/// content hash) and sorted ascending. `primary` keeps its order among
/// equal timestamps and comes first.
pub(super) fn union_history(primary: &[Entry], secondary: &[Entry], pool: &BinaryPool) -> Vec<Entry> {
    let mut seen: BTreeSet<SnapshotKey> = BTreeSet::new();
    let mut merged = Vec::with_capacity(primary.len().saturating_add(secondary.len()));
    for snap in primary.iter().chain(secondary) {
        if seen.insert(key(snap, pool)) {
            merged.push(snap.snapshot());
        }
    }
    merged.sort_by_key(|snap| snap.times.last_modification);
    merged
}

/// Merge `remote` into `local`, both describing the same entry.
///
/// Location fields (parent, `location_changed`) are left to the caller.
pub(super) fn merge_entry(local: &mut Entry, remote: &Entry, pool: &BinaryPool, report: &mut MergeReport) {
    let id = local.uuid;
    let before = local.history.len();
    let local_time = local.times.last_modification;
    let remote_time = remote.times.last_modification;

    let last_access = local.times.last_access.max(remote.times.last_access);
    let usage_count = local.times.usage_count.max(remote.times.usage_count);

    if remote_time > local_time {
        let mut own = local.history.clone();
        own.push(local.snapshot());
        let history = union_history(&remote.history, &own, pool);

        let mut merged = remote.clone();
        merged.uuid = id;
        merged.parent = local.parent;
        merged.times.location_changed = local.times.location_changed;
        merged.history = history;
        *local = merged;
        report.change(MergeChange::EntryUpdated { id });
    } else {
        let mut theirs = remote.history.clone();
        if local_time > remote_time {
            theirs.push(remote.snapshot());
        } else if local.content_hash(pool) != remote.content_hash(pool) {
            report.conflict(MergeConflict::SameTimestampDivergence { id });
        }
        local.history = union_history(&local.history, &theirs, pool);
    }

    local.times.last_access = last_access;
    local.times.usage_count = usage_count;

    let added = local.history.len().saturating_sub(before);
    if added > 0 {
        report.change(MergeChange::HistorySnapshotsAdded { id, count: added });
    }
}

/// Merge `remote`'s own content into `local`; children and location are
/// left untouched.
pub(super) fn merge_group(local: &mut Group, remote: &Group, report: &mut MergeReport) {
    let id = local.uuid;
    let last_access = local.times.last_access.max(remote.times.last_access);
    let usage_count = local.times.usage_count.max(remote.times.usage_count);

    if remote.times.last_modification > local.times.last_modification {
        let mut merged = remote.detached();
        merged.uuid = id;
        merged.parent = local.parent;
        merged.times.location_changed = local.times.location_changed;
        merged.groups = std::mem::take(&mut local.groups);
        merged.entries = std::mem::take(&mut local.entries);
        *local = merged;
        report.change(MergeChange::GroupUpdated { id });
    } else if remote.times.last_modification == local.times.last_modification
        && remote.content_hash() != local.content_hash()
    {
        report.conflict(MergeConflict::SameTimestampDivergence { id });
    }

    local.times.last_access = last_access;
    local.times.usage_count = usage_count;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::times::{now, Times};
    use chrono::TimeDelta;

    fn at(entry: &mut Entry, offset: i64) {
        entry.times = Times::at(now() + TimeDelta::seconds(offset));
    }

    fn pair() -> (Entry, Entry) {
        let mut local = Entry::new();
        local.set("Title", "x");
        at(&mut local, 0);
        let mut remote = local.clone();
        remote.set("Title", "y");
        at(&mut remote, 60);
        (local, remote)
    }

    #[test]
    fn later_remote_wins_and_keeps_local_in_history() {
        let (mut local, remote) = pair();
        let mut report = MergeReport::default();
        merge_entry(&mut local, &remote, &BinaryPool::new(), &mut report);

        assert_eq!(local.title(), "y");
        assert_eq!(local.history().len(), 1);
        assert_eq!(local.history()[0].title(), "x");
        assert!(report.changes.contains(&MergeChange::EntryUpdated { id: local.uuid() }));
    }

    #[test]
    fn later_local_wins_and_keeps_remote_in_history() {
        let (remote, mut local) = pair();
        let mut report = MergeReport::default();
        merge_entry(&mut local, &remote, &BinaryPool::new(), &mut report);

        assert_eq!(local.title(), "y");
        assert_eq!(local.history()[0].title(), "x");
        assert!(!report.changes.contains(&MergeChange::EntryUpdated { id: local.uuid() }));
    }

    #[test]
    fn equal_times_with_different_content_are_flagged() {
        let (mut local, mut remote) = pair();
        remote.times = local.times.clone();
        let mut report = MergeReport::default();
        merge_entry(&mut local, &remote, &BinaryPool::new(), &mut report);

        assert_eq!(local.title(), "x");
        assert!(local.history().is_empty());
        assert_eq!(report.conflicts, vec![MergeConflict::SameTimestampDivergence { id: local.uuid() }]);
    }

    #[test]
    fn union_drops_duplicates_and_sorts() {
        let (a, b) = pair();
        let pool = BinaryPool::new();
        let merged = union_history(&[b.clone(), a.clone()], &[a.clone(), b], &pool);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].title(), "x");
        assert_eq!(merged[1].title(), "y");
    }

    #[test]
    fn merging_identical_entries_changes_nothing() {
        let (mut local, _) = pair();
        let remote = local.clone();
        let before = local.clone();
        let mut report = MergeReport::default();
        merge_entry(&mut local, &remote, &BinaryPool::new(), &mut report);
        assert_eq!(local, before);
        assert!(report.is_empty());
    }

    #[test]
    fn newer_group_content_keeps_local_children() {
        let mut local = Group::new("Old");
        local.times = Times::at(now());
        local.entries.push(uuid::Uuid::new_v4());
        let mut remote = local.detached();
        remote.name = "New".into();
        remote.times.last_modification = local.times.last_modification + TimeDelta::seconds(1);

        let mut report = MergeReport::default();
        merge_group(&mut local, &remote, &mut report);
        assert_eq!(local.name, "New");
        assert_eq!(local.entries().len(), 1);
    }
}
