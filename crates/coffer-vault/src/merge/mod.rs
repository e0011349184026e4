//! Two-way database merge.
//!
//! This module provides:
//! - [`merge`]: deterministic latest-wins reconciliation of two copies of
//!   one database
//! - [`MergeReport`]: the ordered changes and conflicts of a run
//!
//! The local copy is the base. Remote items are visited in preorder so a
//! remote parent is always settled before its children. All decisions use
//! timestamps carried by the data; the wall clock is never read, so merging
//! a database with itself is a no-op.

mod history;
mod pools;
mod report;

use std::collections::BTreeSet;

use uuid::Uuid;

pub use report::{MergeChange, MergeConflict, MergeReport, MergeSummary};

use crate::error::TreeError;
use crate::meta::Meta;
use crate::times::Timestamp;
use crate::tree::Database;

/// Merge `remote` into a copy of `local`.
///
/// Total: every input yields a valid tree, with anything the merge could
/// not place recorded in [`MergeReport::conflicts`].
#[must_use]
pub fn merge(local: &Database, remote: &Database) -> (Database, MergeReport) {
    let mut out = local.clone();
    let mut theirs = remote.clone();
    let mut report = MergeReport::default();

    pools::merge_binaries(&mut out, &mut theirs, &mut report);
    pools::merge_icons(&mut out, &mut theirs, &mut report);
    merge_meta(&mut out.meta, &theirs.meta, &mut report);
    if out.public_custom_data.is_none() {
        out.public_custom_data.clone_from(&theirs.public_custom_data);
    }
    out.deleted_objects.union(&theirs.deleted_objects);

    Walk {
        out: &mut out,
        remote: &theirs,
        report: &mut report,
    }
    .run();

    apply_deletions(&mut out, &mut report);
    repair(&mut out, &mut report);
    out.compact_binaries();

    tracing::info!(summary = %report.summary(), "merged databases");
    (out, report)
}

// ---------------------------------------------------------------------------
// Tree walk
// ---------------------------------------------------------------------------

struct Walk<'a> {
    out: &'a mut Database,
    remote: &'a Database,
    report: &'a mut MergeReport,
}

impl Walk<'_> {
    fn run(&mut self) {
        let remote = self.remote;
        if let (Some(local_root), Some(remote_root)) =
            (self.out.groups.get_mut(&self.out.root), remote.groups.get(&remote.root))
        {
            history::merge_group(local_root, remote_root, self.report);
        }

        let mut stack = vec![remote.root];
        while let Some(id) = stack.pop() {
            let Some(group) = remote.groups.get(&id) else {
                continue;
            };
            if id != remote.root {
                self.visit_group(id);
            }
            for entry in &group.entries {
                self.visit_entry(*entry);
            }
            stack.extend(group.groups.iter().rev().copied());
        }
    }

    /// Remote parent expressed in the merged tree.
    fn target_parent(&self, parent: Option<Uuid>) -> Option<Uuid> {
        parent.map(|p| if p == self.remote.root { self.out.root } else { p })
    }

    fn visit_group(&mut self, id: Uuid) {
        let remote = self.remote;
        let Some(theirs) = remote.groups.get(&id) else {
            return;
        };
        let parent = self.target_parent(theirs.parent);

        if let Some(ours) = self.out.groups.get_mut(&id) {
            history::merge_group(ours, theirs, self.report);
            self.relocate(id, true, parent, theirs.times.location_changed);
        } else if self.out.entries.contains_key(&id) {
            self.report.conflict(MergeConflict::Unresolved {
                id,
                reason: "identity is an entry locally".into(),
            });
        } else if !self
            .out
            .deleted_objects
            .supersedes(&id, &theirs.times.last_modification)
        {
            let parent = self.resolve_parent(id, parent);
            self.out.groups.insert(id, theirs.detached());
            self.out.attach_group(id, parent);
            self.report.change(MergeChange::GroupAdded { id });
        }
    }

    fn visit_entry(&mut self, id: Uuid) {
        let remote = self.remote;
        let Some(theirs) = remote.entries.get(&id) else {
            return;
        };
        let parent = self.target_parent(theirs.parent);

        if self.out.entries.contains_key(&id) {
            let Database { entries, binaries, .. } = &mut *self.out;
            if let Some(ours) = entries.get_mut(&id) {
                history::merge_entry(ours, theirs, binaries, self.report);
            }
            self.relocate(id, false, parent, theirs.times.location_changed);
        } else if self.out.groups.contains_key(&id) {
            self.report.conflict(MergeConflict::Unresolved {
                id,
                reason: "identity is a group locally".into(),
            });
        } else if !self
            .out
            .deleted_objects
            .supersedes(&id, &theirs.times.last_modification)
        {
            let parent = self.resolve_parent(id, parent);
            let mut entry = theirs.clone();
            entry.parent = None;
            self.out.entries.insert(id, entry);
            self.out.attach_entry(id, parent);
            self.report.change(MergeChange::EntryAdded { id });
        }
    }

    /// `parent` if it is a group of the merged tree, otherwise the root.
    fn resolve_parent(&mut self, id: Uuid, parent: Option<Uuid>) -> Uuid {
        match parent {
            Some(p) if self.out.groups.contains_key(&p) => p,
            _ => {
                self.report.conflict(MergeConflict::Unresolved {
                    id,
                    reason: "parent is not in the merged tree".into(),
                });
                self.out.root
            }
        }
    }

    /// Follow the remote location when it changed later than the local one.
    fn relocate(&mut self, id: Uuid, is_group: bool, target: Option<Uuid>, remote_changed: Timestamp) {
        let Some(target) = target else {
            return;
        };
        if id == self.out.root {
            return;
        }
        let current = self.out.parent_of(id);
        let local_changed = self.out.node(id).map(|n| n.times().location_changed);
        let Some(local_changed) = local_changed else {
            return;
        };
        if remote_changed <= local_changed {
            return;
        }
        if current != Some(target) {
            if !self.out.groups.contains_key(&target) {
                self.report.conflict(MergeConflict::MoveTargetMissing { id, parent: target });
                return;
            }
            if is_group && self.out.is_ancestor_or_self(id, target) {
                self.report.conflict(MergeConflict::CyclicMoveRefused { id, parent: target });
                return;
            }
            self.out.detach(id);
            if is_group {
                self.out.attach_group(id, target);
            } else {
                self.out.attach_entry(id, target);
            }
            self.report.change(MergeChange::Relocated {
                id,
                from: current,
                to: target,
            });
        }
        if let Some(group) = self.out.groups.get_mut(&id) {
            group.times.location_changed = remote_changed;
        } else if let Some(entry) = self.out.entries.get_mut(&id) {
            entry.times.location_changed = remote_changed;
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

fn take_newer<T: Clone + PartialEq>(
    field: &str,
    value: &mut T,
    changed: &mut Option<Timestamp>,
    remote_value: &T,
    remote_changed: Option<Timestamp>,
    report: &mut MergeReport,
) {
    if remote_changed <= *changed {
        return;
    }
    if value != remote_value {
        value.clone_from(remote_value);
        report.change(MergeChange::MetaUpdated { field: field.into() });
    }
    *changed = remote_changed;
}

fn merge_meta(ours: &mut Meta, theirs: &Meta, report: &mut MergeReport) {
    take_newer(
        "databaseName",
        &mut ours.database_name,
        &mut ours.database_name_changed,
        &theirs.database_name,
        theirs.database_name_changed,
        report,
    );
    take_newer(
        "description",
        &mut ours.description,
        &mut ours.description_changed,
        &theirs.description,
        theirs.description_changed,
        report,
    );
    take_newer(
        "defaultUserName",
        &mut ours.default_user_name,
        &mut ours.default_user_name_changed,
        &theirs.default_user_name,
        theirs.default_user_name_changed,
        report,
    );
    let mut bin = (ours.recycle_bin_enabled, ours.recycle_bin);
    take_newer(
        "recycleBin",
        &mut bin,
        &mut ours.recycle_bin_changed,
        &(theirs.recycle_bin_enabled, theirs.recycle_bin),
        theirs.recycle_bin_changed,
        report,
    );
    (ours.recycle_bin_enabled, ours.recycle_bin) = bin;
    take_newer(
        "entryTemplatesGroup",
        &mut ours.entry_templates_group,
        &mut ours.entry_templates_group_changed,
        &theirs.entry_templates_group,
        theirs.entry_templates_group_changed,
        report,
    );
    ours.settings_changed = ours.settings_changed.max(theirs.settings_changed);

    for (key, item) in &theirs.custom_data {
        match ours.custom_data.get_mut(key) {
            Some(local) if local != item && item.last_modified > local.last_modified => {
                local.clone_from(item);
                report.change(MergeChange::MetaUpdated {
                    field: format!("customData.{key}"),
                });
            }
            Some(_) => {}
            None => {
                ours.custom_data.insert(key.clone(), item.clone());
                report.change(MergeChange::MetaUpdated {
                    field: format!("customData.{key}"),
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Deletions and repair
// ---------------------------------------------------------------------------

fn apply_deletions(out: &mut Database, report: &mut MergeReport) {
    let log = &out.deleted_objects;
    let doomed: BTreeSet<Uuid> = out
        .groups
        .values()
        .filter(|g| g.uuid != out.root)
        .map(|g| (g.uuid, g.times.last_modification))
        .chain(out.entries.values().map(|e| (e.uuid, e.times.last_modification)))
        .filter(|(id, modified)| log.supersedes(id, modified))
        .map(|(id, _)| id)
        .collect();
    if doomed.is_empty() {
        return;
    }

    let orphans: Vec<(Uuid, bool)> = out
        .groups
        .values()
        .map(|g| (g.uuid, g.parent, true))
        .chain(out.entries.values().map(|e| (e.uuid, e.parent, false)))
        .filter(|(id, parent, _)| !doomed.contains(id) && parent.is_some_and(|p| doomed.contains(&p)))
        .map(|(id, _, is_group)| (id, is_group))
        .collect();
    let root = out.root;
    for (id, is_group) in orphans {
        out.detach(id);
        if is_group {
            out.attach_group(id, root);
        } else {
            out.attach_entry(id, root);
        }
        report.conflict(MergeConflict::Unresolved {
            id,
            reason: "parent removed by a deletion record".into(),
        });
    }

    for id in &doomed {
        out.detach(*id);
        out.groups.remove(id);
        out.entries.remove(id);
        report.change(MergeChange::RemovedByDeletion { id: *id });
    }
    for slot in [&mut out.meta.recycle_bin, &mut out.meta.entry_templates_group] {
        if slot.is_some_and(|g| doomed.contains(&g)) {
            *slot = None;
        }
    }
}

/// Re-attach anything unreachable (cycles, lost parents) under the root.
fn repair(out: &mut Database, report: &mut MergeReport) {
    let bound = out.groups.len().saturating_add(out.entries.len());
    for _ in 0..=bound {
        match out.validate() {
            Ok(()) => return,
            Err(TreeError::Unreachable(id)) => {
                let root = out.root;
                out.detach(id);
                if out.groups.contains_key(&id) {
                    out.attach_group(id, root);
                } else {
                    out.attach_entry(id, root);
                }
                report.conflict(MergeConflict::Unresolved {
                    id,
                    reason: "unreachable from the root".into(),
                });
            }
            Err(err) => {
                tracing::warn!(error = %err, "merged tree failed validation");
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
