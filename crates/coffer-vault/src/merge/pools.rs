//! Attachment and custom icon pool merging.
//!
//! Both pools are content-addressed during the merge: identical bytes end
//! up under one identity, and the remote side's references are rewritten to
//! the identities chosen for the result.

use std::collections::BTreeMap;

use uuid::Uuid;

use super::report::{MergeChange, MergeReport};
use crate::attachments::BinaryId;
use crate::tree::Database;

/// Bring the remote attachments into `out` and rewrite every remote
/// reference (history included) to its id in `out`.
pub(super) fn merge_binaries(out: &mut Database, remote: &mut Database, report: &mut MergeReport) {
    let mut mapping: BTreeMap<BinaryId, BinaryId> = BTreeMap::new();
    for (id, binary) in remote.binaries.iter() {
        let known = out.binaries.find_by_hash(&binary.content_hash()).is_some();
        let target = if known {
            // Returns the pooled twin and ORs the protection flag.
            out.binaries.insert(binary.clone())
        } else if out.binaries.contains(id) {
            let fresh = out.binaries.insert(binary.clone());
            report.change(MergeChange::BinaryRehomed { from: id.0, to: fresh.0 });
            fresh
        } else {
            out.binaries.insert_at(id, binary.clone());
            id
        };
        mapping.insert(id, target);
    }

    if mapping.iter().all(|(from, to)| from == to) {
        return;
    }
    let rewrite = |id: BinaryId| mapping.get(&id).copied().unwrap_or(id);
    for entry in remote.entries.values_mut() {
        entry.rewrite_binary_refs(&rewrite);
    }
}

/// Bring the remote custom icons into `out.meta` and rewrite remote icon
/// references that were folded onto a local identity.
///
/// An identity present on both sides with different images keeps the one
/// with the later modification time; ties keep the local image.
pub(super) fn merge_icons(out: &mut Database, remote: &mut Database, report: &mut MergeReport) {
    let mut folded: BTreeMap<Uuid, Uuid> = BTreeMap::new();
    for (id, icon) in &remote.meta.custom_icons {
        if let Some(local) = out.meta.custom_icons.get_mut(id) {
            if local != icon && icon.last_modified > local.last_modified {
                *local = icon.clone();
                report.change(MergeChange::IconUpdated { id: *id });
            }
            continue;
        }
        let hash = icon.content_hash();
        let twin = out
            .meta
            .custom_icons
            .iter()
            .find(|(_, candidate)| candidate.content_hash() == hash)
            .map(|(twin, _)| *twin);
        if let Some(twin) = twin {
            report.change(MergeChange::IconFolded { from: *id, to: twin });
            folded.insert(*id, twin);
        } else {
            out.meta.custom_icons.insert(*id, icon.clone());
        }
    }

    if folded.is_empty() {
        return;
    }
    let rewrite = |id: Uuid| folded.get(&id).copied().unwrap_or(id);
    for entry in remote.entries.values_mut() {
        entry.rewrite_icon_refs(&rewrite);
    }
    for group in remote.groups.values_mut() {
        group.custom_icon = group.custom_icon.map(rewrite);
    }
}
