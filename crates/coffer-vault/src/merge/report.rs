//! What a merge did, and what it could not decide.

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

/// One applied change, in the order the merge made it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MergeChange {
    /// Remote-only group grafted into the result.
    GroupAdded {
        /// Group identity.
        id: Uuid,
    },
    /// Remote-only entry grafted into the result.
    EntryAdded {
        /// Entry identity.
        id: Uuid,
    },
    /// Group content taken from the remote side.
    GroupUpdated {
        /// Group identity.
        id: Uuid,
    },
    /// Entry content taken from the remote side.
    EntryUpdated {
        /// Entry identity.
        id: Uuid,
    },
    /// Item moved to the remote side's parent.
    Relocated {
        /// Item identity.
        id: Uuid,
        /// Previous parent.
        from: Option<Uuid>,
        /// New parent.
        to: Uuid,
    },
    /// Item dropped because a deletion record supersedes it.
    RemovedByDeletion {
        /// Item identity.
        id: Uuid,
    },
    /// Entry history grew by `count` snapshots.
    HistorySnapshotsAdded {
        /// Entry identity.
        id: Uuid,
        /// Snapshots added.
        count: usize,
    },
    /// Remote attachment stored under a fresh pool id.
    BinaryRehomed {
        /// Remote pool id.
        from: u32,
        /// Pool id in the result.
        to: u32,
    },
    /// Custom icon image replaced by the newer remote one.
    IconUpdated {
        /// Icon identity.
        id: Uuid,
    },
    /// Remote icon identical to a local one under another identity.
    IconFolded {
        /// Remote icon identity.
        from: Uuid,
        /// Local icon identity now referenced.
        to: Uuid,
    },
    /// Database metadata field taken from the remote side.
    MetaUpdated {
        /// camelCase field name.
        field: String,
    },
}

/// A decision the merge made without enough information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MergeConflict {
    /// Item re-parented under the root because its ancestry could not be
    /// resolved, or skipped because its identity is used by the other kind
    /// of item.
    Unresolved {
        /// Item identity.
        id: Uuid,
        /// Human-readable cause.
        reason: String,
    },
    /// A remote move that would have made a group its own ancestor.
    CyclicMoveRefused {
        /// Group identity.
        id: Uuid,
        /// Requested parent.
        parent: Uuid,
    },
    /// A later remote move into a group that is not in the merged tree.
    /// The item keeps its local location.
    MoveTargetMissing {
        /// Item identity.
        id: Uuid,
        /// Requested parent.
        parent: Uuid,
    },
    /// Same modification time, different content; local content kept.
    SameTimestampDivergence {
        /// Item identity.
        id: Uuid,
    },
}

/// Ordered record of a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    /// Applied changes.
    pub changes: Vec<MergeChange>,
    /// Conflicts needing user confirmation.
    pub conflicts: Vec<MergeConflict>,
}

/// Change and conflict counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeSummary {
    /// Groups and entries added.
    pub added: usize,
    /// Groups and entries updated.
    pub updated: usize,
    /// Items relocated.
    pub relocated: usize,
    /// Items removed by deletion records.
    pub removed: usize,
    /// History snapshots added.
    pub history_snapshots: usize,
    /// Attachments re-homed.
    pub binaries_rehomed: usize,
    /// Icons updated or folded.
    pub icons: usize,
    /// Metadata fields updated.
    pub meta: usize,
    /// Conflicts.
    pub conflicts: usize,
}

impl MergeReport {
    /// Whether anything needs confirmation.
    #[must_use]
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Whether the merge changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.conflicts.is_empty()
    }

    /// Counters over the report.
    #[must_use]
    pub fn summary(&self) -> MergeSummary {
        let mut s = MergeSummary {
            conflicts: self.conflicts.len(),
            ..MergeSummary::default()
        };
        for change in &self.changes {
            let counter = match change {
                MergeChange::GroupAdded { .. } | MergeChange::EntryAdded { .. } => &mut s.added,
                MergeChange::GroupUpdated { .. } | MergeChange::EntryUpdated { .. } => &mut s.updated,
                MergeChange::Relocated { .. } => &mut s.relocated,
                MergeChange::RemovedByDeletion { .. } => &mut s.removed,
                MergeChange::HistorySnapshotsAdded { count, .. } => {
                    s.history_snapshots = s.history_snapshots.saturating_add(*count);
                    continue;
                }
                MergeChange::BinaryRehomed { .. } => &mut s.binaries_rehomed,
                MergeChange::IconUpdated { .. } | MergeChange::IconFolded { .. } => &mut s.icons,
                MergeChange::MetaUpdated { .. } => &mut s.meta,
            };
            *counter = counter.saturating_add(1);
        }
        s
    }

    pub(crate) fn change(&mut self, change: MergeChange) {
        tracing::debug!(?change, "merge change");
        self.changes.push(change);
    }

    pub(crate) fn conflict(&mut self, conflict: MergeConflict) {
        tracing::warn!(?conflict, "merge conflict");
        self.conflicts.push(conflict);
    }
}

impl fmt::Display for MergeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} added, {} updated, {} relocated, {} removed, {} history snapshots, {} conflicts",
            self.added, self.updated, self.relocated, self.removed, self.history_snapshots, self.conflicts
        )
    }
}
