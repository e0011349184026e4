//! The credential tree: an arena of groups and entries keyed by identity.
//!
//! This module provides:
//! - [`Database`]: the root group, metadata, attachment pool and deletion
//!   log of one KDBX file
//! - edit operations that keep the tree consistent (parent links, history
//!   snapshots, deletion records)
//! - navigation helpers and [`Database::validate`]
//!
//! Parents are stored as identity references and children as ordered
//! identity lists, so moving a subtree never copies it.

use std::collections::{BTreeMap, BTreeSet};

use chrono::TimeDelta;
use coffer_crypto_core::VariantDictionary;
use uuid::Uuid;

use crate::attachments::{Binary, BinaryId, BinaryPool};
use crate::deleted::DeletionLog;
use crate::entries::Entry;
use crate::error::TreeError;
use crate::groups::Group;
use crate::meta::Meta;
use crate::times::{now, Timestamp, Times};

/// Built-in icon of the recycle bin group.
pub const RECYCLE_BIN_ICON: u32 = 43;

/// Name given to a recycle bin created on first use.
pub const RECYCLE_BIN_NAME: &str = "Recycle Bin";

/// Borrowed view of either kind of tree item.
#[derive(Debug, Clone, Copy)]
pub enum Node<'a> {
    /// A group.
    Group(&'a Group),
    /// An entry.
    Entry(&'a Entry),
}

impl Node<'_> {
    /// Identity of the item.
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        match self {
            Self::Group(g) => g.uuid,
            Self::Entry(e) => e.uuid,
        }
    }

    /// Timestamps of the item.
    #[must_use]
    pub const fn times(&self) -> &Times {
        match self {
            Self::Group(g) => &g.times,
            Self::Entry(e) => &e.times,
        }
    }
}

/// A complete credential database.
#[derive(Debug, Clone, PartialEq)]
pub struct Database {
    /// File metadata.
    pub meta: Meta,
    /// Unencrypted KDBX 4 header custom data, carried through unchanged.
    pub public_custom_data: Option<VariantDictionary>,
    pub(crate) root: Uuid,
    pub(crate) groups: BTreeMap<Uuid, Group>,
    pub(crate) entries: BTreeMap<Uuid, Entry>,
    pub(crate) binaries: BinaryPool,
    pub(crate) deleted_objects: DeletionLog,
}

impl Database {
    /// Empty database whose root group is named `name`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        let mut meta = Meta::default();
        meta.database_name = name.to_owned();
        Self::with_root(Group::new(name), meta)
    }

    pub(crate) fn with_root(mut root: Group, meta: Meta) -> Self {
        root.parent = None;
        root.groups.clear();
        root.entries.clear();
        let id = root.uuid;
        let mut groups = BTreeMap::new();
        groups.insert(id, root);
        Self {
            meta,
            public_custom_data: None,
            root: id,
            groups,
            entries: BTreeMap::new(),
            binaries: BinaryPool::new(),
            deleted_objects: DeletionLog::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Navigation
    // -----------------------------------------------------------------------

    /// Identity of the root group.
    #[must_use]
    pub const fn root_id(&self) -> Uuid {
        self.root
    }

    /// The root group.
    ///
    /// # Panics
    ///
    /// Never: the root is present by construction.
    #[must_use]
    pub fn root(&self) -> &Group {
        &self.groups[&self.root]
    }

    /// Group by identity.
    #[must_use]
    pub fn group(&self, id: Uuid) -> Option<&Group> {
        self.groups.get(&id)
    }

    /// Mutable group access without touching timestamps.
    pub fn group_mut(&mut self, id: Uuid) -> Option<&mut Group> {
        self.groups.get_mut(&id)
    }

    /// Entry by identity.
    #[must_use]
    pub fn entry(&self, id: Uuid) -> Option<&Entry> {
        self.entries.get(&id)
    }

    /// Mutable entry access without a history snapshot.
    pub fn entry_mut(&mut self, id: Uuid) -> Option<&mut Entry> {
        self.entries.get_mut(&id)
    }

    /// Group or entry by identity.
    #[must_use]
    pub fn node(&self, id: Uuid) -> Option<Node<'_>> {
        self.groups
            .get(&id)
            .map(Node::Group)
            .or_else(|| self.entries.get(&id).map(Node::Entry))
    }

    /// Whether a group or entry with this identity exists.
    #[must_use]
    pub fn contains(&self, id: Uuid) -> bool {
        self.groups.contains_key(&id) || self.entries.contains_key(&id)
    }

    /// Parent group of `id`.
    #[must_use]
    pub fn parent_of(&self, id: Uuid) -> Option<Uuid> {
        match self.node(id)? {
            Node::Group(g) => g.parent,
            Node::Entry(e) => e.parent,
        }
    }

    /// Identities from the root down to `id`, both included.
    #[must_use]
    pub fn path(&self, id: Uuid) -> Option<Vec<Uuid>> {
        if !self.contains(id) {
            return None;
        }
        let mut path = vec![id];
        let mut current = id;
        while let Some(parent) = self.parent_of(current) {
            if path.contains(&parent) || path.len() > self.groups.len() {
                return None;
            }
            path.push(parent);
            current = parent;
        }
        path.reverse();
        (path.first() == Some(&self.root)).then_some(path)
    }

    /// Items below group `id` in preorder (each group's entries, then its
    /// sub-groups recursively). `id` itself is not included.
    #[must_use]
    pub fn descendants(&self, id: Uuid) -> Vec<Node<'_>> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        self.collect_descendants(id, &mut seen, &mut out);
        out
    }

    fn collect_descendants<'a>(&'a self, id: Uuid, seen: &mut BTreeSet<Uuid>, out: &mut Vec<Node<'a>>) {
        let Some(group) = self.groups.get(&id) else {
            return;
        };
        if !seen.insert(id) {
            return;
        }
        for entry in group.entries.iter().filter_map(|e| self.entries.get(e)) {
            out.push(Node::Entry(entry));
        }
        for child in &group.groups {
            if let Some(g) = self.groups.get(child) {
                out.push(Node::Group(g));
                self.collect_descendants(*child, seen, out);
            }
        }
    }

    /// All groups in identity order.
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// All entries in identity order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    /// The attachment pool.
    #[must_use]
    pub const fn binaries(&self) -> &BinaryPool {
        &self.binaries
    }

    /// Add an attachment to the pool, de-duplicating by content.
    pub fn add_binary(&mut self, binary: Binary) -> BinaryId {
        self.binaries.insert(binary)
    }

    /// Deletion records.
    #[must_use]
    pub const fn deleted_objects(&self) -> &DeletionLog {
        &self.deleted_objects
    }

    /// Whether `ancestor` is `id` or one of its ancestors.
    #[must_use]
    pub fn is_ancestor_or_self(&self, ancestor: Uuid, id: Uuid) -> bool {
        let mut current = Some(id);
        let mut steps = 0usize;
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            steps = steps.saturating_add(1);
            if steps > self.groups.len() {
                return false;
            }
            current = self.parent_of(c);
        }
        false
    }

    /// Whether `id` is the recycle bin or inside it.
    #[must_use]
    pub fn is_in_recycle_bin(&self, id: Uuid) -> bool {
        self.meta
            .recycle_bin
            .filter(|bin| self.groups.contains_key(bin))
            .is_some_and(|bin| self.is_ancestor_or_self(bin, id))
    }

    // -----------------------------------------------------------------------
    // Edits
    // -----------------------------------------------------------------------

    fn require_group(&self, id: Uuid) -> Result<(), TreeError> {
        if self.groups.contains_key(&id) {
            Ok(())
        } else if self.entries.contains_key(&id) {
            Err(TreeError::NotAGroup(id))
        } else {
            Err(TreeError::NotFound(id))
        }
    }

    /// Insert `group` (without children) as the last sub-group of `parent`.
    ///
    /// # Errors
    ///
    /// [`TreeError::NotFound`] / [`TreeError::NotAGroup`] for a bad parent,
    /// [`TreeError::DuplicateId`] if the identity is taken.
    pub fn add_group(&mut self, parent: Uuid, mut group: Group) -> Result<Uuid, TreeError> {
        self.require_group(parent)?;
        let id = group.uuid;
        if self.contains(id) {
            return Err(TreeError::DuplicateId(id));
        }
        group.parent = Some(parent);
        group.groups.clear();
        group.entries.clear();
        self.groups.insert(id, group);
        self.attach_group(id, parent);
        Ok(id)
    }

    /// Insert `entry` as the last entry of `parent`.
    ///
    /// # Errors
    ///
    /// As [`Self::add_group`], plus [`TreeError::DanglingAttachment`] if an
    /// attachment reference is not pooled.
    pub fn add_entry(&mut self, parent: Uuid, mut entry: Entry) -> Result<Uuid, TreeError> {
        self.require_group(parent)?;
        let id = entry.uuid;
        if self.contains(id) {
            return Err(TreeError::DuplicateId(id));
        }
        self.check_refs(&entry)?;
        entry.parent = Some(parent);
        self.entries.insert(id, entry);
        self.attach_entry(id, parent);
        Ok(id)
    }

    fn check_refs(&self, entry: &Entry) -> Result<(), TreeError> {
        match entry.all_binary_refs().find(|r| !self.binaries.contains(*r)) {
            Some(missing) => Err(TreeError::DanglingAttachment {
                entry: entry.uuid,
                reference: missing.0,
            }),
            None => Ok(()),
        }
    }

    /// Edit entry `id` through `f`.
    ///
    /// The prior content is appended to the entry's history, the
    /// modification time is bumped past the snapshot's, and the history is
    /// trimmed to the `history_max_items` / `history_max_size` limits.
    /// Identity, parent and history cannot be changed by `f`.
    ///
    /// # Errors
    ///
    /// [`TreeError::NotFound`], or [`TreeError::DanglingAttachment`] if `f`
    /// references an attachment missing from the pool (nothing is changed).
    pub fn update_entry(&mut self, id: Uuid, f: impl FnOnce(&mut Entry)) -> Result<(), TreeError> {
        let current = self.entries.get(&id).ok_or(TreeError::NotFound(id))?;
        let mut next = current.clone();
        f(&mut next);
        next.uuid = id;
        next.parent = current.parent;
        next.history.clone_from(&current.history);
        self.check_refs(&next)?;

        let stamp = bump(current.times.last_modification);
        next.history.push(current.snapshot());
        next.times.last_modification = stamp;
        next.times.last_access = stamp;
        self.trim_history(&mut next);
        self.entries.insert(id, next);
        Ok(())
    }

    fn trim_history(&self, entry: &mut Entry) {
        if let Ok(max) = usize::try_from(self.meta.history_max_items) {
            let excess = entry.history.len().saturating_sub(max);
            entry.history.drain(..excess);
        }
        if let Ok(max) = u64::try_from(self.meta.history_max_size) {
            loop {
                let total = entry
                    .history
                    .iter()
                    .map(|h| h.approximate_size(&self.binaries))
                    .fold(0u64, u64::saturating_add);
                if total <= max || entry.history.is_empty() {
                    break;
                }
                entry.history.remove(0);
            }
        }
    }

    /// Edit group `id` through `f`, bumping its modification time.
    /// Identity, parent and children cannot be changed by `f`.
    ///
    /// # Errors
    ///
    /// [`TreeError::NotFound`] / [`TreeError::NotAGroup`].
    pub fn update_group(&mut self, id: Uuid, f: impl FnOnce(&mut Group)) -> Result<(), TreeError> {
        self.require_group(id)?;
        let group = self.groups.get_mut(&id).ok_or(TreeError::NotFound(id))?;
        let (parent, groups, entries) = (group.parent, group.groups.clone(), group.entries.clone());
        let stamp = bump(group.times.last_modification);
        f(group);
        group.uuid = id;
        group.parent = parent;
        group.groups = groups;
        group.entries = entries;
        group.times.last_modification = stamp;
        Ok(())
    }

    /// Re-parent group `id` as the last sub-group of `new_parent`.
    ///
    /// # Errors
    ///
    /// [`TreeError::RootImmutable`] for the root, [`TreeError::Cycle`] if
    /// `new_parent` is `id` or below it, lookup errors otherwise.
    pub fn move_group(&mut self, id: Uuid, new_parent: Uuid) -> Result<(), TreeError> {
        if id == self.root {
            return Err(TreeError::RootImmutable);
        }
        self.require_group(id)?;
        self.require_group(new_parent)?;
        if self.is_ancestor_or_self(id, new_parent) {
            return Err(TreeError::Cycle { id, parent: new_parent });
        }
        if self.parent_of(id) == Some(new_parent) {
            return Ok(());
        }
        self.detach(id);
        self.attach_group(id, new_parent);
        if let Some(group) = self.groups.get_mut(&id) {
            group.times.location_changed = now();
        }
        Ok(())
    }

    /// Re-parent entry `id` as the last entry of `new_parent`.
    ///
    /// # Errors
    ///
    /// Lookup errors for `id` or `new_parent`.
    pub fn move_entry(&mut self, id: Uuid, new_parent: Uuid) -> Result<(), TreeError> {
        if !self.entries.contains_key(&id) {
            return Err(TreeError::NotFound(id));
        }
        self.require_group(new_parent)?;
        if self.parent_of(id) == Some(new_parent) {
            return Ok(());
        }
        self.detach(id);
        self.attach_entry(id, new_parent);
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.times.location_changed = now();
        }
        Ok(())
    }

    /// The recycle bin, created under the root on first use.
    ///
    /// # Errors
    ///
    /// [`TreeError::RecycleBinDisabled`].
    pub fn recycle_bin(&mut self) -> Result<Uuid, TreeError> {
        if !self.meta.recycle_bin_enabled {
            return Err(TreeError::RecycleBinDisabled);
        }
        if let Some(bin) = self.meta.recycle_bin.filter(|b| self.groups.contains_key(b)) {
            return Ok(bin);
        }
        let mut bin = Group::new(RECYCLE_BIN_NAME);
        bin.icon_id = RECYCLE_BIN_ICON;
        bin.is_expanded = false;
        bin.enable_auto_type = Some(false);
        bin.enable_searching = Some(false);
        let id = self.add_group(self.root, bin)?;
        self.meta.recycle_bin = Some(id);
        self.meta.recycle_bin_changed = Some(now());
        tracing::debug!(%id, "created recycle bin");
        Ok(id)
    }

    /// Move `id` into the recycle bin. Items already in the bin are left
    /// where they are.
    ///
    /// # Errors
    ///
    /// [`TreeError::RootImmutable`], [`TreeError::RecycleBinDisabled`],
    /// [`TreeError::NotFound`].
    pub fn recycle(&mut self, id: Uuid) -> Result<(), TreeError> {
        if id == self.root {
            return Err(TreeError::RootImmutable);
        }
        if !self.contains(id) {
            return Err(TreeError::NotFound(id));
        }
        if !self.meta.recycle_bin_enabled {
            return Err(TreeError::RecycleBinDisabled);
        }
        if self.is_in_recycle_bin(id) {
            return Ok(());
        }
        let bin = self.recycle_bin()?;
        if self.groups.contains_key(&id) {
            self.move_group(id, bin)
        } else {
            self.move_entry(id, bin)
        }
    }

    /// Remove `id` and its subtree for good, recording one deletion per
    /// removed identity. Returns the removed identities in preorder.
    ///
    /// While the recycle bin is enabled only items inside it may be
    /// deleted; deleting the bin itself is allowed.
    ///
    /// # Errors
    ///
    /// [`TreeError::RootImmutable`], [`TreeError::NotFound`],
    /// [`TreeError::NotInRecycleBin`].
    pub fn delete_permanently(&mut self, id: Uuid) -> Result<Vec<Uuid>, TreeError> {
        if id == self.root {
            return Err(TreeError::RootImmutable);
        }
        if !self.contains(id) {
            return Err(TreeError::NotFound(id));
        }
        if self.meta.recycle_bin_enabled && !self.is_in_recycle_bin(id) {
            return Err(TreeError::NotInRecycleBin(id));
        }
        let removed = self.remove_subtree(id);
        let at = now();
        for item in &removed {
            self.deleted_objects.record(*item, at);
        }
        tracing::debug!(%id, count = removed.len(), "deleted permanently");
        Ok(removed)
    }

    /// Permanently delete everything in the recycle bin, keeping the bin.
    ///
    /// # Errors
    ///
    /// None in practice; an absent bin yields an empty list.
    pub fn empty_recycle_bin(&mut self) -> Result<Vec<Uuid>, TreeError> {
        let Some(bin) = self.meta.recycle_bin.filter(|b| self.groups.contains_key(b)) else {
            return Ok(Vec::new());
        };
        let children: Vec<Uuid> = self
            .groups
            .get(&bin)
            .map(|g| g.entries.iter().chain(&g.groups).copied().collect())
            .unwrap_or_default();
        let mut removed = Vec::new();
        let at = now();
        for child in children {
            for item in self.remove_subtree(child) {
                self.deleted_objects.record(item, at);
                removed.push(item);
            }
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Check every structural invariant.
    ///
    /// # Errors
    ///
    /// The first violation found: duplicate identities, parent/child
    /// disagreement, unreachable items (which includes cycles), dangling
    /// attachment references, unordered history.
    pub fn validate(&self) -> Result<(), TreeError> {
        if let Some(dup) = self.groups.keys().find(|id| self.entries.contains_key(id)) {
            return Err(TreeError::DuplicateId(*dup));
        }
        let root = self.groups.get(&self.root).ok_or(TreeError::NotFound(self.root))?;
        if root.parent.is_some() {
            return Err(TreeError::ParentMismatch(self.root));
        }

        for (id, group) in &self.groups {
            if *id != self.root {
                let parent = group.parent.ok_or(TreeError::ParentMismatch(*id))?;
                let listed = self
                    .groups
                    .get(&parent)
                    .map_or(0, |p| p.groups.iter().filter(|c| *c == id).count());
                if listed != 1 {
                    return Err(TreeError::ParentMismatch(*id));
                }
            }
            for child in &group.groups {
                if self.groups.get(child).and_then(|c| c.parent) != Some(*id) {
                    return Err(TreeError::ParentMismatch(*child));
                }
            }
            for child in &group.entries {
                if self.entries.get(child).and_then(|c| c.parent) != Some(*id) {
                    return Err(TreeError::ParentMismatch(*child));
                }
            }
        }

        for (id, entry) in &self.entries {
            let parent = entry.parent.ok_or(TreeError::ParentMismatch(*id))?;
            let listed = self
                .groups
                .get(&parent)
                .map_or(0, |p| p.entries.iter().filter(|c| *c == id).count());
            if listed != 1 {
                return Err(TreeError::ParentMismatch(*id));
            }
            self.check_refs(entry)?;
            let ordered = entry
                .history
                .windows(2)
                .all(|w| matches!(w, [a, b] if a.times.last_modification <= b.times.last_modification));
            if !ordered {
                return Err(TreeError::HistoryOrder(*id));
            }
        }

        let reachable: BTreeSet<Uuid> = self.descendants(self.root).iter().map(Node::uuid).collect();
        if let Some(lost) = self
            .groups
            .keys()
            .chain(self.entries.keys())
            .find(|id| **id != self.root && !reachable.contains(id))
        {
            return Err(TreeError::Unreachable(*lost));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Crate-internal structure helpers
    // -----------------------------------------------------------------------

    pub(crate) fn attach_group(&mut self, id: Uuid, parent: Uuid) {
        if let Some(p) = self.groups.get_mut(&parent) {
            p.groups.push(id);
        }
        if let Some(g) = self.groups.get_mut(&id) {
            g.parent = Some(parent);
        }
    }

    pub(crate) fn attach_entry(&mut self, id: Uuid, parent: Uuid) {
        if let Some(p) = self.groups.get_mut(&parent) {
            p.entries.push(id);
        }
        if let Some(e) = self.entries.get_mut(&id) {
            e.parent = Some(parent);
        }
    }

    /// Unlink `id` from its parent's child list; the item stays in the arena.
    pub(crate) fn detach(&mut self, id: Uuid) {
        let Some(parent) = self.parent_of(id) else {
            return;
        };
        if let Some(p) = self.groups.get_mut(&parent) {
            p.groups.retain(|c| *c != id);
            p.entries.retain(|c| *c != id);
        }
        if let Some(g) = self.groups.get_mut(&id) {
            g.parent = None;
        } else if let Some(e) = self.entries.get_mut(&id) {
            e.parent = None;
        }
    }

    /// Renumber attachments densely from 0 in id order, rewriting every
    /// reference. The codec writes pool positions, so a compact pool
    /// survives a write and read unchanged.
    pub(crate) fn compact_binaries(&mut self) {
        let mapping: BTreeMap<BinaryId, BinaryId> = self
            .binaries
            .iter()
            .zip(0u32..)
            .map(|((id, _), index)| (id, BinaryId(index)))
            .collect();
        if mapping.iter().all(|(from, to)| from == to) {
            return;
        }
        let mut pool = BinaryPool::new();
        for (id, binary) in self.binaries.iter() {
            if let Some(to) = mapping.get(&id) {
                pool.insert_at(*to, binary.clone());
            }
        }
        self.binaries = pool;
        let rewrite = |id: BinaryId| mapping.get(&id).copied().unwrap_or(id);
        for entry in self.entries.values_mut() {
            entry.rewrite_binary_refs(&rewrite);
        }
    }

    /// Detach and drop `id` with its subtree, without logging.
    pub(crate) fn remove_subtree(&mut self, id: Uuid) -> Vec<Uuid> {
        let mut removed = vec![id];
        removed.extend(self.descendants(id).iter().map(Node::uuid));
        self.detach(id);
        for item in &removed {
            self.groups.remove(item);
            self.entries.remove(item);
        }
        for slot in [&mut self.meta.recycle_bin, &mut self.meta.entry_templates_group] {
            if slot.is_some_and(|g| removed.contains(&g)) {
                *slot = None;
            }
        }
        removed
    }
}

/// Next modification time: now, or one second past `previous` when the
/// clock has not moved on.
fn bump(previous: Timestamp) -> Timestamp {
    let at = now();
    if at > previous {
        return at;
    }
    previous.checked_add_signed(TimeDelta::seconds(1)).unwrap_or(previous)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Database, Uuid, Uuid) {
        let mut db = Database::new("Vault");
        let root = db.root_id();
        let work = db.add_group(root, Group::new("Work")).expect("group");
        let mut entry = Entry::new();
        entry.set("Title", "mail");
        let mail = db.add_entry(work, entry).expect("entry");
        (db, work, mail)
    }

    #[test]
    fn new_database_is_valid() {
        let db = Database::new("Vault");
        assert_eq!(db.root().name, "Vault");
        assert_eq!(db.meta.database_name, "Vault");
        db.validate().expect("valid");
    }

    #[test]
    fn add_rejects_duplicates_and_bad_parents() {
        let (mut db, work, mail) = sample();
        let dup = Entry::with_uuid(mail);
        assert_eq!(db.add_entry(work, dup), Err(TreeError::DuplicateId(mail)));
        assert_eq!(db.add_group(mail, Group::new("x")), Err(TreeError::NotAGroup(mail)));
        let ghost = Uuid::new_v4();
        assert_eq!(db.add_group(ghost, Group::new("x")), Err(TreeError::NotFound(ghost)));
    }

    #[test]
    fn add_entry_rejects_unpooled_attachment() {
        let (mut db, work, _) = sample();
        let mut entry = Entry::new();
        entry.attachments.insert("a.txt".into(), BinaryId(9));
        let err = db.add_entry(work, entry).expect_err("dangling");
        assert!(matches!(err, TreeError::DanglingAttachment { reference: 9, .. }));
    }

    #[test]
    fn update_entry_snapshots_and_bumps_time() {
        let (mut db, work, mail) = sample();
        let before = db.entry(mail).expect("entry").times.last_modification;
        db.update_entry(mail, |e| {
            e.set("Title", "mail2");
        })
        .expect("update");
        let entry = db.entry(mail).expect("entry");
        assert_eq!(entry.title(), "mail2");
        assert_eq!(entry.parent(), Some(work));
        assert_eq!(entry.history().len(), 1);
        assert_eq!(entry.history()[0].title(), "mail");
        assert!(entry.times.last_modification > before);
        db.validate().expect("valid");
    }

    #[test]
    fn update_entry_trims_history() {
        let (mut db, _, mail) = sample();
        db.meta.history_max_items = 2;
        for i in 0..5 {
            db.update_entry(mail, |e| {
                e.set("Notes", format!("rev {i}"));
            })
            .expect("update");
        }
        let entry = db.entry(mail).expect("entry");
        assert_eq!(entry.history().len(), 2);
        assert_eq!(entry.history()[1].notes(), "rev 3");
        db.validate().expect("history stays ordered");
    }

    #[test]
    fn update_entry_cannot_change_identity() {
        let (mut db, _, mail) = sample();
        db.update_entry(mail, |e| e.uuid = Uuid::new_v4()).expect("update");
        assert!(db.entry(mail).is_some());
    }

    #[test]
    fn update_group_keeps_children() {
        let (mut db, work, mail) = sample();
        db.update_group(work, |g| {
            g.name = "Office".into();
            g.entries.clear();
        })
        .expect("update");
        let group = db.group(work).expect("group");
        assert_eq!(group.name, "Office");
        assert_eq!(group.entries(), &[mail]);
    }

    #[test]
    fn move_group_refuses_cycles() {
        let (mut db, work, _) = sample();
        let inner = db.add_group(work, Group::new("Inner")).expect("group");
        assert_eq!(
            db.move_group(work, inner),
            Err(TreeError::Cycle { id: work, parent: inner })
        );
        assert_eq!(db.move_group(work, work), Err(TreeError::Cycle { id: work, parent: work }));
        assert_eq!(db.move_group(db.root_id(), work), Err(TreeError::RootImmutable));
        db.validate().expect("unchanged");
    }

    #[test]
    fn move_entry_updates_both_parents() {
        let (mut db, work, mail) = sample();
        let root = db.root_id();
        db.move_entry(mail, root).expect("move");
        assert!(db.group(work).expect("work").entries().is_empty());
        assert_eq!(db.root().entries(), &[mail]);
        assert_eq!(db.path(mail), Some(vec![root, mail]));
        db.validate().expect("valid");
    }

    #[test]
    fn recycle_creates_bin_once() {
        let (mut db, work, mail) = sample();
        db.recycle(mail).expect("recycle");
        let bin = db.meta.recycle_bin.expect("bin");
        let group = db.group(bin).expect("bin group");
        assert_eq!(group.icon_id, RECYCLE_BIN_ICON);
        assert_eq!(group.enable_searching, Some(false));
        assert!(db.is_in_recycle_bin(mail));

        db.recycle(work).expect("recycle group");
        assert_eq!(db.meta.recycle_bin, Some(bin));
        assert_eq!(db.root().groups(), &[bin]);
        db.recycle(mail).expect("already recycled is a no-op");
        db.validate().expect("valid");
    }

    #[test]
    fn recycle_disabled_errors() {
        let (mut db, _, mail) = sample();
        db.meta.recycle_bin_enabled = false;
        assert_eq!(db.recycle(mail), Err(TreeError::RecycleBinDisabled));
    }

    #[test]
    fn delete_requires_bin_membership() {
        let (mut db, work, mail) = sample();
        assert_eq!(db.delete_permanently(mail), Err(TreeError::NotInRecycleBin(mail)));
        db.recycle(work).expect("recycle");
        let removed = db.delete_permanently(work).expect("delete");
        assert_eq!(removed, vec![work, mail]);
        assert!(db.deleted_objects().deleted_at(&work).is_some());
        assert!(db.deleted_objects().deleted_at(&mail).is_some());
        assert!(!db.contains(mail));
        db.validate().expect("valid");
    }

    #[test]
    fn delete_without_bin_is_direct() {
        let (mut db, _, mail) = sample();
        db.meta.recycle_bin_enabled = false;
        assert_eq!(db.delete_permanently(mail).expect("delete"), vec![mail]);
        assert_eq!(db.delete_permanently(db.root_id()), Err(TreeError::RootImmutable));
    }

    #[test]
    fn empty_recycle_bin_keeps_the_bin() {
        let (mut db, work, mail) = sample();
        db.recycle(mail).expect("recycle");
        db.recycle(work).expect("recycle");
        let removed = db.empty_recycle_bin().expect("empty");
        assert_eq!(removed.len(), 2);
        let bin = db.meta.recycle_bin.expect("bin kept");
        assert!(db.group(bin).expect("bin").groups().is_empty());
        db.validate().expect("valid");
    }

    #[test]
    fn descendants_are_preorder() {
        let (mut db, work, mail) = sample();
        let root = db.root_id();
        let inner = db.add_group(work, Group::new("Inner")).expect("group");
        let deep = db.add_entry(inner, Entry::new()).expect("entry");
        let top = db.add_entry(root, Entry::new()).expect("entry");
        let order: Vec<Uuid> = db.descendants(root).iter().map(Node::uuid).collect();
        assert_eq!(order, vec![top, work, mail, inner, deep]);
    }

    #[test]
    fn compact_binaries_closes_gaps() {
        let mut db = Database::new("Home");
        let root = db.root_id();
        db.binaries.insert_at(BinaryId(3), Binary::new(b"three".to_vec()));
        db.binaries.insert_at(BinaryId(7), Binary::new(b"seven".to_vec()));
        let mut entry = Entry::new();
        entry.attachments.insert("a".into(), BinaryId(7));
        let id = db.add_entry(root, entry).unwrap();
        db.update_entry(id, |e| {
            e.attachments.insert("b".into(), BinaryId(3));
        })
        .unwrap();

        db.compact_binaries();
        let ids: Vec<BinaryId> = db.binaries().iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![BinaryId(0), BinaryId(1)]);
        let e = db.entry(id).unwrap();
        assert_eq!(db.binaries().get(e.attachments["a"]).unwrap().data, b"seven");
        assert_eq!(e.attachments["b"], BinaryId(0));
        assert_eq!(e.history()[0].attachments["a"], BinaryId(1));
        db.validate().unwrap();
    }

    #[test]
    fn validate_detects_orphan_cycle() {
        let (mut db, work, _) = sample();
        let inner = db.add_group(work, Group::new("Inner")).expect("group");
        // Splice work under inner behind the API's back.
        db.detach(work);
        db.attach_group(work, inner);
        assert!(matches!(db.validate(), Err(TreeError::Unreachable(_))));
    }
}
