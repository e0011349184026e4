//! Groups: the interior nodes of the credential tree.

use uuid::Uuid;

use crate::digest::{ContentDigest, ContentHash};
use crate::meta::CustomData;
use crate::times::Times;

/// A group of entries and sub-groups.
///
/// Children are kept as two ordered identity lists (sub-groups, entries)
/// owned by [`crate::Database`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub(crate) uuid: Uuid,
    pub(crate) parent: Option<Uuid>,
    /// Display name.
    pub name: String,
    /// Free-form notes.
    pub notes: String,
    /// Built-in icon number.
    pub icon_id: u32,
    /// Custom icon from the database pool.
    pub custom_icon: Option<Uuid>,
    /// Timestamps.
    pub times: Times,
    /// UI expansion state.
    pub is_expanded: bool,
    /// Auto-type sequence inherited by entries; empty means inherited.
    pub default_auto_type_sequence: String,
    /// Auto-type switch; `None` inherits from the parent.
    pub enable_auto_type: Option<bool>,
    /// Search switch; `None` inherits from the parent.
    pub enable_searching: Option<bool>,
    /// Last top visible entry in a UI.
    pub last_top_visible_entry: Option<Uuid>,
    /// Tags (KDBX 4.1).
    pub tags: Vec<String>,
    /// Plugin data.
    pub custom_data: CustomData,
    pub(crate) groups: Vec<Uuid>,
    pub(crate) entries: Vec<Uuid>,
}

impl Group {
    /// Empty group with a fresh identity.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_uuid(Uuid::new_v4(), name)
    }

    /// Empty group with the given identity.
    #[must_use]
    pub fn with_uuid(uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            uuid,
            parent: None,
            name: name.into(),
            notes: String::new(),
            icon_id: 48,
            custom_icon: None,
            times: Times::now(),
            is_expanded: true,
            default_auto_type_sequence: String::new(),
            enable_auto_type: None,
            enable_searching: None,
            last_top_visible_entry: None,
            tags: Vec::new(),
            custom_data: CustomData::new(),
            groups: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Identity.
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Parent group; `None` for the root.
    #[must_use]
    pub const fn parent(&self) -> Option<Uuid> {
        self.parent
    }

    /// Sub-group identities in order.
    #[must_use]
    pub fn groups(&self) -> &[Uuid] {
        &self.groups
    }

    /// Entry identities in order.
    #[must_use]
    pub fn entries(&self) -> &[Uuid] {
        &self.entries
    }

    /// Hash of the group's own content (children excluded).
    #[must_use]
    pub fn content_hash(&self) -> ContentHash {
        let mut d = ContentDigest::new("group");
        d.str(&self.name)
            .str(&self.notes)
            .u64(u64::from(self.icon_id))
            .uuid(self.custom_icon.as_ref())
            .time(&self.times.creation)
            .time(&self.times.last_modification)
            .time(&self.times.expiry)
            .bool(self.times.expires)
            .bool(self.is_expanded)
            .str(&self.default_auto_type_sequence)
            .tri(self.enable_auto_type)
            .tri(self.enable_searching)
            .uuid(self.last_top_visible_entry.as_ref())
            .strings(&self.tags)
            .custom_data(&self.custom_data);
        d.finish()
    }

    /// Copy of the group's own content without children or parent.
    pub(crate) fn detached(&self) -> Self {
        let mut copy = self.clone();
        copy.parent = None;
        copy.groups.clear();
        copy.entries.clear();
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_ignores_children() {
        let mut a = Group::new("Work");
        let b = a.clone();
        a.groups.push(Uuid::new_v4());
        a.entries.push(Uuid::new_v4());
        assert_eq!(a.content_hash(), b.content_hash());
        a.notes = "changed".into();
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn tri_states_are_distinct() {
        let mut a = Group::new("g");
        let base = a.content_hash();
        a.enable_searching = Some(false);
        let off = a.content_hash();
        a.enable_searching = Some(true);
        assert_ne!(base, off);
        assert_ne!(off, a.content_hash());
    }
}
