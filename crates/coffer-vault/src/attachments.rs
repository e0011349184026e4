//! Attachment pool shared by all entries of a database.
//!
//! Entries reference attachments by [`BinaryId`]; the pool stores each
//! distinct content once. Content identity is the BLAKE3 hash of the bytes,
//! which is also what the merge engine de-duplicates on.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Pool identifier of an attachment (the KDBX `Ref` / `ID` number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BinaryId(pub u32);

impl fmt::Display for BinaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One pooled attachment.
#[derive(Clone, PartialEq, Eq)]
pub struct Binary {
    /// Raw attachment bytes.
    pub data: Vec<u8>,
    /// Memory protection flag.
    pub protected: bool,
}

impl Binary {
    /// Unprotected attachment.
    #[must_use]
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            protected: false,
        }
    }

    /// BLAKE3 hash of the bytes.
    #[must_use]
    pub fn content_hash(&self) -> [u8; 32] {
        *blake3::hash(&self.data).as_bytes()
    }
}

impl fmt::Debug for Binary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binary")
            .field("len", &self.data.len())
            .field("protected", &self.protected)
            .finish()
    }
}

/// Attachment pool, ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryPool {
    items: BTreeMap<BinaryId, Binary>,
}

impl BinaryPool {
    /// Empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `binary`, returning the id of identical content if already
    /// pooled (protection flags are OR-ed), or a fresh id otherwise.
    pub fn insert(&mut self, binary: Binary) -> BinaryId {
        let hash = binary.content_hash();
        if let Some(id) = self.find_by_hash(&hash) {
            if let Some(existing) = self.items.get_mut(&id) {
                existing.protected |= binary.protected;
            }
            return id;
        }
        let id = self.next_id();
        self.items.insert(id, binary);
        id
    }

    /// Store `binary` under `id`. Returns `false` (and stores nothing) if
    /// the id is taken.
    pub fn insert_at(&mut self, id: BinaryId, binary: Binary) -> bool {
        if self.items.contains_key(&id) {
            return false;
        }
        self.items.insert(id, binary);
        true
    }

    /// Look up an attachment.
    #[must_use]
    pub fn get(&self, id: BinaryId) -> Option<&Binary> {
        self.items.get(&id)
    }

    /// Whether `id` is pooled.
    #[must_use]
    pub fn contains(&self, id: BinaryId) -> bool {
        self.items.contains_key(&id)
    }

    /// Id of the attachment whose content hashes to `hash`.
    #[must_use]
    pub fn find_by_hash(&self, hash: &[u8; 32]) -> Option<BinaryId> {
        self.items
            .iter()
            .find(|(_, b)| &b.content_hash() == hash)
            .map(|(id, _)| *id)
    }

    /// Content hash of `id`.
    #[must_use]
    pub fn hash_of(&self, id: BinaryId) -> Option<[u8; 32]> {
        self.items.get(&id).map(Binary::content_hash)
    }

    /// Smallest id greater than every id in use.
    #[must_use]
    pub fn next_id(&self) -> BinaryId {
        self.items
            .keys()
            .next_back()
            .map_or(BinaryId(0), |last| BinaryId(last.0.saturating_add(1)))
    }

    /// Iterate in id order.
    pub fn iter(&self) -> impl Iterator<Item = (BinaryId, &Binary)> {
        self.items.iter().map(|(id, b)| (*id, b))
    }

    /// Number of pooled attachments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the pool is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
