//! Credential entries.
//!
//! An entry is a bag of string fields (`Title`, `UserName`, `Password`,
//! `URL`, `Notes` plus any custom keys), named attachment references into
//! the database's [`BinaryPool`], a timestamp set and an ordered history of
//! prior snapshots of its own content.
//!
//! Field values are zeroized on drop and never appear in `Debug` output.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::attachments::{BinaryId, BinaryPool};
use crate::digest::{ContentDigest, ContentHash};
use crate::meta::CustomData;
use crate::times::Times;

/// Standard field keys, in the order KeePass writes them.
pub const STANDARD_FIELDS: [&str; 5] = ["Title", "UserName", "Password", "URL", "Notes"];

// ---------------------------------------------------------------------------
// Field values
// ---------------------------------------------------------------------------

/// One string field.
#[derive(Clone, PartialEq, Eq, Default, Zeroize, ZeroizeOnDrop)]
pub struct FieldValue {
    /// Plaintext value.
    pub value: String,
    /// Masked with the inner stream on write.
    #[zeroize(skip)]
    pub protected: bool,
}

impl FieldValue {
    /// Unprotected value.
    #[must_use]
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            protected: false,
        }
    }

    /// Protected value.
    #[must_use]
    pub fn protected(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            protected: true,
        }
    }
}

impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.protected {
            f.write_str("FieldValue(***)")
        } else {
            write!(f, "FieldValue(len={})", self.value.len())
        }
    }
}

// ---------------------------------------------------------------------------
// Auto-type
// ---------------------------------------------------------------------------

/// Window-specific auto-type sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoTypeAssociation {
    /// Window title pattern.
    pub window: String,
    /// Keystroke sequence; empty means the entry default.
    pub sequence: String,
}

/// Auto-type settings of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoType {
    /// Whether auto-type is enabled.
    pub enabled: bool,
    /// Obfuscation mode (0 = none).
    pub obfuscation: u32,
    /// Default keystroke sequence; empty means inherited.
    pub default_sequence: String,
    /// Per-window sequences.
    pub associations: Vec<AutoTypeAssociation>,
}

impl Default for AutoType {
    fn default() -> Self {
        Self {
            enabled: true,
            obfuscation: 0,
            default_sequence: String::new(),
            associations: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// A credential entry.
///
/// `uuid`, `parent` and `history` are maintained by [`crate::Database`];
/// everything else is freely editable, ideally through
/// [`crate::Database::update_entry`] so that a history snapshot is taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub(crate) uuid: Uuid,
    pub(crate) parent: Option<Uuid>,
    /// Built-in icon number.
    pub icon_id: u32,
    /// Custom icon from the database pool.
    pub custom_icon: Option<Uuid>,
    /// Foreground colour, `#RRGGBB` or empty.
    pub foreground_color: String,
    /// Background colour, `#RRGGBB` or empty.
    pub background_color: String,
    /// URL override command.
    pub override_url: String,
    /// Tags.
    pub tags: Vec<String>,
    /// Timestamps.
    pub times: Times,
    /// String fields by key.
    pub fields: BTreeMap<String, FieldValue>,
    /// Attachment name to pool reference.
    pub attachments: BTreeMap<String, BinaryId>,
    /// Auto-type settings.
    pub auto_type: AutoType,
    /// Plugin data.
    pub custom_data: CustomData,
    pub(crate) history: Vec<Entry>,
}

impl Entry {
    /// Empty entry with a fresh identity and the standard fields present.
    #[must_use]
    pub fn new() -> Self {
        Self::with_uuid(Uuid::new_v4())
    }

    /// Empty entry with the given identity.
    #[must_use]
    pub fn with_uuid(uuid: Uuid) -> Self {
        let fields = STANDARD_FIELDS
            .iter()
            .map(|key| {
                let value = if *key == "Password" {
                    FieldValue::protected("")
                } else {
                    FieldValue::plain("")
                };
                ((*key).to_owned(), value)
            })
            .collect();
        Self {
            uuid,
            parent: None,
            icon_id: 0,
            custom_icon: None,
            foreground_color: String::new(),
            background_color: String::new(),
            override_url: String::new(),
            tags: Vec::new(),
            times: Times::now(),
            fields,
            attachments: BTreeMap::new(),
            auto_type: AutoType::default(),
            custom_data: CustomData::new(),
            history: Vec::new(),
        }
    }

    /// Identity.
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Owning group; `None` for detached entries and history snapshots.
    #[must_use]
    pub const fn parent(&self) -> Option<Uuid> {
        self.parent
    }

    /// Prior snapshots, oldest first.
    #[must_use]
    pub fn history(&self) -> &[Entry] {
        &self.history
    }

    /// Value of field `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(|f| f.value.as_str())
    }

    /// `Title` or empty.
    #[must_use]
    pub fn title(&self) -> &str {
        self.get("Title").unwrap_or_default()
    }

    /// `UserName` or empty.
    #[must_use]
    pub fn username(&self) -> &str {
        self.get("UserName").unwrap_or_default()
    }

    /// `Password` or empty.
    #[must_use]
    pub fn password(&self) -> &str {
        self.get("Password").unwrap_or_default()
    }

    /// `URL` or empty.
    #[must_use]
    pub fn url(&self) -> &str {
        self.get("URL").unwrap_or_default()
    }

    /// `Notes` or empty.
    #[must_use]
    pub fn notes(&self) -> &str {
        self.get("Notes").unwrap_or_default()
    }

    /// Set field `key`, keeping its protection flag if it exists.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        match self.fields.get_mut(key) {
            Some(field) => field.value = value,
            None => {
                self.fields.insert(key.to_owned(), FieldValue::plain(value));
            }
        }
        self
    }

    /// Set field `key` with an explicit protection flag.
    pub fn set_field(&mut self, key: &str, value: FieldValue) -> &mut Self {
        self.fields.insert(key.to_owned(), value);
        self
    }

    /// Copy of this entry's content suitable for its history: no parent,
    /// no nested history.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        let mut snap = self.clone();
        snap.parent = None;
        snap.history.clear();
        snap
    }

    /// Hash of the entry content.
    ///
    /// Covers fields, attachments (resolved to their bytes through `pool`),
    /// appearance, auto-type, custom data and the creation / modification /
    /// expiry times. Excludes identity, parent, history and the access,
    /// usage and location bookkeeping.
    #[must_use]
    pub fn content_hash(&self, pool: &BinaryPool) -> ContentHash {
        let mut d = ContentDigest::new("entry");
        d.u64(u64::from(self.icon_id))
            .uuid(self.custom_icon.as_ref())
            .str(&self.foreground_color)
            .str(&self.background_color)
            .str(&self.override_url)
            .strings(&self.tags)
            .time(&self.times.creation)
            .time(&self.times.last_modification)
            .time(&self.times.expiry)
            .bool(self.times.expires);
        d.u64(u64::try_from(self.fields.len()).unwrap_or(u64::MAX));
        for (key, field) in &self.fields {
            d.str(key).str(&field.value).bool(field.protected);
        }
        d.u64(u64::try_from(self.attachments.len()).unwrap_or(u64::MAX));
        for (name, id) in &self.attachments {
            d.str(name);
            match pool.hash_of(*id) {
                Some(hash) => d.bytes(&hash),
                None => d.u64(u64::from(id.0)),
            };
        }
        d.bool(self.auto_type.enabled)
            .u64(u64::from(self.auto_type.obfuscation))
            .str(&self.auto_type.default_sequence);
        for assoc in &self.auto_type.associations {
            d.str(&assoc.window).str(&assoc.sequence);
        }
        d.custom_data(&self.custom_data);
        d.finish()
    }

    /// Rough byte size of this entry's content, used for history limits.
    #[must_use]
    pub fn approximate_size(&self, pool: &BinaryPool) -> u64 {
        let fields = self
            .fields
            .iter()
            .map(|(k, v)| k.len().saturating_add(v.value.len()))
            .fold(0usize, usize::saturating_add);
        let attachments = self
            .attachments
            .iter()
            .map(|(name, id)| name.len().saturating_add(pool.get(*id).map_or(0, |b| b.data.len())))
            .fold(0usize, usize::saturating_add);
        u64::try_from(fields.saturating_add(attachments)).unwrap_or(u64::MAX)
    }

    /// Attachment references of this entry and its history.
    pub(crate) fn all_binary_refs(&self) -> impl Iterator<Item = BinaryId> + '_ {
        self.attachments
            .values()
            .copied()
            .chain(self.history.iter().flat_map(|h| h.attachments.values().copied()))
    }

    /// Apply `f` to every attachment reference, history included.
    pub(crate) fn rewrite_binary_refs(&mut self, f: &impl Fn(BinaryId) -> BinaryId) {
        for id in self.attachments.values_mut() {
            *id = f(*id);
        }
        for snap in &mut self.history {
            snap.rewrite_binary_refs(f);
        }
    }

    /// Apply `f` to the custom icon reference, history included.
    pub(crate) fn rewrite_icon_refs(&mut self, f: &impl Fn(Uuid) -> Uuid) {
        self.custom_icon = self.custom_icon.map(f);
        for snap in &mut self.history {
            snap.rewrite_icon_refs(f);
        }
    }
}

impl Default for Entry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
