//! Database metadata (`KeePassFile/Meta`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::times::{now, Timestamp};

/// Generator name written by this crate.
pub const DEFAULT_GENERATOR: &str = "COFFER";

// ---------------------------------------------------------------------------
// Custom data
// ---------------------------------------------------------------------------

/// One plugin-defined key/value item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomDataItem {
    /// Value.
    pub value: String,
    /// Last modification (KDBX 4.1), absent in older files.
    pub last_modified: Option<Timestamp>,
}

impl CustomDataItem {
    /// Item without a modification time.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            last_modified: None,
        }
    }
}

/// Key → item mapping, as carried by the database, groups and entries.
pub type CustomData = BTreeMap<String, CustomDataItem>;

// ---------------------------------------------------------------------------
// Custom icons
// ---------------------------------------------------------------------------

/// A user-supplied icon image.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomIcon {
    /// Image bytes (PNG in practice).
    pub data: Vec<u8>,
    /// Display name (KDBX 4.1).
    pub name: String,
    /// Last modification (KDBX 4.1).
    pub last_modified: Option<Timestamp>,
}

impl CustomIcon {
    /// Icon from image bytes.
    #[must_use]
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            name: String::new(),
            last_modified: None,
        }
    }

    /// BLAKE3 hash of the image bytes.
    #[must_use]
    pub fn content_hash(&self) -> [u8; 32] {
        *blake3::hash(&self.data).as_bytes()
    }
}

impl std::fmt::Debug for CustomIcon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomIcon")
            .field("len", &self.data.len())
            .field("name", &self.name)
            .field("last_modified", &self.last_modified)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Meta
// ---------------------------------------------------------------------------

/// Which standard fields are masked with the inner stream on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryProtection {
    /// Protect `Title`.
    pub title: bool,
    /// Protect `UserName`.
    pub user_name: bool,
    /// Protect `Password`.
    pub password: bool,
    /// Protect `URL`.
    pub url: bool,
    /// Protect `Notes`.
    pub notes: bool,
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self {
            title: false,
            user_name: false,
            password: true,
            url: false,
            notes: false,
        }
    }
}

/// Database metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    /// Application that wrote the file.
    pub generator: String,
    /// Last change of any database setting.
    pub settings_changed: Option<Timestamp>,
    /// Database name.
    pub database_name: String,
    /// When `database_name` changed.
    pub database_name_changed: Option<Timestamp>,
    /// Database description.
    pub description: String,
    /// When `description` changed.
    pub description_changed: Option<Timestamp>,
    /// User name suggested for new entries.
    pub default_user_name: String,
    /// When `default_user_name` changed.
    pub default_user_name_changed: Option<Timestamp>,
    /// Days of history kept by maintenance.
    pub maintenance_history_days: u32,
    /// Database colour (`#RRGGBB` or empty).
    pub color: String,
    /// Last master key change.
    pub master_key_changed: Option<Timestamp>,
    /// Days after which a key change is recommended (-1 = never).
    pub master_key_change_rec: i64,
    /// Days after which a key change is forced (-1 = never).
    pub master_key_change_force: i64,
    /// Force a key change on next open.
    pub master_key_change_force_once: bool,
    /// Field protection flags.
    pub memory_protection: MemoryProtection,
    /// Custom icon pool.
    pub custom_icons: BTreeMap<Uuid, CustomIcon>,
    /// Whether deletions go through the recycle bin.
    pub recycle_bin_enabled: bool,
    /// Recycle bin group, created on first use.
    pub recycle_bin: Option<Uuid>,
    /// When the recycle bin settings changed.
    pub recycle_bin_changed: Option<Timestamp>,
    /// Group holding entry templates.
    pub entry_templates_group: Option<Uuid>,
    /// When `entry_templates_group` changed.
    pub entry_templates_group_changed: Option<Timestamp>,
    /// Maximum history snapshots per entry kept on edit (-1 = unlimited).
    pub history_max_items: i32,
    /// Maximum history size per entry in bytes (-1 = unlimited).
    pub history_max_size: i64,
    /// Last selected group in a UI.
    pub last_selected_group: Option<Uuid>,
    /// Last top visible group in a UI.
    pub last_top_visible_group: Option<Uuid>,
    /// Database-level custom data.
    pub custom_data: CustomData,
}

impl Default for Meta {
    fn default() -> Self {
        let at = now();
        Self {
            generator: DEFAULT_GENERATOR.into(),
            settings_changed: Some(at),
            database_name: String::new(),
            database_name_changed: Some(at),
            description: String::new(),
            description_changed: Some(at),
            default_user_name: String::new(),
            default_user_name_changed: Some(at),
            maintenance_history_days: 365,
            color: String::new(),
            master_key_changed: Some(at),
            master_key_change_rec: -1,
            master_key_change_force: -1,
            master_key_change_force_once: false,
            memory_protection: MemoryProtection::default(),
            custom_icons: BTreeMap::new(),
            recycle_bin_enabled: true,
            recycle_bin: None,
            recycle_bin_changed: Some(at),
            entry_templates_group: None,
            entry_templates_group_changed: Some(at),
            history_max_items: 10,
            history_max_size: 6_291_456,
            last_selected_group: None,
            last_top_visible_group: None,
            custom_data: CustomData::new(),
        }
    }
}

impl Meta {
    /// Whether the standard field `key` is protected by default.
    #[must_use]
    pub fn protects(&self, key: &str) -> bool {
        let p = &self.memory_protection;
        match key {
            "Title" => p.title,
            "UserName" => p.user_name,
            "Password" => p.password,
            "URL" => p.url,
            "Notes" => p.notes,
            _ => false,
        }
    }
}
