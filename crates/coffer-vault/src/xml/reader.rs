//! Element tree to [`Database`].
//!
//! Protected values have already been unmasked by [`super::unprotect`].
//! Unknown elements are skipped; missing identities, missing keys, unknown
//! attachment references and unparsable values are
//! [`DecodeError::MalformedPayload`].

use std::collections::BTreeMap;
use std::io::Read;
use std::str::FromStr;

use data_encoding::BASE64;
use flate2::read::GzDecoder;
use uuid::Uuid;

use super::{XmlNode, PROTECTED};
use crate::attachments::{Binary, BinaryId, BinaryPool};
use crate::entries::{AutoType, AutoTypeAssociation, Entry, FieldValue};
use crate::error::{DecodeError, TreeError};
use crate::groups::Group;
use crate::meta::{CustomData, CustomDataItem, CustomIcon, MemoryProtection, Meta};
use crate::times::{self, Timestamp, Times};
use crate::tree::Database;

/// Result of reading a payload.
pub(crate) struct ParsedDocument {
    pub(crate) database: Database,
    /// `Meta/HeaderHash` (3.x files).
    pub(crate) header_hash: Option<Vec<u8>>,
}

fn malformed(msg: impl Into<String>) -> DecodeError {
    DecodeError::MalformedPayload(msg.into())
}

fn skip(scope: &str, node: &XmlNode) {
    tracing::trace!(scope, element = %node.name, "skipping unknown element");
}

// ---------------------------------------------------------------------------
// Value parsers
// ---------------------------------------------------------------------------

fn parse_uuid(node: &XmlNode) -> Result<Option<Uuid>, DecodeError> {
    let text = node.text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let bytes = BASE64
        .decode(text.as_bytes())
        .map_err(|e| malformed(format!("{}: bad UUID: {e}", node.name)))?;
    let id = Uuid::from_slice(&bytes).map_err(|_| malformed(format!("{}: UUID must be 16 bytes", node.name)))?;
    Ok((!id.is_nil()).then_some(id))
}

fn require_uuid(parent: &XmlNode) -> Result<Uuid, DecodeError> {
    parent
        .child("UUID")
        .map(parse_uuid)
        .transpose()?
        .flatten()
        .ok_or_else(|| malformed(format!("{} without UUID", parent.name)))
}

fn parse_bool(node: &XmlNode) -> Result<bool, DecodeError> {
    match node.text.trim() {
        t if t.eq_ignore_ascii_case("true") => Ok(true),
        t if t.eq_ignore_ascii_case("false") || t.is_empty() => Ok(false),
        other => Err(malformed(format!("{}: bad boolean {other:?}", node.name))),
    }
}

fn parse_tri(node: &XmlNode) -> Result<Option<bool>, DecodeError> {
    let text = node.text.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("null") {
        return Ok(None);
    }
    parse_bool(node).map(Some)
}

fn parse_num<T: FromStr>(node: &XmlNode) -> Result<T, DecodeError> {
    node.text
        .trim()
        .parse()
        .map_err(|_| malformed(format!("{}: bad number {:?}", node.name, node.text.trim())))
}

fn parse_time(node: &XmlNode) -> Result<Timestamp, DecodeError> {
    times::decode(&node.text).ok_or_else(|| malformed(format!("{}: bad time {:?}", node.name, node.text.trim())))
}

fn parse_opt_time(node: &XmlNode) -> Result<Option<Timestamp>, DecodeError> {
    if node.text.trim().is_empty() {
        return Ok(None);
    }
    parse_time(node).map(Some)
}

fn parse_base64(node: &XmlNode) -> Result<Vec<u8>, DecodeError> {
    BASE64
        .decode(node.text.trim().as_bytes())
        .map_err(|e| malformed(format!("{}: bad base64: {e}", node.name)))
}

fn parse_tags(node: &XmlNode) -> Vec<String> {
    node.text
        .split([';', ','])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}

fn text_of(parent: &XmlNode, name: &str) -> String {
    parent.child(name).map(|n| n.text.clone()).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Shared blocks
// ---------------------------------------------------------------------------

fn read_times(node: Option<&XmlNode>) -> Result<Times, DecodeError> {
    let mut times = Times::at(Timestamp::default());
    let Some(node) = node else {
        return Ok(times);
    };
    for child in &node.children {
        match child.name.as_str() {
            "CreationTime" => times.creation = parse_time(child)?,
            "LastModificationTime" => times.last_modification = parse_time(child)?,
            "LastAccessTime" => times.last_access = parse_time(child)?,
            "ExpiryTime" => times.expiry = parse_time(child)?,
            "Expires" => times.expires = parse_bool(child)?,
            "UsageCount" => times.usage_count = parse_num(child)?,
            "LocationChanged" => times.location_changed = parse_time(child)?,
            _ => skip("Times", child),
        }
    }
    Ok(times)
}

fn read_custom_data(node: &XmlNode) -> Result<CustomData, DecodeError> {
    let mut data = CustomData::new();
    for item in node.children_named("Item") {
        let key = item
            .child("Key")
            .map(|k| k.text.clone())
            .ok_or_else(|| malformed("CustomData item without Key"))?;
        let last_modified = item
            .child("LastModificationTime")
            .map(parse_opt_time)
            .transpose()?
            .flatten();
        data.insert(
            key,
            CustomDataItem {
                value: text_of(item, "Value"),
                last_modified,
            },
        );
    }
    Ok(data)
}

// ---------------------------------------------------------------------------
// Meta
// ---------------------------------------------------------------------------

struct MetaParts {
    meta: Meta,
    header_hash: Option<Vec<u8>>,
    binaries: Vec<(BinaryId, Binary)>,
}

fn read_meta(node: Option<&XmlNode>) -> Result<MetaParts, DecodeError> {
    let mut meta = Meta {
        settings_changed: None,
        database_name_changed: None,
        description_changed: None,
        default_user_name_changed: None,
        master_key_changed: None,
        recycle_bin_changed: None,
        entry_templates_group_changed: None,
        ..Meta::default()
    };
    let mut header_hash = None;
    let mut binaries = Vec::new();

    for child in node.map(|n| n.children.as_slice()).unwrap_or_default() {
        match child.name.as_str() {
            "Generator" => meta.generator.clone_from(&child.text),
            "HeaderHash" => header_hash = Some(parse_base64(child)?),
            "SettingsChanged" => meta.settings_changed = parse_opt_time(child)?,
            "DatabaseName" => meta.database_name.clone_from(&child.text),
            "DatabaseNameChanged" => meta.database_name_changed = parse_opt_time(child)?,
            "DatabaseDescription" => meta.description.clone_from(&child.text),
            "DatabaseDescriptionChanged" => meta.description_changed = parse_opt_time(child)?,
            "DefaultUserName" => meta.default_user_name.clone_from(&child.text),
            "DefaultUserNameChanged" => meta.default_user_name_changed = parse_opt_time(child)?,
            "MaintenanceHistoryDays" => meta.maintenance_history_days = parse_num(child)?,
            "Color" => meta.color.clone_from(&child.text),
            "MasterKeyChanged" => meta.master_key_changed = parse_opt_time(child)?,
            "MasterKeyChangeRec" => meta.master_key_change_rec = parse_num(child)?,
            "MasterKeyChangeForce" => meta.master_key_change_force = parse_num(child)?,
            "MasterKeyChangeForceOnce" => meta.master_key_change_force_once = parse_bool(child)?,
            "MemoryProtection" => meta.memory_protection = read_memory_protection(child)?,
            "CustomIcons" => meta.custom_icons = read_custom_icons(child)?,
            "RecycleBinEnabled" => meta.recycle_bin_enabled = parse_bool(child)?,
            "RecycleBinUUID" => meta.recycle_bin = parse_uuid(child)?,
            "RecycleBinChanged" => meta.recycle_bin_changed = parse_opt_time(child)?,
            "EntryTemplatesGroup" => meta.entry_templates_group = parse_uuid(child)?,
            "EntryTemplatesGroupChanged" => meta.entry_templates_group_changed = parse_opt_time(child)?,
            "HistoryMaxItems" => meta.history_max_items = parse_num(child)?,
            "HistoryMaxSize" => meta.history_max_size = parse_num(child)?,
            "LastSelectedGroup" => meta.last_selected_group = parse_uuid(child)?,
            "LastTopVisibleGroup" => meta.last_top_visible_group = parse_uuid(child)?,
            "Binaries" => binaries = read_meta_binaries(child)?,
            "CustomData" => meta.custom_data = read_custom_data(child)?,
            _ => skip("Meta", child),
        }
    }
    Ok(MetaParts {
        meta,
        header_hash,
        binaries,
    })
}

fn read_memory_protection(node: &XmlNode) -> Result<MemoryProtection, DecodeError> {
    let mut p = MemoryProtection {
        title: false,
        user_name: false,
        password: false,
        url: false,
        notes: false,
    };
    for child in &node.children {
        let flag = match child.name.as_str() {
            "ProtectTitle" => &mut p.title,
            "ProtectUserName" => &mut p.user_name,
            "ProtectPassword" => &mut p.password,
            "ProtectURL" => &mut p.url,
            "ProtectNotes" => &mut p.notes,
            _ => {
                skip("MemoryProtection", child);
                continue;
            }
        };
        *flag = parse_bool(child)?;
    }
    Ok(p)
}

fn read_custom_icons(node: &XmlNode) -> Result<BTreeMap<uuid::Uuid, CustomIcon>, DecodeError> {
    let mut icons = BTreeMap::new();
    for icon in node.children_named("Icon") {
        let id = require_uuid(icon)?;
        let data = icon.child("Data").map(parse_base64).transpose()?.unwrap_or_default();
        let last_modified = icon
            .child("LastModificationTime")
            .map(parse_opt_time)
            .transpose()?
            .flatten();
        let item = CustomIcon {
            data,
            name: text_of(icon, "Name"),
            last_modified,
        };
        if icons.insert(id, item).is_some() {
            return Err(malformed(format!("duplicate custom icon {id}")));
        }
    }
    Ok(icons)
}

fn read_meta_binaries(node: &XmlNode) -> Result<Vec<(BinaryId, Binary)>, DecodeError> {
    let mut out = Vec::new();
    for binary in node.children_named("Binary") {
        let id = binary
            .attr("ID")
            .ok_or_else(|| malformed("Meta binary without ID"))?
            .trim()
            .parse::<u32>()
            .map_err(|_| malformed("Meta binary ID is not a number"))?;
        let mut data = parse_base64(binary)?;
        if binary.flag("Compressed") {
            let mut inflated = Vec::new();
            GzDecoder::new(data.as_slice())
                .read_to_end(&mut inflated)
                .map_err(|e| DecodeError::Decompression(format!("binary {id}: {e}")))?;
            data = inflated;
        }
        out.push((
            BinaryId(id),
            Binary {
                data,
                protected: binary.flag(PROTECTED),
            },
        ));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Groups and entries
// ---------------------------------------------------------------------------

fn read_group_fields(node: &XmlNode) -> Result<Group, DecodeError> {
    let mut group = Group::with_uuid(require_uuid(node)?, "");
    group.times = read_times(node.child("Times"))?;
    for child in &node.children {
        match child.name.as_str() {
            "Name" => group.name.clone_from(&child.text),
            "Notes" => group.notes.clone_from(&child.text),
            "IconID" => group.icon_id = parse_num(child)?,
            "CustomIconUUID" => group.custom_icon = parse_uuid(child)?,
            "IsExpanded" => group.is_expanded = parse_bool(child)?,
            "DefaultAutoTypeSequence" => group.default_auto_type_sequence.clone_from(&child.text),
            "EnableAutoType" => group.enable_auto_type = parse_tri(child)?,
            "EnableSearching" => group.enable_searching = parse_tri(child)?,
            "LastTopVisibleEntry" => group.last_top_visible_entry = parse_uuid(child)?,
            "Tags" => group.tags = parse_tags(child),
            "CustomData" => group.custom_data = read_custom_data(child)?,
            "UUID" | "Times" | "Entry" | "Group" => {}
            _ => skip("Group", child),
        }
    }
    Ok(group)
}

fn read_entry(node: &XmlNode, pool: &BinaryPool, nested: bool) -> Result<Entry, DecodeError> {
    let mut entry = Entry::with_uuid(require_uuid(node)?);
    entry.fields.clear();
    entry.times = read_times(node.child("Times"))?;
    for child in &node.children {
        match child.name.as_str() {
            "IconID" => entry.icon_id = parse_num(child)?,
            "CustomIconUUID" => entry.custom_icon = parse_uuid(child)?,
            "ForegroundColor" => entry.foreground_color.clone_from(&child.text),
            "BackgroundColor" => entry.background_color.clone_from(&child.text),
            "OverrideURL" => entry.override_url.clone_from(&child.text),
            "Tags" => entry.tags = parse_tags(child),
            "String" => {
                let (key, value) = read_string(child)?;
                entry.fields.insert(key, value);
            }
            "Binary" => {
                let (name, id) = read_binary_ref(child, pool)?;
                entry.attachments.insert(name, id);
            }
            "AutoType" => entry.auto_type = read_auto_type(child)?,
            "CustomData" => entry.custom_data = read_custom_data(child)?,
            "History" if !nested => {
                for snap in child.children_named("Entry") {
                    entry.history.push(read_entry(snap, pool, true)?);
                }
                entry.history.sort_by_key(|h| h.times.last_modification);
            }
            "UUID" | "Times" | "History" => {}
            _ => skip("Entry", child),
        }
    }
    Ok(entry)
}

fn read_string(node: &XmlNode) -> Result<(String, FieldValue), DecodeError> {
    let key = node
        .child("Key")
        .map(|k| k.text.clone())
        .ok_or_else(|| malformed("String without Key"))?;
    let value = match node.child("Value") {
        Some(v) => FieldValue {
            value: v.text.clone(),
            protected: v.flag(PROTECTED) || v.flag("ProtectInMemory"),
        },
        None => FieldValue::plain(""),
    };
    Ok((key, value))
}

fn read_binary_ref(node: &XmlNode, pool: &BinaryPool) -> Result<(String, BinaryId), DecodeError> {
    let key = node
        .child("Key")
        .map(|k| k.text.clone())
        .ok_or_else(|| malformed("Binary without Key"))?;
    let reference = node
        .child("Value")
        .and_then(|v| v.attr("Ref"))
        .ok_or_else(|| malformed(format!("Binary {key:?} without Ref")))?
        .trim()
        .parse::<u32>()
        .map_err(|_| malformed(format!("Binary {key:?}: Ref is not a number")))?;
    let id = BinaryId(reference);
    if !pool.contains(id) {
        return Err(malformed(format!("Binary {key:?} references missing attachment {id}")));
    }
    Ok((key, id))
}

fn read_auto_type(node: &XmlNode) -> Result<AutoType, DecodeError> {
    let mut auto_type = AutoType::default();
    for child in &node.children {
        match child.name.as_str() {
            "Enabled" => auto_type.enabled = parse_bool(child)?,
            "DataTransferObfuscation" => auto_type.obfuscation = parse_num(child)?,
            "DefaultSequence" => auto_type.default_sequence.clone_from(&child.text),
            "Association" => auto_type.associations.push(AutoTypeAssociation {
                window: text_of(child, "Window"),
                sequence: text_of(child, "KeystrokeSequence"),
            }),
            _ => skip("AutoType", child),
        }
    }
    Ok(auto_type)
}

fn tree_error(err: TreeError) -> DecodeError {
    malformed(err.to_string())
}

fn read_children(db: &mut Database, parent: Uuid, node: &XmlNode) -> Result<(), DecodeError> {
    for child in &node.children {
        match child.name.as_str() {
            "Entry" => {
                let entry = read_entry(child, &db.binaries, false)?;
                db.add_entry(parent, entry).map_err(tree_error)?;
            }
            "Group" => {
                let group = read_group_fields(child)?;
                let id = db.add_group(parent, group).map_err(tree_error)?;
                read_children(db, id, child)?;
            }
            _ => {}
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// Map a `KeePassFile` element tree onto a [`Database`].
///
/// `pool` holds the 4.x inner-header attachments; 3.x attachments are read
/// from `Meta/Binaries` and added to it.
pub(crate) fn read_document(doc: &XmlNode, mut pool: BinaryPool) -> Result<ParsedDocument, DecodeError> {
    if doc.name != "KeePassFile" {
        return Err(malformed(format!("unexpected root element {:?}", doc.name)));
    }
    let parts = read_meta(doc.child("Meta"))?;
    for (id, binary) in parts.binaries {
        if !pool.insert_at(id, binary) {
            return Err(malformed(format!("duplicate attachment id {id}")));
        }
    }

    let root_node = doc.child("Root").ok_or_else(|| malformed("missing Root"))?;
    let top = root_node
        .child("Group")
        .ok_or_else(|| malformed("missing root group"))?;
    let mut database = Database::with_root(read_group_fields(top)?, parts.meta);
    database.binaries = pool;
    let root = database.root;
    read_children(&mut database, root, top)?;

    for child in &root_node.children {
        match child.name.as_str() {
            "DeletedObjects" => {
                for record in child.children_named("DeletedObject") {
                    let id = require_uuid(record)?;
                    let at = record
                        .child("DeletionTime")
                        .map(parse_time)
                        .transpose()?
                        .ok_or_else(|| malformed(format!("DeletedObject {id} without DeletionTime")))?;
                    database.deleted_objects.record(id, at);
                }
            }
            "Group" => {}
            _ => skip("Root", child),
        }
    }

    Ok(ParsedDocument {
        database,
        header_hash: parts.header_hash,
    })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
