//! [`Database`] to element tree.
//!
//! Values of protected fields are emitted in plaintext with
//! `Protected="True"`; [`super::protect`] masks them afterwards.

use std::collections::BTreeMap;

use data_encoding::BASE64;
use uuid::Uuid;

use super::{XmlNode, PROTECTED};
use crate::attachments::BinaryId;
use crate::entries::Entry;
use crate::error::EncodeError;
use crate::groups::Group;
use crate::meta::{CustomData, Meta};
use crate::times::{self, Timestamp, Times};
use crate::tree::Database;

/// Layout choices for one write.
pub(crate) struct WriteOptions<'a> {
    /// 4.x layout (binary times, no `Meta/Binaries`).
    pub(crate) v4: bool,
    /// Value of `Meta/Generator`.
    pub(crate) generator: &'a str,
    /// `Meta/HeaderHash`, written for 3.x only.
    pub(crate) header_hash: Option<[u8; 32]>,
    /// Pool id to the index written in `Ref` attributes.
    pub(crate) binary_refs: &'a BTreeMap<BinaryId, u32>,
}

struct Ctx<'a> {
    options: &'a WriteOptions<'a>,
}

impl Ctx<'_> {
    fn time(&self, name: &str, ts: &Timestamp) -> XmlNode {
        let text = if self.options.v4 {
            times::encode_binary(ts)
        } else {
            times::encode_iso(ts)
        };
        XmlNode::text_node(name, text)
    }

    fn opt_time(&self, parent: &mut XmlNode, name: &str, ts: Option<&Timestamp>) {
        if let Some(ts) = ts {
            parent.push(self.time(name, ts));
        }
    }

    fn times(&self, times: &Times) -> XmlNode {
        let mut node = XmlNode::new("Times");
        node.push(self.time("CreationTime", &times.creation))
            .push(self.time("LastModificationTime", &times.last_modification))
            .push(self.time("LastAccessTime", &times.last_access))
            .push(self.time("ExpiryTime", &times.expiry))
            .push(boolean("Expires", times.expires))
            .push(XmlNode::text_node("UsageCount", times.usage_count.to_string()))
            .push(self.time("LocationChanged", &times.location_changed));
        node
    }

    fn custom_data(&self, data: &CustomData) -> XmlNode {
        let mut node = XmlNode::new("CustomData");
        for (key, item) in data {
            let mut xml = XmlNode::new("Item");
            xml.push(XmlNode::text_node("Key", key.as_str()))
                .push(XmlNode::text_node("Value", item.value.as_str()));
            self.opt_time(&mut xml, "LastModificationTime", item.last_modified.as_ref());
            node.push(xml);
        }
        node
    }
}

fn boolean(name: &str, value: bool) -> XmlNode {
    XmlNode::text_node(name, if value { "True" } else { "False" })
}

fn tri(name: &str, value: Option<bool>) -> XmlNode {
    match value {
        Some(v) => boolean(name, v),
        None => XmlNode::text_node(name, "null"),
    }
}

fn uuid(name: &str, id: Option<&Uuid>) -> XmlNode {
    XmlNode::text_node(name, BASE64.encode(id.unwrap_or(&Uuid::nil()).as_bytes()))
}

fn serialization(msg: impl Into<String>) -> EncodeError {
    EncodeError::Serialization(msg.into())
}

// ---------------------------------------------------------------------------
// Meta
// ---------------------------------------------------------------------------

fn write_meta(ctx: &Ctx<'_>, db: &Database) -> XmlNode {
    let meta: &Meta = &db.meta;
    let mut node = XmlNode::new("Meta");
    node.push(XmlNode::text_node("Generator", ctx.options.generator));
    if let Some(hash) = ctx.options.header_hash.filter(|_| !ctx.options.v4) {
        node.push(XmlNode::text_node("HeaderHash", BASE64.encode(&hash)));
    }
    ctx.opt_time(&mut node, "SettingsChanged", meta.settings_changed.as_ref());
    node.push(XmlNode::text_node("DatabaseName", meta.database_name.as_str()));
    ctx.opt_time(&mut node, "DatabaseNameChanged", meta.database_name_changed.as_ref());
    node.push(XmlNode::text_node("DatabaseDescription", meta.description.as_str()));
    ctx.opt_time(&mut node, "DatabaseDescriptionChanged", meta.description_changed.as_ref());
    node.push(XmlNode::text_node("DefaultUserName", meta.default_user_name.as_str()));
    ctx.opt_time(&mut node, "DefaultUserNameChanged", meta.default_user_name_changed.as_ref());
    node.push(XmlNode::text_node(
        "MaintenanceHistoryDays",
        meta.maintenance_history_days.to_string(),
    ))
    .push(XmlNode::text_node("Color", meta.color.as_str()));
    ctx.opt_time(&mut node, "MasterKeyChanged", meta.master_key_changed.as_ref());
    node.push(XmlNode::text_node("MasterKeyChangeRec", meta.master_key_change_rec.to_string()))
        .push(XmlNode::text_node(
            "MasterKeyChangeForce",
            meta.master_key_change_force.to_string(),
        ))
        .push(boolean("MasterKeyChangeForceOnce", meta.master_key_change_force_once));

    let p = &meta.memory_protection;
    let mut protection = XmlNode::new("MemoryProtection");
    protection
        .push(boolean("ProtectTitle", p.title))
        .push(boolean("ProtectUserName", p.user_name))
        .push(boolean("ProtectPassword", p.password))
        .push(boolean("ProtectURL", p.url))
        .push(boolean("ProtectNotes", p.notes));
    node.push(protection);

    let mut icons = XmlNode::new("CustomIcons");
    for (id, icon) in &meta.custom_icons {
        let mut xml = XmlNode::new("Icon");
        xml.push(uuid("UUID", Some(id)))
            .push(XmlNode::text_node("Data", BASE64.encode(&icon.data)));
        if !icon.name.is_empty() {
            xml.push(XmlNode::text_node("Name", icon.name.as_str()));
        }
        ctx.opt_time(&mut xml, "LastModificationTime", icon.last_modified.as_ref());
        icons.push(xml);
    }
    node.push(icons);

    node.push(boolean("RecycleBinEnabled", meta.recycle_bin_enabled))
        .push(uuid("RecycleBinUUID", meta.recycle_bin.as_ref()));
    ctx.opt_time(&mut node, "RecycleBinChanged", meta.recycle_bin_changed.as_ref());
    node.push(uuid("EntryTemplatesGroup", meta.entry_templates_group.as_ref()));
    ctx.opt_time(
        &mut node,
        "EntryTemplatesGroupChanged",
        meta.entry_templates_group_changed.as_ref(),
    );
    node.push(XmlNode::text_node("HistoryMaxItems", meta.history_max_items.to_string()))
        .push(XmlNode::text_node("HistoryMaxSize", meta.history_max_size.to_string()))
        .push(uuid("LastSelectedGroup", meta.last_selected_group.as_ref()))
        .push(uuid("LastTopVisibleGroup", meta.last_top_visible_group.as_ref()));

    if !ctx.options.v4 {
        let mut binaries = XmlNode::new("Binaries");
        for (id, binary) in db.binaries.iter() {
            let index = ctx.options.binary_refs.get(&id).copied().unwrap_or(id.0);
            let mut xml = XmlNode::text_node("Binary", BASE64.encode(&binary.data)).with_attr("ID", index.to_string());
            if binary.protected {
                xml = xml.with_attr(PROTECTED, "True");
            }
            binaries.push(xml);
        }
        node.push(binaries);
    }

    node.push(ctx.custom_data(&meta.custom_data));
    node
}

// ---------------------------------------------------------------------------
// Groups and entries
// ---------------------------------------------------------------------------

fn write_entry(ctx: &Ctx<'_>, entry: &Entry, with_history: bool) -> Result<XmlNode, EncodeError> {
    let mut node = XmlNode::new("Entry");
    node.push(uuid("UUID", Some(&entry.uuid)))
        .push(XmlNode::text_node("IconID", entry.icon_id.to_string()));
    if let Some(icon) = &entry.custom_icon {
        node.push(uuid("CustomIconUUID", Some(icon)));
    }
    node.push(XmlNode::text_node("ForegroundColor", entry.foreground_color.as_str()))
        .push(XmlNode::text_node("BackgroundColor", entry.background_color.as_str()))
        .push(XmlNode::text_node("OverrideURL", entry.override_url.as_str()));
    if !entry.tags.is_empty() {
        node.push(XmlNode::text_node("Tags", entry.tags.join(";")));
    }
    node.push(ctx.times(&entry.times));

    for (key, field) in &entry.fields {
        let mut value = XmlNode::text_node("Value", field.value.as_str());
        if field.protected {
            value = value.with_attr(PROTECTED, "True");
        }
        let mut xml = XmlNode::new("String");
        xml.push(XmlNode::text_node("Key", key.as_str())).push(value);
        node.push(xml);
    }

    for (name, id) in &entry.attachments {
        let index = ctx
            .options
            .binary_refs
            .get(id)
            .ok_or_else(|| serialization(format!("entry {} references missing attachment {id}", entry.uuid)))?;
        let mut xml = XmlNode::new("Binary");
        xml.push(XmlNode::text_node("Key", name.as_str()))
            .push(XmlNode::new("Value").with_attr("Ref", index.to_string()));
        node.push(xml);
    }

    let at = &entry.auto_type;
    let mut auto_type = XmlNode::new("AutoType");
    auto_type
        .push(boolean("Enabled", at.enabled))
        .push(XmlNode::text_node("DataTransferObfuscation", at.obfuscation.to_string()));
    if !at.default_sequence.is_empty() {
        auto_type.push(XmlNode::text_node("DefaultSequence", at.default_sequence.as_str()));
    }
    for assoc in &at.associations {
        let mut xml = XmlNode::new("Association");
        xml.push(XmlNode::text_node("Window", assoc.window.as_str()))
            .push(XmlNode::text_node("KeystrokeSequence", assoc.sequence.as_str()));
        auto_type.push(xml);
    }
    node.push(auto_type);

    if !entry.custom_data.is_empty() {
        node.push(ctx.custom_data(&entry.custom_data));
    }

    if with_history {
        let mut history = XmlNode::new("History");
        for snap in &entry.history {
            history.push(write_entry(ctx, snap, false)?);
        }
        node.push(history);
    }
    Ok(node)
}

fn write_group(ctx: &Ctx<'_>, db: &Database, group: &Group) -> Result<XmlNode, EncodeError> {
    let mut node = XmlNode::new("Group");
    node.push(uuid("UUID", Some(&group.uuid)))
        .push(XmlNode::text_node("Name", group.name.as_str()))
        .push(XmlNode::text_node("Notes", group.notes.as_str()))
        .push(XmlNode::text_node("IconID", group.icon_id.to_string()));
    if let Some(icon) = &group.custom_icon {
        node.push(uuid("CustomIconUUID", Some(icon)));
    }
    node.push(ctx.times(&group.times))
        .push(boolean("IsExpanded", group.is_expanded))
        .push(XmlNode::text_node(
            "DefaultAutoTypeSequence",
            group.default_auto_type_sequence.as_str(),
        ))
        .push(tri("EnableAutoType", group.enable_auto_type))
        .push(tri("EnableSearching", group.enable_searching))
        .push(uuid("LastTopVisibleEntry", group.last_top_visible_entry.as_ref()));
    if !group.tags.is_empty() {
        node.push(XmlNode::text_node("Tags", group.tags.join(";")));
    }
    if !group.custom_data.is_empty() {
        node.push(ctx.custom_data(&group.custom_data));
    }

    for id in &group.entries {
        let entry = db
            .entries
            .get(id)
            .ok_or_else(|| serialization(format!("group {} lists missing entry {id}", group.uuid)))?;
        node.push(write_entry(ctx, entry, true)?);
    }
    for id in &group.groups {
        let child = db
            .groups
            .get(id)
            .ok_or_else(|| serialization(format!("group {} lists missing group {id}", group.uuid)))?;
        node.push(write_group(ctx, db, child)?);
    }
    Ok(node)
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// Build the `KeePassFile` element tree for `db`.
pub(crate) fn write_document(db: &Database, options: &WriteOptions<'_>) -> Result<XmlNode, EncodeError> {
    let ctx = Ctx { options };
    let mut doc = XmlNode::new("KeePassFile");
    doc.push(write_meta(&ctx, db));

    let mut root = XmlNode::new("Root");
    root.push(write_group(&ctx, db, db.root())?);
    let mut deleted = XmlNode::new("DeletedObjects");
    for (id, at) in db.deleted_objects.iter() {
        let mut record = XmlNode::new("DeletedObject");
        record.push(uuid("UUID", Some(id))).push(ctx.time("DeletionTime", at));
        deleted.push(record);
    }
    root.push(deleted);
    doc.push(root);
    Ok(doc)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::{Binary, BinaryPool};
    use crate::xml::reader::read_document;

    fn options<'a>(v4: bool, refs: &'a BTreeMap<BinaryId, u32>) -> WriteOptions<'a> {
        WriteOptions {
            v4,
            generator: "COFFER",
            header_hash: Some([7u8; 32]),
            binary_refs: refs,
        }
    }

    fn sample() -> Database {
        let mut db = Database::new("Home");
        let root = db.root_id();
        let id = db.add_binary(Binary::new(b"attachment".to_vec()));
        let mut entry = Entry::new();
        entry.set("Title", "Mail").set("Password", "s3cret");
        entry.attachments.insert("a.txt".into(), id);
        db.add_entry(root, entry).expect("entry");
        db
    }

    #[test]
    fn entries_precede_groups() {
        let mut db = sample();
        let root = db.root_id();
        db.add_group(root, Group::new("Sub")).expect("group");
        let refs = BTreeMap::from([(BinaryId(0), 0)]);
        let doc = write_document(&db, &options(true, &refs)).expect("write");
        let group = doc.child("Root").and_then(|r| r.child("Group")).expect("root group");
        let names: Vec<&str> = group
            .children
            .iter()
            .filter(|c| c.name == "Entry" || c.name == "Group")
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["Entry", "Group"]);
    }

    #[test]
    fn v4_omits_header_hash_and_binaries() {
        let db = sample();
        let refs = BTreeMap::from([(BinaryId(0), 0)]);
        let doc = write_document(&db, &options(true, &refs)).expect("write");
        let meta = doc.child("Meta").expect("meta");
        assert!(meta.child("HeaderHash").is_none());
        assert!(meta.child("Binaries").is_none());

        let doc = write_document(&db, &options(false, &refs)).expect("write");
        let meta = doc.child("Meta").expect("meta");
        assert!(meta.child("HeaderHash").is_some());
        assert_eq!(meta.child("Binaries").expect("binaries").children.len(), 1);
    }

    #[test]
    fn protected_values_are_flagged() {
        let db = sample();
        let refs = BTreeMap::from([(BinaryId(0), 0)]);
        let doc = write_document(&db, &options(true, &refs)).expect("write");
        let entry = doc
            .child("Root")
            .and_then(|r| r.child("Group"))
            .and_then(|g| g.child("Entry"))
            .expect("entry");
        let password = entry
            .children_named("String")
            .find(|s| s.child("Key").is_some_and(|k| k.text == "Password"))
            .and_then(|s| s.child("Value"))
            .expect("value");
        assert!(password.flag(PROTECTED));
    }

    #[test]
    fn missing_ref_mapping_fails() {
        let db = sample();
        let refs = BTreeMap::new();
        let err = write_document(&db, &options(true, &refs)).err().expect("error");
        assert!(matches!(err, EncodeError::Serialization(ref m) if m.contains("missing attachment")));
    }

    #[test]
    fn v3_document_reads_back() {
        let db = sample();
        let refs = BTreeMap::from([(BinaryId(0), 0)]);
        let doc = write_document(&db, &options(false, &refs)).expect("write");
        let parsed = read_document(&doc, BinaryPool::new()).expect("read");
        assert_eq!(parsed.header_hash, Some(vec![7u8; 32]));
        assert_eq!(parsed.database, db);
    }
}
