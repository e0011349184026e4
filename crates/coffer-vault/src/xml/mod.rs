//! KeePass XML payload.
//!
//! This module provides:
//! - [`XmlNode`]: a small element tree built with `quick-xml`, so that
//!   protected values can be processed in document order before (or after)
//!   the typed mapping runs
//! - [`unprotect`] / [`protect`]: the inner random stream pass
//! - `reader` / `writer`: the mapping between the element tree and
//!   [`crate::Database`]
//!
//! Element text is zeroized when a node is dropped.

pub(crate) mod reader;
pub(crate) mod writer;

use std::borrow::Cow;
use std::mem;

use coffer_crypto_core::InnerStream;
use data_encoding::BASE64;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use zeroize::Zeroize;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Attribute marking a value masked with the inner stream.
pub(crate) const PROTECTED: &str = "Protected";

// ---------------------------------------------------------------------------
// Element tree
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct XmlNode {
    pub(crate) name: String,
    pub(crate) attrs: Vec<(String, String)>,
    pub(crate) text: String,
    pub(crate) children: Vec<XmlNode>,
}

impl Drop for XmlNode {
    fn drop(&mut self) {
        self.text.zeroize();
    }
}

impl XmlNode {
    pub(crate) fn new(name: &str) -> Self {
        Self::text_node(name, String::new())
    }

    pub(crate) fn text_node(name: &str, text: impl Into<String>) -> Self {
        Self {
            name: name.to_owned(),
            attrs: Vec::new(),
            text: text.into(),
            children: Vec::new(),
        }
    }

    pub(crate) fn with_attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attrs.push((key.to_owned(), value.into()));
        self
    }

    pub(crate) fn push(&mut self, child: Self) -> &mut Self {
        self.children.push(child);
        self
    }

    pub(crate) fn child(&self, name: &str) -> Option<&Self> {
        self.children.iter().find(|c| c.name == name)
    }

    pub(crate) fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Self> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub(crate) fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn flag(&self, key: &str) -> bool {
        self.attr(key).is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

// ---------------------------------------------------------------------------
// Parse / serialize
// ---------------------------------------------------------------------------

/// Parse a document into its root element.
pub(crate) fn parse(data: &[u8]) -> Result<XmlNode, String> {
    let data = data.strip_prefix(UTF8_BOM).unwrap_or(data);
    let mut reader = Reader::from_reader(data);
    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| format!("at byte {}: {e}", reader.buffer_position()))?;
        match event {
            Event::Start(start) => stack.push(open_element(&start)?),
            Event::Empty(start) => {
                let node = open_element(&start)?;
                close_element(&mut stack, &mut root, node)?;
            }
            Event::End(_) => {
                let node = stack.pop().ok_or("unbalanced end tag")?;
                close_element(&mut stack, &mut root, node)?;
            }
            Event::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    let value = text.unescape().map_err(|e| e.to_string())?;
                    top.text.push_str(&value);
                }
            }
            Event::CData(cdata) => {
                if let Some(top) = stack.last_mut() {
                    let raw = cdata.into_inner();
                    let value = std::str::from_utf8(&raw).map_err(|e| e.to_string())?;
                    top.text.push_str(value);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err("unexpected end of document".into());
    }
    root.ok_or_else(|| "empty document".into())
}

fn open_element(start: &BytesStart<'_>) -> Result<XmlNode, String> {
    let name = std::str::from_utf8(start.name().as_ref())
        .map_err(|e| e.to_string())?
        .to_owned();
    let mut node = XmlNode::new(&name);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| e.to_string())?
            .to_owned();
        let value = attr.unescape_value().map_err(|e| e.to_string())?.into_owned();
        node.attrs.push((key, value));
    }
    Ok(node)
}

fn close_element(stack: &mut [XmlNode], root: &mut Option<XmlNode>, node: XmlNode) -> Result<(), String> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(node);
            Ok(())
        }
        None => Err("multiple root elements".into()),
    }
}

/// Serialize `root` as a UTF-8 document with tab indentation.
pub(crate) fn serialize(root: &XmlNode) -> Result<Vec<u8>, String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b'\t', 1);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), Some("yes"))))
        .map_err(|e| e.to_string())?;
    write_node(&mut writer, root)?;
    Ok(writer.into_inner())
}

/// Whether `c` may appear in an XML 1.0 document.
const fn is_xml_char(c: char) -> bool {
    matches!(c, '\t' | '\n' | '\r' | '\u{20}'..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..='\u{10FFFF}')
}

/// `text` without the characters XML 1.0 forbids.
fn xml_safe(text: &str) -> Cow<'_, str> {
    if text.chars().all(is_xml_char) {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(text.chars().filter(|c| is_xml_char(*c)).collect())
    }
}

fn write_node(writer: &mut Writer<Vec<u8>>, node: &XmlNode) -> Result<(), String> {
    let mut start = BytesStart::new(node.name.as_str());
    for (key, value) in &node.attrs {
        start.push_attribute((key.as_str(), xml_safe(value).as_ref()));
    }
    let text = xml_safe(&node.text);
    if node.children.is_empty() && text.is_empty() {
        return writer.write_event(Event::Empty(start)).map_err(|e| e.to_string());
    }
    writer.write_event(Event::Start(start)).map_err(|e| e.to_string())?;
    if !text.is_empty() {
        writer
            .write_event(Event::Text(BytesText::new(&text)))
            .map_err(|e| e.to_string())?;
    }
    for child in &node.children {
        write_node(writer, child)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(node.name.as_str())))
        .map_err(|e| e.to_string())
}

// ---------------------------------------------------------------------------
// Protected values
// ---------------------------------------------------------------------------

/// `String/Value` carries text; every other protected element carries
/// base64 of raw bytes.
fn holds_text(parent: &str, node: &XmlNode) -> bool {
    parent == "String" && node.name == "Value"
}

/// Replace every `Protected="True"` value, in document order, with its
/// plaintext. Binary values stay base64 encoded (of the plaintext).
pub(crate) fn unprotect(root: &mut XmlNode, stream: &mut InnerStream) -> Result<(), String> {
    unprotect_node("", root, stream)
}

fn unprotect_node(parent: &str, node: &mut XmlNode, stream: &mut InnerStream) -> Result<(), String> {
    if node.flag(PROTECTED) && !node.text.is_empty() {
        let mut bytes = BASE64
            .decode(node.text.trim().as_bytes())
            .map_err(|e| format!("protected {}: {e}", node.name))?;
        stream.apply(&mut bytes);
        node.text.zeroize();
        node.text = if holds_text(parent, node) {
            String::from_utf8(bytes).map_err(|e| {
                let mut raw = e.into_bytes();
                raw.zeroize();
                format!("protected {} is not UTF-8", node.name)
            })?
        } else {
            let encoded = BASE64.encode(&bytes);
            bytes.zeroize();
            encoded
        };
    }
    let name = mem::take(&mut node.name);
    let result = node
        .children
        .iter_mut()
        .try_for_each(|child| unprotect_node(&name, child, stream));
    node.name = name;
    result
}

/// Mask every `Protected="True"` value, in document order.
pub(crate) fn protect(root: &mut XmlNode, stream: &mut InnerStream) -> Result<(), String> {
    protect_node("", root, stream)
}

fn protect_node(parent: &str, node: &mut XmlNode, stream: &mut InnerStream) -> Result<(), String> {
    if node.flag(PROTECTED) && !node.text.is_empty() {
        let mut bytes = if holds_text(parent, node) {
            mem::take(&mut node.text).into_bytes()
        } else {
            let decoded = BASE64
                .decode(node.text.as_bytes())
                .map_err(|e| format!("protected {}: {e}", node.name))?;
            node.text.zeroize();
            decoded
        };
        stream.apply(&mut bytes);
        node.text = BASE64.encode(&bytes);
        bytes.zeroize();
    }
    let name = mem::take(&mut node.name);
    let result = node
        .children
        .iter_mut()
        .try_for_each(|child| protect_node(&name, child, stream));
    node.name = name;
    result
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
