//! KDBX 4 variant dictionary: typed key/value map used for KDF parameters
//! and public custom data.
//!
//! # Layout
//!
//! ```text
//! version (u16 LE, 0x0100) | items... | 0x00
//! item = type (u8) | key len (i32 LE) | key (UTF-8) | value len (i32 LE) | value
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

/// Serialization version written by this crate.
const DICTIONARY_VERSION: u16 = 0x0100;

/// Readers accept any minor version under this major.
const VERSION_CRITICAL_MASK: u16 = 0xFF00;

const TYPE_END: u8 = 0x00;
const TYPE_U32: u8 = 0x04;
const TYPE_U64: u8 = 0x05;
const TYPE_BOOL: u8 = 0x08;
const TYPE_I32: u8 = 0x0C;
const TYPE_I64: u8 = 0x0D;
const TYPE_STRING: u8 = 0x18;
const TYPE_BYTES: u8 = 0x42;

/// A single typed value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum VariantValue {
    /// Unsigned 32-bit integer.
    U32(u32),
    /// Unsigned 64-bit integer.
    U64(u64),
    /// Boolean.
    Bool(bool),
    /// Signed 32-bit integer.
    I32(i32),
    /// Signed 64-bit integer.
    I64(i64),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

/// Ordered variant dictionary.
///
/// Keys are kept sorted so the serialized form is deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantDictionary {
    items: BTreeMap<String, VariantValue>,
}

impl VariantDictionary {
    /// Create an empty dictionary.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value.
    pub fn insert(&mut self, key: impl Into<String>, value: VariantValue) {
        self.items.insert(key.into(), value);
    }

    /// Look up a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&VariantValue> {
        self.items.get(key)
    }

    /// Returns `true` if the dictionary has no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate items in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &VariantValue)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Fetch a required `u32`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CorruptHeader`] if absent or of another type.
    pub fn require_u32(&self, key: &str) -> Result<u32, CryptoError> {
        match self.get(key) {
            Some(VariantValue::U32(v)) => Ok(*v),
            other => Err(type_error(key, "u32", other)),
        }
    }

    /// Fetch a required `u64`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CorruptHeader`] if absent or of another type.
    pub fn require_u64(&self, key: &str) -> Result<u64, CryptoError> {
        match self.get(key) {
            Some(VariantValue::U64(v)) => Ok(*v),
            other => Err(type_error(key, "u64", other)),
        }
    }

    /// Fetch a required byte array.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CorruptHeader`] if absent or of another type.
    pub fn require_bytes(&self, key: &str) -> Result<&[u8], CryptoError> {
        match self.get(key) {
            Some(VariantValue::Bytes(v)) => Ok(v),
            other => Err(type_error(key, "byte array", other)),
        }
    }

    /// Fetch an optional byte array.
    #[must_use]
    pub fn optional_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.get(key) {
            Some(VariantValue::Bytes(v)) => Some(v),
            _ => None,
        }
    }

    /// Serialize to the binary layout.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encryption`] if a key or value exceeds `i32`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::new();
        out.extend_from_slice(&DICTIONARY_VERSION.to_le_bytes());
        for (key, value) in &self.items {
            let (kind, data) = match value {
                VariantValue::U32(v) => (TYPE_U32, v.to_le_bytes().to_vec()),
                VariantValue::U64(v) => (TYPE_U64, v.to_le_bytes().to_vec()),
                VariantValue::Bool(v) => (TYPE_BOOL, vec![u8::from(*v)]),
                VariantValue::I32(v) => (TYPE_I32, v.to_le_bytes().to_vec()),
                VariantValue::I64(v) => (TYPE_I64, v.to_le_bytes().to_vec()),
                VariantValue::String(v) => (TYPE_STRING, v.as_bytes().to_vec()),
                VariantValue::Bytes(v) => (TYPE_BYTES, v.clone()),
            };
            out.push(kind);
            write_len_prefixed(&mut out, key.as_bytes())?;
            write_len_prefixed(&mut out, &data)?;
        }
        out.push(TYPE_END);
        Ok(out)
    }

    /// Parse the binary layout.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CorruptHeader`] for an unsupported version,
    /// unknown value type, bad value width, or truncation.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        let mut cursor = 0usize;
        let version = u16::from_le_bytes(take_array(data, &mut cursor)?);
        if version & VERSION_CRITICAL_MASK != DICTIONARY_VERSION & VERSION_CRITICAL_MASK {
            return Err(CryptoError::CorruptHeader(format!(
                "unsupported variant dictionary version {version:#06x}"
            )));
        }

        let mut dict = Self::new();
        loop {
            let [kind] = take_array::<1>(data, &mut cursor)?;
            if kind == TYPE_END {
                break;
            }
            let key_bytes = take_len_prefixed(data, &mut cursor)?;
            let key = String::from_utf8(key_bytes.to_vec())
                .map_err(|_| CryptoError::CorruptHeader("variant key is not UTF-8".into()))?;
            let raw = take_len_prefixed(data, &mut cursor)?;
            let value = match kind {
                TYPE_U32 => VariantValue::U32(u32::from_le_bytes(fixed(raw, &key)?)),
                TYPE_U64 => VariantValue::U64(u64::from_le_bytes(fixed(raw, &key)?)),
                TYPE_BOOL => {
                    let [b] = fixed::<1>(raw, &key)?;
                    VariantValue::Bool(b != 0)
                }
                TYPE_I32 => VariantValue::I32(i32::from_le_bytes(fixed(raw, &key)?)),
                TYPE_I64 => VariantValue::I64(i64::from_le_bytes(fixed(raw, &key)?)),
                TYPE_STRING => VariantValue::String(String::from_utf8(raw.to_vec()).map_err(
                    |_| CryptoError::CorruptHeader(format!("variant {key} is not UTF-8")),
                )?),
                TYPE_BYTES => VariantValue::Bytes(raw.to_vec()),
                other => {
                    return Err(CryptoError::CorruptHeader(format!(
                        "unknown variant type {other:#04x} for key {key}"
                    )))
                }
            };
            dict.insert(key, value);
        }
        Ok(dict)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn type_error(key: &str, expected: &str, found: Option<&VariantValue>) -> CryptoError {
    match found {
        None => CryptoError::CorruptHeader(format!("missing parameter {key}")),
        Some(_) => CryptoError::CorruptHeader(format!("parameter {key} is not a {expected}")),
    }
}

fn write_len_prefixed(out: &mut Vec<u8>, data: &[u8]) -> Result<(), CryptoError> {
    let len = i32::try_from(data.len())
        .map_err(|_| CryptoError::Encryption("variant item exceeds i32 length".into()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(data);
    Ok(())
}

fn take_array<const N: usize>(data: &[u8], cursor: &mut usize) -> Result<[u8; N], CryptoError> {
    let slice = take(data, cursor, N)?;
    let mut buf = [0u8; N];
    buf.copy_from_slice(slice);
    Ok(buf)
}

fn take_len_prefixed<'a>(data: &'a [u8], cursor: &mut usize) -> Result<&'a [u8], CryptoError> {
    let len = i32::from_le_bytes(take_array(data, cursor)?);
    let len = usize::try_from(len)
        .map_err(|_| CryptoError::CorruptHeader("negative variant length".into()))?;
    take(data, cursor, len)
}

fn take<'a>(data: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8], CryptoError> {
    let end = cursor
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| CryptoError::CorruptHeader("variant dictionary truncated".into()))?;
    let slice = &data[*cursor..end];
    *cursor = end;
    Ok(slice)
}

fn fixed<const N: usize>(raw: &[u8], key: &str) -> Result<[u8; N], CryptoError> {
    raw.try_into().map_err(|_| {
        CryptoError::CorruptHeader(format!(
            "variant {key} has width {} (expected {N})",
            raw.len()
        ))
    })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VariantDictionary {
        let mut dict = VariantDictionary::new();
        dict.insert("I", VariantValue::U64(2));
        dict.insert("P", VariantValue::U32(1));
        dict.insert("S", VariantValue::Bytes(vec![7; 32]));
        dict.insert("flag", VariantValue::Bool(true));
        dict.insert("name", VariantValue::String("coffer".into()));
        dict.insert("neg", VariantValue::I64(-5));
        dict
    }

    #[test]
    fn parses_what_it_writes() {
        let dict = sample();
        let bytes = dict.to_bytes().expect("serialize");
        assert_eq!(&bytes[..2], &[0x00, 0x01]);
        assert_eq!(*bytes.last().expect("terminator"), TYPE_END);
        let parsed = VariantDictionary::from_bytes(&bytes).expect("parse");
        assert_eq!(parsed, dict);
    }

    #[test]
    fn accepts_newer_minor_version() {
        let mut bytes = sample().to_bytes().expect("serialize");
        bytes[0] = 0x05;
        assert!(VariantDictionary::from_bytes(&bytes).is_ok());
    }

    #[test]
    fn rejects_newer_major_version() {
        let mut bytes = sample().to_bytes().expect("serialize");
        bytes[1] = 0x02;
        let err = VariantDictionary::from_bytes(&bytes).expect_err("major 2 rejected");
        assert!(matches!(err, CryptoError::CorruptHeader(ref m) if m.contains("version")));
    }

    #[test]
    fn rejects_truncation() {
        let bytes = sample().to_bytes().expect("serialize");
        let err = VariantDictionary::from_bytes(&bytes[..bytes.len() - 4])
            .expect_err("truncated rejected");
        assert!(matches!(err, CryptoError::CorruptHeader(_)));
    }

    #[test]
    fn rejects_wrong_integer_width() {
        // version, type u32, key "P", value of 3 bytes, end
        let bytes = [
            0x00, 0x01, TYPE_U32, 1, 0, 0, 0, b'P', 3, 0, 0, 0, 1, 2, 3, TYPE_END,
        ];
        let err = VariantDictionary::from_bytes(&bytes).expect_err("bad width rejected");
        assert!(matches!(err, CryptoError::CorruptHeader(ref m) if m.contains("width")));
    }

    #[test]
    fn typed_accessors_report_missing_and_mismatched() {
        let dict = sample();
        assert_eq!(dict.require_u64("I").expect("present"), 2);
        assert!(dict.require_u32("I").is_err());
        assert!(dict.require_bytes("missing").is_err());
        assert_eq!(dict.optional_bytes("S").map(<[u8]>::len), Some(32));
    }
}
