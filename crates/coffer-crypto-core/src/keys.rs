//! Composite key material.
//!
//! This module provides:
//! - [`KeyFactor`]: one secret factor (password bytes or a key file source)
//! - [`KeyFileSource`]: the capability a caller implements to hand over
//!   key file bytes
//! - [`KeyMaterial`]: the ordered set of factors and the 32-byte seed they
//!   reduce to
//! - [`KeySchedule`]: cipher and HMAC keys derived after the KDF
//!
//! Each factor is reduced to a 32-byte component; the seed is
//! `SHA-256(component_1 || component_2 || ...)` in insertion order.
//!
//! Key files are interpreted the way KeePass does:
//! 1. XML key file, version 1.0 (base64 `<Data>`) or 2.0 (hex `<Data>`
//!    carrying a `Hash` attribute)
//! 2. exactly 32 raw bytes
//! 3. exactly 64 hexadecimal characters
//! 4. anything else: SHA-256 of the file bytes

use data_encoding::{BASE64, HEXLOWER_PERMISSIVE};
use quick_xml::events::Event;
use quick_xml::Reader;
use ring::digest;
use std::fmt;
use zeroize::Zeroize;

use crate::error::KeyError;
use crate::memory::{SecretBuffer, SecretBytes};

/// Length of every factor component and of the seed.
pub const SEED_LEN: usize = 32;

/// Length of a hex-encoded key file.
const HEX_KEY_FILE_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Supplies the raw bytes of a key file.
///
/// Reading the file from disk (or a hardware token, or a vault) is the
/// caller's concern; this crate only interprets the bytes.
pub trait KeyFileSource {
    /// Produce the key file contents.
    ///
    /// # Errors
    ///
    /// Implementations return [`KeyError::Unavailable`] when the bytes
    /// cannot be produced.
    fn raw_bytes(&self) -> Result<SecretBuffer, KeyError>;
}

impl KeyFileSource for SecretBuffer {
    fn raw_bytes(&self) -> Result<SecretBuffer, KeyError> {
        Ok(self.clone())
    }
}

impl<F> KeyFileSource for F
where
    F: Fn() -> Result<SecretBuffer, KeyError>,
{
    fn raw_bytes(&self) -> Result<SecretBuffer, KeyError> {
        self()
    }
}

/// One independent secret factor.
pub enum KeyFactor {
    /// Password bytes, as typed (UTF-8).
    Password(SecretBuffer),
    /// Key file, read lazily through its source.
    FileKey(Box<dyn KeyFileSource>),
}

impl KeyFactor {
    /// Password factor from UTF-8 text.
    #[must_use]
    pub fn password(text: &str) -> Self {
        Self::Password(SecretBuffer::new(text.as_bytes()))
    }

    /// Key file factor from any source.
    #[must_use]
    pub fn key_file(source: impl KeyFileSource + 'static) -> Self {
        Self::FileKey(Box::new(source))
    }

    /// The factor's raw bytes.
    ///
    /// # Errors
    ///
    /// Propagates the source's [`KeyError::Unavailable`].
    pub fn raw_bytes(&self) -> Result<SecretBuffer, KeyError> {
        match self {
            Self::Password(bytes) => Ok(bytes.clone()),
            Self::FileKey(source) => source.raw_bytes(),
        }
    }

    /// Reduce the factor to its 32-byte component.
    fn component(&self) -> Result<SecretBytes<SEED_LEN>, KeyError> {
        let raw = self.raw_bytes()?;
        match self {
            Self::Password(_) => Ok(sha256(raw.expose())),
            Self::FileKey(_) => key_file_component(raw.expose()),
        }
    }
}

impl fmt::Debug for KeyFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("KeyFactor::Password(***)"),
            Self::FileKey(_) => f.write_str("KeyFactor::FileKey(***)"),
        }
    }
}

/// Ordered set of key factors.
#[derive(Debug, Default)]
pub struct KeyMaterial {
    factors: Vec<KeyFactor>,
}

// ---------------------------------------------------------------------------
// Core operations
// ---------------------------------------------------------------------------

impl KeyMaterial {
    /// Empty key material.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Key material holding a single password.
    #[must_use]
    pub fn from_password(text: &str) -> Self {
        let mut key = Self::new();
        key.add_factor(KeyFactor::password(text));
        key
    }

    /// Append a factor. Order matters for the derived seed.
    pub fn add_factor(&mut self, factor: KeyFactor) -> &mut Self {
        self.factors.push(factor);
        self
    }

    /// Number of factors added so far.
    #[must_use]
    pub fn factor_count(&self) -> usize {
        self.factors.len()
    }

    /// Combine all factors into the 32-byte composite seed.
    ///
    /// # Errors
    ///
    /// - [`KeyError::NoFactors`] if no factor was added
    /// - [`KeyError::Unavailable`] if a key file source fails
    /// - [`KeyError::InvalidKeyFile`] if an XML key file fails its checks
    pub fn derive_seed(&self) -> Result<SecretBytes<SEED_LEN>, KeyError> {
        if self.factors.is_empty() {
            return Err(KeyError::NoFactors);
        }
        let mut ctx = digest::Context::new(&digest::SHA256);
        for factor in &self.factors {
            let component = factor.component()?;
            ctx.update(component.expose());
        }
        Ok(digest_to_secret(&ctx.finish()))
    }
}

// ---------------------------------------------------------------------------
// Key schedule
// ---------------------------------------------------------------------------

/// Keys derived from the master seed and the transformed key.
///
/// - cipher key = `SHA-256(master_seed || transformed)`
/// - HMAC base key = `SHA-512(master_seed || transformed || 0x01)`
#[derive(Debug)]
pub struct KeySchedule {
    /// Outer cipher key.
    pub cipher_key: SecretBytes<32>,
    /// Base key for per-block HMAC keys (KDBX 4 only).
    pub hmac_base: SecretBytes<64>,
}

impl KeySchedule {
    /// Derive both keys.
    #[must_use]
    pub fn derive(master_seed: &[u8], transformed: &SecretBytes<32>) -> Self {
        let mut ctx = digest::Context::new(&digest::SHA256);
        ctx.update(master_seed);
        ctx.update(transformed.expose());
        let cipher_key = digest_to_secret(&ctx.finish());

        let mut ctx = digest::Context::new(&digest::SHA512);
        ctx.update(master_seed);
        ctx.update(transformed.expose());
        ctx.update(&[0x01]);
        let mut base = [0u8; 64];
        base.copy_from_slice(ctx.finish().as_ref());
        let hmac_base = SecretBytes::new(base);
        base.zeroize();

        Self { cipher_key, hmac_base }
    }
}

// ---------------------------------------------------------------------------
// Key file interpretation
// ---------------------------------------------------------------------------

fn sha256(data: &[u8]) -> SecretBytes<SEED_LEN> {
    digest_to_secret(&digest::digest(&digest::SHA256, data))
}

fn digest_to_secret(d: &digest::Digest) -> SecretBytes<SEED_LEN> {
    let mut out = [0u8; SEED_LEN];
    out.copy_from_slice(d.as_ref());
    SecretBytes::new(out)
}

fn key_file_component(data: &[u8]) -> Result<SecretBytes<SEED_LEN>, KeyError> {
    if let Some(key) = parse_xml_key_file(data)? {
        return Ok(key);
    }
    if data.len() == SEED_LEN {
        let mut out = [0u8; SEED_LEN];
        out.copy_from_slice(data);
        return Ok(SecretBytes::new(out));
    }
    if data.len() == HEX_KEY_FILE_LEN && data.iter().all(u8::is_ascii_hexdigit) {
        if let Ok(mut decoded) = HEXLOWER_PERMISSIVE.decode(data) {
            let key = SecretBytes::from_slice(&decoded)
                .map_err(|e| KeyError::InvalidKeyFile(e.to_string()));
            decoded.zeroize();
            return key;
        }
    }
    Ok(sha256(data))
}

#[derive(Default)]
struct XmlKeyFile {
    version: Option<String>,
    data: Option<String>,
    hash: Option<String>,
}

impl Drop for XmlKeyFile {
    fn drop(&mut self) {
        if let Some(data) = self.data.as_mut() {
            data.zeroize();
        }
    }
}

/// Returns `Ok(None)` when the bytes are not an XML key file at all, so the
/// caller can fall back to the binary interpretations.
fn parse_xml_key_file(data: &[u8]) -> Result<Option<SecretBytes<SEED_LEN>>, KeyError> {
    let trimmed = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    if !trimmed.trim_ascii_start().starts_with(b"<") {
        return Ok(None);
    }
    let Some(file) = scan_key_file(trimmed) else {
        return Ok(None);
    };

    let version = file
        .version
        .as_deref()
        .ok_or_else(|| KeyError::InvalidKeyFile("missing Meta/Version".into()))?;
    let data = file
        .data
        .as_deref()
        .ok_or_else(|| KeyError::InvalidKeyFile("missing Key/Data".into()))?;

    let mut key_bytes = match version.split('.').next() {
        Some("1") => BASE64
            .decode(data.as_bytes())
            .map_err(|e| KeyError::InvalidKeyFile(format!("bad base64 key data: {e}")))?,
        Some("2") => {
            let hex: String = data.chars().filter(|c| !c.is_whitespace()).collect();
            let decoded = HEXLOWER_PERMISSIVE
                .decode(hex.as_bytes())
                .map_err(|e| KeyError::InvalidKeyFile(format!("bad hex key data: {e}")))?;
            verify_v2_hash(&decoded, file.hash.as_deref())?;
            decoded
        }
        _ => {
            return Err(KeyError::InvalidKeyFile(format!(
                "unsupported key file version {version}"
            )))
        }
    };

    let key = if key_bytes.len() == SEED_LEN {
        SecretBytes::from_slice(&key_bytes).map_err(|e| KeyError::InvalidKeyFile(e.to_string()))?
    } else {
        sha256(&key_bytes)
    };
    key_bytes.zeroize();
    Ok(Some(key))
}

fn verify_v2_hash(decoded: &[u8], hash_attr: Option<&str>) -> Result<(), KeyError> {
    let hash_attr =
        hash_attr.ok_or_else(|| KeyError::InvalidKeyFile("missing Data/@Hash".into()))?;
    let expected = HEXLOWER_PERMISSIVE
        .decode(hash_attr.trim().as_bytes())
        .map_err(|e| KeyError::InvalidKeyFile(format!("bad hash attribute: {e}")))?;
    let actual = digest::digest(&digest::SHA256, decoded);
    if expected.len() != 4 || actual.as_ref().get(..4) != Some(expected.as_slice()) {
        return Err(KeyError::InvalidKeyFile("key data hash mismatch".into()));
    }
    Ok(())
}

/// Collect `KeyFile/Meta/Version`, `KeyFile/Key/Data` and its `Hash`.
/// Returns `None` on malformed XML or a foreign root element.
fn scan_key_file(data: &[u8]) -> Option<XmlKeyFile> {
    let mut reader = Reader::from_reader(data);
    let mut buf = Vec::new();
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut file = XmlKeyFile::default();

    loop {
        match reader.read_event_into(&mut buf).ok()? {
            Event::Start(start) => {
                let name = start.name().as_ref().to_vec();
                if path.is_empty() && name != b"KeyFile" {
                    return None;
                }
                path.push(name);
                if path_is(&path, &[b"KeyFile", b"Key", b"Data"]) {
                    for attr in start.attributes().flatten() {
                        if attr.key.as_ref() == b"Hash" {
                            file.hash = Some(attr.unescape_value().ok()?.into_owned());
                        }
                    }
                }
            }
            Event::End(_) => {
                path.pop();
            }
            Event::Text(text) => {
                let value = text.unescape().ok()?;
                let value = value.trim();
                if path_is(&path, &[b"KeyFile", b"Meta", b"Version"]) {
                    file.version = Some(value.to_owned());
                } else if path_is(&path, &[b"KeyFile", b"Key", b"Data"]) {
                    file.data = Some(value.to_owned());
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    buf.zeroize();
    Some(file)
}

fn path_is(path: &[Vec<u8>], expected: &[&[u8]]) -> bool {
    path.len() == expected.len() && path.iter().zip(expected).all(|(a, b)| a.as_slice() == *b)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sha(data: &[u8]) -> Vec<u8> {
        digest::digest(&digest::SHA256, data).as_ref().to_vec()
    }

    #[test]
    fn no_factors_is_an_error() {
        let err = KeyMaterial::new().derive_seed().expect_err("empty key");
        assert!(matches!(err, KeyError::NoFactors));
    }

    #[test]
    fn password_seed_is_double_sha256() {
        let seed = KeyMaterial::from_password("hunter2").derive_seed().expect("seed");
        assert_eq!(seed.expose().as_slice(), sha(&sha(b"hunter2")).as_slice());
    }

    #[test]
    fn factor_order_changes_seed() {
        let file = || -> Result<SecretBuffer, KeyError> { Ok(SecretBuffer::new(b"some key file contents")) };
        let mut a = KeyMaterial::new();
        a.add_factor(KeyFactor::password("pw")).add_factor(KeyFactor::key_file(file));
        let mut b = KeyMaterial::new();
        b.add_factor(KeyFactor::key_file(file)).add_factor(KeyFactor::password("pw"));
        assert_eq!(a.factor_count(), 2);
        assert_ne!(
            a.derive_seed().expect("seed").expose(),
            b.derive_seed().expect("seed").expose()
        );
    }

    #[test]
    fn unavailable_source_propagates() {
        let mut key = KeyMaterial::new();
        key.add_factor(KeyFactor::key_file(|| -> Result<SecretBuffer, KeyError> {
            Err(KeyError::Unavailable("token removed".into()))
        }));
        let err = key.derive_seed().expect_err("unavailable");
        assert!(matches!(err, KeyError::Unavailable(ref m) if m.contains("token")));
    }

    #[test]
    fn raw_32_byte_key_file_is_used_verbatim() {
        let raw = [0x11u8; 32];
        assert_eq!(key_file_component(&raw).expect("component").expose(), &raw);
    }

    #[test]
    fn hex_64_key_file_is_decoded() {
        let hex = "00112233445566778899aabbccddeeff00112233445566778899AABBCCDDEEFF";
        let component = key_file_component(hex.as_bytes()).expect("component");
        assert_eq!(component.expose()[1], 0x11);
        assert_eq!(component.expose()[31], 0xFF);
    }

    #[test]
    fn arbitrary_key_file_is_hashed() {
        let data = b"not a key file format at all, just bytes";
        let component = key_file_component(data).expect("component");
        assert_eq!(component.expose().as_slice(), sha(data).as_slice());
    }

    #[test]
    fn xml_v1_key_file() {
        let key = [0x5Cu8; 32];
        let xml = format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<KeyFile>\n\t<Meta>\n\t\t<Version>1.00</Version>\n\t</Meta>\n\t<Key>\n\t\t<Data>{}</Data>\n\t</Key>\n</KeyFile>",
            BASE64.encode(&key)
        );
        assert_eq!(key_file_component(xml.as_bytes()).expect("component").expose(), &key);
    }

    #[test]
    fn xml_v2_key_file_checks_hash() {
        let key = [0xA7u8; 32];
        let hex = HEXLOWER_PERMISSIVE.encode(&key).to_uppercase();
        let grouped: Vec<String> = hex.as_bytes().chunks(8).map(|c| String::from_utf8_lossy(c).into_owned()).collect();
        let hash = HEXLOWER_PERMISSIVE.encode(&sha(&key)[..4]);
        let make = |h: &str| {
            format!(
                "<KeyFile><Meta><Version>2.0</Version></Meta><Key><Data Hash=\"{h}\">\n{}\n</Data></Key></KeyFile>",
                grouped.join(" ")
            )
        };

        let good = make(&hash);
        assert_eq!(key_file_component(good.as_bytes()).expect("component").expose(), &key);

        let bad = make("00000000");
        let err = key_file_component(bad.as_bytes()).expect_err("hash mismatch");
        assert!(matches!(err, KeyError::InvalidKeyFile(ref m) if m.contains("hash")));
    }

    #[test]
    fn foreign_xml_falls_back_to_hash() {
        let data = b"<html><body>not a key</body></html>";
        let component = key_file_component(data).expect("component");
        assert_eq!(component.expose().as_slice(), sha(data).as_slice());
    }

    #[test]
    fn schedule_keys_depend_on_master_seed() {
        let transformed = SecretBytes::new([9u8; 32]);
        let a = KeySchedule::derive(&[1u8; 32], &transformed);
        let b = KeySchedule::derive(&[2u8; 32], &transformed);
        assert_ne!(a.cipher_key.expose(), b.cipher_key.expose());
        assert_ne!(a.hmac_base.expose(), b.hmac_base.expose());

        let mut concat = vec![1u8; 32];
        concat.extend_from_slice(&[9u8; 32]);
        assert_eq!(a.cipher_key.expose().as_slice(), sha(&concat).as_slice());
    }

    #[test]
    fn debug_is_masked() {
        let key = KeyMaterial::from_password("secret");
        assert!(!format!("{key:?}").contains("secret"));
    }
}
