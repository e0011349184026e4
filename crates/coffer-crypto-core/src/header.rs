//! KDBX outer and inner headers.
//!
//! This module provides:
//! - [`OuterHeader`]: the unencrypted header preceding the body
//! - [`InnerHeader`]: the KDBX 4 header at the start of the decrypted body
//! - [`FormatVersion`], [`Compression`]: header-level enums
//!
//! # Outer layout
//!
//! ```text
//! sig1 u32 | sig2 u32 | version u32 (major << 16 | minor)
//! { id u8 | len u16 (3.x) or u32 (4.x) | data }*  until id 0
//! ```
//!
//! Both parsers record the exact byte length they consumed, so callers can
//! hash and MAC the header as it appears on disk.

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::inner_stream::{InnerStreamAlgorithm, InnerStreamSpec};
use crate::kdf::{KdfParams, AES_KDF_UUID, SALT_LEN};
use crate::memory::SecretBuffer;
use crate::symmetric::OuterCipher;
use crate::variant::VariantDictionary;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// First file signature.
pub const SIGNATURE_1: u32 = 0x9AA2_D903;

/// Second file signature (KeePass 2.x).
pub const SIGNATURE_2: u32 = 0xB54B_FB67;

/// Data of the end-of-header field.
const END_OF_HEADER: &[u8] = b"\r\n\r\n";

/// Length of the master seed and the v3 stream start bytes.
pub const SEED_LEN: usize = 32;

const FIELD_END: u8 = 0;
const FIELD_COMMENT: u8 = 1;
const FIELD_CIPHER_ID: u8 = 2;
const FIELD_COMPRESSION: u8 = 3;
const FIELD_MASTER_SEED: u8 = 4;
const FIELD_TRANSFORM_SEED: u8 = 5;
const FIELD_TRANSFORM_ROUNDS: u8 = 6;
const FIELD_ENCRYPTION_IV: u8 = 7;
const FIELD_PROTECTED_STREAM_KEY: u8 = 8;
const FIELD_STREAM_START_BYTES: u8 = 9;
const FIELD_INNER_RANDOM_STREAM_ID: u8 = 10;
const FIELD_KDF_PARAMETERS: u8 = 11;
const FIELD_PUBLIC_CUSTOM_DATA: u8 = 12;

const INNER_FIELD_END: u8 = 0;
const INNER_FIELD_STREAM_ID: u8 = 1;
const INNER_FIELD_STREAM_KEY: u8 = 2;
const INNER_FIELD_BINARY: u8 = 3;

/// Inner binary flag: the attachment is memory-protected.
const BINARY_FLAG_PROTECTED: u8 = 0x01;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Container format version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FormatVersion {
    /// Major version (3 or 4).
    pub major: u16,
    /// Minor version.
    pub minor: u16,
}

impl FormatVersion {
    /// KDBX 3.1, read only.
    pub const V3_1: Self = Self { major: 3, minor: 1 };
    /// KDBX 4.0, the version written.
    pub const V4_0: Self = Self { major: 4, minor: 0 };

    /// Packed `major << 16 | minor` form.
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        let minor = self.minor.to_le_bytes();
        let major = self.major.to_le_bytes();
        u32::from_le_bytes([minor[0], minor[1], major[0], major[1]])
    }

    /// Unpack and check support.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CorruptHeader`] for a major version other
    /// than 3 or 4.
    pub fn from_u32(raw: u32) -> Result<Self, CryptoError> {
        let bytes = raw.to_le_bytes();
        let version = Self {
            major: u16::from_le_bytes([bytes[2], bytes[3]]),
            minor: u16::from_le_bytes([bytes[0], bytes[1]]),
        };
        match version.major {
            3 | 4 => Ok(version),
            other => Err(CryptoError::CorruptHeader(format!(
                "unsupported format version {other}.{}",
                version.minor
            ))),
        }
    }

    /// Whether this is a 4.x layout.
    #[must_use]
    pub const fn is_v4(self) -> bool {
        self.major >= 4
    }
}

impl std::fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Payload compression.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Compression {
    /// Stored as-is.
    None,
    /// Gzip (flag 1).
    #[default]
    Gzip,
}

impl Compression {
    /// Header flag value.
    #[must_use]
    pub const fn id(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Gzip => 1,
        }
    }

    /// Map the header flag.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CorruptHeader`] for unknown algorithms.
    pub fn from_id(id: u32) -> Result<Self, CryptoError> {
        match id {
            0 => Ok(Self::None),
            1 => Ok(Self::Gzip),
            other => Err(CryptoError::CorruptHeader(format!(
                "unsupported compression {other}"
            ))),
        }
    }
}

/// Parsed outer header.
#[derive(Clone, Debug)]
pub struct OuterHeader {
    /// Format version.
    pub version: FormatVersion,
    /// Outer cipher.
    pub cipher: OuterCipher,
    /// Payload compression.
    pub compression: Compression,
    /// Master seed (field 4).
    pub master_seed: [u8; SEED_LEN],
    /// Cipher IV or nonce (field 7).
    pub iv: Vec<u8>,
    /// KDF parameters (fields 5 + 6 in 3.x, field 11 in 4.x).
    pub kdf: KdfParams,
    /// Optional comment (field 1), kept opaque.
    pub comment: Option<Vec<u8>>,
    /// Inner stream of a 3.x container (fields 8 + 10).
    pub legacy_inner_stream: Option<InnerStreamSpec>,
    /// Verification marker of a 3.x container (field 9).
    pub stream_start_bytes: Option<[u8; SEED_LEN]>,
    /// Unencrypted plugin data of a 4.x container (field 12).
    pub public_custom_data: Option<VariantDictionary>,
}

/// One attachment carried in the KDBX 4 inner header.
#[derive(Clone, PartialEq, Eq)]
pub struct ContainerBinary {
    /// Memory protection flag.
    pub protected: bool,
    /// Attachment bytes.
    pub data: Vec<u8>,
}

impl std::fmt::Debug for ContainerBinary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerBinary")
            .field("protected", &self.protected)
            .field("len", &self.data.len())
            .finish()
    }
}

/// KDBX 4 inner header.
#[derive(Clone, Debug)]
pub struct InnerHeader {
    /// Inner random stream.
    pub stream: InnerStreamSpec,
    /// Attachment pool, indexed by position.
    pub binaries: Vec<ContainerBinary>,
}

// ---------------------------------------------------------------------------
// Cursor helpers
// ---------------------------------------------------------------------------

fn corrupt(msg: impl Into<String>) -> CryptoError {
    CryptoError::CorruptHeader(msg.into())
}

fn take<'a>(data: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], CryptoError> {
    let end = pos
        .checked_add(n)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| corrupt("header truncated"))?;
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}

fn take_u32(data: &[u8], pos: &mut usize) -> Result<u32, CryptoError> {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(take(data, pos, 4)?);
    Ok(u32::from_le_bytes(arr))
}

fn fixed<const N: usize>(data: &[u8], field: &str) -> Result<[u8; N], CryptoError> {
    data.try_into()
        .map_err(|_| corrupt(format!("{field} must be {N} bytes, got {}", data.len())))
}

fn push_field(out: &mut Vec<u8>, v4: bool, id: u8, data: &[u8]) -> Result<(), CryptoError> {
    out.push(id);
    if v4 {
        let len = u32::try_from(data.len())
            .map_err(|_| CryptoError::Encryption(format!("header field {id} too large")))?;
        out.extend_from_slice(&len.to_le_bytes());
    } else {
        let len = u16::try_from(data.len())
            .map_err(|_| CryptoError::Encryption(format!("header field {id} too large")))?;
        out.extend_from_slice(&len.to_le_bytes());
    }
    out.extend_from_slice(data);
    Ok(())
}

// ---------------------------------------------------------------------------
// Outer header
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RawFields {
    comment: Option<Vec<u8>>,
    cipher: Option<Uuid>,
    compression: Option<u32>,
    master_seed: Option<[u8; SEED_LEN]>,
    transform_seed: Option<[u8; SALT_LEN]>,
    transform_rounds: Option<u64>,
    iv: Option<Vec<u8>>,
    stream_key: Option<SecretBuffer>,
    stream_start: Option<[u8; SEED_LEN]>,
    stream_id: Option<u32>,
    kdf: Option<VariantDictionary>,
    public_custom_data: Option<VariantDictionary>,
}

impl OuterHeader {
    /// Parse the outer header.
    ///
    /// Returns the header and the number of bytes it occupies.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CorruptHeader`] for a bad signature, an
    /// unsupported version, or a missing or malformed field.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), CryptoError> {
        let mut pos = 0usize;
        let sig1 = take_u32(data, &mut pos)?;
        let sig2 = take_u32(data, &mut pos)?;
        if sig1 != SIGNATURE_1 || sig2 != SIGNATURE_2 {
            return Err(corrupt("not a KDBX file (bad signature)"));
        }
        let version = FormatVersion::from_u32(take_u32(data, &mut pos)?)?;
        let v4 = version.is_v4();

        let mut raw = RawFields::default();
        loop {
            let id = take(data, &mut pos, 1)?[0];
            let len = if v4 {
                usize::try_from(take_u32(data, &mut pos)?)
                    .map_err(|_| corrupt("header field length exceeds address space"))?
            } else {
                let b = take(data, &mut pos, 2)?;
                usize::from(u16::from_le_bytes([b[0], b[1]]))
            };
            let field = take(data, &mut pos, len)?;
            match id {
                FIELD_END => break,
                FIELD_COMMENT => raw.comment = Some(field.to_vec()),
                FIELD_CIPHER_ID => {
                    raw.cipher = Some(Uuid::from_bytes(fixed::<16>(field, "cipher id")?));
                }
                FIELD_COMPRESSION => {
                    raw.compression = Some(u32::from_le_bytes(fixed::<4>(field, "compression")?));
                }
                FIELD_MASTER_SEED => raw.master_seed = Some(fixed(field, "master seed")?),
                FIELD_TRANSFORM_SEED if !v4 => {
                    raw.transform_seed = Some(fixed(field, "transform seed")?);
                }
                FIELD_TRANSFORM_ROUNDS if !v4 => {
                    raw.transform_rounds =
                        Some(u64::from_le_bytes(fixed::<8>(field, "transform rounds")?));
                }
                FIELD_ENCRYPTION_IV => raw.iv = Some(field.to_vec()),
                FIELD_PROTECTED_STREAM_KEY if !v4 => {
                    raw.stream_key = Some(SecretBuffer::new(field));
                }
                FIELD_STREAM_START_BYTES if !v4 => {
                    raw.stream_start = Some(fixed(field, "stream start bytes")?);
                }
                FIELD_INNER_RANDOM_STREAM_ID if !v4 => {
                    raw.stream_id = Some(u32::from_le_bytes(fixed::<4>(field, "inner stream id")?));
                }
                FIELD_KDF_PARAMETERS if v4 => raw.kdf = Some(VariantDictionary::from_bytes(field)?),
                FIELD_PUBLIC_CUSTOM_DATA if v4 => {
                    raw.public_custom_data = Some(VariantDictionary::from_bytes(field)?);
                }
                other => {
                    tracing::trace!(field = other, version = %version, "skipping unknown header field");
                }
            }
        }

        let header = Self::from_raw(version, raw)?;
        tracing::debug!(
            version = %header.version,
            cipher = ?header.cipher,
            kdf = %header.kdf.uuid(),
            compression = ?header.compression,
            "parsed outer header"
        );
        Ok((header, pos))
    }

    fn from_raw(version: FormatVersion, raw: RawFields) -> Result<Self, CryptoError> {
        let cipher = OuterCipher::from_uuid(raw.cipher.ok_or_else(|| corrupt("missing cipher id"))?)?;
        let compression =
            Compression::from_id(raw.compression.ok_or_else(|| corrupt("missing compression flags"))?)?;
        let master_seed = raw.master_seed.ok_or_else(|| corrupt("missing master seed"))?;
        let iv = raw.iv.ok_or_else(|| corrupt("missing encryption iv"))?;
        if iv.len() != cipher.iv_len() {
            return Err(corrupt(format!(
                "encryption iv must be {} bytes, got {}",
                cipher.iv_len(),
                iv.len()
            )));
        }

        if version.is_v4() {
            let dict = raw.kdf.ok_or_else(|| corrupt("missing KDF parameters"))?;
            return Ok(Self {
                version,
                cipher,
                compression,
                master_seed,
                iv,
                kdf: KdfParams::from_dictionary(&dict)?,
                comment: raw.comment,
                legacy_inner_stream: None,
                stream_start_bytes: None,
                public_custom_data: raw.public_custom_data,
            });
        }

        let kdf = KdfParams::Aes {
            rounds: raw.transform_rounds.ok_or_else(|| corrupt("missing transform rounds"))?,
            seed: raw.transform_seed.ok_or_else(|| corrupt("missing transform seed"))?,
        };
        let key = raw.stream_key.ok_or_else(|| corrupt("missing protected stream key"))?;
        let algorithm =
            InnerStreamAlgorithm::from_id(raw.stream_id.ok_or_else(|| corrupt("missing inner stream id"))?)?;
        Ok(Self {
            version,
            cipher,
            compression,
            master_seed,
            iv,
            kdf,
            comment: raw.comment,
            legacy_inner_stream: Some(InnerStreamSpec { algorithm, key }),
            stream_start_bytes: Some(raw.stream_start.ok_or_else(|| corrupt("missing stream start bytes"))?),
            public_custom_data: None,
        })
    }

    /// Serialize the header in the layout of `self.version`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encryption`] if a field exceeds its length
    /// prefix, or if a 3.x header is asked to carry a non-AES KDF or lacks
    /// its inner stream and start bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let v4 = self.version.is_v4();
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(&SIGNATURE_1.to_le_bytes());
        out.extend_from_slice(&SIGNATURE_2.to_le_bytes());
        out.extend_from_slice(&self.version.to_u32().to_le_bytes());

        if let Some(comment) = &self.comment {
            push_field(&mut out, v4, FIELD_COMMENT, comment)?;
        }
        push_field(&mut out, v4, FIELD_CIPHER_ID, self.cipher.uuid().as_bytes())?;
        push_field(&mut out, v4, FIELD_COMPRESSION, &self.compression.id().to_le_bytes())?;
        push_field(&mut out, v4, FIELD_MASTER_SEED, &self.master_seed)?;

        if v4 {
            push_field(&mut out, v4, FIELD_ENCRYPTION_IV, &self.iv)?;
            push_field(&mut out, v4, FIELD_KDF_PARAMETERS, &self.kdf.to_dictionary().to_bytes()?)?;
            if let Some(custom) = self.public_custom_data.as_ref().filter(|d| !d.is_empty()) {
                push_field(&mut out, v4, FIELD_PUBLIC_CUSTOM_DATA, &custom.to_bytes()?)?;
            }
        } else {
            let KdfParams::Aes { rounds, seed } = &self.kdf else {
                return Err(CryptoError::Encryption(format!(
                    "format 3.x requires {AES_KDF_UUID} key derivation"
                )));
            };
            let stream = self
                .legacy_inner_stream
                .as_ref()
                .ok_or_else(|| CryptoError::Encryption("3.x header without inner stream".into()))?;
            let start = self
                .stream_start_bytes
                .ok_or_else(|| CryptoError::Encryption("3.x header without stream start bytes".into()))?;
            push_field(&mut out, v4, FIELD_TRANSFORM_SEED, seed)?;
            push_field(&mut out, v4, FIELD_TRANSFORM_ROUNDS, &rounds.to_le_bytes())?;
            push_field(&mut out, v4, FIELD_ENCRYPTION_IV, &self.iv)?;
            push_field(&mut out, v4, FIELD_PROTECTED_STREAM_KEY, stream.key.expose())?;
            push_field(&mut out, v4, FIELD_STREAM_START_BYTES, &start)?;
            push_field(
                &mut out,
                v4,
                FIELD_INNER_RANDOM_STREAM_ID,
                &stream.algorithm.id().to_le_bytes(),
            )?;
        }
        push_field(&mut out, v4, FIELD_END, END_OF_HEADER)?;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Inner header (KDBX 4)
// ---------------------------------------------------------------------------

impl InnerHeader {
    /// Parse the inner header at the start of the decrypted body.
    ///
    /// Returns the header and the number of bytes it occupies.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CorruptBody`] for truncated or incomplete data.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), CryptoError> {
        let body = |e: CryptoError| match e {
            CryptoError::CorruptHeader(m) => CryptoError::CorruptBody(format!("inner header: {m}")),
            other => other,
        };
        let mut pos = 0usize;
        let mut algorithm = None;
        let mut key = None;
        let mut binaries = Vec::new();
        loop {
            let id = take(data, &mut pos, 1).map_err(body)?[0];
            let len = usize::try_from(take_u32(data, &mut pos).map_err(body)?)
                .map_err(|_| CryptoError::CorruptBody("inner field length exceeds address space".into()))?;
            let field = take(data, &mut pos, len).map_err(body)?;
            match id {
                INNER_FIELD_END => break,
                INNER_FIELD_STREAM_ID => {
                    let raw = u32::from_le_bytes(fixed::<4>(field, "inner stream id").map_err(body)?);
                    algorithm = Some(InnerStreamAlgorithm::from_id(raw).map_err(body)?);
                }
                INNER_FIELD_STREAM_KEY => key = Some(SecretBuffer::new(field)),
                INNER_FIELD_BINARY => {
                    let (&flags, content) = field
                        .split_first()
                        .ok_or_else(|| CryptoError::CorruptBody("empty inner binary field".into()))?;
                    binaries.push(ContainerBinary {
                        protected: flags & BINARY_FLAG_PROTECTED != 0,
                        data: content.to_vec(),
                    });
                }
                other => tracing::trace!(field = other, "skipping unknown inner header field"),
            }
        }
        let stream = InnerStreamSpec {
            algorithm: algorithm
                .ok_or_else(|| CryptoError::CorruptBody("inner header without stream id".into()))?,
            key: key.ok_or_else(|| CryptoError::CorruptBody("inner header without stream key".into()))?,
        };
        tracing::debug!(binaries = binaries.len(), stream = ?stream.algorithm, "parsed inner header");
        Ok((Self { stream, binaries }, pos))
    }

    /// Serialize the inner header.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encryption`] if an attachment exceeds the
    /// `u32` length prefix.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::new();
        push_field(&mut out, true, INNER_FIELD_STREAM_ID, &self.stream.algorithm.id().to_le_bytes())?;
        push_field(&mut out, true, INNER_FIELD_STREAM_KEY, self.stream.key.expose())?;
        for binary in &self.binaries {
            let mut field = Vec::with_capacity(binary.data.len().saturating_add(1));
            field.push(if binary.protected { BINARY_FLAG_PROTECTED } else { 0 });
            field.extend_from_slice(&binary.data);
            push_field(&mut out, true, INNER_FIELD_BINARY, &field)?;
        }
        push_field(&mut out, true, INNER_FIELD_END, &[])?;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
