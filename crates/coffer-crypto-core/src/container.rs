//! Container open / seal: the cryptographic half of the KDBX codec.
//!
//! This module provides:
//! - [`open`]: verify and decrypt a container into its XML payload,
//!   inner stream and attachment pool
//! - [`read_header`]: parse the outer header without any key
//! - [`Sealer`]: generate fresh header randomness and seal a payload
//!
//! # Layering
//!
//! ```text
//! 3.x: header | AES/ChaCha( start_bytes | hashed_blocks( gzip?( xml ) ) )
//! 4.x: header | sha256(header) | hmac(header) | hmac_blocks( cipher( gzip?( inner_header | xml ) ) )
//! ```
//!
//! Wrong credentials surface only as [`CryptoError::InvalidCredentials`]:
//! the start bytes check in 3.x (or an AES padding failure), the header
//! HMAC in 4.x.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use ring::digest;
use std::io::{Read, Write};
use zeroize::Zeroize;

use crate::blocks::{header_hmac, read_hashed_blocks, read_hmac_blocks, write_hashed_blocks, write_hmac_blocks};
use crate::error::CryptoError;
use crate::header::{Compression, ContainerBinary, FormatVersion, InnerHeader, OuterHeader, SEED_LEN};
use crate::inner_stream::InnerStreamSpec;
use crate::kdf::KdfParams;
use crate::keys::{KeyMaterial, KeySchedule};
use crate::memory::{constant_time_eq, random_array, SecretBuffer};
use crate::symmetric::OuterCipher;
use crate::variant::VariantDictionary;

/// SHA-256 / HMAC-SHA-256 length.
const HASH_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A verified, decrypted container.
#[derive(Debug)]
pub struct OpenedContainer {
    /// Parsed outer header.
    pub header: OuterHeader,
    /// SHA-256 of the outer header bytes (checked against `Meta/HeaderHash`
    /// in 3.x payloads).
    pub header_hash: [u8; HASH_LEN],
    /// Inner random stream for protected values.
    pub inner_stream: InnerStreamSpec,
    /// Attachments from the 4.x inner header; empty for 3.x.
    pub binaries: Vec<ContainerBinary>,
    /// Decompressed XML document.
    pub payload: SecretBuffer,
}

/// Caller-chosen settings for a new container.
#[derive(Clone, Debug)]
pub struct SealSettings {
    /// Outer cipher.
    pub cipher: OuterCipher,
    /// KDF with freshly generated salt or seed.
    pub kdf: KdfParams,
    /// Payload compression.
    pub compression: Compression,
    /// Unencrypted header custom data (4.x only).
    pub public_custom_data: Option<VariantDictionary>,
}

/// Fresh header state for one write.
///
/// The header (and therefore its hash) is fixed at construction, so the
/// payload can embed the hash and be masked with [`Self::inner_stream`]
/// before [`Self::seal`] runs.
#[derive(Debug)]
pub struct Sealer {
    header: OuterHeader,
    header_bytes: Vec<u8>,
    inner_stream: InnerStreamSpec,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn sha256(data: &[u8]) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(digest::digest(&digest::SHA256, data).as_ref());
    out
}

fn key_schedule(header: &OuterHeader, key: &KeyMaterial) -> Result<KeySchedule, CryptoError> {
    let seed = key.derive_seed()?;
    let transformed = header.kdf.transform(seed.expose())?;
    Ok(KeySchedule::derive(&header.master_seed, &transformed))
}

fn decompress(compression: Compression, data: Vec<u8>) -> Result<Vec<u8>, CryptoError> {
    match compression {
        Compression::None => Ok(data),
        Compression::Gzip => {
            let mut out = Vec::with_capacity(data.len().saturating_mul(4));
            let result = GzDecoder::new(data.as_slice()).read_to_end(&mut out);
            let mut data = data;
            data.zeroize();
            match result {
                Ok(_) => Ok(out),
                Err(e) => {
                    out.zeroize();
                    Err(CryptoError::Decompression(e.to_string()))
                }
            }
        }
    }
}

fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .map_err(|e| CryptoError::Decompression(format!("gzip: {e}")))?;
            encoder
                .finish()
                .map_err(|e| CryptoError::Decompression(format!("gzip: {e}")))
        }
    }
}

// ---------------------------------------------------------------------------
// Open
// ---------------------------------------------------------------------------

/// Parse only the outer header, no key required.
///
/// # Errors
///
/// Returns [`CryptoError::CorruptHeader`] if the header is unreadable.
pub fn read_header(data: &[u8]) -> Result<OuterHeader, CryptoError> {
    OuterHeader::parse(data).map(|(header, _)| header)
}

/// Verify and decrypt a container.
///
/// # Errors
///
/// - [`CryptoError::Key`] if the key material cannot be assembled
/// - [`CryptoError::CorruptHeader`] for header damage or a 4.x header
///   checksum mismatch
/// - [`CryptoError::InvalidCredentials`] if the key is wrong
/// - [`CryptoError::CorruptBody`] for block integrity failures
/// - [`CryptoError::Decompression`] for a malformed gzip stream
/// - [`CryptoError::KeyDerivation`] for unusable KDF parameters
pub fn open(data: &[u8], key: &KeyMaterial) -> Result<OpenedContainer, CryptoError> {
    let (header, header_len) = OuterHeader::parse(data)?;
    let header_bytes = &data[..header_len];
    let header_hash = sha256(header_bytes);
    let rest = &data[header_len..];
    if header.version.is_v4() {
        open_v4(header, header_bytes, header_hash, rest, key)
    } else {
        open_v3(header, header_hash, rest, key)
    }
}

fn open_v3(
    header: OuterHeader,
    header_hash: [u8; HASH_LEN],
    body: &[u8],
    key: &KeyMaterial,
) -> Result<OpenedContainer, CryptoError> {
    let schedule = key_schedule(&header, key)?;
    let plain = header
        .cipher
        .decrypt(schedule.cipher_key.expose(), &header.iv, body)?;

    let expected = header
        .stream_start_bytes
        .ok_or_else(|| CryptoError::CorruptHeader("missing stream start bytes".into()))?;
    let (start, framed) = plain
        .expose()
        .split_at_checked(SEED_LEN)
        .ok_or(CryptoError::InvalidCredentials)?;
    if !constant_time_eq(start, &expected) {
        return Err(CryptoError::InvalidCredentials);
    }

    let unframed = read_hashed_blocks(framed)?;
    let payload = decompress(header.compression, unframed)?;
    let inner_stream = header
        .legacy_inner_stream
        .clone()
        .ok_or_else(|| CryptoError::CorruptHeader("missing inner stream".into()))?;
    tracing::debug!(version = %header.version, payload = payload.len(), "opened container");

    Ok(OpenedContainer {
        header,
        header_hash,
        inner_stream,
        binaries: Vec::new(),
        payload: SecretBuffer::from_vec(payload),
    })
}

fn open_v4(
    header: OuterHeader,
    header_bytes: &[u8],
    header_hash: [u8; HASH_LEN],
    rest: &[u8],
    key: &KeyMaterial,
) -> Result<OpenedContainer, CryptoError> {
    let (stored_hash, rest) = rest
        .split_at_checked(HASH_LEN)
        .ok_or_else(|| CryptoError::CorruptHeader("missing header checksum".into()))?;
    if !constant_time_eq(stored_hash, &header_hash) {
        return Err(CryptoError::CorruptHeader("header checksum mismatch".into()));
    }
    let (stored_mac, blocks) = rest
        .split_at_checked(HASH_LEN)
        .ok_or_else(|| CryptoError::CorruptHeader("missing header MAC".into()))?;

    let schedule = key_schedule(&header, key)?;
    if !constant_time_eq(&header_hmac(&schedule.hmac_base, header_bytes), stored_mac) {
        return Err(CryptoError::InvalidCredentials);
    }

    let ciphertext = read_hmac_blocks(&schedule.hmac_base, blocks)?;
    let plain = header
        .cipher
        .decrypt(schedule.cipher_key.expose(), &header.iv, &ciphertext)
        .map_err(|e| match e {
            CryptoError::InvalidCredentials => CryptoError::CorruptBody("invalid cipher padding".into()),
            other => other,
        })?;
    let decompressed = decompress(header.compression, plain.expose().to_vec())?;
    let decompressed = SecretBuffer::from_vec(decompressed);

    let (inner, consumed) = InnerHeader::parse(decompressed.expose())?;
    let payload = SecretBuffer::new(&decompressed.expose()[consumed..]);
    tracing::debug!(
        version = %header.version,
        binaries = inner.binaries.len(),
        payload = payload.len(),
        "opened container"
    );

    Ok(OpenedContainer {
        header,
        header_hash,
        inner_stream: inner.stream,
        binaries: inner.binaries,
        payload,
    })
}

// ---------------------------------------------------------------------------
// Seal
// ---------------------------------------------------------------------------

impl Sealer {
    /// Prepare a new container of `version` with fresh master seed, IV and
    /// inner stream key.
    ///
    /// 4.x containers get a ChaCha20 inner stream, 3.x containers Salsa20
    /// plus random stream start bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SecureMemory`] if the CSPRNG fails and
    /// [`CryptoError::Encryption`] if the header cannot be serialized.
    pub fn new(version: FormatVersion, settings: SealSettings) -> Result<Self, CryptoError> {
        let v4 = version.is_v4();
        let inner_stream = if v4 {
            InnerStreamSpec::generate_chacha20()?
        } else {
            InnerStreamSpec::generate_salsa20()?
        };
        let header = OuterHeader {
            version,
            cipher: settings.cipher,
            compression: settings.compression,
            master_seed: random_array()?,
            iv: settings.cipher.generate_iv()?,
            kdf: settings.kdf,
            comment: None,
            legacy_inner_stream: (!v4).then(|| inner_stream.clone()),
            stream_start_bytes: if v4 { None } else { Some(random_array()?) },
            public_custom_data: if v4 { settings.public_custom_data } else { None },
        };
        let header_bytes = header.to_bytes()?;
        Ok(Self {
            header,
            header_bytes,
            inner_stream,
        })
    }

    /// The header that will be written.
    #[must_use]
    pub const fn header(&self) -> &OuterHeader {
        &self.header
    }

    /// Inner stream to mask protected values with.
    #[must_use]
    pub const fn inner_stream(&self) -> &InnerStreamSpec {
        &self.inner_stream
    }

    /// SHA-256 of the serialized outer header.
    #[must_use]
    pub fn header_hash(&self) -> [u8; HASH_LEN] {
        sha256(&self.header_bytes)
    }

    /// Compress, encrypt and frame `payload` under `key`.
    ///
    /// `binaries` go into the 4.x inner header; a 3.x container carries its
    /// attachments inside the payload and must be given none.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::Key`] if the key material cannot be assembled
    /// - [`CryptoError::KeyDerivation`] for unusable KDF parameters
    /// - [`CryptoError::Encryption`] for size limit violations or binaries
    ///   passed to a 3.x container
    pub fn seal(
        &self,
        key: &KeyMaterial,
        payload: &[u8],
        binaries: &[ContainerBinary],
    ) -> Result<Vec<u8>, CryptoError> {
        let schedule = key_schedule(&self.header, key)?;
        let cipher_key = schedule.cipher_key.expose();

        let mut out = self.header_bytes.clone();
        if self.header.version.is_v4() {
            let inner = InnerHeader {
                stream: self.inner_stream.clone(),
                binaries: binaries.to_vec(),
            };
            let mut plain = inner.to_bytes()?;
            plain.extend_from_slice(payload);
            let mut compressed = compress(self.header.compression, &plain)?;
            plain.zeroize();
            let ciphertext = self.header.cipher.encrypt(cipher_key, &self.header.iv, &compressed)?;
            compressed.zeroize();

            out.extend_from_slice(&self.header_hash());
            out.extend_from_slice(&header_hmac(&schedule.hmac_base, &self.header_bytes));
            out.extend_from_slice(&write_hmac_blocks(&schedule.hmac_base, &ciphertext)?);
        } else {
            if !binaries.is_empty() {
                return Err(CryptoError::Encryption(
                    "3.x containers carry attachments inside the payload".into(),
                ));
            }
            let start = self
                .header
                .stream_start_bytes
                .ok_or_else(|| CryptoError::Encryption("missing stream start bytes".into()))?;
            let mut compressed = compress(self.header.compression, payload)?;
            let mut plain = start.to_vec();
            plain.extend_from_slice(&write_hashed_blocks(&compressed)?);
            compressed.zeroize();
            let ciphertext = self.header.cipher.encrypt(cipher_key, &self.header.iv, &plain)?;
            plain.zeroize();
            out.extend_from_slice(&ciphertext);
        }

        tracing::debug!(
            version = %self.header.version,
            cipher = ?self.header.cipher,
            kdf = %self.header.kdf.uuid(),
            bytes = out.len(),
            "sealed container"
        );
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::Argon2Variant;

    fn settings(cipher: OuterCipher, compression: Compression) -> SealSettings {
        SealSettings {
            cipher,
            kdf: KdfParams::new_argon2(Argon2Variant::Argon2id, 32, 1, 1).expect("kdf"),
            compression,
            public_custom_data: None,
        }
    }

    const XML: &[u8] = b"<?xml version=\"1.0\"?><KeePassFile><Root/></KeePassFile>";

    #[test]
    fn v4_seal_open_roundtrip() {
        let key = KeyMaterial::from_password("pw");
        let sealer = Sealer::new(FormatVersion::V4_0, settings(OuterCipher::ChaCha20, Compression::Gzip))
            .expect("sealer");
        let binaries = vec![ContainerBinary { protected: true, data: b"attachment".to_vec() }];
        let bytes = sealer.seal(&key, XML, &binaries).expect("seal");

        let opened = open(&bytes, &key).expect("open");
        assert_eq!(opened.payload.expose(), XML);
        assert_eq!(opened.binaries, binaries);
        assert_eq!(opened.header_hash, sealer.header_hash());
        assert_eq!(opened.inner_stream.key.expose(), sealer.inner_stream().key.expose());
    }

    #[test]
    fn v3_seal_open_roundtrip() {
        let key = KeyMaterial::from_password("pw");
        let settings = SealSettings {
            cipher: OuterCipher::Aes256,
            kdf: KdfParams::new_aes(10).expect("kdf"),
            compression: Compression::None,
            public_custom_data: None,
        };
        let sealer = Sealer::new(FormatVersion::V3_1, settings).expect("sealer");
        let bytes = sealer.seal(&key, XML, &[]).expect("seal");
        let opened = open(&bytes, &key).expect("open");
        assert_eq!(opened.header.version, FormatVersion::V3_1);
        assert_eq!(opened.payload.expose(), XML);
        assert!(opened.binaries.is_empty());
    }

    #[test]
    fn wrong_key_is_invalid_credentials_in_both_versions() {
        let good = KeyMaterial::from_password("right");
        let bad = KeyMaterial::from_password("wrong");

        let v4 = Sealer::new(FormatVersion::V4_0, settings(OuterCipher::Aes256, Compression::Gzip))
            .expect("sealer")
            .seal(&good, XML, &[])
            .expect("seal");
        assert!(matches!(open(&v4, &bad), Err(CryptoError::InvalidCredentials)));

        let v3_settings = SealSettings {
            cipher: OuterCipher::Aes256,
            kdf: KdfParams::new_aes(10).expect("kdf"),
            compression: Compression::Gzip,
            public_custom_data: None,
        };
        let v3 = Sealer::new(FormatVersion::V3_1, v3_settings)
            .expect("sealer")
            .seal(&good, XML, &[])
            .expect("seal");
        assert!(matches!(open(&v3, &bad), Err(CryptoError::InvalidCredentials)));
    }

    #[test]
    fn v4_header_tamper_is_corrupt_header() {
        let key = KeyMaterial::from_password("pw");
        let sealer = Sealer::new(FormatVersion::V4_0, settings(OuterCipher::ChaCha20, Compression::None))
            .expect("sealer");
        let mut bytes = sealer.seal(&key, XML, &[]).expect("seal");
        // master seed data starts after sig(8) + version(4) + cipher(5+16) + compression(5+4) + id/len(5)
        bytes[8 + 4 + 21 + 9 + 5] ^= 0x01;
        let err = open(&bytes, &key).expect_err("tampered");
        assert!(matches!(err, CryptoError::CorruptHeader(ref m) if m.contains("checksum")));
    }

    #[test]
    fn v4_body_tamper_is_corrupt_body() {
        let key = KeyMaterial::from_password("pw");
        let mut bytes = Sealer::new(FormatVersion::V4_0, settings(OuterCipher::ChaCha20, Compression::None))
            .expect("sealer")
            .seal(&key, XML, &[])
            .expect("seal");
        let last = bytes.len() - 40;
        bytes[last] ^= 0x01;
        let err = open(&bytes, &key).expect_err("tampered");
        assert!(matches!(err, CryptoError::CorruptBody(_)));
    }

    #[test]
    fn v3_rejects_binaries() {
        let settings = SealSettings {
            cipher: OuterCipher::Aes256,
            kdf: KdfParams::new_aes(10).expect("kdf"),
            compression: Compression::None,
            public_custom_data: None,
        };
        let sealer = Sealer::new(FormatVersion::V3_1, settings).expect("sealer");
        let binaries = [ContainerBinary { protected: false, data: vec![1] }];
        let err = sealer
            .seal(&KeyMaterial::from_password("pw"), XML, &binaries)
            .expect_err("binaries in 3.x");
        assert!(matches!(err, CryptoError::Encryption(_)));
    }

    #[test]
    fn every_seal_uses_fresh_randomness() {
        let a = Sealer::new(FormatVersion::V4_0, settings(OuterCipher::Aes256, Compression::Gzip)).expect("a");
        let b = Sealer::new(FormatVersion::V4_0, settings(OuterCipher::Aes256, Compression::Gzip)).expect("b");
        assert_ne!(a.header().master_seed, b.header().master_seed);
        assert_ne!(a.header().iv, b.header().iv);
        assert_ne!(a.inner_stream().key.expose(), b.inner_stream().key.expose());
    }

    #[test]
    fn corrupt_gzip_is_decompression_error() {
        let err = decompress(Compression::Gzip, b"definitely not gzip".to_vec()).expect_err("bad gzip");
        assert!(matches!(err, CryptoError::Decompression(_)));
    }

    #[test]
    fn read_header_needs_no_key() {
        let bytes = Sealer::new(FormatVersion::V4_0, settings(OuterCipher::ChaCha20, Compression::Gzip))
            .expect("sealer")
            .seal(&KeyMaterial::from_password("pw"), XML, &[])
            .expect("seal");
        let header = read_header(&bytes).expect("header");
        assert_eq!(header.cipher, OuterCipher::ChaCha20);
        assert_eq!(header.compression, Compression::Gzip);
    }
}
