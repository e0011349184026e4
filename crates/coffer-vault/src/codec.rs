//! `decode` / `encode`: container bytes to [`Database`] and back.

use std::collections::BTreeMap;

use coffer_crypto_core::{open, ContainerBinary, FormatVersion, KeyMaterial, Sealer};
use zeroize::Zeroize;

use crate::attachments::{Binary, BinaryId, BinaryPool};
use crate::error::{DecodeError, EncodeError, MergeFilesError};
use crate::merge::{merge, MergeReport};
use crate::preferences::FormatPreferences;
use crate::tree::Database;
use crate::xml::{self, reader, writer};

fn malformed(msg: impl Into<String>) -> DecodeError {
    DecodeError::MalformedPayload(msg.into())
}

/// Open a KDBX 3.1 or 4.x container.
///
/// # Errors
///
/// - [`DecodeError::CorruptHeader`] for an unreadable header, a header
///   checksum mismatch or a 3.x `HeaderHash` mismatch
/// - [`DecodeError::InvalidCredentials`] when `key` does not open the file
/// - [`DecodeError::MalformedPayload`] for integrity failures or an
///   invalid XML document
/// - [`DecodeError::Decompression`] for a broken gzip stream
pub fn decode(data: &[u8], key: &KeyMaterial) -> Result<Database, DecodeError> {
    let opened = open(data, key)?;
    let v4 = opened.header.version.is_v4();

    let mut doc = xml::parse(opened.payload.expose()).map_err(malformed)?;
    let mut stream = opened.inner_stream.start()?;
    xml::unprotect(&mut doc, &mut stream).map_err(malformed)?;

    let mut pool = BinaryPool::new();
    for (index, binary) in opened.binaries.iter().enumerate() {
        let id = u32::try_from(index).map_err(|_| malformed("too many attachments"))?;
        pool.insert_at(
            BinaryId(id),
            Binary {
                data: binary.data.clone(),
                protected: binary.protected,
            },
        );
    }

    let parsed = reader::read_document(&doc, pool)?;
    if !v4 {
        if let Some(hash) = &parsed.header_hash {
            if hash.as_slice() != opened.header_hash.as_slice() {
                return Err(DecodeError::CorruptHeader("header hash mismatch".into()));
            }
        }
    }

    let mut database = parsed.database;
    database.compact_binaries();
    database.public_custom_data.clone_from(&opened.header.public_custom_data);
    database.validate().map_err(|e| malformed(e.to_string()))?;

    tracing::debug!(
        version = %opened.header.version,
        groups = database.groups.len(),
        entries = database.entries.len(),
        binaries = database.binaries.len(),
        "decoded database"
    );
    Ok(database)
}

/// Write `db` as a KDBX 4.0 container with a ChaCha20 inner stream.
///
/// Master seed, IV, KDF salt and inner stream key are fresh on every call.
///
/// # Errors
///
/// - [`EncodeError::Serialization`] if the tree is inconsistent
/// - [`EncodeError::SizeLimit`] for counts the format cannot represent
/// - [`EncodeError::Key`] / [`EncodeError::Crypto`] from sealing
pub fn encode(db: &Database, key: &KeyMaterial, prefs: &FormatPreferences) -> Result<Vec<u8>, EncodeError> {
    encode_with_version(db, key, prefs, FormatVersion::V4_0)
}

/// Write `db` in the given layout version.
///
/// Attachments are written by pool position, so `decode` numbers them
/// densely from 0 in id order.
///
/// 3.1 output is for readers that predate KDBX 4; it requires AES-KDF and
/// keeps attachments in `Meta/Binaries`.
///
/// # Errors
///
/// As [`encode`], plus [`EncodeError::Crypto`] for a 3.1 request with an
/// Argon2 KDF.
pub fn encode_with_version(
    db: &Database,
    key: &KeyMaterial,
    prefs: &FormatPreferences,
    version: FormatVersion,
) -> Result<Vec<u8>, EncodeError> {
    db.validate()
        .map_err(|e| EncodeError::Serialization(e.to_string()))?;
    check_counts(db)?;
    let v4 = version.is_v4();

    let settings = prefs.to_seal_settings(db.public_custom_data.clone())?;
    let sealer = Sealer::new(version, settings)?;

    let mut refs = BTreeMap::new();
    let mut binaries = Vec::with_capacity(db.binaries.len());
    for (index, (id, binary)) in db.binaries.iter().enumerate() {
        let index = u32::try_from(index).map_err(|_| EncodeError::SizeLimit("too many attachments".into()))?;
        refs.insert(id, index);
        binaries.push(ContainerBinary {
            protected: binary.protected,
            data: binary.data.clone(),
        });
    }

    let options = writer::WriteOptions {
        v4,
        generator: &prefs.generator,
        header_hash: (!v4).then(|| sealer.header_hash()),
        binary_refs: &refs,
    };
    let mut doc = writer::write_document(db, &options)?;
    let mut stream = sealer.inner_stream().start()?;
    xml::protect(&mut doc, &mut stream).map_err(EncodeError::Serialization)?;
    let mut payload = xml::serialize(&doc).map_err(EncodeError::Serialization)?;
    drop(doc);

    let container_binaries = if v4 { binaries } else { Vec::new() };
    let sealed = sealer.seal(key, &payload, &container_binaries);
    payload.zeroize();
    let bytes = sealed?;

    tracing::debug!(
        version = %version,
        groups = db.groups.len(),
        entries = db.entries.len(),
        bytes = bytes.len(),
        "encoded database"
    );
    Ok(bytes)
}

fn check_counts(db: &Database) -> Result<(), EncodeError> {
    let limit = usize::try_from(i32::MAX).unwrap_or(usize::MAX);
    if db.entries.len() > limit || db.groups.len() > limit {
        return Err(EncodeError::SizeLimit("item count exceeds i32".into()));
    }
    if db.binaries.len() > limit {
        return Err(EncodeError::SizeLimit("attachment count exceeds i32".into()));
    }
    if let Some((_, big)) = db.binaries.iter().find(|(_, b)| b.data.len() >= limit) {
        return Err(EncodeError::SizeLimit(format!(
            "attachment of {} bytes exceeds the inner header limit",
            big.data.len()
        )));
    }
    Ok(())
}

/// Decode two containers, merge them and write the result with the local
/// file's container settings.
///
/// # Errors
///
/// [`MergeFilesError::Local`] / [`MergeFilesError::Remote`] if either file
/// cannot be opened, [`MergeFilesError::Encode`] if the result cannot be
/// written.
pub fn merge_files(
    local: &[u8],
    local_key: &KeyMaterial,
    remote: &[u8],
    remote_key: &KeyMaterial,
) -> Result<(Vec<u8>, MergeReport), MergeFilesError> {
    let prefs = FormatPreferences::from_container(local).map_err(MergeFilesError::Local)?;
    let local_db = decode(local, local_key).map_err(MergeFilesError::Local)?;
    let remote_db = decode(remote, remote_key).map_err(MergeFilesError::Remote)?;
    let (merged, report) = merge(&local_db, &remote_db);
    let bytes = encode(&merged, local_key, &prefs)?;
    Ok((bytes, report))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entries::Entry;
    use crate::preferences::KdfSetting;

    fn fast_prefs() -> FormatPreferences {
        FormatPreferences {
            kdf: KdfSetting::AesKdf { rounds: 10 },
            ..FormatPreferences::default()
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut db = Database::new("Home");
        let root = db.root_id();
        let mut entry = Entry::new();
        entry.set("Title", "Bank").set("Password", "p@ss");
        db.add_entry(root, entry).expect("entry");

        let key = KeyMaterial::from_password("pw");
        let bytes = encode(&db, &key, &fast_prefs()).expect("encode");
        let back = decode(&bytes, &key).expect("decode");
        assert_eq!(back, db);
    }

    #[test]
    fn v3_layout_roundtrip() {
        let mut db = Database::new("Legacy");
        let root = db.root_id();
        let id = db.add_binary(Binary::new(b"blob".to_vec()));
        let mut entry = Entry::new();
        entry.attachments.insert("f.bin".into(), id);
        entry.set("Password", "old");
        db.add_entry(root, entry).expect("entry");

        let key = KeyMaterial::from_password("pw");
        let bytes = encode_with_version(&db, &key, &fast_prefs(), FormatVersion::V3_1).expect("encode");
        let back = decode(&bytes, &key).expect("decode");
        assert_eq!(back, db);
    }

    #[test]
    fn sparse_attachment_ids_read_back_dense() {
        let mut db = Database::new("Sparse");
        let root = db.root_id();
        db.binaries.insert_at(BinaryId(2), Binary::new(b"two".to_vec()));
        db.binaries.insert_at(BinaryId(5), Binary::new(b"five".to_vec()));
        let mut entry = Entry::new();
        entry.attachments.insert("a".into(), BinaryId(5));
        entry.attachments.insert("b".into(), BinaryId(2));
        db.add_entry(root, entry).expect("entry");

        let mut dense = db.clone();
        dense.compact_binaries();
        let key = KeyMaterial::from_password("pw");
        for version in [FormatVersion::V4_0, FormatVersion::V3_1] {
            let bytes = encode_with_version(&db, &key, &fast_prefs(), version).expect("encode");
            let back = decode(&bytes, &key).expect("decode");
            assert_eq!(back, dense);
            let again = encode_with_version(&back, &key, &fast_prefs(), version).expect("encode");
            assert_eq!(decode(&again, &key).expect("decode"), back);
        }
    }

    #[test]
    fn encode_rejects_inconsistent_tree() {
        let mut db = Database::new("Home");
        let root = db.root_id();
        let entry = db.add_entry(root, Entry::new()).expect("entry");
        db.entry_mut(entry).expect("entry").attachments.insert("x".into(), BinaryId(3));
        let err = encode(&db, &KeyMaterial::from_password("pw"), &fast_prefs()).expect_err("invalid");
        assert!(matches!(err, EncodeError::Serialization(_)));
    }

    #[test]
    fn wrong_key_is_reported_as_credentials() {
        let db = Database::new("Home");
        let bytes = encode(&db, &KeyMaterial::from_password("a"), &fast_prefs()).expect("encode");
        let err = decode(&bytes, &KeyMaterial::from_password("b")).expect_err("wrong key");
        assert!(err.is_wrong_key());
    }
}
