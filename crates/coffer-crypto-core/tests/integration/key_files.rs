//! Integration tests for composite keys with key files.

use coffer_crypto_core::{KeyError, KeyFactor, KeyMaterial, SecretBuffer};
use ring::digest;

fn sha256(data: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA256, data).as_ref().to_vec()
}

#[test]
fn password_and_key_file_combine_in_order() {
    let file_bytes = b"arbitrary key file with enough bytes to be hashed".to_vec();
    let mut key = KeyMaterial::new();
    key.add_factor(KeyFactor::password("pw"));
    let source = SecretBuffer::new(&file_bytes);
    key.add_factor(KeyFactor::key_file(source));

    let mut concat = sha256(b"pw");
    concat.extend_from_slice(&sha256(&file_bytes));
    let seed = key.derive_seed().expect("seed");
    assert_eq!(seed.expose().as_slice(), sha256(&concat).as_slice());
}

#[test]
fn key_file_only_is_supported() {
    let mut key = KeyMaterial::new();
    key.add_factor(KeyFactor::key_file(SecretBuffer::new(&[0x10; 32])));
    let seed = key.derive_seed().expect("seed");
    assert_eq!(seed.expose().as_slice(), sha256(&[0x10; 32]).as_slice());
}

#[test]
fn xml_key_file_with_unknown_version_is_rejected() {
    let xml = b"<KeyFile><Meta><Version>9.0</Version></Meta><Key><Data>AAAA</Data></Key></KeyFile>";
    let mut key = KeyMaterial::new();
    key.add_factor(KeyFactor::key_file(SecretBuffer::new(xml)));
    let err = key.derive_seed().expect_err("bad version");
    assert!(matches!(err, KeyError::InvalidKeyFile(ref m) if m.contains("version")));
}

#[test]
fn source_is_read_on_every_derivation() {
    use std::cell::Cell;
    use std::rc::Rc;

    let calls = Rc::new(Cell::new(0u32));
    let counter = Rc::clone(&calls);
    let mut key = KeyMaterial::new();
    key.add_factor(KeyFactor::key_file(move || -> Result<SecretBuffer, KeyError> {
        counter.set(counter.get() + 1);
        Ok(SecretBuffer::new(b"file"))
    }));
    let a = key.derive_seed().expect("first");
    let b = key.derive_seed().expect("second");
    assert_eq!(a.expose(), b.expose());
    assert_eq!(calls.get(), 2);
}
