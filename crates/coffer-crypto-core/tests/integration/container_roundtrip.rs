//! Integration tests for the container open/seal cycle.
//!
//! Cross-module composition: key material + KDF + outer cipher + block
//! framing + inner header.

use coffer_crypto_core::kdf::{Argon2Variant, KdfParams};
use coffer_crypto_core::{
    open, read_header, Compression, ContainerBinary, CryptoError, FormatVersion, InnerStreamAlgorithm,
    KeyError, KeyFactor, KeyMaterial, OuterCipher, SealSettings, Sealer, SecretBuffer,
    VariantDictionary, VariantValue,
};

const PAYLOAD: &[u8] = b"<?xml version=\"1.0\" encoding=\"utf-8\" standalone=\"yes\"?>\n<KeePassFile><Meta/><Root/></KeePassFile>";

fn cheap_kdfs() -> Vec<KdfParams> {
    vec![
        KdfParams::new_aes(10).expect("aes kdf"),
        KdfParams::new_argon2(Argon2Variant::Argon2d, 32, 1, 1).expect("argon2d"),
        KdfParams::new_argon2(Argon2Variant::Argon2id, 32, 1, 2).expect("argon2id"),
    ]
}

fn seal_v4(key: &KeyMaterial, cipher: OuterCipher, kdf: KdfParams, compression: Compression) -> Vec<u8> {
    let settings = SealSettings { cipher, kdf, compression, public_custom_data: None };
    Sealer::new(FormatVersion::V4_0, settings)
        .expect("sealer should build")
        .seal(key, PAYLOAD, &[])
        .expect("seal should succeed")
}

#[test]
fn v4_roundtrip_every_cipher_kdf_and_compression() {
    let key = KeyMaterial::from_password("correct horse battery staple");
    for cipher in [OuterCipher::Aes256, OuterCipher::ChaCha20] {
        for kdf in cheap_kdfs() {
            for compression in [Compression::None, Compression::Gzip] {
                let bytes = seal_v4(&key, cipher, kdf.clone(), compression);
                let opened = open(&bytes, &key).expect("open should succeed");
                assert_eq!(opened.payload.expose(), PAYLOAD);
                assert_eq!(opened.header.cipher, cipher);
                assert_eq!(opened.header.kdf, kdf);
                assert_eq!(opened.header.compression, compression);
                assert_eq!(opened.inner_stream.algorithm, InnerStreamAlgorithm::ChaCha20);
            }
        }
    }
}

#[test]
fn public_custom_data_survives() {
    let key = KeyMaterial::from_password("pw");
    let mut custom = VariantDictionary::new();
    custom.insert("plugin.flag", VariantValue::Bool(true));
    custom.insert("plugin.name", VariantValue::String("sync".into()));
    let settings = SealSettings {
        cipher: OuterCipher::ChaCha20,
        kdf: KdfParams::new_aes(10).expect("kdf"),
        compression: Compression::Gzip,
        public_custom_data: Some(custom.clone()),
    };
    let bytes = Sealer::new(FormatVersion::V4_0, settings)
        .expect("sealer")
        .seal(&key, PAYLOAD, &[])
        .expect("seal");
    let header = read_header(&bytes).expect("header");
    assert_eq!(header.public_custom_data, Some(custom));
}

#[test]
fn large_attachment_spans_several_blocks() {
    let key = KeyMaterial::from_password("pw");
    let big: Vec<u8> = (0..3 * 1024 * 1024 + 5).map(|i| (i * 7 % 256) as u8).collect();
    let binaries = vec![
        ContainerBinary { protected: false, data: big },
        ContainerBinary { protected: true, data: b"tiny".to_vec() },
    ];
    let settings = SealSettings {
        cipher: OuterCipher::Aes256,
        kdf: KdfParams::new_aes(10).expect("kdf"),
        compression: Compression::None,
        public_custom_data: None,
    };
    let bytes = Sealer::new(FormatVersion::V4_0, settings)
        .expect("sealer")
        .seal(&key, PAYLOAD, &binaries)
        .expect("seal");
    let opened = open(&bytes, &key).expect("open");
    assert_eq!(opened.binaries, binaries);
}

#[test]
fn wrong_password_is_invalid_credentials() {
    let bytes = seal_v4(
        &KeyMaterial::from_password("alpha"),
        OuterCipher::ChaCha20,
        KdfParams::new_aes(10).expect("kdf"),
        Compression::Gzip,
    );
    let err = open(&bytes, &KeyMaterial::from_password("beta")).expect_err("wrong key");
    assert!(matches!(err, CryptoError::InvalidCredentials));
}

#[test]
fn missing_key_file_factor_is_invalid_credentials() {
    let file = SecretBuffer::new(&[0x33; 32]);
    let mut full = KeyMaterial::new();
    full.add_factor(KeyFactor::password("pw"))
        .add_factor(KeyFactor::key_file(file));
    let bytes = seal_v4(&full, OuterCipher::Aes256, KdfParams::new_aes(10).expect("kdf"), Compression::None);

    let err = open(&bytes, &KeyMaterial::from_password("pw")).expect_err("password only");
    assert!(matches!(err, CryptoError::InvalidCredentials));
}

#[test]
fn empty_key_material_is_key_error() {
    let bytes = seal_v4(
        &KeyMaterial::from_password("pw"),
        OuterCipher::Aes256,
        KdfParams::new_aes(10).expect("kdf"),
        Compression::None,
    );
    let err = open(&bytes, &KeyMaterial::new()).expect_err("no factors");
    assert!(matches!(err, CryptoError::Key(KeyError::NoFactors)));
}

#[test]
fn v3_container_roundtrip_with_salsa20_stream() {
    let key = KeyMaterial::from_password("legacy");
    let settings = SealSettings {
        cipher: OuterCipher::Aes256,
        kdf: KdfParams::new_aes(10).expect("kdf"),
        compression: Compression::Gzip,
        public_custom_data: None,
    };
    let sealer = Sealer::new(FormatVersion::V3_1, settings).expect("sealer");
    let bytes = sealer.seal(&key, PAYLOAD, &[]).expect("seal");
    let opened = open(&bytes, &key).expect("open");
    assert_eq!(opened.header.version, FormatVersion::V3_1);
    assert_eq!(opened.inner_stream.algorithm, InnerStreamAlgorithm::Salsa20);
    assert_eq!(opened.header_hash, sealer.header_hash());
    assert_eq!(opened.payload.expose(), PAYLOAD);
}

#[test]
fn truncated_file_fails_cleanly() {
    let key = KeyMaterial::from_password("pw");
    let bytes = seal_v4(&key, OuterCipher::ChaCha20, KdfParams::new_aes(10).expect("kdf"), Compression::Gzip);
    for cut in [0, 4, 11, 40, bytes.len() / 2, bytes.len() - 1] {
        assert!(open(&bytes[..cut], &key).is_err(), "cut at {cut} should fail");
    }
}

#[test]
fn not_a_container() {
    let err = open(b"PK\x03\x04 zip file", &KeyMaterial::from_password("pw")).expect_err("zip");
    assert!(matches!(err, CryptoError::CorruptHeader(_)));
}
