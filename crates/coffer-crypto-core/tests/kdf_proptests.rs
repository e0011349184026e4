#![allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]

//! Property-based tests for the AES-KDF and Argon2 key transforms.

use coffer_crypto_core::kdf::{Argon2Variant, KdfParams};
use proptest::prelude::*;

fn cheap_kdf() -> impl Strategy<Value = KdfParams> {
    prop_oneof![
        (1u64..20).prop_map(|rounds| KdfParams::new_aes(rounds).unwrap()),
        Just(KdfParams::new_argon2(Argon2Variant::Argon2d, 32, 1, 1).unwrap()),
        Just(KdfParams::new_argon2(Argon2Variant::Argon2id, 32, 1, 1).unwrap()),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// The transform is a function of its inputs.
    #[test]
    fn transform_is_deterministic(seed in proptest::array::uniform32(0u8..), kdf in cheap_kdf()) {
        let a = kdf.transform(&seed).expect("transform should succeed");
        let b = kdf.transform(&seed).expect("transform should succeed");
        prop_assert_eq!(a.expose(), b.expose());
    }

    /// Different key seeds give different transformed keys.
    #[test]
    fn different_seeds_different_keys(
        a in proptest::array::uniform32(0u8..),
        b in proptest::array::uniform32(0u8..),
        kdf in cheap_kdf(),
    ) {
        prop_assume!(a != b);
        let ka = kdf.transform(&a).expect("transform should succeed");
        let kb = kdf.transform(&b).expect("transform should succeed");
        prop_assert_ne!(ka.expose(), kb.expose());
    }

    /// Header dictionary encoding recovers the parameters.
    #[test]
    fn dictionary_roundtrip(kdf in cheap_kdf()) {
        let back = KdfParams::from_dictionary(&kdf.to_dictionary()).expect("dictionary should parse");
        prop_assert_eq!(back, kdf);
    }
}

/// Fresh parameters never share a salt.
#[test]
fn fresh_params_have_fresh_salts() {
    let a = KdfParams::new_argon2(Argon2Variant::Argon2id, 32, 1, 1).expect("params");
    let b = KdfParams::new_argon2(Argon2Variant::Argon2id, 32, 1, 1).expect("params");
    assert_ne!(a, b);
}
