#![allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]

//! Property-based tests for block stream framing and inner streams.

use coffer_crypto_core::blocks::{read_hashed_blocks, read_hmac_blocks, write_hashed_blocks, write_hmac_blocks};
use coffer_crypto_core::{InnerStream, InnerStreamAlgorithm, SecretBytes};
use proptest::prelude::*;

proptest! {
    /// Hashed framing recovers any payload.
    #[test]
    fn hashed_blocks_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..8192)) {
        let framed = write_hashed_blocks(&data).expect("frame should succeed");
        prop_assert_eq!(read_hashed_blocks(&framed).expect("unframe should succeed"), data);
    }

    /// Any single flipped bit in an HMAC framed stream is detected.
    #[test]
    fn hmac_blocks_detect_any_bit_flip(
        data in proptest::collection::vec(any::<u8>(), 1..2048),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let base = SecretBytes::new([0x5E; 64]);
        let mut framed = write_hmac_blocks(&base, &data).expect("frame should succeed");
        let idx = position.index(framed.len());
        framed[idx] ^= 1 << bit;
        prop_assert!(read_hmac_blocks(&base, &framed).is_err());
    }

    /// Splitting values arbitrarily does not change the keystream.
    #[test]
    fn inner_stream_is_position_based(
        values in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 1..10),
    ) {
        let key = [0x21u8; 64];
        let joined: Vec<u8> = values.concat();
        let mut whole = joined.clone();
        InnerStream::new(InnerStreamAlgorithm::Salsa20, &key).expect("stream").apply(&mut whole);

        let mut stream = InnerStream::new(InnerStreamAlgorithm::Salsa20, &key).expect("stream");
        let mut pieces = Vec::new();
        for mut value in values {
            stream.apply(&mut value);
            pieces.extend_from_slice(&value);
        }
        prop_assert_eq!(pieces, whole);
    }
}
