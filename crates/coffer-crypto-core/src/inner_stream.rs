//! Inner random stream: masks protected field values inside the payload.
//!
//! One keystream runs across the whole document: every protected value is
//! XOR-ed with the next bytes of the stream, in document order, on both
//! read and write.
//!
//! - id 2, Salsa20: key = SHA-256(stream key), fixed 8-byte nonce
//! - id 3, ChaCha20: SHA-512(stream key) → key (32 B) ‖ nonce (12 B)

use chacha20::ChaCha20;
use ring::digest;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa20;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::memory::SecretBuffer;

/// Fixed Salsa20 nonce mandated by the format.
const SALSA20_NONCE: [u8; 8] = [0xE8, 0x30, 0x09, 0x4B, 0x97, 0x20, 0x5D, 0x2A];

/// Length of freshly generated ChaCha20 stream keys.
pub const CHACHA20_STREAM_KEY_LEN: usize = 64;

/// Inner stream algorithm identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InnerStreamAlgorithm {
    /// No masking (id 0). Only tolerated on read.
    None,
    /// Salsa20 (id 2), KDBX 3.x default.
    Salsa20,
    /// ChaCha20 (id 3), KDBX 4.x default.
    ChaCha20,
}

impl InnerStreamAlgorithm {
    /// Numeric identifier stored in the header.
    #[must_use]
    pub const fn id(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Salsa20 => 2,
            Self::ChaCha20 => 3,
        }
    }

    /// Map the numeric identifier.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CorruptHeader`] for unsupported ids (the
    /// obsolete ArcFour variant included).
    pub fn from_id(id: u32) -> Result<Self, CryptoError> {
        match id {
            0 => Ok(Self::None),
            2 => Ok(Self::Salsa20),
            3 => Ok(Self::ChaCha20),
            other => Err(CryptoError::CorruptHeader(format!(
                "unsupported inner random stream {other}"
            ))),
        }
    }
}

/// Algorithm and key of the inner stream, as read from or written to a header.
#[derive(Clone, Debug)]
pub struct InnerStreamSpec {
    /// Algorithm.
    pub algorithm: InnerStreamAlgorithm,
    /// Raw stream key from the header.
    pub key: SecretBuffer,
}

impl InnerStreamSpec {
    /// Fresh ChaCha20 spec with a random 64-byte key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SecureMemory`] if the CSPRNG fails.
    pub fn generate_chacha20() -> Result<Self, CryptoError> {
        Ok(Self {
            algorithm: InnerStreamAlgorithm::ChaCha20,
            key: SecretBuffer::random(CHACHA20_STREAM_KEY_LEN)?,
        })
    }

    /// Fresh Salsa20 spec with a random 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SecureMemory`] if the CSPRNG fails.
    pub fn generate_salsa20() -> Result<Self, CryptoError> {
        Ok(Self {
            algorithm: InnerStreamAlgorithm::Salsa20,
            key: SecretBuffer::random(32)?,
        })
    }

    /// Start the keystream at offset zero.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if the derived key or
    /// nonce cannot initialise the cipher.
    pub fn start(&self) -> Result<InnerStream, CryptoError> {
        InnerStream::new(self.algorithm, self.key.expose())
    }
}

enum StreamState {
    Plain,
    Salsa20(Box<Salsa20>),
    ChaCha20(Box<ChaCha20>),
}

/// A running inner keystream.
pub struct InnerStream {
    state: StreamState,
}

impl InnerStream {
    /// Initialise the stream from the raw header key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if cipher setup fails.
    pub fn new(algorithm: InnerStreamAlgorithm, key: &[u8]) -> Result<Self, CryptoError> {
        let state = match algorithm {
            InnerStreamAlgorithm::None => StreamState::Plain,
            InnerStreamAlgorithm::Salsa20 => {
                let hashed = digest::digest(&digest::SHA256, key);
                let cipher = Salsa20::new_from_slices(hashed.as_ref(), &SALSA20_NONCE)
                    .map_err(|_| CryptoError::InvalidKeyMaterial("salsa20 setup failed".into()))?;
                StreamState::Salsa20(Box::new(cipher))
            }
            InnerStreamAlgorithm::ChaCha20 => {
                let hashed = digest::digest(&digest::SHA512, key);
                let material = hashed.as_ref();
                let cipher = ChaCha20::new_from_slices(&material[..32], &material[32..44])
                    .map_err(|_| CryptoError::InvalidKeyMaterial("chacha20 setup failed".into()))?;
                StreamState::ChaCha20(Box::new(cipher))
            }
        };
        Ok(Self { state })
    }

    /// XOR the next `data.len()` keystream bytes into `data`.
    ///
    /// Masking and unmasking are the same operation.
    pub fn apply(&mut self, data: &mut [u8]) {
        match &mut self.state {
            StreamState::Plain => {}
            StreamState::Salsa20(cipher) => cipher.apply_keystream(data),
            StreamState::ChaCha20(cipher) => cipher.apply_keystream(data),
        }
    }
}

impl std::fmt::Debug for InnerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("InnerStream(***)")
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_is_continuous_across_values() {
        let key = [0x5A; 32];
        let mut whole = vec![0u8; 24];
        InnerStream::new(InnerStreamAlgorithm::ChaCha20, &key)
            .expect("stream")
            .apply(&mut whole);

        let mut stream = InnerStream::new(InnerStreamAlgorithm::ChaCha20, &key).expect("stream");
        let mut first = vec![0u8; 10];
        let mut second = vec![0u8; 14];
        stream.apply(&mut first);
        stream.apply(&mut second);
        first.extend_from_slice(&second);
        assert_eq!(first, whole);
    }

    #[test]
    fn masking_twice_restores_plaintext() {
        for algorithm in [InnerStreamAlgorithm::Salsa20, InnerStreamAlgorithm::ChaCha20] {
            let key = [0x01; 64];
            let mut data = b"correct horse battery staple".to_vec();
            InnerStream::new(algorithm, &key).expect("stream").apply(&mut data);
            assert_ne!(data.as_slice(), b"correct horse battery staple");
            InnerStream::new(algorithm, &key).expect("stream").apply(&mut data);
            assert_eq!(data.as_slice(), b"correct horse battery staple");
        }
    }

    #[test]
    fn algorithms_produce_different_keystreams() {
        let key = [0x07; 32];
        let mut a = vec![0u8; 16];
        let mut b = vec![0u8; 16];
        InnerStream::new(InnerStreamAlgorithm::Salsa20, &key).expect("salsa").apply(&mut a);
        InnerStream::new(InnerStreamAlgorithm::ChaCha20, &key).expect("chacha").apply(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn ids_map_both_ways() {
        for algorithm in [
            InnerStreamAlgorithm::None,
            InnerStreamAlgorithm::Salsa20,
            InnerStreamAlgorithm::ChaCha20,
        ] {
            assert_eq!(InnerStreamAlgorithm::from_id(algorithm.id()).expect("known"), algorithm);
        }
        assert!(InnerStreamAlgorithm::from_id(1).is_err());
    }
}
