//! Outer body ciphers: AES-256-CBC (PKCS#7) and ChaCha20.
//!
//! The body is encrypted as one stream; integrity comes from the block
//! stream framing (see [`crate::blocks`]), not from the cipher.

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use chacha20::cipher::StreamCipher;
use chacha20::ChaCha20;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CryptoError;
use crate::memory::{random_array, SecretBuffer};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES-256-CBC header identifier.
pub const AES256_UUID: Uuid = Uuid::from_u128(0x31c1_f2e6_bf71_4350_be58_0521_6afc_5aff);

/// ChaCha20 header identifier.
pub const CHACHA20_UUID: Uuid = Uuid::from_u128(0xd603_8a2b_8b6f_4cb5_a524_339a_31db_b59a);

/// Cipher key length in bytes (both ciphers).
pub const KEY_LEN: usize = 32;

/// AES block / IV length.
const AES_IV_LEN: usize = 16;

/// ChaCha20 (RFC 8439) nonce length.
const CHACHA20_NONCE_LEN: usize = 12;

/// Outer cipher selector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OuterCipher {
    /// AES-256 in CBC mode with PKCS#7 padding.
    #[default]
    Aes256,
    /// ChaCha20 stream cipher.
    ChaCha20,
}

impl OuterCipher {
    /// Header identifier.
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        match self {
            Self::Aes256 => AES256_UUID,
            Self::ChaCha20 => CHACHA20_UUID,
        }
    }

    /// Map a header identifier back to a cipher.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CorruptHeader`] for an unsupported cipher.
    pub fn from_uuid(id: Uuid) -> Result<Self, CryptoError> {
        if id == AES256_UUID {
            Ok(Self::Aes256)
        } else if id == CHACHA20_UUID {
            Ok(Self::ChaCha20)
        } else {
            Err(CryptoError::CorruptHeader(format!("unsupported cipher {id}")))
        }
    }

    /// IV / nonce length in bytes.
    #[must_use]
    pub const fn iv_len(self) -> usize {
        match self {
            Self::Aes256 => AES_IV_LEN,
            Self::ChaCha20 => CHACHA20_NONCE_LEN,
        }
    }

    /// Generate a fresh random IV of the right length.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SecureMemory`] if the CSPRNG fails.
    pub fn generate_iv(self) -> Result<Vec<u8>, CryptoError> {
        Ok(match self {
            Self::Aes256 => random_array::<AES_IV_LEN>()?.to_vec(),
            Self::ChaCha20 => random_array::<CHACHA20_NONCE_LEN>()?.to_vec(),
        })
    }

    /// Encrypt the whole body.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encryption`] if the key or IV length is wrong.
    pub fn encrypt(self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::Aes256 => {
                let cipher = Aes256CbcEnc::new_from_slices(key, iv)
                    .map_err(|_| CryptoError::Encryption("invalid AES-256-CBC key or IV".into()))?;
                Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
            }
            Self::ChaCha20 => {
                let mut cipher = ChaCha20::new_from_slices(key, iv)
                    .map_err(|_| CryptoError::Encryption("invalid ChaCha20 key or nonce".into()))?;
                let mut out = plaintext.to_vec();
                cipher.apply_keystream(&mut out);
                Ok(out)
            }
        }
    }

    /// Decrypt the whole body into a zeroizing buffer.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encryption`] if the key or IV length is wrong.
    /// Returns [`CryptoError::InvalidCredentials`] when AES padding is
    /// invalid, which in practice means the key was wrong.
    pub fn decrypt(self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<SecretBuffer, CryptoError> {
        match self {
            Self::Aes256 => {
                let cipher = Aes256CbcDec::new_from_slices(key, iv)
                    .map_err(|_| CryptoError::Encryption("invalid AES-256-CBC key or IV".into()))?;
                let plain = cipher
                    .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                    .map_err(|_| CryptoError::InvalidCredentials)?;
                Ok(SecretBuffer::from_vec(plain))
            }
            Self::ChaCha20 => {
                let mut cipher = ChaCha20::new_from_slices(key, iv)
                    .map_err(|_| CryptoError::Encryption("invalid ChaCha20 key or nonce".into()))?;
                let mut out = ciphertext.to_vec();
                cipher.apply_keystream(&mut out);
                Ok(SecretBuffer::from_vec(out))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
