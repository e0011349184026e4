//! Cryptographic error types for `coffer-crypto-core`.

use thiserror::Error;

/// Errors produced while assembling key material from its factors.
#[derive(Debug, Error)]
pub enum KeyError {
    /// `derive_seed` was called before any factor was added.
    #[error("no key factors supplied")]
    NoFactors,

    /// The caller-supplied source could not produce the key file bytes.
    #[error("key factor unavailable: {0}")]
    Unavailable(String),

    /// An XML key file failed its structural or hash check.
    #[error("invalid key file: {0}")]
    InvalidKeyFile(String),
}

/// Errors produced by container cryptography and framing.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key material could not be assembled.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Outer header is unreadable: bad signature, unsupported version,
    /// missing or malformed field, or checksum mismatch.
    #[error("corrupt header: {0}")]
    CorruptHeader(String),

    /// Verification marker mismatch: the composite key is wrong.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Encrypted body failed a block integrity check or is truncated.
    #[error("corrupt body: {0}")]
    CorruptBody(String),

    /// Gzip stream could not be inflated or deflated.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// Key derivation failed (parameter validation, memory allocation).
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Cipher setup or encryption failure, or a size limit of the framing.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Invalid key material (wrong length, corrupted bytes).
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Secure memory allocation or CSPRNG failure.
    #[error("secure memory error: {0}")]
    SecureMemory(String),
}
