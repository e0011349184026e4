//! Zeroizing containers for key material and decrypted payloads.
//!
//! - [`SecretBuffer`]: variable length, backed by [`secrecy::SecretSlice`]
//! - [`SecretBytes`]: fixed length, zeroized on drop
//!
//! Both mask their `Debug` output.

use crate::error::CryptoError;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretSlice};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ---------------------------------------------------------------------------
// SecretBuffer: variable-length
// ---------------------------------------------------------------------------

/// Variable-length buffer for sensitive data, zeroized on drop.
pub struct SecretBuffer {
    inner: SecretSlice<u8>,
}

impl SecretBuffer {
    /// Copy `data` into a new secret allocation.
    ///
    /// The caller should zeroize the source afterwards.
    #[must_use]
    pub fn new(data: &[u8]) -> Self {
        Self {
            inner: data.to_vec().into(),
        }
    }

    /// Take ownership of `data` without copying.
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { inner: data.into() }
    }

    /// Create a buffer filled with `len` CSPRNG bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SecureMemory`] if the CSPRNG fails.
    pub fn random(len: usize) -> Result<Self, CryptoError> {
        let mut bytes = vec![0u8; len];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::SecureMemory(format!("CSPRNG fill failed: {e}")))?;
        Ok(Self::from_vec(bytes))
    }

    /// Expose the underlying bytes for a cryptographic operation.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        self.inner.expose_secret()
    }

    /// Number of bytes held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.expose().len()
    }

    /// Returns `true` if the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Clone for SecretBuffer {
    fn clone(&self) -> Self {
        Self::new(self.expose())
    }
}

impl fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBuffer(***)")
    }
}

// ---------------------------------------------------------------------------
// SecretBytes<N>: fixed-size
// ---------------------------------------------------------------------------

/// Fixed-size secret (keys, seeds) erased when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> SecretBytes<N> {
    /// Wrap a fixed-size array.
    #[must_use]
    pub const fn new(bytes: [u8; N]) -> Self {
        Self { bytes }
    }

    /// Copy a slice of exactly `N` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] on a length mismatch.
    pub fn from_slice(data: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; N] = data.try_into().map_err(|_| {
            CryptoError::InvalidKeyMaterial(format!(
                "expected {N} bytes, got {}",
                data.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Create `SecretBytes` filled with CSPRNG bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SecureMemory`] if the CSPRNG fails.
    pub fn random() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; N];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::SecureMemory(format!("CSPRNG fill failed: {e}")))?;
        Ok(Self::new(bytes))
    }

    /// Expose the underlying bytes for cryptographic operations.
    #[must_use]
    pub const fn expose(&self) -> &[u8; N] {
        &self.bytes
    }
}

impl<const N: usize> fmt::Debug for SecretBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes<{N}>(***)")
    }
}

impl<const N: usize> From<[u8; N]> for SecretBytes<N> {
    fn from(data: [u8; N]) -> Self {
        Self::new(data)
    }
}

/// Constant-time equality for verification markers and MACs.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Fill a fresh array with CSPRNG bytes (salts and IVs, not secret).
///
/// # Errors
///
/// Returns [`CryptoError::SecureMemory`] if the CSPRNG fails.
pub fn random_array<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut bytes = [0u8; N];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CryptoError::SecureMemory(format!("CSPRNG fill failed: {e}")))?;
    Ok(bytes)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
