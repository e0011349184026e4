//! Block stream framing of the container body.
//!
//! This module provides:
//! - The KDBX 3.x hashed block stream (`[index][sha256][size][data]`)
//! - The KDBX 4.x HMAC block stream (`[hmac][size][data]`)
//! - Per-block HMAC key derivation
//!
//! Both streams end with an empty block. Every failure is reported as
//! [`CryptoError::CorruptBody`].

use ring::{digest, hmac};

use crate::error::CryptoError;
use crate::memory::{constant_time_eq, SecretBytes};

/// Payload bytes per block written by this crate.
pub const BLOCK_SIZE: usize = 1024 * 1024;

/// SHA-256 / HMAC-SHA-256 output length.
const HASH_LEN: usize = 32;

/// Block index reserved for the header MAC.
pub const HEADER_BLOCK_INDEX: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// Cursor helpers
// ---------------------------------------------------------------------------

fn take<'a>(data: &'a [u8], pos: &mut usize, n: usize, what: &str) -> Result<&'a [u8], CryptoError> {
    let end = pos
        .checked_add(n)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| CryptoError::CorruptBody(format!("truncated {what}")))?;
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}

fn take_u32(data: &[u8], pos: &mut usize, what: &str) -> Result<u32, CryptoError> {
    let bytes = take(data, pos, 4, what)?;
    let mut arr = [0u8; 4];
    arr.copy_from_slice(bytes);
    Ok(u32::from_le_bytes(arr))
}

fn block_len(len: usize) -> Result<u32, CryptoError> {
    u32::try_from(len).map_err(|_| CryptoError::Encryption(format!("block of {len} bytes too large")))
}

// ---------------------------------------------------------------------------
// Hashed block stream (KDBX 3.x)
// ---------------------------------------------------------------------------

/// Frame `data` into a hashed block stream.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the block count overflows `u32`.
pub fn write_hashed_blocks(data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut out = Vec::with_capacity(data.len().saturating_add(80));
    let mut index: u32 = 0;
    for chunk in data.chunks(BLOCK_SIZE) {
        out.extend_from_slice(&index.to_le_bytes());
        out.extend_from_slice(digest::digest(&digest::SHA256, chunk).as_ref());
        out.extend_from_slice(&block_len(chunk.len())?.to_le_bytes());
        out.extend_from_slice(chunk);
        index = index
            .checked_add(1)
            .ok_or_else(|| CryptoError::Encryption("block index overflow".into()))?;
    }
    out.extend_from_slice(&index.to_le_bytes());
    out.extend_from_slice(&[0u8; HASH_LEN]);
    out.extend_from_slice(&0u32.to_le_bytes());
    Ok(out)
}

/// Verify and unframe a hashed block stream.
///
/// # Errors
///
/// Returns [`CryptoError::CorruptBody`] on an out-of-order index, a hash
/// mismatch, a non-zero terminator hash, or truncation.
pub fn read_hashed_blocks(data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut out = Vec::with_capacity(data.len());
    let mut pos = 0usize;
    let mut expected: u32 = 0;
    loop {
        let index = take_u32(data, &mut pos, "block index")?;
        if index != expected {
            return Err(CryptoError::CorruptBody(format!(
                "block index {index}, expected {expected}"
            )));
        }
        let hash = take(data, &mut pos, HASH_LEN, "block hash")?;
        let size = usize::try_from(take_u32(data, &mut pos, "block size")?)
            .map_err(|_| CryptoError::CorruptBody("block size exceeds address space".into()))?;
        if size == 0 {
            if hash.iter().any(|&b| b != 0) {
                return Err(CryptoError::CorruptBody("non-zero terminator hash".into()));
            }
            break;
        }
        let block = take(data, &mut pos, size, "block data")?;
        if !constant_time_eq(digest::digest(&digest::SHA256, block).as_ref(), hash) {
            return Err(CryptoError::CorruptBody(format!("hash mismatch in block {index}")));
        }
        out.extend_from_slice(block);
        expected = expected
            .checked_add(1)
            .ok_or_else(|| CryptoError::CorruptBody("block index overflow".into()))?;
    }
    tracing::debug!(blocks = expected, bytes = out.len(), "hashed block stream verified");
    Ok(out)
}

// ---------------------------------------------------------------------------
// HMAC block stream (KDBX 4.x)
// ---------------------------------------------------------------------------

/// Derive the HMAC key of block `index` from the 64-byte base key.
#[must_use]
pub fn block_hmac_key(base: &SecretBytes<64>, index: u64) -> SecretBytes<64> {
    let mut ctx = digest::Context::new(&digest::SHA512);
    ctx.update(&index.to_le_bytes());
    ctx.update(base.expose());
    let mut key = [0u8; 64];
    key.copy_from_slice(ctx.finish().as_ref());
    SecretBytes::new(key)
}

/// HMAC-SHA-256 of the header bytes under the header block key.
#[must_use]
pub fn header_hmac(base: &SecretBytes<64>, header: &[u8]) -> [u8; HASH_LEN] {
    let key = block_hmac_key(base, HEADER_BLOCK_INDEX);
    let tag = hmac::sign(&hmac::Key::new(hmac::HMAC_SHA256, key.expose()), header);
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(tag.as_ref());
    out
}

fn block_hmac(base: &SecretBytes<64>, index: u64, size: i32, data: &[u8]) -> hmac::Tag {
    let key = block_hmac_key(base, index);
    let mut ctx = hmac::Context::with_key(&hmac::Key::new(hmac::HMAC_SHA256, key.expose()));
    ctx.update(&index.to_le_bytes());
    ctx.update(&size.to_le_bytes());
    ctx.update(data);
    ctx.sign()
}

/// Frame `data` into an HMAC block stream.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if a block length does not fit `i32`
/// or the block count overflows.
pub fn write_hmac_blocks(base: &SecretBytes<64>, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut out = Vec::with_capacity(data.len().saturating_add(72));
    let mut index: u64 = 0;
    for chunk in data.chunks(BLOCK_SIZE) {
        let size = i32::try_from(chunk.len())
            .map_err(|_| CryptoError::Encryption("block length exceeds i32".into()))?;
        out.extend_from_slice(block_hmac(base, index, size, chunk).as_ref());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(chunk);
        index = index
            .checked_add(1)
            .ok_or_else(|| CryptoError::Encryption("block index overflow".into()))?;
    }
    out.extend_from_slice(block_hmac(base, index, 0, &[]).as_ref());
    out.extend_from_slice(&0i32.to_le_bytes());
    Ok(out)
}

/// Verify and unframe an HMAC block stream.
///
/// # Errors
///
/// Returns [`CryptoError::CorruptBody`] on a MAC mismatch, a negative
/// size, or truncation.
pub fn read_hmac_blocks(base: &SecretBytes<64>, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut out = Vec::with_capacity(data.len());
    let mut pos = 0usize;
    let mut index: u64 = 0;
    loop {
        let tag = take(data, &mut pos, HASH_LEN, "block mac")?;
        let raw_size = take_u32(data, &mut pos, "block size")?;
        let size = i32::from_le_bytes(raw_size.to_le_bytes());
        let len = usize::try_from(size)
            .map_err(|_| CryptoError::CorruptBody(format!("negative size in block {index}")))?;
        let block = take(data, &mut pos, len, "block data")?;
        let expected = block_hmac(base, index, size, block);
        if !constant_time_eq(expected.as_ref(), tag) {
            return Err(CryptoError::CorruptBody(format!("mac mismatch in block {index}")));
        }
        if len == 0 {
            break;
        }
        out.extend_from_slice(block);
        index = index
            .checked_add(1)
            .ok_or_else(|| CryptoError::CorruptBody("block index overflow".into()))?;
    }
    tracing::debug!(blocks = index, bytes = out.len(), "hmac block stream verified");
    Ok(out)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> SecretBytes<64> {
        SecretBytes::new([0x42; 64])
    }

    #[test]
    fn hashed_stream_roundtrip_multi_block() {
        let data: Vec<u8> = (0..BLOCK_SIZE + 17).map(|i| (i % 251) as u8).collect();
        let framed = write_hashed_blocks(&data).expect("frame");
        assert_eq!(read_hashed_blocks(&framed).expect("unframe"), data);
    }

    #[test]
    fn hashed_stream_empty_payload() {
        let framed = write_hashed_blocks(&[]).expect("frame");
        assert_eq!(framed.len(), 40);
        assert!(read_hashed_blocks(&framed).expect("unframe").is_empty());
    }

    #[test]
    fn hashed_stream_detects_flipped_byte() {
        let mut framed = write_hashed_blocks(b"some payload bytes").expect("frame");
        framed[41] ^= 0x01;
        let err = read_hashed_blocks(&framed).expect_err("tampered");
        assert!(matches!(err, CryptoError::CorruptBody(ref m) if m.contains("hash mismatch")));
    }

    #[test]
    fn hashed_stream_detects_truncation() {
        let framed = write_hashed_blocks(b"some payload bytes").expect("frame");
        let err = read_hashed_blocks(&framed[..framed.len() - 10]).expect_err("truncated");
        assert!(matches!(err, CryptoError::CorruptBody(_)));
    }

    #[test]
    fn hmac_stream_roundtrip() {
        let data = vec![7u8; 3000];
        let framed = write_hmac_blocks(&base(), &data).expect("frame");
        assert_eq!(read_hmac_blocks(&base(), &framed).expect("unframe"), data);
    }

    #[test]
    fn hmac_stream_rejects_other_key() {
        let framed = write_hmac_blocks(&base(), b"data").expect("frame");
        let other = SecretBytes::new([0x43; 64]);
        let err = read_hmac_blocks(&other, &framed).expect_err("wrong key");
        assert!(matches!(err, CryptoError::CorruptBody(ref m) if m.contains("mac mismatch")));
    }

    #[test]
    fn hmac_stream_rejects_dropped_terminator() {
        let framed = write_hmac_blocks(&base(), b"data").expect("frame");
        let err = read_hmac_blocks(&base(), &framed[..framed.len() - 36]).expect_err("truncated");
        assert!(matches!(err, CryptoError::CorruptBody(ref m) if m.contains("truncated")));
    }

    #[test]
    fn block_keys_differ_per_index() {
        let k0 = block_hmac_key(&base(), 0);
        let k1 = block_hmac_key(&base(), 1);
        let kh = block_hmac_key(&base(), HEADER_BLOCK_INDEX);
        assert_ne!(k0.expose(), k1.expose());
        assert_ne!(k0.expose(), kh.expose());
    }
}
