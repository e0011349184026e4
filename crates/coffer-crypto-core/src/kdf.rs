//! Key derivation: AES-KDF and Argon2 (d / id) as used by KDBX.
//!
//! This module provides:
//! - [`KdfParams`]: parameter set carried in the outer header
//! - [`KdfParams::transform`]: turn the composite seed into the transformed key
//! - [`KdfParams::to_dictionary`] / [`KdfParams::from_dictionary`]: KDBX 4
//!   variant dictionary encoding
//!
//! The cipher key and HMAC keys are derived from the transformed key by
//! [`crate::keys::KeySchedule`].

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;
use ring::digest;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::memory::{random_array, SecretBytes};
use crate::variant::{VariantDictionary, VariantValue};

/// AES-KDF identifier (`$UUID` in the dictionary).
pub const AES_KDF_UUID: Uuid = Uuid::from_u128(0xc9d9_f39a_628a_4460_bf74_0d08_c18a_4fea);

/// Argon2d identifier.
pub const ARGON2D_UUID: Uuid = Uuid::from_u128(0xef63_6ddf_8c29_444b_91f7_a9a4_03e3_0a0c);

/// Argon2id identifier.
pub const ARGON2ID_UUID: Uuid = Uuid::from_u128(0x9e29_8b19_56db_4773_b23d_fc3e_c6f0_a1e6);

/// Output length of every KDF in bytes (256 bits).
pub const OUTPUT_LEN: usize = 32;

/// Length of generated salts and AES-KDF seeds.
pub const SALT_LEN: usize = 32;

/// Argon2 version 1.3.
const ARGON2_VERSION_13: u32 = 0x13;

/// Argon2 version 1.0.
const ARGON2_VERSION_10: u32 = 0x10;

const KEY_UUID: &str = "$UUID";
const KEY_ROUNDS: &str = "R";
const KEY_SEED: &str = "S";
const KEY_PARALLELISM: &str = "P";
const KEY_MEMORY: &str = "M";
const KEY_ITERATIONS: &str = "I";
const KEY_VERSION: &str = "V";
const KEY_SECRET: &str = "K";
const KEY_ASSOCIATED: &str = "A";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Argon2 flavour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Argon2Variant {
    /// Data-dependent addressing (KeePass default).
    Argon2d,
    /// Hybrid addressing.
    Argon2id,
}

impl Argon2Variant {
    /// Header identifier of this flavour.
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        match self {
            Self::Argon2d => ARGON2D_UUID,
            Self::Argon2id => ARGON2ID_UUID,
        }
    }

    const fn algorithm(self) -> argon2::Algorithm {
        match self {
            Self::Argon2d => argon2::Algorithm::Argon2d,
            Self::Argon2id => argon2::Algorithm::Argon2id,
        }
    }
}

/// Argon2 parameters as stored in the header.
///
/// `memory` is in **bytes**, following the KDBX dictionary convention; the
/// `argon2` crate receives it in KiB.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Argon2Params {
    /// Flavour.
    pub variant: Argon2Variant,
    /// Salt (`S`).
    pub salt: Vec<u8>,
    /// Memory cost in bytes (`M`).
    pub memory: u64,
    /// Iterations (`I`).
    pub iterations: u64,
    /// Lanes (`P`).
    pub parallelism: u32,
    /// Algorithm version (`V`), 0x10 or 0x13.
    pub version: u32,
    /// Optional secret key (`K`).
    pub secret: Option<Vec<u8>>,
    /// Optional associated data (`A`).
    pub associated_data: Option<Vec<u8>>,
}

/// KDF parameter set carried in the outer header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KdfParams {
    /// AES-KDF: `rounds` AES-256-ECB encryptions keyed with `seed`.
    Aes {
        /// Transform rounds.
        rounds: u64,
        /// 32-byte transform seed.
        seed: [u8; SALT_LEN],
    },
    /// Argon2d / Argon2id.
    Argon2(Argon2Params),
}

impl KdfParams {
    /// Fresh AES-KDF parameters with a random seed.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SecureMemory`] if the CSPRNG fails.
    pub fn new_aes(rounds: u64) -> Result<Self, CryptoError> {
        Ok(Self::Aes {
            rounds,
            seed: random_array()?,
        })
    }

    /// Fresh Argon2 parameters (version 1.3) with a random salt.
    ///
    /// `memory_kib` is converted to the header's byte unit.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SecureMemory`] if the CSPRNG fails.
    pub fn new_argon2(
        variant: Argon2Variant,
        memory_kib: u32,
        iterations: u32,
        parallelism: u32,
    ) -> Result<Self, CryptoError> {
        let salt: [u8; SALT_LEN] = random_array()?;
        Ok(Self::Argon2(Argon2Params {
            variant,
            salt: salt.to_vec(),
            memory: u64::from(memory_kib).saturating_mul(1024),
            iterations: u64::from(iterations),
            parallelism,
            version: ARGON2_VERSION_13,
            secret: None,
            associated_data: None,
        }))
    }

    /// Header identifier of the algorithm.
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        match self {
            Self::Aes { .. } => AES_KDF_UUID,
            Self::Argon2(p) => p.variant.uuid(),
        }
    }

    /// Derive the 32-byte transformed key from the composite seed.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivation`] for parameters outside the
    /// range accepted by the primitive, or if derivation fails.
    pub fn transform(&self, seed: &[u8; OUTPUT_LEN]) -> Result<SecretBytes<OUTPUT_LEN>, CryptoError> {
        match self {
            Self::Aes { rounds, seed: key } => aes_kdf(seed, key, *rounds),
            Self::Argon2(params) => argon2_kdf(seed, params),
        }
    }

    /// Encode as a KDBX 4 variant dictionary.
    #[must_use]
    pub fn to_dictionary(&self) -> VariantDictionary {
        let mut dict = VariantDictionary::new();
        dict.insert(KEY_UUID, VariantValue::Bytes(self.uuid().as_bytes().to_vec()));
        match self {
            Self::Aes { rounds, seed } => {
                dict.insert(KEY_ROUNDS, VariantValue::U64(*rounds));
                dict.insert(KEY_SEED, VariantValue::Bytes(seed.to_vec()));
            }
            Self::Argon2(p) => {
                dict.insert(KEY_SEED, VariantValue::Bytes(p.salt.clone()));
                dict.insert(KEY_PARALLELISM, VariantValue::U32(p.parallelism));
                dict.insert(KEY_MEMORY, VariantValue::U64(p.memory));
                dict.insert(KEY_ITERATIONS, VariantValue::U64(p.iterations));
                dict.insert(KEY_VERSION, VariantValue::U32(p.version));
                if let Some(secret) = &p.secret {
                    dict.insert(KEY_SECRET, VariantValue::Bytes(secret.clone()));
                }
                if let Some(ad) = &p.associated_data {
                    dict.insert(KEY_ASSOCIATED, VariantValue::Bytes(ad.clone()));
                }
            }
        }
        dict
    }

    /// Decode from a KDBX 4 variant dictionary.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CorruptHeader`] for an unknown algorithm or
    /// missing / mistyped parameters.
    pub fn from_dictionary(dict: &VariantDictionary) -> Result<Self, CryptoError> {
        let id = Uuid::from_slice(dict.require_bytes(KEY_UUID)?)
            .map_err(|_| CryptoError::CorruptHeader("KDF $UUID is not 16 bytes".into()))?;

        if id == AES_KDF_UUID {
            let seed: [u8; SALT_LEN] = dict.require_bytes(KEY_SEED)?.try_into().map_err(|_| {
                CryptoError::CorruptHeader("AES-KDF seed must be 32 bytes".into())
            })?;
            return Ok(Self::Aes {
                rounds: dict.require_u64(KEY_ROUNDS)?,
                seed,
            });
        }

        let variant = if id == ARGON2D_UUID {
            Argon2Variant::Argon2d
        } else if id == ARGON2ID_UUID {
            Argon2Variant::Argon2id
        } else {
            return Err(CryptoError::CorruptHeader(format!("unknown KDF {id}")));
        };

        Ok(Self::Argon2(Argon2Params {
            variant,
            salt: dict.require_bytes(KEY_SEED)?.to_vec(),
            memory: dict.require_u64(KEY_MEMORY)?,
            iterations: dict.require_u64(KEY_ITERATIONS)?,
            parallelism: dict.require_u32(KEY_PARALLELISM)?,
            version: dict.require_u32(KEY_VERSION)?,
            secret: dict.optional_bytes(KEY_SECRET).map(<[u8]>::to_vec),
            associated_data: dict.optional_bytes(KEY_ASSOCIATED).map(<[u8]>::to_vec),
        }))
    }
}

// ---------------------------------------------------------------------------
// Core KDFs
// ---------------------------------------------------------------------------

/// AES-KDF: encrypt each 16-byte half of `seed` `rounds` times with
/// AES-256-ECB keyed by `key`, then SHA-256 the result.
fn aes_kdf(
    seed: &[u8; OUTPUT_LEN],
    key: &[u8; SALT_LEN],
    rounds: u64,
) -> Result<SecretBytes<OUTPUT_LEN>, CryptoError> {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let mut blocks = [
        GenericArray::clone_from_slice(&seed[..16]),
        GenericArray::clone_from_slice(&seed[16..]),
    ];
    for _ in 0..rounds {
        cipher.encrypt_blocks(&mut blocks);
    }

    let mut transformed = [0u8; OUTPUT_LEN];
    transformed[..16].copy_from_slice(&blocks[0]);
    transformed[16..].copy_from_slice(&blocks[1]);
    for block in &mut blocks {
        block.as_mut_slice().zeroize();
    }

    let hashed = digest::digest(&digest::SHA256, &transformed);
    transformed.zeroize();
    SecretBytes::from_slice(hashed.as_ref())
}

/// Argon2d / Argon2id over the composite seed.
fn argon2_kdf(
    seed: &[u8; OUTPUT_LEN],
    params: &Argon2Params,
) -> Result<SecretBytes<OUTPUT_LEN>, CryptoError> {
    let memory_kib = u32::try_from(params.memory / 1024).map_err(|_| {
        CryptoError::KeyDerivation(format!("argon2 memory too large: {} bytes", params.memory))
    })?;
    let iterations = u32::try_from(params.iterations).map_err(|_| {
        CryptoError::KeyDerivation(format!("argon2 iterations too large: {}", params.iterations))
    })?;
    let version = match params.version {
        ARGON2_VERSION_13 => argon2::Version::V0x13,
        ARGON2_VERSION_10 => argon2::Version::V0x10,
        other => {
            return Err(CryptoError::KeyDerivation(format!(
                "unsupported argon2 version {other:#x}"
            )))
        }
    };

    let mut builder = argon2::ParamsBuilder::new();
    builder
        .m_cost(memory_kib)
        .t_cost(iterations)
        .p_cost(params.parallelism)
        .output_len(OUTPUT_LEN);
    if let Some(ad) = &params.associated_data {
        let data = argon2::AssociatedData::new(ad)
            .map_err(|e| CryptoError::KeyDerivation(format!("invalid argon2 data: {e}")))?;
        builder.data(data);
    }
    let argon2_params = builder
        .build()
        .map_err(|e| CryptoError::KeyDerivation(format!("invalid argon2 params: {e}")))?;

    let argon2 = match &params.secret {
        Some(secret) => argon2::Argon2::new_with_secret(
            secret,
            params.variant.algorithm(),
            version,
            argon2_params,
        )
        .map_err(|e| CryptoError::KeyDerivation(format!("invalid argon2 secret: {e}")))?,
        None => argon2::Argon2::new(params.variant.algorithm(), version, argon2_params),
    };

    let mut output = [0u8; OUTPUT_LEN];
    argon2
        .hash_password_into(seed, &params.salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(format!("argon2 derivation failed: {e}")))?;
    Ok(SecretBytes::new(output))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
