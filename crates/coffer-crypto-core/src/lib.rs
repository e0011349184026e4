//! `coffer-crypto-core`: KDBX container cryptography for COFFER.
//!
//! Key material, key derivation, outer ciphers, inner random streams,
//! block stream framing and the outer/inner container headers. No XML
//! document handling and no tree model; those live in `coffer-vault`.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod error;
pub mod memory;

pub mod keys;

pub mod kdf;
pub mod symmetric;
pub mod variant;

pub mod inner_stream;

pub mod blocks;
pub mod header;

pub mod container;

pub use container::{open, read_header, OpenedContainer, SealSettings, Sealer};
pub use error::{CryptoError, KeyError};
pub use header::{Compression, ContainerBinary, FormatVersion, InnerHeader, OuterHeader};
pub use inner_stream::{InnerStream, InnerStreamAlgorithm, InnerStreamSpec};
pub use kdf::{Argon2Params, Argon2Variant, KdfParams};
pub use keys::{KeyFactor, KeyFileSource, KeyMaterial, KeySchedule};
pub use memory::{SecretBuffer, SecretBytes};
pub use symmetric::OuterCipher;
pub use variant::{VariantDictionary, VariantValue};
