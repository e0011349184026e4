//! `coffer-vault`: the credential tree of a KDBX database.
//!
//! Decodes a container opened by `coffer-crypto-core` into a [`Database`],
//! edits it while keeping history and deletion records, writes it back,
//! and merges two copies of the same database.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod error;
pub mod times;

pub mod attachments;
pub mod deleted;
pub mod meta;

pub(crate) mod digest;

pub mod entries;
pub mod groups;
pub mod tree;

pub(crate) mod xml;

pub mod codec;
pub mod preferences;

pub mod merge;

pub use attachments::{Binary, BinaryId, BinaryPool};
pub use codec::{decode, encode, encode_with_version, merge_files};
pub use deleted::DeletionLog;
pub use digest::ContentHash;
pub use entries::{AutoType, AutoTypeAssociation, Entry, FieldValue, STANDARD_FIELDS};
pub use error::{DecodeError, EncodeError, MergeFilesError, TreeError};
pub use groups::Group;
pub use merge::{merge, MergeChange, MergeConflict, MergeReport, MergeSummary};
pub use meta::{CustomData, CustomDataItem, CustomIcon, MemoryProtection, Meta};
pub use preferences::{FormatPreferences, KdfSetting};
pub use times::{Timestamp, Times};
pub use tree::{Database, Node};

pub use coffer_crypto_core::{FormatVersion, KeyFactor, KeyMaterial};
