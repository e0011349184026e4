//! Error types for `coffer-vault`.

use coffer_crypto_core::{CryptoError, KeyError};
use thiserror::Error;
use uuid::Uuid;

/// Errors produced while decoding a container into a [`crate::Database`].
///
/// No partial tree is ever returned alongside an error.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Key material could not be assembled.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Header unreadable, unsupported, or failing its checksum.
    #[error("corrupt header: {0}")]
    CorruptHeader(String),

    /// The composite key does not open this container.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Gzip stream could not be inflated.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// Body integrity failure or an invalid XML document.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Failure of the cryptographic provider itself (CSPRNG, allocation).
    #[error(transparent)]
    Crypto(CryptoError),
}

impl DecodeError {
    /// `true` when the failure means "wrong password or key file" rather
    /// than damage to the file.
    #[must_use]
    pub const fn is_wrong_key(&self) -> bool {
        matches!(self, Self::InvalidCredentials)
    }
}

impl From<CryptoError> for DecodeError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Key(e) => Self::Key(e),
            CryptoError::CorruptHeader(m) => Self::CorruptHeader(m),
            CryptoError::InvalidCredentials => Self::InvalidCredentials,
            CryptoError::CorruptBody(m) => Self::MalformedPayload(m),
            CryptoError::Decompression(m) => Self::Decompression(m),
            // All three stem from parameters read out of the header.
            CryptoError::KeyDerivation(m)
            | CryptoError::Encryption(m)
            | CryptoError::InvalidKeyMaterial(m) => Self::CorruptHeader(m),
            other @ CryptoError::SecureMemory(_) => Self::Crypto(other),
        }
    }
}

/// Errors produced while encoding a [`crate::Database`].
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Key material could not be assembled.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// XML document could not be produced.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A count or length exceeds what the format can represent.
    #[error("size limit exceeded: {0}")]
    SizeLimit(String),

    /// Container sealing failed.
    #[error(transparent)]
    Crypto(CryptoError),
}

impl From<CryptoError> for EncodeError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Key(e) => Self::Key(e),
            other => Self::Crypto(other),
        }
    }
}

/// Structural edit or validation failures of a [`crate::Database`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    /// No group or entry with this identity.
    #[error("no such item: {0}")]
    NotFound(Uuid),

    /// The identity is already used by another group or entry.
    #[error("duplicate identity: {0}")]
    DuplicateId(Uuid),

    /// The identity names an entry where a group is required.
    #[error("not a group: {0}")]
    NotAGroup(Uuid),

    /// Re-parenting `id` under `parent` would create a cycle.
    #[error("moving {id} under {parent} would create a cycle")]
    Cycle {
        /// Item being moved.
        id: Uuid,
        /// Requested new parent.
        parent: Uuid,
    },

    /// The root group cannot be moved, recycled or deleted.
    #[error("the root group cannot be moved or deleted")]
    RootImmutable,

    /// The recycle bin is disabled for this database.
    #[error("recycle bin is disabled")]
    RecycleBinDisabled,

    /// Permanent deletion requires the item to be in the recycle bin.
    #[error("item {0} is not in the recycle bin")]
    NotInRecycleBin(Uuid),

    /// Parent and child records disagree.
    #[error("parent/child mismatch at {0}")]
    ParentMismatch(Uuid),

    /// The item is not reachable from the root group.
    #[error("item {0} is not reachable from the root")]
    Unreachable(Uuid),

    /// An entry references an attachment missing from the pool.
    #[error("entry {entry} references missing attachment {reference}")]
    DanglingAttachment {
        /// Referencing entry.
        entry: Uuid,
        /// Missing pool id.
        reference: u32,
    },

    /// History snapshots are not in ascending modification order.
    #[error("history of entry {0} is out of order")]
    HistoryOrder(Uuid),
}

/// Errors of the decode → merge → encode pipeline.
#[derive(Debug, Error)]
pub enum MergeFilesError {
    /// The local container could not be opened.
    #[error("local database: {0}")]
    Local(#[source] DecodeError),

    /// The remote container could not be opened.
    #[error("remote database: {0}")]
    Remote(#[source] DecodeError),

    /// The merged database could not be written.
    #[error(transparent)]
    Encode(#[from] EncodeError),
}
