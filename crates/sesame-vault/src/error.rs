//! Vault error types for `sesame-vault`.

use sesame_keychain::{ItemMetadata, KeychainError};
use thiserror::Error;

/// Errors produced by vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Wrong passphrase or a key entry that does not validate. The two are
    /// never distinguished.
    #[error("authentication failed")]
    Authentication,

    /// Vault is locked: the operation requires an unlocked vault, or the keys
    /// were forgotten while the operation was in flight.
    #[error("vault is locked")]
    Locked,

    /// Ciphertext or decrypted payload failed to decode.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Vault, item or pattern target not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A pattern that must resolve to one item matched several.
    #[error("pattern {pattern:?} matches {} items", candidates.len())]
    AmbiguousMatch {
        /// The pattern as supplied by the caller.
        pattern: String,
        /// Every matching item, in index order.
        candidates: Vec<ItemMetadata>,
    },

    /// Storage backend failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A vault or item already exists at the target.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Caller-supplied argument rejected (empty key id, empty passphrase).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Keychain file could not be parsed or serialized.
    #[error("keychain format error: {0}")]
    Format(String),

    /// Unexpected internal failure (task join, poisoned lock, cipher setup).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<KeychainError> for VaultError {
    fn from(err: KeychainError) -> Self {
        match err {
            KeychainError::Authentication => Self::Authentication,
            KeychainError::Integrity(msg) => Self::Integrity(msg),
            KeychainError::Format(msg) => Self::Format(msg),
            KeychainError::InvalidKeyMaterial(msg) => Self::InvalidArgument(msg),
            KeychainError::KeyDerivation(msg)
            | KeychainError::Encryption(msg)
            | KeychainError::SecureMemory(msg) => Self::Internal(msg),
        }
    }
}

/// Errors produced by a [`Storage`](crate::storage::Storage) backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No file or directory at the path.
    #[error("no such file or directory: {0}")]
    NotFound(String),

    /// Something already exists where a new entry was requested.
    #[error("file exists: {0}")]
    AlreadyExists(String),

    /// A path component is a file, or a directory was used as a file.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Directory removal refused because it still has entries.
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// Path escapes the storage root or is otherwise malformed.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// I/O error from the underlying filesystem.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Storage path the operation targeted.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Backend-specific failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Map an `io::Error` for `path`, keeping not-found and already-exists
    /// distinguishable.
    #[must_use]
    pub fn from_io(path: &str, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.to_owned()),
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.to_owned()),
            _ => Self::Io {
                path: path.to_owned(),
                source,
            },
        }
    }

    /// Whether this is a not-found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
