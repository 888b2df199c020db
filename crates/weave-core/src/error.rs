//! Error types for Weave

use thiserror::Error;

/// Main error type for Weave operations
#[derive(Error, Debug)]
pub enum WeaveError {
    /// Malformed key, bad suffix format, or otherwise unusable input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation requires the runtime keys (nobody is logged in)
    #[error("Not authenticated")]
    NotAuthenticated,

    /// Password-based unwrap of the identity keys failed
    #[error("Wrong password")]
    WrongPassword,

    /// Derived public key does not match the stored/backup one
    #[error("Identity integrity check failed: {0}")]
    IdentityIntegrity(String),

    /// Write into an occupied frozen path
    #[error("Path is immutable: {0}")]
    Immutable(String),

    /// Handle already claimed by a different key
    #[error("Handle taken: {0}")]
    HandleTaken(String),

    /// Admission-time signature verification failure
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// Handle suffix does not match the public key, or a user-space
    /// write by a non-owner
    #[error("Forged write rejected: {0}")]
    Forged(String),

    /// Frozen write older than the claim-age barrier
    #[error("Replay rejected: {0}")]
    Replay(String),

    /// Byte codec met an unknown tag or truncated input
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Trie node bytes are corrupt or truncated
    #[error("Malformed trie node: {0}")]
    MalformedNode(String),

    /// Per-request network timeout; non-fatal
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Operation after close()
    #[error("Engine is closed")]
    Closed,

    /// Error during storage operations
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using WeaveError
pub type WeaveResult<T> = Result<T, WeaveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WeaveError::Immutable("frozen/genesis".to_string());
        assert_eq!(format!("{}", err), "Path is immutable: frozen/genesis");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: WeaveError = io_err.into();
        assert!(matches!(err, WeaveError::Io(_)));
    }
}
