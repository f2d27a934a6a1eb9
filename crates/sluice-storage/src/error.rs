//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Malformed object data or identifier.
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// The requested object is not in the store.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// The requested reference does not exist.
    #[error("reference not found: {0}")]
    RefNotFound(String),

    /// A reference update was rejected.
    #[error("invalid reference: {0}")]
    InvalidRef(String),

    /// No repository is registered for the given key.
    #[error("repository not found: {0}")]
    RepoNotFound(String),

    /// A repository is already registered for the given key.
    #[error("repository already exists: {0}")]
    RepoExists(String),
}
