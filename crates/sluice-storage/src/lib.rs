//! Git object storage for Sluice.
//!
//! This crate provides content-addressed in-memory storage for git objects
//! (blobs, trees, commits, tags), reference management, and the registry of
//! repositories a Sluice server exposes.

mod error;
mod object;
mod refs;
mod store;

pub use error::StorageError;
pub use object::{GitObject, ObjectId, ObjectType, TreeEntry};
pub use refs::{RefEdit, RefStore, Reference};
pub use store::{ObjectStore, RepoStore, Repository};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
