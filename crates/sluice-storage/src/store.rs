//! Object store and repository management.

use crate::{GitObject, ObjectId, RefStore, Reference, Result, StorageError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Content-addressed object store.
#[derive(Debug, Default)]
pub struct ObjectStore {
    /// Objects indexed by their SHA-1 hash.
    objects: RwLock<HashMap<ObjectId, GitObject>>,
}

impl ObjectStore {
    /// Creates a new empty object store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object and returns its ID.
    pub fn put(&self, object: GitObject) -> ObjectId {
        let id = object.id;
        self.objects.write().insert(id, object);
        id
    }

    /// Stores a batch of objects under a single lock.
    pub fn extend(&self, objects: impl IntoIterator<Item = GitObject>) {
        let mut guard = self.objects.write();
        for object in objects {
            guard.insert(object.id, object);
        }
    }

    /// Retrieves an object by ID.
    pub fn get(&self, id: &ObjectId) -> Result<GitObject> {
        self.objects
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::ObjectNotFound(id.to_hex()))
    }

    /// Checks if an object exists.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.read().contains_key(id)
    }

    /// Returns the number of objects in the store.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Removes and returns every object, leaving the store empty.
    pub fn drain(&self) -> Vec<GitObject> {
        self.objects.write().drain().map(|(_, object)| object).collect()
    }
}

/// A git repository with objects and references.
#[derive(Debug)]
pub struct Repository {
    /// Location the repository is registered under.
    pub location: String,
    /// Object store.
    pub objects: Arc<ObjectStore>,
    /// Reference store.
    pub refs: Arc<RefStore>,
}

impl Repository {
    /// Creates a new empty repository whose HEAD points at `default_branch`.
    pub fn new(location: impl Into<String>, default_branch: &str) -> Self {
        let refs = Arc::new(RefStore::new());
        refs.set_symbolic("HEAD", &format!("refs/heads/{}", default_branch));

        Self {
            location: location.into(),
            objects: Arc::new(ObjectStore::new()),
            refs,
        }
    }

    /// Gets the current HEAD commit.
    pub fn head(&self) -> Result<ObjectId> {
        self.refs.resolve("HEAD")
    }

    /// Lists all references except HEAD that point directly at an object.
    pub fn direct_refs(&self) -> BTreeMap<String, ObjectId> {
        self.refs
            .list_all()
            .into_iter()
            .filter(|(name, _)| name != "HEAD")
            .filter_map(|(name, reference)| match reference {
                Reference::Direct(id) => Some((name, id)),
                Reference::Symbolic(_) => None,
            })
            .collect()
    }
}

/// Registry of repositories keyed by location.
#[derive(Debug, Default)]
pub struct RepoStore {
    repos: RwLock<HashMap<String, Arc<Repository>>>,
}

impl RepoStore {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new empty repository at `location`.
    pub fn create(&self, location: &str, default_branch: &str) -> Result<Arc<Repository>> {
        let mut repos = self.repos.write();
        if repos.contains_key(location) {
            return Err(StorageError::RepoExists(location.to_string()));
        }

        let repo = Arc::new(Repository::new(location, default_branch));
        repos.insert(location.to_string(), repo.clone());
        tracing::info!(location = %location, "Registered repository");
        Ok(repo)
    }

    /// Gets a repository by location.
    pub fn get(&self, location: &str) -> Result<Arc<Repository>> {
        self.repos
            .read()
            .get(location)
            .cloned()
            .ok_or_else(|| StorageError::RepoNotFound(location.to_string()))
    }
}
