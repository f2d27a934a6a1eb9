//! Git reference management.

use crate::{ObjectId, Result, StorageError};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Symbolic refs are followed at most this many hops.
const MAX_SYMREF_DEPTH: usize = 5;

/// A git reference (branch, tag, or symbolic ref).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// Direct reference to an object.
    Direct(ObjectId),
    /// Symbolic reference (e.g., HEAD -> refs/heads/main).
    Symbolic(String),
}

impl Reference {
    /// Returns the object ID if this is a direct reference.
    pub fn as_direct(&self) -> Option<ObjectId> {
        match self {
            Self::Direct(id) => Some(*id),
            Self::Symbolic(_) => None,
        }
    }
}

/// A compare-and-swap update of one reference.
///
/// `old` of `None` means the reference must not exist yet; `new` of `None`
/// deletes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefEdit {
    /// Reference name.
    pub name: String,
    /// Value the reference must currently have.
    pub old: Option<ObjectId>,
    /// Value to store, or `None` to delete.
    pub new: Option<ObjectId>,
}

/// Thread-safe reference store, ordered by name.
#[derive(Debug, Default)]
pub struct RefStore {
    refs: RwLock<BTreeMap<String, Reference>>,
}

impl RefStore {
    /// Creates a new empty reference store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets a reference by name.
    pub fn get(&self, name: &str) -> Result<Reference> {
        self.refs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::RefNotFound(name.to_string()))
    }

    /// Sets a reference to point to an object.
    pub fn set(&self, name: &str, target: ObjectId) {
        self.refs
            .write()
            .insert(name.to_string(), Reference::Direct(target));
    }

    /// Sets a symbolic reference.
    pub fn set_symbolic(&self, name: &str, target: &str) {
        self.refs
            .write()
            .insert(name.to_string(), Reference::Symbolic(target.to_string()));
    }

    /// Lists all references, sorted by name.
    pub fn list_all(&self) -> Vec<(String, Reference)> {
        self.refs
            .read()
            .iter()
            .map(|(name, refr)| (name.clone(), refr.clone()))
            .collect()
    }

    /// Resolves a reference through symbolic links to an object id.
    pub fn resolve(&self, name: &str) -> Result<ObjectId> {
        let refs = self.refs.read();
        let mut current = name.to_string();
        for _ in 0..MAX_SYMREF_DEPTH {
            match refs.get(&current) {
                Some(Reference::Direct(id)) => return Ok(*id),
                Some(Reference::Symbolic(target)) => current = target.clone(),
                None => return Err(StorageError::RefNotFound(current)),
            }
        }
        Err(StorageError::InvalidRef(format!(
            "symbolic ref chain too deep: {}",
            name
        )))
    }

    /// Returns the target name if `name` is a symbolic reference.
    pub fn symbolic_target(&self, name: &str) -> Option<String> {
        match self.refs.read().get(name)? {
            Reference::Symbolic(target) => Some(target.clone()),
            Reference::Direct(_) => None,
        }
    }

    /// Applies a batch of compare-and-swap edits under a single lock.
    ///
    /// Returns one result per edit, in order. When `atomic` is set and any
    /// edit fails its check, nothing is written and every edit reports an
    /// error.
    pub fn apply(&self, edits: &[RefEdit], atomic: bool) -> Vec<Result<()>> {
        let mut refs = self.refs.write();

        let checks: Vec<Result<()>> = edits.iter().map(|edit| check(&refs, edit)).collect();

        if atomic && checks.iter().any(|c| c.is_err()) {
            return checks
                .into_iter()
                .map(|c| {
                    c.and(Err(StorageError::InvalidRef(
                        "atomic transaction failed".to_string(),
                    )))
                })
                .collect();
        }

        for (edit, check) in edits.iter().zip(&checks) {
            if check.is_err() {
                continue;
            }
            match edit.new {
                Some(id) => {
                    refs.insert(edit.name.clone(), Reference::Direct(id));
                }
                None => {
                    refs.remove(&edit.name);
                }
            }
        }

        tracing::debug!(
            edits = edits.len(),
            rejected = checks.iter().filter(|c| c.is_err()).count(),
            "Applied reference edits"
        );

        checks
    }
}

fn check(refs: &BTreeMap<String, Reference>, edit: &RefEdit) -> Result<()> {
    let current = refs.get(&edit.name);
    match (edit.old, current) {
        (None, None) => Ok(()),
        (None, Some(_)) => Err(StorageError::InvalidRef(format!(
            "{} already exists",
            edit.name
        ))),
        (Some(_), None) => Err(StorageError::RefNotFound(edit.name.clone())),
        (Some(_), Some(Reference::Symbolic(_))) => Err(StorageError::InvalidRef(format!(
            "{} is a symbolic reference",
            edit.name
        ))),
        (Some(expected), Some(Reference::Direct(actual))) if expected != *actual => Err(
            StorageError::InvalidRef(format!("{} has moved", edit.name)),
        ),
        (Some(_), Some(Reference::Direct(_))) => Ok(()),
    }
}
