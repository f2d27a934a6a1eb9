//! Git object types and utilities.

use crate::{Result, StorageError};
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::fmt;

/// Tree entry mode for submodule commits; their targets live in another repository.
const GITLINK_MODE: u32 = 0o160000;
/// Tree entry mode for subdirectories.
const TREE_MODE: u32 = 0o040000;

/// A 20-byte SHA-1 object identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    /// The all-zero id git uses for "no object" in ref updates.
    pub const ZERO: ObjectId = ObjectId([0u8; 20]);

    /// Creates an ObjectId from raw bytes.
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Creates an ObjectId from a byte slice of exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 20] = bytes.try_into().map_err(|_| {
            StorageError::InvalidObject(format!("invalid object id length: {}", bytes.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Creates an ObjectId from a hex string.
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != 40 {
            return Err(StorageError::InvalidObject(format!(
                "invalid object id length: {}",
                hex.len()
            )));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(hex, &mut bytes)
            .map_err(|e| StorageError::InvalidObject(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Returns the hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns true for the all-zero id.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// Computes the SHA-1 hash of data with a git object header.
    pub fn hash_object(object_type: ObjectType, data: &[u8]) -> Self {
        let header = format!("{} {}\0", object_type.as_str(), data.len());
        let mut hasher = Sha1::new();
        hasher.update(header.as_bytes());
        hasher.update(data);
        let result = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&result);
        Self(bytes)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Git object types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// File content.
    Blob,
    /// Directory listing.
    Tree,
    /// Commit object.
    Commit,
    /// Annotated tag.
    Tag,
}

impl ObjectType {
    /// Returns the string representation used in git.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Tree => "tree",
            Self::Commit => "commit",
            Self::Tag => "tag",
        }
    }

    /// Parses an object type from a string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "blob" => Ok(Self::Blob),
            "tree" => Ok(Self::Tree),
            "commit" => Ok(Self::Commit),
            "tag" => Ok(Self::Tag),
            _ => Err(StorageError::InvalidObject(format!(
                "unknown object type: {}",
                s
            ))),
        }
    }

    /// Returns the type code used in pack files.
    pub fn pack_type(&self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
        }
    }

    /// Parses an object type from a pack file type code.
    pub fn from_pack_type(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::Commit),
            2 => Ok(Self::Tree),
            3 => Ok(Self::Blob),
            4 => Ok(Self::Tag),
            _ => Err(StorageError::InvalidObject(format!(
                "unknown pack type: {}",
                code
            ))),
        }
    }
}

/// One entry of a tree object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// File mode, e.g. `0o100644` or `0o040000`.
    pub mode: u32,
    /// Entry name.
    pub name: String,
    /// Target object.
    pub id: ObjectId,
}

impl TreeEntry {
    /// Creates a tree entry.
    pub fn new(mode: u32, name: impl Into<String>, id: ObjectId) -> Self {
        Self {
            mode,
            name: name.into(),
            id,
        }
    }

    /// Returns true if the entry points at a commit in another repository.
    pub fn is_gitlink(&self) -> bool {
        self.mode == GITLINK_MODE
    }

    /// Returns true if the entry is a subdirectory.
    pub fn is_tree(&self) -> bool {
        self.mode == TREE_MODE
    }
}

/// A git object (blob, tree, commit, or tag).
#[derive(Debug, Clone)]
pub struct GitObject {
    /// The object's unique identifier (SHA-1 hash).
    pub id: ObjectId,
    /// The type of object.
    pub object_type: ObjectType,
    /// The raw object data (uncompressed).
    pub data: Bytes,
}

impl GitObject {
    /// Creates a new git object, computing its ID from the data.
    pub fn new(object_type: ObjectType, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let id = ObjectId::hash_object(object_type, &data);
        Self {
            id,
            object_type,
            data,
        }
    }

    /// Creates a blob object from file content.
    pub fn blob(content: impl Into<Bytes>) -> Self {
        Self::new(ObjectType::Blob, content)
    }

    /// Creates a tree object. Entries are written in the order given.
    pub fn tree(entries: &[TreeEntry]) -> Self {
        let mut content = Vec::new();
        for entry in entries {
            content.extend_from_slice(format!("{:o} {}\0", entry.mode, entry.name).as_bytes());
            content.extend_from_slice(entry.id.as_bytes());
        }
        Self::new(ObjectType::Tree, content)
    }

    /// Creates a commit object.
    pub fn commit(
        tree_id: &ObjectId,
        parents: &[ObjectId],
        author: &str,
        committer: &str,
        message: &str,
    ) -> Self {
        let mut content = format!("tree {}\n", tree_id);
        for parent in parents {
            content.push_str(&format!("parent {}\n", parent));
        }
        content.push_str(&format!("author {}\n", author));
        content.push_str(&format!("committer {}\n", committer));
        content.push_str(&format!("\n{}", message));
        Self::new(ObjectType::Commit, content.into_bytes())
    }

    /// Creates an annotated tag object.
    pub fn tag(target: &GitObject, name: &str, tagger: &str, message: &str) -> Self {
        let content = format!(
            "object {}\ntype {}\ntag {}\ntagger {}\n\n{}",
            target.id,
            target.object_type.as_str(),
            name,
            tagger,
            message
        );
        Self::new(ObjectType::Tag, content.into_bytes())
    }

    /// Returns the size of the object data.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Parses the entries of a tree object.
    pub fn tree_entries(&self) -> Result<Vec<TreeEntry>> {
        self.expect_type(ObjectType::Tree)?;

        let mut entries = Vec::new();
        let mut rest: &[u8] = &self.data;
        while !rest.is_empty() {
            let space = rest
                .iter()
                .position(|&b| b == b' ')
                .ok_or_else(|| invalid(self, "tree entry without mode"))?;
            let mode_str = std::str::from_utf8(&rest[..space])
                .map_err(|_| invalid(self, "tree entry mode is not utf-8"))?;
            let mode = u32::from_str_radix(mode_str, 8)
                .map_err(|_| invalid(self, "tree entry mode is not octal"))?;
            rest = &rest[space + 1..];

            let nul = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| invalid(self, "tree entry without name terminator"))?;
            let name = String::from_utf8_lossy(&rest[..nul]).into_owned();
            rest = &rest[nul + 1..];

            if rest.len() < 20 {
                return Err(invalid(self, "truncated tree entry id"));
            }
            let id = ObjectId::from_slice(&rest[..20])?;
            rest = &rest[20..];

            entries.push(TreeEntry { mode, name, id });
        }
        Ok(entries)
    }

    /// Returns the tree and parents named in a commit's header.
    pub fn commit_links(&self) -> Result<(ObjectId, Vec<ObjectId>)> {
        self.expect_type(ObjectType::Commit)?;

        let mut tree = None;
        let mut parents = Vec::new();
        for line in self.header_lines() {
            if let Some(hex) = line.strip_prefix(b"tree ") {
                tree = Some(self.header_id(hex)?);
            } else if let Some(hex) = line.strip_prefix(b"parent ") {
                parents.push(self.header_id(hex)?);
            }
        }
        let tree = tree.ok_or_else(|| invalid(self, "commit without tree"))?;
        Ok((tree, parents))
    }

    /// Returns the object an annotated tag points at.
    pub fn tag_target(&self) -> Result<ObjectId> {
        self.expect_type(ObjectType::Tag)?;

        let hex = self
            .header_lines()
            .find_map(|line| line.strip_prefix(b"object "))
            .ok_or_else(|| invalid(self, "tag without object"))?;
        self.header_id(hex)
    }

    /// Header lines as raw bytes; identity lines may carry any encoding.
    fn header_lines(&self) -> impl Iterator<Item = &[u8]> {
        let header_end = self
            .data
            .windows(2)
            .position(|w| w == b"\n\n")
            .unwrap_or(self.data.len());
        self.data[..header_end].split(|&b| b == b'\n')
    }

    fn header_id(&self, hex: &[u8]) -> Result<ObjectId> {
        let hex = std::str::from_utf8(hex).map_err(|_| invalid(self, "non-ascii object id"))?;
        ObjectId::from_hex(hex)
    }

    fn expect_type(&self, expected: ObjectType) -> Result<()> {
        if self.object_type != expected {
            return Err(StorageError::InvalidObject(format!(
                "{} is a {}, not a {}",
                self.id,
                self.object_type.as_str(),
                expected.as_str()
            )));
        }
        Ok(())
    }
}

fn invalid(object: &GitObject, reason: &str) -> StorageError {
    StorageError::InvalidObject(format!("{}: {}", object.id, reason))
}
