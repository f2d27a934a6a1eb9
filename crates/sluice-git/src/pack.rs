//! Git pack file format implementation.
//!
//! Pack files are the format used by git for efficient object transfer.
//! See: https://git-scm.com/docs/pack-format

use crate::{GitError, Result};
use flate2::bufread::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};
use sluice_storage::{GitObject, ObjectId, ObjectStore, ObjectType};
use std::collections::HashMap;
use std::io::{Read, Write};

/// Magic bytes at the start of a pack file.
const PACK_SIGNATURE: &[u8; 4] = b"PACK";
/// Pack file version we write.
const PACK_VERSION: u32 = 2;
/// Header plus trailing checksum.
const PACK_OVERHEAD: usize = 12 + 20;

const OFS_DELTA: u8 = 6;
const REF_DELTA: u8 = 7;

/// Builds a pack file from a set of objects.
pub struct PackBuilder {
    objects: Vec<GitObject>,
}

impl PackBuilder {
    /// Creates a new pack builder.
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
        }
    }

    /// Adds an object to the pack.
    pub fn add(&mut self, object: GitObject) {
        self.objects.push(object);
    }

    /// Adds an object from the store by ID.
    pub fn add_from_store(&mut self, store: &ObjectStore, id: &ObjectId) -> Result<()> {
        let object = store.get(id)?;
        self.objects.push(object);
        Ok(())
    }

    /// Number of objects added so far.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if no object was added.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Builds the pack file.
    pub fn build(self) -> Result<Vec<u8>> {
        let count = u32::try_from(self.objects.len())
            .map_err(|_| GitError::InvalidPack("too many objects for one pack".to_string()))?;

        let mut pack = Vec::new();
        pack.extend_from_slice(PACK_SIGNATURE);
        pack.extend_from_slice(&PACK_VERSION.to_be_bytes());
        pack.extend_from_slice(&count.to_be_bytes());

        for object in &self.objects {
            write_entry_header(&mut pack, object.object_type.pack_type(), object.data.len());
            pack.extend_from_slice(&compress(&object.data)?);
        }

        let checksum = Sha1::digest(&pack);
        pack.extend_from_slice(&checksum);

        Ok(pack)
    }
}

impl Default for PackBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes an entry's type and size: the first byte holds a continuation
/// bit, three type bits and the low four size bits; each following byte
/// holds seven more size bits.
fn write_entry_header(pack: &mut Vec<u8>, type_code: u8, size: usize) {
    let mut first_byte = (type_code << 4) | ((size & 0x0F) as u8);
    let mut remaining_size = size >> 4;

    if remaining_size > 0 {
        first_byte |= 0x80;
    }
    pack.push(first_byte);

    while remaining_size > 0 {
        let mut byte = (remaining_size & 0x7F) as u8;
        remaining_size >>= 7;
        if remaining_size > 0 {
            byte |= 0x80;
        }
        pack.push(byte);
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| GitError::InvalidPack(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| GitError::InvalidPack(e.to_string()))
}

/// How a pack entry's content is stored.
#[derive(Clone, Copy)]
enum EntryKind {
    Whole(ObjectType),
    OfsDelta { base_offset: usize },
    RefDelta { base: ObjectId },
}

struct Entry {
    kind: EntryKind,
    data: Vec<u8>,
}

/// Parses a pack file and extracts objects.
pub struct PackParser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PackParser<'a> {
    /// Creates a new pack parser.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Parses the pack file and stores objects.
    pub fn parse(&mut self, store: &ObjectStore) -> Result<Vec<ObjectId>> {
        let objects = self.parse_objects(store, || false)?;
        let ids = objects.iter().map(|o| o.id).collect();
        store.extend(objects);
        Ok(ids)
    }

    /// Parses every object in the pack without storing anything.
    ///
    /// Deltas are resolved against earlier entries or, for `REF_DELTA`
    /// entries naming an object outside the pack, against `base`. The
    /// `interrupted` callback is polled between entries; once it returns
    /// true parsing stops with [`GitError::Canceled`].
    pub fn parse_objects(
        &mut self,
        base: &ObjectStore,
        interrupted: impl Fn() -> bool,
    ) -> Result<Vec<GitObject>> {
        let object_count = self.read_header()?;
        let end = self.data.len() - 20;

        // The declared count is untrusted; let the vector grow with real entries.
        let mut entries = Vec::new();
        let mut by_offset = HashMap::new();
        for _ in 0..object_count {
            if interrupted() {
                return Err(GitError::Canceled);
            }
            let offset = self.pos;
            let entry = self.parse_entry(end)?;
            by_offset.insert(offset, entries.len());
            entries.push(entry);
        }

        if self.pos != end {
            return Err(GitError::InvalidPack(format!(
                "{} trailing bytes after last object",
                end - self.pos
            )));
        }

        resolve(entries, &by_offset, base, interrupted)
    }

    /// Validates signature, version and checksum, returning the object count.
    fn read_header(&mut self) -> Result<u32> {
        if self.data.len() < PACK_OVERHEAD {
            return Err(GitError::InvalidPack("pack too small".to_string()));
        }

        if &self.data[0..4] != PACK_SIGNATURE {
            return Err(GitError::InvalidPack("invalid signature".to_string()));
        }

        let version = u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]]);
        if version != 2 && version != 3 {
            return Err(GitError::InvalidPack(format!(
                "unsupported version: {}",
                version
            )));
        }

        let checksum_start = self.data.len() - 20;
        let computed = Sha1::digest(&self.data[..checksum_start]);
        if computed.as_slice() != &self.data[checksum_start..] {
            return Err(GitError::InvalidPack("checksum mismatch".to_string()));
        }

        self.pos = 12;
        Ok(u32::from_be_bytes([
            self.data[8],
            self.data[9],
            self.data[10],
            self.data[11],
        ]))
    }

    fn next_byte(&mut self, end: usize) -> Result<u8> {
        if self.pos >= end {
            return Err(GitError::InvalidPack("unexpected end of pack".to_string()));
        }
        let byte = self.data[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    /// Parses one entry header and inflates its payload.
    fn parse_entry(&mut self, end: usize) -> Result<Entry> {
        let offset = self.pos;
        let first_byte = self.next_byte(end)?;

        let type_code = (first_byte >> 4) & 0x07;
        let mut size = u64::from(first_byte & 0x0F);
        let mut shift = 4;
        let mut byte = first_byte;
        while byte & 0x80 != 0 {
            byte = self.next_byte(end)?;
            if shift > 57 {
                return Err(GitError::InvalidPack("object size overflow".to_string()));
            }
            size |= u64::from(byte & 0x7F) << shift;
            shift += 7;
        }
        let size = usize::try_from(size)
            .map_err(|_| GitError::InvalidPack("object size overflow".to_string()))?;

        let kind = match type_code {
            OFS_DELTA => {
                let distance = self.read_base_distance(end)?;
                let base_offset = offset
                    .checked_sub(distance)
                    .filter(|_| distance > 0)
                    .ok_or_else(|| {
                        GitError::InvalidPack(format!(
                            "delta base offset {} out of range at {}",
                            distance, offset
                        ))
                    })?;
                EntryKind::OfsDelta { base_offset }
            }
            REF_DELTA => {
                if end - self.pos < 20 {
                    return Err(GitError::InvalidPack("truncated delta base id".to_string()));
                }
                let base = ObjectId::from_slice(&self.data[self.pos..self.pos + 20])?;
                self.pos += 20;
                EntryKind::RefDelta { base }
            }
            code => EntryKind::Whole(ObjectType::from_pack_type(code)?),
        };

        let data = self.inflate(end, size)?;
        Ok(Entry { kind, data })
    }

    /// Reads the big-endian base-128 distance of an `OFS_DELTA` base, where
    /// every continuation adds one before shifting.
    fn read_base_distance(&mut self, end: usize) -> Result<usize> {
        let mut byte = self.next_byte(end)?;
        let mut distance = usize::from(byte & 0x7F);
        while byte & 0x80 != 0 {
            byte = self.next_byte(end)?;
            distance = distance
                .checked_add(1)
                .and_then(|d| d.checked_mul(128))
                .map(|d| d | usize::from(byte & 0x7F))
                .ok_or_else(|| GitError::InvalidPack("delta base offset overflow".to_string()))?;
        }
        Ok(distance)
    }

    fn inflate(&mut self, end: usize, size: usize) -> Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(&self.data[self.pos..end]);
        let mut decompressed = Vec::new();
        (&mut decoder)
            .take(size as u64 + 1)
            .read_to_end(&mut decompressed)
            .map_err(|e| GitError::InvalidPack(format!("decompression failed: {}", e)))?;

        if decompressed.len() != size {
            return Err(GitError::InvalidPack(format!(
                "object at {} inflated to {} bytes, header says {}",
                self.pos,
                decompressed.len(),
                size
            )));
        }

        self.pos += decoder.total_in() as usize;
        Ok(decompressed)
    }
}

/// Turns parsed entries into objects, applying deltas once their bases are
/// known. Each pass resolves at least one entry or the pack is rejected.
fn resolve(
    mut entries: Vec<Entry>,
    by_offset: &HashMap<usize, usize>,
    base: &ObjectStore,
    interrupted: impl Fn() -> bool,
) -> Result<Vec<GitObject>> {
    let mut resolved: Vec<Option<GitObject>> = vec![None; entries.len()];
    let mut by_id: HashMap<ObjectId, usize> = HashMap::new();
    let mut remaining = entries.len();

    while remaining > 0 {
        let mut progressed = false;

        for index in 0..entries.len() {
            if resolved[index].is_some() {
                continue;
            }
            if interrupted() {
                return Err(GitError::Canceled);
            }

            let kind = entries[index].kind;
            let object = match kind {
                EntryKind::Whole(object_type) => Some(GitObject::new(
                    object_type,
                    std::mem::take(&mut entries[index].data),
                )),
                EntryKind::OfsDelta { base_offset } => {
                    let base_index = *by_offset.get(&base_offset).ok_or_else(|| {
                        GitError::InvalidPack(format!(
                            "delta base offset {} is not an entry",
                            base_offset
                        ))
                    })?;
                    match &resolved[base_index] {
                        Some(base_object) => Some(undelta(base_object, &entries[index].data)?),
                        None => None,
                    }
                }
                EntryKind::RefDelta { base: base_id } => {
                    if let Some(&base_index) = by_id.get(&base_id) {
                        match &resolved[base_index] {
                            Some(base_object) => {
                                Some(undelta(base_object, &entries[index].data)?)
                            }
                            None => None,
                        }
                    } else if base.contains(&base_id) {
                        Some(undelta(&base.get(&base_id)?, &entries[index].data)?)
                    } else {
                        None
                    }
                }
            };

            if let Some(object) = object {
                by_id.insert(object.id, index);
                resolved[index] = Some(object);
                remaining -= 1;
                progressed = true;
            }
        }

        if remaining > 0 && !progressed {
            return Err(GitError::InvalidPack(format!(
                "{} deltas reference missing base objects",
                remaining
            )));
        }
    }

    Ok(resolved.into_iter().flatten().collect())
}

fn undelta(base: &GitObject, delta: &[u8]) -> Result<GitObject> {
    let data = apply_delta(&base.data, delta)?;
    Ok(GitObject::new(base.object_type, data))
}

/// Applies a git delta to `base`, returning the reconstructed content.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 0;
    let base_size = read_delta_size(delta, &mut pos)?;
    let result_size = read_delta_size(delta, &mut pos)?;

    if base_size != base.len() {
        return Err(GitError::InvalidPack(format!(
            "delta expects base of {} bytes, got {}",
            base_size,
            base.len()
        )));
    }

    let mut result = Vec::with_capacity(result_size.min(delta.len().saturating_mul(64)));
    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;

        if cmd & 0x80 != 0 {
            let mut offset = 0usize;
            let mut size = 0usize;
            for i in 0..4 {
                if cmd & (1 << i) != 0 {
                    let byte = *delta.get(pos).ok_or_else(truncated_delta)?;
                    offset |= usize::from(byte) << (8 * i);
                    pos += 1;
                }
            }
            for i in 0..3 {
                if cmd & (0x10 << i) != 0 {
                    let byte = *delta.get(pos).ok_or_else(truncated_delta)?;
                    size |= usize::from(byte) << (8 * i);
                    pos += 1;
                }
            }
            if size == 0 {
                size = 0x10000;
            }

            let chunk = offset
                .checked_add(size)
                .and_then(|copy_end| base.get(offset..copy_end))
                .ok_or_else(|| {
                    GitError::InvalidPack(format!(
                        "delta copy {}+{} outside base of {} bytes",
                        offset,
                        size,
                        base.len()
                    ))
                })?;
            result.extend_from_slice(chunk);
        } else if cmd != 0 {
            let len = usize::from(cmd);
            let chunk = delta.get(pos..pos + len).ok_or_else(truncated_delta)?;
            result.extend_from_slice(chunk);
            pos += len;
        } else {
            return Err(GitError::InvalidPack("reserved delta opcode 0".to_string()));
        }

        if result.len() > result_size {
            return Err(GitError::InvalidPack(
                "delta output exceeds declared size".to_string(),
            ));
        }
    }

    if result.len() != result_size {
        return Err(GitError::InvalidPack(format!(
            "delta produced {} bytes, expected {}",
            result.len(),
            result_size
        )));
    }
    Ok(result)
}

fn read_delta_size(delta: &[u8], pos: &mut usize) -> Result<usize> {
    let mut size = 0u64;
    let mut shift = 0;
    loop {
        let byte = *delta.get(*pos).ok_or_else(truncated_delta)?;
        *pos += 1;
        if shift > 57 {
            return Err(GitError::InvalidPack("delta size overflow".to_string()));
        }
        size |= u64::from(byte & 0x7F) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            break;
        }
    }
    usize::try_from(size).map_err(|_| GitError::InvalidPack("delta size overflow".to_string()))
}

fn truncated_delta() -> GitError {
    GitError::InvalidPack("truncated delta".to_string())
}
