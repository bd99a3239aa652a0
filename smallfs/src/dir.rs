//! The single flat directory of the volume.

use std::collections::{BTreeMap, BTreeSet};

use crate::fs::{Result, SFSError, BLOCK_SIZE, MAX_FILE_NAME_LENGTH, NULL_POINTER};
use crate::node::InodeId;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const DIR_ENTRY_SIZE: usize = 32;
const ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / DIR_ENTRY_SIZE;

/// On-disk form of one directory slot.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Copy, Clone, Debug)]
struct DirEntry {
    /// `NULL_POINTER` for an empty slot.
    inode: u32,
    name_len: u32,
    name: [u8; MAX_FILE_NAME_LENGTH],
    padding: [u8; 8],
}

impl DirEntry {
    fn empty() -> Self {
        Self {
            inode: NULL_POINTER,
            name_len: 0,
            name: [0; MAX_FILE_NAME_LENGTH],
            padding: [0; 8],
        }
    }

    fn encode(name: &str, inode: InodeId) -> Self {
        let mut entry = Self::empty();
        entry.inode = inode;
        entry.name_len = name.len() as u32;
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        entry
    }

    fn decode(&self) -> Result<Option<(String, InodeId)>> {
        if self.inode == NULL_POINTER {
            return Ok(None);
        }
        let len = self.name_len as usize;
        let raw = self.name.get(..len).ok_or(SFSError::CorruptVolume)?;
        let name = std::str::from_utf8(raw).map_err(|_| SFSError::CorruptVolume)?;
        if name.is_empty() {
            return Err(SFSError::CorruptVolume);
        }
        Ok(Some((name.to_string(), self.inode)))
    }
}

/// Checks `name` can be stored in a directory entry.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SFSError::InvalidName);
    }
    if name.len() > MAX_FILE_NAME_LENGTH {
        return Err(SFSError::NameTooLong(name.to_string()));
    }
    Ok(())
}

/// Flat mapping of file names to inode identities.
///
/// Entries live in fixed slots mirroring the on-disk directory region. Listing
/// walks slots in order with a cursor that only moves forward: once it runs off
/// the end it stays there until the directory is loaded again.
pub struct Directory {
    slots: Vec<Option<(String, InodeId)>>,
    names: BTreeMap<String, usize>,
    free_slots: BTreeSet<usize>,
    cursor: usize,
    dirty: BTreeSet<usize>,
}

impl Directory {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            names: BTreeMap::new(),
            free_slots: (0..capacity).collect(),
            cursor: 0,
            dirty: BTreeSet::new(),
        }
    }

    /// Rebuilds the directory from its serialized blocks.
    pub fn open(capacity: usize, region: &[u8]) -> Result<Self> {
        let mut dir = Self::new(capacity);
        for slot in 0..capacity {
            let start = slot * DIR_ENTRY_SIZE;
            let entry = region
                .get(start..start + DIR_ENTRY_SIZE)
                .and_then(DirEntry::read_from)
                .ok_or(SFSError::CorruptVolume)?;
            if let Some((name, inode)) = entry.decode()? {
                if dir.names.insert(name.clone(), slot).is_some() {
                    return Err(SFSError::CorruptVolume);
                }
                dir.slots[slot] = Some((name, inode));
                dir.free_slots.remove(&slot);
            }
        }
        Ok(dir)
    }

    pub fn has_room(&self) -> bool {
        !self.free_slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Maps `name` to `inode` in the lowest free slot.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the name is taken, `NameTooLong` or `InvalidName` if it
    /// cannot be stored, `TableFull` when every slot is taken.
    pub fn create(&mut self, name: &str, inode: InodeId) -> Result<()> {
        validate_name(name)?;
        if self.names.contains_key(name) {
            return Err(SFSError::AlreadyExists(name.to_string()));
        }
        let slot = match self.free_slots.iter().next() {
            Some(&slot) => slot,
            None => return Err(SFSError::TableFull("directory")),
        };
        self.free_slots.remove(&slot);
        self.slots[slot] = Some((name.to_string(), inode));
        self.names.insert(name.to_string(), slot);
        self.dirty.insert(slot / ENTRIES_PER_BLOCK);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<InodeId> {
        let slot = self.names.get(name).ok_or(SFSError::NotFound)?;
        match &self.slots[*slot] {
            Some((_, inode)) => Ok(*inode),
            None => Err(SFSError::NotFound),
        }
    }

    /// Unmaps `name`, returning the inode it referred to.
    pub fn remove(&mut self, name: &str) -> Result<InodeId> {
        let slot = self.names.remove(name).ok_or(SFSError::NotFound)?;
        let inode = match self.slots[slot].take() {
            Some((_, inode)) => inode,
            None => return Err(SFSError::NotFound),
        };
        self.free_slots.insert(slot);
        self.dirty.insert(slot / ENTRIES_PER_BLOCK);
        Ok(inode)
    }

    /// Live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, InodeId)> + '_ {
        self.slots
            .iter()
            .filter_map(|slot| slot.as_ref().map(|(name, inode)| (name.as_str(), *inode)))
    }

    /// Returns the next live entry at or after the cursor and moves the cursor
    /// past it.
    ///
    /// # Errors
    ///
    /// `EndOfDirectory` once no live entry remains ahead of the cursor, and on
    /// every call after that until the directory is loaded again.
    pub fn next_entry(&mut self) -> Result<String> {
        while self.cursor < self.slots.len() {
            let slot = self.cursor;
            self.cursor += 1;
            if let Some((name, _)) = &self.slots[slot] {
                return Ok(name.clone());
            }
        }
        Err(SFSError::EndOfDirectory)
    }

    /// Directory blocks modified since they were last marked clean.
    pub fn dirty_blocks(&self) -> Vec<usize> {
        self.dirty.iter().copied().collect()
    }

    pub fn mark_clean(&mut self, disk_block: usize) {
        self.dirty.remove(&disk_block);
    }

    pub fn serialize_block(&self, disk_block: usize) -> Vec<u8> {
        let mut block_buf = vec![0; BLOCK_SIZE];
        let offset = disk_block * ENTRIES_PER_BLOCK;
        let end = std::cmp::min(offset + ENTRIES_PER_BLOCK, self.slots.len());
        for (i, slot) in self.slots[offset.min(end)..end].iter().enumerate() {
            let entry = match slot {
                Some((name, inode)) => DirEntry::encode(name, *inode),
                None => DirEntry::empty(),
            };
            let start = i * DIR_ENTRY_SIZE;
            block_buf[start..start + DIR_ENTRY_SIZE].copy_from_slice(entry.as_bytes());
        }
        block_buf
    }
}
