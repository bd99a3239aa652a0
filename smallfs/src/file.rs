use std::collections::BTreeSet;

use crate::fs::{Result, SFSError};
use crate::node::InodeId;

/// Handle returned by `open`, an index into the open file table.
pub type FileDescriptor = usize;

/// One open session on a file.
///
/// Holds only the identity of the inode, never a copy of it, so sessions on the
/// same file always see the authoritative record in the inode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFile {
    pub inode: InodeId,
    /// Byte position the next read or write starts at.
    pub offset: usize,
}

pub struct OpenFileTable {
    entries: Vec<Option<OpenFile>>,
    free_slots: BTreeSet<usize>,
}

impl OpenFileTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: vec![None; capacity],
            free_slots: (0..capacity).collect(),
        }
    }

    pub fn has_room(&self) -> bool {
        !self.free_slots.is_empty()
    }

    /// Opens a new session on `inode` positioned at offset 0, using the lowest
    /// free descriptor.
    pub fn open(&mut self, inode: InodeId) -> Result<FileDescriptor> {
        let fd = match self.free_slots.iter().next() {
            Some(&fd) => fd,
            None => return Err(SFSError::TableFull("open file table")),
        };
        self.free_slots.remove(&fd);
        self.entries[fd] = Some(OpenFile { inode, offset: 0 });
        Ok(fd)
    }

    pub fn get(&self, fd: FileDescriptor) -> Result<OpenFile> {
        self.entries
            .get(fd)
            .copied()
            .flatten()
            .ok_or(SFSError::InvalidDescriptor(fd))
    }

    pub fn set(&mut self, fd: FileDescriptor, entry: OpenFile) -> Result<()> {
        match self.entries.get_mut(fd) {
            Some(slot) if slot.is_some() => {
                *slot = Some(entry);
                Ok(())
            }
            _ => Err(SFSError::InvalidDescriptor(fd)),
        }
    }

    pub fn close(&mut self, fd: FileDescriptor) -> Result<OpenFile> {
        let entry = self
            .entries
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(SFSError::InvalidDescriptor(fd))?;
        self.free_slots.insert(fd);
        Ok(entry)
    }

    /// Number of sessions currently open on `inode`.
    pub fn open_count(&self, inode: InodeId) -> usize {
        self.entries
            .iter()
            .flatten()
            .filter(|entry| entry.inode == inode)
            .count()
    }
}
