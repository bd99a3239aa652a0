use std::collections::{BTreeMap, BTreeSet};

use crate::fs::{Result, SFSError, BLOCK_SIZE, NULL_POINTER, NUM_DIRECT_POINTERS};

use log::debug;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const NODE_SIZE: usize = 128;
const NODES_PER_BLOCK: usize = BLOCK_SIZE / NODE_SIZE;
/// Regular file, rw-r--r--.
const FILE_DEFAULT_MODE: u16 = 0o100644;

/// Identity of an inode. Never handed out twice on the same volume.
pub type InodeId = u32;

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Copy, Clone, Debug, PartialEq, Eq)]
/// This structure __must not exceed 128 bytes.__
pub struct Inode {
    /// Identity of the file, `NULL_POINTER` while the slot is unallocated.
    pub id: InodeId,
    /// The file mode (e.g full access - rwxrwxrwx).
    pub mode: u16,
    /// The number of links to this file.
    pub links_count: u16,
    /// The id of the owning user.
    pub uid: u16,
    /// The id of the owning group.
    pub gid: u16,
    /// The total size of the file in bytes.
    pub size: u32,
    /// Data blocks of the file in order, unused slots hold `NULL_POINTER`.
    pub blocks: [u32; NUM_DIRECT_POINTERS],
    /// Block holding further data block numbers, or `NULL_POINTER`.
    pub indirect: u32,
    /// Reserved for future expansion of file attributes up to the 128 byte limit.
    padding: [u32; 15],
}

impl Inode {
    /// An unallocated slot.
    pub fn empty() -> Self {
        Self {
            id: NULL_POINTER,
            mode: 0,
            links_count: 0,
            uid: 0,
            gid: 0,
            size: 0,
            blocks: [NULL_POINTER; NUM_DIRECT_POINTERS],
            indirect: NULL_POINTER,
            padding: [0; 15],
        }
    }

    /// A fresh zero length regular file.
    pub fn new(id: InodeId) -> Self {
        Self {
            id,
            mode: FILE_DEFAULT_MODE,
            links_count: 1,
            ..Self::empty()
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.id != NULL_POINTER
    }

    /// Populated direct pointers, in file order.
    pub fn direct_blocks(&self) -> impl Iterator<Item = u32> + '_ {
        self.blocks.iter().copied().take_while(|&b| b != NULL_POINTER)
    }

    pub fn has_indirect(&self) -> bool {
        self.indirect != NULL_POINTER
    }
}

/// Fixed capacity registry of inodes.
///
/// Slots mirror the on-disk inode table one to one. Free slots are kept in an
/// ordered free list so allocation never scans the table, and an id index maps
/// identities to slots.
pub struct InodeTable {
    nodes: Vec<Inode>,
    index: BTreeMap<InodeId, usize>,
    free_slots: BTreeSet<usize>,
    next_id: InodeId,
    /// Disk blocks of the table touched since the last flush.
    dirty: BTreeSet<usize>,
}

impl InodeTable {
    /// An empty table with room for `capacity` inodes.
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: vec![Inode::empty(); capacity],
            index: BTreeMap::new(),
            free_slots: (0..capacity).collect(),
            next_id: 0,
            dirty: BTreeSet::new(),
        }
    }

    /// Rebuilds the table from its serialized blocks. Records that fail to
    /// parse or repeat an identity mark the volume corrupt.
    pub fn open(capacity: usize, next_id: InodeId, table: &[u8]) -> Result<Self> {
        let mut group = Self::new(capacity);
        group.next_id = next_id;
        for slot in 0..capacity {
            let start = slot * NODE_SIZE;
            let node = table
                .get(start..start + NODE_SIZE)
                .and_then(Inode::read_from)
                .ok_or(SFSError::CorruptVolume)?;
            if !node.is_allocated() {
                continue;
            }
            if node.id >= next_id || group.index.insert(node.id, slot).is_some() {
                return Err(SFSError::CorruptVolume);
            }
            group.nodes[slot] = node;
            group.free_slots.remove(&slot);
        }
        Ok(group)
    }

    pub fn has_room(&self) -> bool {
        !self.free_slots.is_empty() && self.next_id != NULL_POINTER
    }

    pub fn total_nodes(&self) -> usize {
        self.index.len()
    }

    /// The identity the next `create` hands out.
    pub fn next_id(&self) -> InodeId {
        self.next_id
    }

    /// Allocates a zeroed inode with an identity never used before.
    ///
    /// # Errors
    ///
    /// Returns `TableFull` when every slot is taken.
    pub fn create(&mut self) -> Result<Inode> {
        if !self.has_room() {
            return Err(SFSError::TableFull("inode table"));
        }
        let slot = match self.free_slots.iter().next() {
            Some(&slot) => slot,
            None => return Err(SFSError::TableFull("inode table")),
        };
        self.free_slots.remove(&slot);

        let node = Inode::new(self.next_id);
        self.next_id += 1;
        self.nodes[slot] = node;
        self.index.insert(node.id, slot);
        self.mark_dirty(slot);
        debug!("created inode {} in slot {}", node.id, slot);
        Ok(node)
    }

    pub fn lookup(&self, id: InodeId) -> Result<Inode> {
        self.index
            .get(&id)
            .map(|&slot| self.nodes[slot])
            .ok_or(SFSError::NotFound)
    }

    /// Replaces the record stored for `id`. The identity inside `node` is
    /// ignored; a slot always keeps the identity it was created with.
    pub fn update(&mut self, id: InodeId, node: Inode) -> Result<()> {
        let slot = *self.index.get(&id).ok_or(SFSError::NotFound)?;
        self.nodes[slot] = Inode { id, ..node };
        self.mark_dirty(slot);
        Ok(())
    }

    /// Returns the slot of `id` to the free pool, handing back the prior record
    /// so its blocks can be released.
    pub fn remove(&mut self, id: InodeId) -> Result<Inode> {
        let slot = self.index.remove(&id).ok_or(SFSError::NotFound)?;
        let node = std::mem::replace(&mut self.nodes[slot], Inode::empty());
        self.free_slots.insert(slot);
        self.mark_dirty(slot);
        debug!("removed inode {} from slot {}", id, slot);
        Ok(node)
    }

    fn mark_dirty(&mut self, slot: usize) {
        self.dirty.insert(slot / NODES_PER_BLOCK);
    }

    /// Table blocks modified since they were last marked clean.
    pub fn dirty_blocks(&self) -> Vec<usize> {
        self.dirty.iter().copied().collect()
    }

    pub fn mark_clean(&mut self, disk_block: usize) {
        self.dirty.remove(&disk_block);
    }

    /// Serializes an entire disk block of inodes for writing to disk.
    pub fn serialize_block(&self, disk_block: usize) -> Vec<u8> {
        let mut block_buf = vec![0; BLOCK_SIZE];
        let offset = disk_block * NODES_PER_BLOCK;
        let end = std::cmp::min(offset + NODES_PER_BLOCK, self.nodes.len());
        for (i, node) in self.nodes[offset.min(end)..end].iter().enumerate() {
            let start = i * NODE_SIZE;
            block_buf[start..start + NODE_SIZE].copy_from_slice(node.as_bytes());
        }
        block_buf
    }
}
