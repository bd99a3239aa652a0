use crate::alloc::{Bitmap, BlockAllocator};
use crate::dir::{validate_name, Directory};
use crate::file::{FileDescriptor, OpenFileTable};
use crate::io::{BlockNumber, BlockStorage};
use crate::node::{Inode, InodeId, InodeTable};
use crate::sb::{SuperBlock, SUPERBLOCK_INDEX};

use log::{debug, info, warn};
use std::collections::BTreeSet;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes};

pub const SB_MAGIC: u32 = 0x5346_5342; // SFSB

pub const BLOCK_SIZE: usize = 1024;
/// Longest file name in bytes.
pub const MAX_FILE_NAME_LENGTH: usize = 16;
pub const NUM_DIRECT_POINTERS: usize = 12;
/// Block numbers held by one indirect block.
pub const POINTERS_PER_BLOCK: usize = BLOCK_SIZE / std::mem::size_of::<u32>();
/// Most data blocks a single file can address.
pub const MAX_FILE_BLOCKS: usize = NUM_DIRECT_POINTERS + POINTERS_PER_BLOCK;
/// Marks unused pointer slots and unallocated inode identities.
pub const NULL_POINTER: u32 = u32::MAX;

#[derive(Error, Debug)]
pub enum SFSError {
    #[error("found no file with that name")]
    NotFound,
    #[error("file {0:?} already exists")]
    AlreadyExists(String),
    #[error("file name {0:?} is longer than {} bytes", MAX_FILE_NAME_LENGTH)]
    NameTooLong(String),
    #[error("file name must not be empty")]
    InvalidName,
    #[error("{0} is full")]
    TableFull(&'static str),
    #[error("file would span {blocks} blocks, more than a file can address")]
    CapacityExceeded { blocks: usize },
    #[error("requested {requested} blocks but only {available} are free")]
    InsufficientSpace { requested: usize, available: usize },
    #[error("file descriptor {0} is not open")]
    InvalidDescriptor(FileDescriptor),
    #[error("block {0} is not an allocated data block")]
    InvalidBlock(BlockNumber),
    #[error("no more files in directory")]
    EndOfDirectory,
    #[error("volume is corrupt or was never formatted")]
    CorruptVolume,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("block device failure")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SFSError>;

/// Sizing of a volume's tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Most files the volume can hold. Fixed when the volume is formatted and
    /// read back from the super block afterwards.
    pub inode_count: usize,
    /// Most descriptors open at once. Not persisted.
    pub max_open_files: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inode_count: 64,
            max_open_files: 32,
        }
    }
}

/// Metadata of one file as reported by `SFS::stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub inode: InodeId,
    pub mode: u16,
    pub links_count: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: usize,
    /// Data region blocks owned by the file, including its indirect block.
    pub blocks: usize,
}

fn blocks_for(bytes: usize) -> usize {
    bytes / BLOCK_SIZE + (bytes % BLOCK_SIZE != 0) as usize
}

/// A small flat file system on a fixed-size block device.
///
/// Owns every table of one mounted volume: the data block bitmap, the inode
/// table, the directory and the open file table. All metadata changes are
/// written through to the device before an operation returns.
pub struct SFS<T: BlockStorage> {
    dev: T,
    super_block: SuperBlock,
    data_map: BlockAllocator,
    inodes: InodeTable,
    directory: Directory,
    open_files: OpenFileTable,
}

impl<T: BlockStorage> SFS<T> {
    /// Mounts the volume on `dev` with the default configuration. A `fresh`
    /// mount formats the device, otherwise the existing volume is loaded.
    ///
    /// # Errors
    ///
    /// Returns `CorruptVolume` if an existing volume fails validation.
    pub fn mount(dev: T, fresh: bool) -> Result<Self> {
        Self::mount_with_config(dev, fresh, Config::default())
    }

    pub fn mount_with_config(dev: T, fresh: bool, config: Config) -> Result<Self> {
        if config.max_open_files == 0 {
            return Err(SFSError::InvalidArgument(
                "open file table must hold at least one descriptor".to_string(),
            ));
        }
        if fresh {
            Self::format(dev, &config)
        } else {
            Self::load(dev, &config)
        }
    }

    /// Initializes the file system onto owned block storage.
    fn format(dev: T, config: &Config) -> Result<Self> {
        let super_block = SuperBlock::format(dev.block_count(), config.inode_count)?;
        let mut fs = SFS {
            dev,
            data_map: BlockAllocator::new(
                super_block.data_start as BlockNumber,
                super_block.data_blocks as usize,
            ),
            inodes: InodeTable::new(config.inode_count),
            directory: Directory::new(config.inode_count),
            open_files: OpenFileTable::new(config.max_open_files),
            super_block,
        };

        fs.dev
            .write_block(SUPERBLOCK_INDEX, &fs.super_block.serialize())?;
        fs.write_bitmap()?;
        for i in 0..fs.super_block.inode_table_blocks as usize {
            let block = fs.inodes.serialize_block(i);
            fs.dev
                .write_block(fs.super_block.inode_table_start as usize + i, &block)?;
        }
        for i in 0..fs.super_block.directory_blocks as usize {
            let block = fs.directory.serialize_block(i);
            fs.dev
                .write_block(fs.super_block.directory_start as usize + i, &block)?;
        }
        fs.dev.sync_disk()?;

        info!(
            "formatted volume of {} blocks: {} data blocks from block {}, {} inodes",
            fs.super_block.block_count,
            fs.super_block.data_blocks,
            fs.super_block.data_start,
            fs.super_block.inodes_count
        );
        Ok(fs)
    }

    /// Re-hydrates every table from an existing volume.
    fn load(mut dev: T, config: &Config) -> Result<Self> {
        let mut block_buf = vec![0; BLOCK_SIZE];
        dev.read_block(SUPERBLOCK_INDEX, &mut block_buf)?;
        let super_block = SuperBlock::parse(&block_buf, dev.block_count()).map_err(|e| {
            warn!("refusing to mount: {}", e);
            e
        })?;

        let bitmap = read_region(&mut dev, super_block.bitmap_start, super_block.bitmap_blocks)?;
        let data_map = BlockAllocator::open(
            super_block.data_start as BlockNumber,
            Bitmap::parse(&bitmap, super_block.data_blocks as usize),
        );

        let capacity = super_block.inodes_count as usize;
        let table = read_region(
            &mut dev,
            super_block.inode_table_start,
            super_block.inode_table_blocks,
        )?;
        let inodes = InodeTable::open(capacity, super_block.next_inode_id, &table)?;

        let region = read_region(
            &mut dev,
            super_block.directory_start,
            super_block.directory_blocks,
        )?;
        let directory = Directory::open(capacity, &region)?;

        // One directory entry per live inode, and nothing else.
        let linked: BTreeSet<InodeId> = directory.iter().map(|(_, id)| id).collect();
        if directory.len() != inodes.total_nodes()
            || linked.len() != inodes.total_nodes()
            || linked.iter().any(|&id| inodes.lookup(id).is_err())
        {
            warn!("refusing to mount: directory and inode table disagree");
            return Err(SFSError::CorruptVolume);
        }

        info!(
            "mounted volume with {} files, {} of {} data blocks free",
            inodes.total_nodes(),
            data_map.available(),
            super_block.data_blocks
        );
        Ok(SFS {
            dev,
            super_block,
            data_map,
            inodes,
            directory,
            open_files: OpenFileTable::new(config.max_open_files),
        })
    }

    /// Opens the file called `name`, creating it empty if it does not exist.
    /// Every call returns a new descriptor positioned at the start of the file.
    ///
    /// # Errors
    ///
    /// `NameTooLong` or `InvalidName` for names that cannot be stored, `TableFull`
    /// when the open file table, inode table or directory has no room. Nothing is
    /// created when an error is returned.
    pub fn open(&mut self, name: &str) -> Result<FileDescriptor> {
        validate_name(name)?;
        if !self.open_files.has_room() {
            warn!("cannot open {:?}: too many open files", name);
            return Err(SFSError::TableFull("open file table"));
        }

        let inode = match self.directory.lookup(name) {
            Ok(inode) => inode,
            Err(SFSError::NotFound) => self.create_file(name)?,
            Err(e) => return Err(e),
        };
        let fd = self.open_files.open(inode)?;
        debug!("opened {:?} (inode {}) as fd {}", name, inode, fd);
        Ok(fd)
    }

    fn create_file(&mut self, name: &str) -> Result<InodeId> {
        if !self.inodes.has_room() {
            warn!("cannot create {:?}: inode table is full", name);
            return Err(SFSError::TableFull("inode table"));
        }
        if !self.directory.has_room() {
            warn!("cannot create {:?}: directory is full", name);
            return Err(SFSError::TableFull("directory"));
        }

        let node = self.inodes.create()?;
        if let Err(e) = self.directory.create(name, node.id) {
            self.inodes.remove(node.id)?;
            return Err(e);
        }
        self.flush()?;
        info!("created {:?} with inode {}", name, node.id);
        Ok(node.id)
    }

    /// Releases a descriptor. Descriptors of removed files can still be closed.
    pub fn close(&mut self, fd: FileDescriptor) -> Result<()> {
        let entry = self.open_files.close(fd)?;
        debug!("closed fd {} (inode {})", fd, entry.inode);
        Ok(())
    }

    /// Truncates the file at the descriptor's offset and appends `buf`, so
    /// writing at offset 0 replaces the whole content and successive writes
    /// append. A gap between the end of the file and the offset reads back as
    /// zeroes. Advances the offset past the written bytes.
    ///
    /// Blocks before the offset are kept in place; every block from the one
    /// holding the offset onwards is released and replaced. An empty `buf`
    /// truncates the file at the offset.
    ///
    /// # Errors
    ///
    /// `InvalidDescriptor` for unknown descriptors, `NotFound` if the file was
    /// removed, `CapacityExceeded` past the pointer capacity of a file and
    /// `InsufficientSpace` when the volume is too full. Nothing changes on error.
    pub fn write(&mut self, fd: FileDescriptor, buf: &[u8]) -> Result<usize> {
        let mut entry = self.open_files.get(fd)?;
        let mut node = self.inodes.lookup(entry.inode)?;

        let offset = entry.offset;
        let end = offset
            .checked_add(buf.len())
            .ok_or(SFSError::CapacityExceeded { blocks: usize::MAX })?;
        let total_blocks = blocks_for(end);
        if total_blocks > MAX_FILE_BLOCKS {
            warn!(
                "write of {} bytes at {} to inode {} needs {} blocks",
                buf.len(),
                offset,
                node.id,
                total_blocks
            );
            return Err(SFSError::CapacityExceeded {
                blocks: total_blocks,
            });
        }

        let old_blocks = self.block_list(&node)?;
        let keep = std::cmp::min(offset / BLOCK_SIZE, old_blocks.len());
        let needs_indirect = total_blocks > NUM_DIRECT_POINTERS;

        let mut released = old_blocks[keep..].to_vec();
        if node.has_indirect() && !needs_indirect {
            released.push(node.indirect as BlockNumber);
        }
        let fresh_blocks = total_blocks - keep;
        let new_indirect = needs_indirect && !node.has_indirect();
        let required = fresh_blocks + new_indirect as usize;
        let available = self.data_map.available() + released.len();
        if required > available {
            warn!(
                "write to inode {} needs {} blocks, {} available",
                node.id, required, available
            );
            return Err(SFSError::InsufficientSpace {
                requested: required,
                available,
            });
        }

        // Rewritten content from the start of block `keep`: what survives of that
        // block, zeroes up to the offset, then the new bytes.
        let head = offset - keep * BLOCK_SIZE;
        let mut content = vec![0; head];
        if keep < old_blocks.len() && head > 0 {
            let mut block_buf = vec![0; BLOCK_SIZE];
            self.dev.read_block(old_blocks[keep], &mut block_buf)?;
            content.copy_from_slice(&block_buf[..head]);
        }
        content.extend_from_slice(buf);

        self.data_map.free(&mut self.dev, &released)?;
        let mut fresh = self.data_map.allocate(required)?;
        let indirect = if !needs_indirect {
            None
        } else if new_indirect {
            fresh.pop()
        } else {
            Some(node.indirect as BlockNumber)
        };

        for (chunk, &block) in content.chunks(BLOCK_SIZE).zip(fresh.iter()) {
            let mut block_buf = vec![0; BLOCK_SIZE];
            block_buf[..chunk.len()].copy_from_slice(chunk);
            self.dev.write_block(block, &block_buf)?;
        }

        let mut blocks = old_blocks[..keep].to_vec();
        blocks.extend(fresh);
        self.set_pointers(&mut node, &blocks, indirect)?;
        node.size = end as u32;
        self.inodes.update(node.id, node)?;

        entry.offset = end;
        self.open_files.set(fd, entry)?;
        self.flush()?;
        debug!(
            "wrote {} bytes to inode {} at {}, size now {} in {} blocks",
            buf.len(),
            node.id,
            offset,
            end,
            blocks.len()
        );
        Ok(buf.len())
    }

    /// Reads up to `length` bytes from the descriptor's offset, stopping at the
    /// end of the file, and advances the offset by the number of bytes read.
    pub fn read(&mut self, fd: FileDescriptor, length: usize) -> Result<Vec<u8>> {
        let mut entry = self.open_files.get(fd)?;
        let node = self.inodes.lookup(entry.inode)?;
        let size = node.size as usize;
        if entry.offset >= size || length == 0 {
            return Ok(Vec::new());
        }

        let end = std::cmp::min(size, entry.offset.saturating_add(length));
        let blocks = self.block_list(&node)?;
        let mut content = Vec::with_capacity(end - entry.offset);
        let mut block_buf = vec![0; BLOCK_SIZE];
        let mut pos = entry.offset;
        while pos < end {
            let block = *blocks
                .get(pos / BLOCK_SIZE)
                .ok_or(SFSError::CorruptVolume)?;
            self.dev.read_block(block, &mut block_buf)?;

            let within = pos % BLOCK_SIZE;
            let take = std::cmp::min(BLOCK_SIZE - within, end - pos);
            content.extend_from_slice(&block_buf[within..within + take]);
            pos += take;
        }

        debug!(
            "read {} bytes from inode {} at {}",
            content.len(),
            node.id,
            entry.offset
        );
        entry.offset = end;
        self.open_files.set(fd, entry)?;
        Ok(content)
    }

    /// Moves the descriptor's offset to `pos`. Positions past the end of the file
    /// are allowed.
    pub fn seek(&mut self, fd: FileDescriptor, pos: usize) -> Result<()> {
        let mut entry = self.open_files.get(fd)?;
        self.inodes.lookup(entry.inode)?;
        entry.offset = pos;
        self.open_files.set(fd, entry)?;
        debug!("fd {} now at {}", fd, pos);
        Ok(())
    }

    /// Deletes the file called `name` and releases all of its blocks.
    ///
    /// Descriptors still open on the file are left dangling: they fail with
    /// `NotFound` on their next read, write or seek.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let id = self.directory.lookup(name)?;
        let node = self.inodes.lookup(id)?;

        let mut blocks = self.block_list(&node)?;
        if node.has_indirect() {
            blocks.push(node.indirect as BlockNumber);
        }
        self.data_map.free(&mut self.dev, &blocks)?;
        self.directory.remove(name)?;
        self.inodes.remove(id)?;
        self.flush()?;

        let dangling = self.open_files.open_count(id);
        if dangling > 0 {
            warn!("removed {:?} with {} descriptors still open", name, dangling);
        }
        info!("removed {:?} (inode {}), released {} blocks", name, id, blocks.len());
        Ok(())
    }

    /// Size in bytes of the file called `name`.
    pub fn file_size(&self, name: &str) -> Result<usize> {
        Ok(self.stat(name)?.size)
    }

    /// Returns the next file name of the directory listing. The listing starts
    /// at mount and runs once over the directory in slot order; files created or
    /// removed ahead of the listing are seen as they are when it gets there.
    ///
    /// # Errors
    ///
    /// `EndOfDirectory` once the listing is exhausted, for the rest of the mount.
    pub fn next_filename(&mut self) -> Result<String> {
        self.directory.next_entry()
    }

    pub fn stat(&self, name: &str) -> Result<FileStat> {
        let node = self.inodes.lookup(self.directory.lookup(name)?)?;
        Ok(FileStat {
            inode: node.id,
            mode: node.mode,
            links_count: node.links_count,
            uid: node.uid,
            gid: node.gid,
            size: node.size as usize,
            blocks: blocks_for(node.size as usize) + node.has_indirect() as usize,
        })
    }

    /// Number of free blocks in the data region.
    pub fn free_blocks(&self) -> usize {
        self.data_map.available()
    }

    pub fn sync(&mut self) -> Result<()> {
        self.dev.sync_disk()?;
        Ok(())
    }

    /// Flushes the volume and hands the device back.
    pub fn unmount(mut self) -> Result<T> {
        self.flush()?;
        self.dev.sync_disk()?;
        info!("unmounted volume");
        Ok(self.dev)
    }

    /// Data blocks of `node` in file order, direct pointers first.
    fn block_list(&mut self, node: &Inode) -> Result<Vec<BlockNumber>> {
        let mut blocks: Vec<BlockNumber> =
            node.direct_blocks().map(|b| b as BlockNumber).collect();
        if node.has_indirect() {
            let mut block_buf = vec![0; BLOCK_SIZE];
            self.dev
                .read_block(node.indirect as BlockNumber, &mut block_buf)?;
            blocks.extend(
                block_buf
                    .chunks_exact(4)
                    .filter_map(u32::read_from)
                    .take_while(|&b| b != NULL_POINTER)
                    .map(|b| b as BlockNumber),
            );
        }
        Ok(blocks)
    }

    /// Points `node` at `blocks`, spilling past the direct pointers into the
    /// `indirect` block.
    fn set_pointers(
        &mut self,
        node: &mut Inode,
        blocks: &[BlockNumber],
        indirect: Option<BlockNumber>,
    ) -> Result<()> {
        node.blocks = [NULL_POINTER; NUM_DIRECT_POINTERS];
        for (slot, &block) in node.blocks.iter_mut().zip(blocks) {
            *slot = block as u32;
        }

        node.indirect = match indirect {
            Some(indirect) => {
                let mut pointers = vec![NULL_POINTER; POINTERS_PER_BLOCK];
                for (slot, &block) in pointers
                    .iter_mut()
                    .zip(blocks.iter().skip(NUM_DIRECT_POINTERS))
                {
                    *slot = block as u32;
                }
                self.dev.write_block(indirect, pointers.as_bytes())?;
                indirect as u32
            }
            None => NULL_POINTER,
        };
        Ok(())
    }

    /// Writes every modified metadata block back to the device.
    fn flush(&mut self) -> Result<()> {
        // Dirty marks are only cleared once their block is on the device.
        let next_inode_id = self.inodes.next_id();
        if self.super_block.next_inode_id != next_inode_id {
            let updated = SuperBlock {
                next_inode_id,
                ..self.super_block
            };
            self.dev.write_block(SUPERBLOCK_INDEX, &updated.serialize())?;
            self.super_block = updated;
        }
        for i in self.inodes.dirty_blocks() {
            let block = self.inodes.serialize_block(i);
            self.dev
                .write_block(self.super_block.inode_table_start as usize + i, &block)?;
            self.inodes.mark_clean(i);
        }
        for i in self.directory.dirty_blocks() {
            let block = self.directory.serialize_block(i);
            self.dev
                .write_block(self.super_block.directory_start as usize + i, &block)?;
            self.directory.mark_clean(i);
        }
        if self.data_map.is_dirty() {
            self.write_bitmap()?;
            self.data_map.mark_clean();
        }
        Ok(())
    }

    fn write_bitmap(&mut self) -> Result<()> {
        let bytes = self.data_map.bitmap().serialize();
        for i in 0..self.super_block.bitmap_blocks as usize {
            let mut block_buf = vec![0; BLOCK_SIZE];
            let start = std::cmp::min(i * BLOCK_SIZE, bytes.len());
            let end = std::cmp::min(start + BLOCK_SIZE, bytes.len());
            block_buf[..end - start].copy_from_slice(&bytes[start..end]);
            self.dev
                .write_block(self.super_block.bitmap_start as usize + i, &block_buf)?;
        }
        Ok(())
    }
}

fn read_region<T: BlockStorage>(dev: &mut T, start: u32, count: u32) -> Result<Vec<u8>> {
    let mut region = vec![0; count as usize * BLOCK_SIZE];
    for (i, block_buf) in region.chunks_mut(BLOCK_SIZE).enumerate() {
        dev.read_block(start as usize + i, block_buf)?;
    }
    Ok(region)
}
