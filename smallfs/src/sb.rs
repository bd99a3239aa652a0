use crate::dir::DIR_ENTRY_SIZE;
use crate::fs::{Result, SFSError, BLOCK_SIZE, SB_MAGIC};
use crate::node::NODE_SIZE;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Index of the super block on every volume.
pub const SUPERBLOCK_INDEX: usize = 0;

/// The first block of the file system storing information critical for mounting
/// the file system and verifying the underlying disk is formatted correctly.
///
/// Every region after the super block is described here, so a volume can be
/// re-hydrated without knowing the configuration it was formatted with.
///
/// # Layout
/// ===============================================================================
/// | SuperBlock | Bitmap (data region) | Inode table | Directory | Data Region |
/// ===============================================================================
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Debug, PartialEq, Eq, Clone, Copy)]
pub struct SuperBlock {
    /// A 32-bit identifying string, in this case SFSB.
    pub sb_magic: u32,
    /// Size in bytes of every block on the volume.
    pub block_size: u32,
    /// Total number of blocks on the volume including the reserved regions.
    pub block_count: u32,
    pub bitmap_start: u32,
    pub bitmap_blocks: u32,
    pub inode_table_start: u32,
    pub inode_table_blocks: u32,
    /// Capacity of the inode table, which is also the capacity of the directory.
    pub inodes_count: u32,
    pub directory_start: u32,
    pub directory_blocks: u32,
    /// First block governed by the data bitmap.
    pub data_start: u32,
    pub data_blocks: u32,
    /// The identity the next created inode receives. Only ever grows.
    pub next_inode_id: u32,
}

fn blocks_for(bytes: usize) -> usize {
    (bytes + BLOCK_SIZE - 1) / BLOCK_SIZE
}

impl SuperBlock {
    /// Computes the layout of a fresh volume spanning `block_count` blocks with
    /// room for `inodes_count` files.
    pub fn format(block_count: usize, inodes_count: usize) -> Result<Self> {
        if inodes_count == 0 {
            return Err(SFSError::InvalidArgument(
                "inode table must hold at least one inode".to_string(),
            ));
        }
        // Block numbers are stored as u32 with u32::MAX reserved as a sentinel.
        if block_count >= u32::MAX as usize || inodes_count >= u32::MAX as usize {
            return Err(SFSError::InvalidArgument(
                "volume geometry exceeds 32-bit block addressing".to_string(),
            ));
        }

        let bitmap_blocks = blocks_for((block_count + 7) / 8);
        let inode_table_blocks = blocks_for(inodes_count * NODE_SIZE);
        let directory_blocks = blocks_for(inodes_count * DIR_ENTRY_SIZE);
        let reserved = 1 + bitmap_blocks + inode_table_blocks + directory_blocks;
        if block_count <= reserved {
            return Err(SFSError::InvalidArgument(format!(
                "{} blocks leave no data region after {} reserved blocks",
                block_count, reserved
            )));
        }

        let bitmap_start = SUPERBLOCK_INDEX + 1;
        let inode_table_start = bitmap_start + bitmap_blocks;
        let directory_start = inode_table_start + inode_table_blocks;
        let data_start = directory_start + directory_blocks;

        Ok(Self {
            sb_magic: SB_MAGIC,
            block_size: BLOCK_SIZE as u32,
            block_count: block_count as u32,
            bitmap_start: bitmap_start as u32,
            bitmap_blocks: bitmap_blocks as u32,
            inode_table_start: inode_table_start as u32,
            inode_table_blocks: inode_table_blocks as u32,
            inodes_count: inodes_count as u32,
            directory_start: directory_start as u32,
            directory_blocks: directory_blocks as u32,
            data_start: data_start as u32,
            data_blocks: (block_count - data_start) as u32,
            next_inode_id: 0,
        })
    }

    /// Reads the super block from the first block of a volume and checks it
    /// describes a layout that fits on a device of `device_blocks` blocks.
    ///
    /// # Errors
    ///
    /// Returns `CorruptVolume` if the magic number does not match or the
    /// described layout is inconsistent.
    pub fn parse(buf: &[u8], device_blocks: usize) -> Result<Self> {
        let sb = SuperBlock::read_from_prefix(buf).ok_or(SFSError::CorruptVolume)?;
        if sb.sb_magic != SB_MAGIC {
            return Err(SFSError::CorruptVolume);
        }
        if sb.block_size as usize != BLOCK_SIZE || sb.block_count as usize > device_blocks {
            return Err(SFSError::CorruptVolume);
        }

        // A well-formed super block is exactly the layout format would produce.
        let expected = SuperBlock::format(sb.block_count as usize, sb.inodes_count as usize)
            .map_err(|_| SFSError::CorruptVolume)?;
        let expected = SuperBlock {
            next_inode_id: sb.next_inode_id,
            ..expected
        };
        if expected != sb {
            return Err(SFSError::CorruptVolume);
        }
        Ok(sb)
    }

    /// Serializes the SuperBlock into a BLOCK_SIZE buffer for writing to disk.
    pub fn serialize(&self) -> Vec<u8> {
        let mut block = vec![0; BLOCK_SIZE];
        block[..std::mem::size_of::<Self>()].copy_from_slice(self.as_bytes());
        block
    }
}
