use crate::fs::{Result, SFSError, BLOCK_SIZE};
use crate::io::{BlockNumber, BlockStorage};

use log::debug;
use std::collections::BTreeSet;
use zerocopy::{AsBytes, FromBytes};

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

/// Stores one bit per logical block packed into 64 bit words. A single 1K
/// block of bitmap tracks 1024 * 8 logical blocks.
#[derive(Clone, Debug, PartialEq)]
pub struct Bitmap {
    bitmap: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// Creates a bitmap tracking `len` blocks, all of them free.
    pub fn new(len: usize) -> Self {
        Self {
            bitmap: vec![0; (len + 63) / 64],
            len,
        }
    }

    /// Reads `len` bits back from a buffer produced by `serialize`. Bits past
    /// `len` are ignored.
    pub fn parse(buf: &[u8], len: usize) -> Self {
        let mut map = Self::new(len);
        let words = buf.chunks_exact(8).filter_map(u64::read_from);
        for (word, raw) in map.bitmap.iter_mut().zip(words) {
            *word = raw;
        }
        let tail = len % 64;
        if tail != 0 {
            if let Some(last) = map.bitmap.last_mut() {
                *last &= (1_u64 << tail) - 1;
            }
        }
        map
    }

    pub fn serialize(&self) -> &[u8] {
        self.bitmap.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn get(&self, blocknr: usize) -> State {
        assert!(blocknr < self.len);
        // Grab of the u64 containing the significant bit.
        let outer_offset = self.bitmap[blocknr / 64];

        let inner_offset = blocknr % 64;
        let mask = 0b01_u64 << inner_offset;
        if outer_offset & mask == 0 {
            State::Free
        } else {
            State::Used
        }
    }

    pub fn set_reserved(&mut self, blocknr: usize) {
        assert!(blocknr < self.len);
        let mask = 0b01_u64 << (blocknr % 64);
        self.bitmap[blocknr / 64] |= mask;
    }

    pub fn set_free(&mut self, blocknr: usize) {
        assert!(blocknr < self.len);
        let mask = 0b01_u64 << (blocknr % 64);
        self.bitmap[blocknr / 64] &= !mask;
    }

    /// Number of bits currently clear.
    pub fn count_free(&self) -> usize {
        let used: u32 = self.bitmap.iter().map(|word| word.count_ones()).sum();
        self.len - used as usize
    }
}

/// Walks the free bits of a bitmap first-fit, starting at a marker and wrapping
/// around once to the bits before it.
struct NextAvailableAllocation<'a> {
    bitmap: &'a Bitmap,
    /// Keeps track of the next starting place for looking for available blocks.
    marker: usize,
    /// How many bits have been examined so far, the walk stops after one lap.
    scanned: usize,
}

impl<'a> NextAvailableAllocation<'a> {
    fn new(bitmap: &'a Bitmap, marker: usize) -> Self {
        Self {
            bitmap,
            marker,
            scanned: 0,
        }
    }
}

impl<'a> Iterator for NextAvailableAllocation<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let cap = self.bitmap.len();
        while self.scanned < cap {
            let i = (self.marker + self.scanned) % cap;
            self.scanned += 1;
            if let State::Free = self.bitmap.get(i) {
                return Some(i);
            }
        }
        None
    }
}

/// Hands out the data region of a volume one block at a time.
///
/// Block numbers going in and out of the allocator are absolute device block
/// numbers; bit `i` of the bitmap governs block `first_block + i`. A block is
/// marked used exactly while one live inode points at it.
pub struct BlockAllocator {
    bitmap: Bitmap,
    first_block: BlockNumber,
    /// Bit index where the next search starts.
    marker: usize,
    free: usize,
    dirty: bool,
}

impl BlockAllocator {
    /// An allocator over `count` blocks starting at `first_block`, all free.
    pub fn new(first_block: BlockNumber, count: usize) -> Self {
        Self::open(first_block, Bitmap::new(count))
    }

    /// An allocator resuming from a persisted bitmap.
    pub fn open(first_block: BlockNumber, bitmap: Bitmap) -> Self {
        let free = bitmap.count_free();
        Self {
            bitmap,
            first_block,
            marker: 0,
            free,
            dirty: false,
        }
    }

    /// Count of blocks free to allocate.
    pub fn available(&self) -> usize {
        self.free
    }

    /// Whether `block` is currently marked used. Blocks outside the data region
    /// are never used.
    pub fn is_used(&self, block: BlockNumber) -> bool {
        match self.bit_of(block) {
            Some(bit) => self.bitmap.get(bit) == State::Used,
            None => false,
        }
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    /// Whether the bitmap changed since it was last marked clean.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    fn bit_of(&self, block: BlockNumber) -> Option<usize> {
        block
            .checked_sub(self.first_block)
            .filter(|bit| *bit < self.bitmap.len())
    }

    /// Reserves `n` distinct free blocks, first-fit from the marker and wrapping
    /// once. Either all `n` blocks are reserved or none are.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientSpace` when fewer than `n` blocks are free.
    pub fn allocate(&mut self, n: usize) -> Result<Vec<BlockNumber>> {
        if n > self.free {
            return Err(SFSError::InsufficientSpace {
                requested: n,
                available: self.free,
            });
        }
        let bits: Vec<usize> = NextAvailableAllocation::new(&self.bitmap, self.marker)
            .take(n)
            .collect();
        if bits.len() < n {
            return Err(SFSError::InsufficientSpace {
                requested: n,
                available: bits.len(),
            });
        }

        for &bit in bits.iter() {
            self.bitmap.set_reserved(bit);
        }
        if let Some(&highest) = bits.iter().max() {
            self.marker = (highest + 1) % self.bitmap.len();
            self.dirty = true;
        }
        self.free -= n;

        let blocks: Vec<BlockNumber> = bits.iter().map(|bit| bit + self.first_block).collect();
        debug!("allocated blocks {:?}, {} left", blocks, self.free);
        Ok(blocks)
    }

    /// Returns `blocks` to the free pool and zeroes their content on `dev` so no
    /// stale data reaches a later owner. Nothing is freed if any block is
    /// invalid.
    ///
    /// # Errors
    ///
    /// Returns `InvalidBlock` if a block lies outside the data region, is
    /// already free, or is listed twice.
    pub fn free<T: BlockStorage>(&mut self, dev: &mut T, blocks: &[BlockNumber]) -> Result<()> {
        let mut seen = BTreeSet::new();
        for &block in blocks {
            let bit = self.bit_of(block).ok_or(SFSError::InvalidBlock(block))?;
            if self.bitmap.get(bit) == State::Free || !seen.insert(bit) {
                return Err(SFSError::InvalidBlock(block));
            }
        }

        let zeroes = [0_u8; BLOCK_SIZE];
        for bit in seen {
            self.bitmap.set_free(bit);
            self.free += 1;
            self.dirty = true;
            dev.write_block(bit + self.first_block, &zeroes)?;
        }
        debug!("freed blocks {:?}, {} left", blocks, self.free);
        Ok(())
    }
}
