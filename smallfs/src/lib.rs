//! A small flat file system layered over a raw fixed-size block device.
//!
//! Files live in a single directory and are addressed by name. A volume is
//! mounted onto any [`io::BlockStorage`] and exposes a POSIX-like API through
//! [`SFS`]: open, close, read, write, seek, remove, file sizes and a one-shot
//! directory listing.

mod alloc;
mod dir;
mod file;
mod fs;
pub mod io;
mod node;
mod sb;

pub use crate::file::FileDescriptor;
pub use crate::fs::{
    Config, FileStat, Result, SFSError, BLOCK_SIZE, MAX_FILE_BLOCKS, MAX_FILE_NAME_LENGTH,
    NUM_DIRECT_POINTERS, SFS,
};
pub use crate::node::InodeId;
