//! A small flat file system in the ext2/UFS tradition.
//!
//! The device is carved into five consecutive regions:
//!
//! ==============================================================================
//! | SuperBlock | Bitmap (data region) | Bitmap (inodes) | Inodes | Data Region |
//! ==============================================================================
//!
//! The three pieces doing the real work are pure functions over integers and
//! byte buffers: [`layout::plan`] sizes the regions, [`BlockMap::resolve`] turns a
//! file's logical block number into the chain of indirect blocks leading to it and
//! [`alloc::find_free_run`] finds free units in a bitmap. [`Tptfs`] glues them to a
//! [`io::BlockStorage`] device.
#[macro_use]
extern crate log;

pub mod alloc;
pub mod bmap;
mod fs;
pub mod io;
pub mod layout;
mod sb;

pub use crate::bmap::{BlockMap, BlockRef, Indirect, IndirectionPath};
pub use crate::fs::{Result, Tptfs, TptfsError};
pub use crate::layout::{plan, Region, RegionLayout, StorageBudget};
pub use crate::sb::SuperBlock;

/// 4k is a common page size for file systems and the one the defaults assume.
pub const PAGE_SIZE: u32 = 4096;
/// Bytes taken by a single inode table entry.
pub const INODE_SIZE: u32 = 256;
/// Expected average file size in pages, used to decide how many inodes to carve out.
pub const PAGES_PER_FILE: u32 = 1;
/// Inodes handed out at format time (the root directory).
pub const RESERVED_INODES: u32 = 1;

/// Direct block pointers stored in every inode.
pub const N_DIRECT: u64 = 12;
/// Width of an on-disk block pointer in bytes.
pub const POINTER_SIZE: u32 = 8;
/// Block pointers held by one indirect block.
pub const PTRS_PER_BLOCK: u64 = (PAGE_SIZE / POINTER_SIZE) as u64;
/// Single, double and triple indirect pointers.
pub const N_INDIRECT: usize = 3;
