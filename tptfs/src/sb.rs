use crate::bmap::BlockMap;
use crate::fs::{Result, TptfsError};
use crate::layout::{RegionLayout, StorageBudget};

use std::convert::TryFrom;
use zerocopy::{AsBytes, FromBytes};

const SB_MAGIC: u32 = 0x5450_5446; // TPTF

/// The first page of the file system storing information critical for mounting
/// the file system and verifying the underlying disk is formatted correctly.
///
/// Keeps the size of every region so the bitmaps, inode table and data region
/// can be found again without re-planning, and the pointer geometry inodes were
/// written with. Encoded in native byte order.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy, Debug, PartialEq)]
pub struct SuperBlock {
    /// A 32-bit identifying string, in this case TPTF.
    pub sb_magic: u32,
    pub page_size: u32,
    pub inode_entry_size: u32,
    pub pages_per_file: u32,
    /// Pages on the device, superblock included.
    pub total_pages: u64,
    pub page_bitmap_pages: u64,
    pub inode_bitmap_pages: u64,
    pub inode_table_pages: u64,
    pub data_pages: u64,
    pub inodes_count: u64,
    /// The number of remaining available inodes.
    pub free_inodes_count: u64,
    /// Data pages available to be allocated.
    pub free_pages_count: u64,
    pub direct_pointers: u64,
    pub ptrs_per_block: u64,
    pub indirect_depth: u32,
    padding: u32,
}

impl SuperBlock {
    fn empty() -> Self {
        Self {
            sb_magic: 0,
            page_size: 0,
            inode_entry_size: 0,
            pages_per_file: 0,
            total_pages: 0,
            page_bitmap_pages: 0,
            inode_bitmap_pages: 0,
            inode_table_pages: 0,
            data_pages: 0,
            inodes_count: 0,
            free_inodes_count: 0,
            free_pages_count: 0,
            direct_pointers: 0,
            ptrs_per_block: 0,
            indirect_depth: 0,
            padding: 0,
        }
    }

    /// Describes a freshly formatted device: every data page is free.
    pub fn from_layout(budget: &StorageBudget, layout: &RegionLayout, map: &BlockMap) -> Self {
        Self {
            sb_magic: SB_MAGIC,
            page_size: budget.page_size(),
            inode_entry_size: budget.inode_entry_size(),
            pages_per_file: budget.pages_per_file(),
            total_pages: layout.total_pages,
            page_bitmap_pages: layout.page_bitmap,
            inode_bitmap_pages: layout.inode_bitmap,
            inode_table_pages: layout.inode_table,
            data_pages: layout.data_region,
            inodes_count: layout.inode_count,
            free_inodes_count: layout.free_inode_count,
            free_pages_count: layout.data_region,
            direct_pointers: map.direct(),
            ptrs_per_block: map.ptrs_per_block(),
            // At most MAX_DEPTH.
            indirect_depth: map.depth() as u32,
            padding: 0,
        }
    }

    /// Reads a superblock from the start of `buf`.
    ///
    /// # Errors
    ///
    /// Fails with [`TptfsError::InvalidSuperBlock`] if the buffer is too short,
    /// the magic constant does not match or the region sizes do not add up.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let size = std::mem::size_of::<Self>();
        if buf.len() < size {
            return Err(TptfsError::InvalidSuperBlock(format!(
                "buffer of {} bytes is shorter than the {} byte superblock",
                buf.len(),
                size
            )));
        }
        let mut sb = Self::empty();
        sb.as_bytes_mut().copy_from_slice(&buf[..size]);
        if sb.sb_magic != SB_MAGIC {
            return Err(TptfsError::InvalidSuperBlock(format!(
                "magic {:#x} is not {:#x}",
                sb.sb_magic, SB_MAGIC
            )));
        }
        let accounted = [
            1,
            sb.page_bitmap_pages,
            sb.inode_bitmap_pages,
            sb.inode_table_pages,
            sb.data_pages,
        ]
        .iter()
        .try_fold(0u64, |sum, &pages| sum.checked_add(pages));
        if accounted != Some(sb.total_pages) {
            return Err(TptfsError::InvalidSuperBlock(format!(
                "regions do not add up to {} pages",
                sb.total_pages
            )));
        }
        Ok(sb)
    }

    /// Serializes the SuperBlock for writing to disk. Callers pad it out to a
    /// full page.
    pub fn serialize(&self) -> &[u8] {
        self.as_bytes()
    }

    pub fn layout(&self) -> RegionLayout {
        RegionLayout {
            total_pages: self.total_pages,
            page_bitmap: self.page_bitmap_pages,
            inode_bitmap: self.inode_bitmap_pages,
            inode_table: self.inode_table_pages,
            data_region: self.data_pages,
            inode_count: self.inodes_count,
            free_inode_count: self.free_inodes_count,
        }
    }

    /// Pointer geometry the file system was created with.
    pub fn block_map(&self) -> Result<BlockMap> {
        let depth = usize::try_from(self.indirect_depth)
            .map_err(|_| TptfsError::InvalidSuperBlock("indirect depth".to_string()))?;
        BlockMap::new(self.direct_pointers, self.ptrs_per_block, depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formatted() -> SuperBlock {
        let budget = StorageBudget::new(64);
        let layout = budget.plan().unwrap();
        SuperBlock::from_layout(&budget, &layout, &BlockMap::default())
    }

    #[test]
    fn can_encode_and_decode_superblocks() {
        let sb = formatted();
        let mut page = vec![0; 4096];
        page[..sb.serialize().len()].copy_from_slice(sb.serialize());

        let parsed = SuperBlock::parse(&page).unwrap();

        assert_eq!(parsed, sb);
        assert_eq!(parsed.layout(), StorageBudget::new(64).plan().unwrap());
        assert_eq!(parsed.block_map().unwrap(), BlockMap::default());
        assert_eq!(parsed.free_pages_count, parsed.data_pages);
    }

    #[test]
    fn parsing_buffer_with_invalid_magic_fails() {
        let zero_buffer_with_right_size = vec![0; 4096];
        assert!(matches!(
            SuperBlock::parse(&zero_buffer_with_right_size),
            Err(TptfsError::InvalidSuperBlock(_))
        ));
    }

    #[test]
    fn parsing_buffer_with_invalid_size_fails() {
        let wrong_size_buffer = vec![0; 16];
        assert!(SuperBlock::parse(&wrong_size_buffer).is_err());
    }

    #[test]
    fn parsing_inconsistent_regions_fails() {
        let mut sb = formatted();
        sb.data_pages += 1;
        assert!(SuperBlock::parse(sb.serialize()).is_err());
    }
}
