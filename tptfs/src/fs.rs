use crate::alloc::RunAllocator;
use crate::bmap::{BlockMap, BlockRef, IndirectionPath};
use crate::io::BlockStorage;
use crate::layout::{Region, RegionLayout, StorageBudget};
use crate::sb::SuperBlock;

use std::convert::TryFrom;
use std::ops::Range;
use thiserror::Error;

/// Known locations.
const SUPERBLOCK_INDEX: u64 = 0;

#[derive(Error, Debug)]
pub enum TptfsError {
    #[error("invalid storage budget: {0}")]
    InvalidBudget(String),
    #[error("logical block {0} is past the largest addressable file block")]
    Overflow(u64),
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    #[error("invalid superblock: {0}")]
    InvalidSuperBlock(String),
    #[error("no free space left")]
    NoSpace,
    #[error("unit {0} is not allocated")]
    NotAllocated(u64),
    #[error("device io failed")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TptfsError>;

/// A file system laid out on owned block storage.
///
/// # Layout
/// ==============================================================================
/// | SuperBlock | Bitmap (data region) | Bitmap (inodes) | Inodes | Data Region |
/// ==============================================================================
///
/// Both bitmaps are kept in memory and written through to the device page by
/// page as allocations change them.
pub struct Tptfs<T: BlockStorage> {
    dev: T,
    super_block: SuperBlock,
    block_map: BlockMap,
    data_map: RunAllocator,
    inode_map: RunAllocator,
}

impl<T: BlockStorage> Tptfs<T> {
    /// Initializes the file system onto owned block storage.
    ///
    /// # Errors
    ///
    /// Fails if the budget cannot be planned, if the device's block size differs
    /// from the budget's page size or if the device is smaller than the budget.
    pub fn create(mut dev: T, budget: &StorageBudget) -> Result<Self> {
        let page_size = usize::try_from(budget.page_size()).map_err(|_| {
            TptfsError::InvalidGeometry(format!("page size {}", budget.page_size()))
        })?;
        if dev.block_size() != page_size {
            return Err(TptfsError::InvalidGeometry(format!(
                "device blocks of {} bytes do not match {} byte pages",
                dev.block_size(),
                page_size
            )));
        }
        if page_size < std::mem::size_of::<SuperBlock>() {
            return Err(TptfsError::InvalidGeometry(format!(
                "a {} byte page cannot hold the superblock",
                page_size
            )));
        }
        let layout = budget.plan()?;
        if dev.block_count() < layout.total_pages {
            return Err(TptfsError::InvalidGeometry(format!(
                "device has {} blocks, budget needs {}",
                dev.block_count(),
                layout.total_pages
            )));
        }
        let block_map = BlockMap::for_page_size(budget.page_size())?;
        let super_block = SuperBlock::from_layout(budget, &layout, &block_map);

        let data_map = RunAllocator::new(
            vec![0xff; region_bytes(layout.page_bitmap, page_size)?],
            Some(units(layout.data_region)?),
        );
        let mut inode_map = RunAllocator::new(
            vec![0xff; region_bytes(layout.inode_bitmap, page_size)?],
            Some(units(layout.inode_count)?),
        );
        let reserved = units(u64::from(budget.reserved_inodes()))?;
        if reserved > 0 && inode_map.alloc(reserved) != Some(0) {
            return Err(TptfsError::InvalidBudget(format!(
                "cannot reserve {} inodes",
                reserved
            )));
        }

        // Reusable buffer for writing blocks.
        let mut block_buffer = vec![0; page_size];
        block_buffer[..super_block.serialize().len()].copy_from_slice(super_block.serialize());
        dev.write_block(SUPERBLOCK_INDEX, &block_buffer)?;

        write_region(&mut dev, layout.page_bitmap_start(), data_map.bitmap())?;
        write_region(&mut dev, layout.inode_bitmap_start(), inode_map.bitmap())?;

        block_buffer.iter_mut().for_each(|byte| *byte = 0);
        for page in layout.region(Region::InodeTable) {
            dev.write_block(page, &block_buffer)?;
        }
        dev.sync_disk()?;

        info!(
            "created file system of {} pages: {} data pages, {} inodes",
            layout.total_pages, layout.data_region, layout.inode_count
        );
        Ok(Tptfs {
            dev,
            super_block,
            block_map,
            data_map,
            inode_map,
        })
    }

    /// Opens a device previously initialized by [`Tptfs::create`].
    pub fn open(mut dev: T) -> Result<Self> {
        let mut block_buf = vec![0; dev.block_size()];

        // Read superblock from first block.
        dev.read_block(SUPERBLOCK_INDEX, &mut block_buf)?;
        let mut super_block = SuperBlock::parse(&block_buf)?;
        if usize::try_from(super_block.page_size).ok() != Some(dev.block_size()) {
            return Err(TptfsError::InvalidGeometry(format!(
                "superblock pages of {} bytes on a device with {} byte blocks",
                super_block.page_size,
                dev.block_size()
            )));
        }
        if dev.block_count() < super_block.total_pages {
            return Err(TptfsError::InvalidGeometry(format!(
                "superblock spans {} pages on a device of {} blocks",
                super_block.total_pages,
                dev.block_count()
            )));
        }
        let layout = super_block.layout();
        let block_map = super_block.block_map()?;

        let data_map = RunAllocator::new(
            read_region(&mut dev, layout.region(Region::PageBitmap))?,
            Some(units(layout.data_region)?),
        );
        let inode_map = RunAllocator::new(
            read_region(&mut dev, layout.region(Region::InodeBitmap))?,
            Some(units(layout.inode_count)?),
        );

        // The bitmaps are authoritative.
        let free_pages = data_map.free_count() as u64;
        let free_inodes = inode_map.free_count() as u64;
        if free_pages != super_block.free_pages_count || free_inodes != super_block.free_inodes_count {
            warn!(
                "superblock counts {} pages {} inodes disagree with bitmaps {} pages {} inodes",
                super_block.free_pages_count, super_block.free_inodes_count, free_pages, free_inodes
            );
            super_block.free_pages_count = free_pages;
            super_block.free_inodes_count = free_inodes;
        }

        info!("opened file system of {} pages", layout.total_pages);
        Ok(Tptfs {
            dev,
            super_block,
            block_map,
            data_map,
            inode_map,
        })
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.super_block
    }

    pub fn layout(&self) -> RegionLayout {
        self.super_block.layout()
    }

    pub fn block_map(&self) -> &BlockMap {
        &self.block_map
    }

    pub fn free_page_count(&self) -> u64 {
        self.super_block.free_pages_count
    }

    pub fn free_inode_count(&self) -> u64 {
        self.super_block.free_inodes_count
    }

    /// Returns ownership of the underlying device to the caller.
    pub fn into_device(self) -> T {
        self.dev
    }

    /// Chain of indirect blocks leading to a block of a file.
    pub fn map(&self, target: BlockRef) -> Result<IndirectionPath> {
        self.block_map.resolve(target)
    }

    /// Allocates `count` consecutive data pages, returning the device page
    /// number of the first one.
    pub fn alloc_pages(&mut self, count: u64) -> Result<u64> {
        if count == 0 {
            return Err(TptfsError::InvalidGeometry(
                "cannot allocate zero pages".to_string(),
            ));
        }
        let run = units(count)?;
        let start = match self.data_map.alloc(run) {
            Some(start) => start,
            None => {
                warn!("no run of {} free data pages", count);
                return Err(TptfsError::NoSpace);
            }
        };
        self.super_block.free_pages_count -= count;
        self.persist_data_map(start..start + run)?;
        let page = self.layout().data_start() + start as u64;
        debug!("allocated data pages {}..{}", page, page + count);
        Ok(page)
    }

    /// Returns `count` data pages starting at device page `page`.
    pub fn free_pages(&mut self, page: u64, count: u64) -> Result<()> {
        let data = self.layout().region(Region::Data);
        if page < data.start {
            return Err(TptfsError::NotAllocated(page));
        }
        let start = units(page - data.start)?;
        let run = units(count)?;
        self.data_map.release(start, run)?;
        self.super_block.free_pages_count += count;
        self.persist_data_map(start..start + run)
    }

    /// Allocates an inode and returns its number.
    pub fn alloc_inode(&mut self) -> Result<u64> {
        let ino = match self.inode_map.alloc(1) {
            Some(ino) => ino,
            None => {
                warn!("out of inodes");
                return Err(TptfsError::NoSpace);
            }
        };
        self.super_block.free_inodes_count -= 1;
        self.persist_inode_map(ino..ino + 1)?;
        Ok(ino as u64)
    }

    pub fn free_inode(&mut self, ino: u64) -> Result<()> {
        let unit = units(ino)?;
        self.inode_map.release(unit, 1)?;
        self.super_block.free_inodes_count += 1;
        self.persist_inode_map(unit..unit + 1)
    }

    fn persist_data_map(&mut self, bits: Range<usize>) -> Result<()> {
        let start = self.layout().page_bitmap_start();
        write_bitmap_pages(&mut self.dev, start, self.data_map.bitmap(), bits)?;
        self.write_super_block()
    }

    fn persist_inode_map(&mut self, bits: Range<usize>) -> Result<()> {
        let start = self.layout().inode_bitmap_start();
        write_bitmap_pages(&mut self.dev, start, self.inode_map.bitmap(), bits)?;
        self.write_super_block()
    }

    fn write_super_block(&mut self) -> Result<()> {
        let mut block_buffer = vec![0; self.dev.block_size()];
        let encoded = self.super_block.serialize();
        block_buffer[..encoded.len()].copy_from_slice(encoded);
        self.dev.write_block(SUPERBLOCK_INDEX, &block_buffer)?;
        Ok(())
    }
}

fn units(count: u64) -> Result<usize> {
    usize::try_from(count)
        .map_err(|_| TptfsError::InvalidGeometry(format!("{} units do not fit in memory", count)))
}

fn region_bytes(pages: u64, page_size: usize) -> Result<usize> {
    units(pages)?
        .checked_mul(page_size)
        .ok_or_else(|| TptfsError::InvalidGeometry(format!("{} pages do not fit in memory", pages)))
}

fn read_region<T: BlockStorage>(dev: &mut T, pages: Range<u64>) -> Result<Vec<u8>> {
    let page_size = dev.block_size();
    let mut region = vec![0; region_bytes(pages.end - pages.start, page_size)?];
    for (chunk, page) in region.chunks_mut(page_size).zip(pages) {
        dev.read_block(page, chunk)?;
    }
    Ok(region)
}

fn write_region<T: BlockStorage>(dev: &mut T, first_page: u64, region: &[u8]) -> Result<()> {
    let page_size = dev.block_size();
    for (page, chunk) in (first_page..).zip(region.chunks(page_size)) {
        dev.write_block(page, chunk)?;
    }
    Ok(())
}

/// Writes back the pages of `bitmap` holding `bits`.
fn write_bitmap_pages<T: BlockStorage>(
    dev: &mut T,
    first_page: u64,
    bitmap: &[u8],
    bits: Range<usize>,
) -> Result<()> {
    if bits.start >= bits.end {
        return Ok(());
    }
    let page_size = dev.block_size();
    let bits_per_page = page_size * 8;
    for index in bits.start / bits_per_page..=(bits.end - 1) / bits_per_page {
        let chunk = &bitmap[index * page_size..(index + 1) * page_size];
        dev.write_block(first_page + index as u64, chunk)?;
    }
    Ok(())
}
