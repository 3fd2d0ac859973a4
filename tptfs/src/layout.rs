use crate::fs::{Result, TptfsError};
use crate::{INODE_SIZE, PAGES_PER_FILE, PAGE_SIZE, RESERVED_INODES};

use std::convert::TryFrom;
use std::ops::Range;

/// The fixed storage a file system has to be laid out in, together with the
/// assumptions used to decide how much of it goes to metadata.
///
/// Defaults follow the crate level constants and can be overridden in the same
/// chained style as the block emulator builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageBudget {
    total_pages: u64,
    page_size: u32,
    inode_entry_size: u32,
    pages_per_file: u32,
    reserved_inodes: u32,
}

impl StorageBudget {
    pub fn new(total_pages: u64) -> Self {
        Self {
            total_pages,
            page_size: PAGE_SIZE,
            inode_entry_size: INODE_SIZE,
            pages_per_file: PAGES_PER_FILE,
            reserved_inodes: RESERVED_INODES,
        }
    }

    /// Sets the page size in bytes. Expected to be a power of two, which is not checked.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_inode_entry_size(mut self, inode_entry_size: u32) -> Self {
        self.inode_entry_size = inode_entry_size;
        self
    }

    /// Sets the expected average file size in pages. Smaller values reserve more
    /// of the budget for inodes.
    pub fn with_pages_per_file(mut self, pages_per_file: u32) -> Self {
        self.pages_per_file = pages_per_file;
        self
    }

    /// Sets how many inodes are in use as soon as the file system is created.
    pub fn with_reserved_inodes(mut self, reserved_inodes: u32) -> Self {
        self.reserved_inodes = reserved_inodes;
        self
    }

    pub fn total_pages(&self) -> u64 {
        self.total_pages
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn inode_entry_size(&self) -> u32 {
        self.inode_entry_size
    }

    pub fn pages_per_file(&self) -> u32 {
        self.pages_per_file
    }

    pub fn reserved_inodes(&self) -> u32 {
        self.reserved_inodes
    }

    /// Splits the budget into superblock, bitmaps, inode table and data region.
    ///
    /// Metadata regions are the tight footprint of the largest data region that
    /// fits, not the rounded closed form, with leftover pages in the page bitmap.
    ///
    /// # Errors
    ///
    /// Returns [`TptfsError::InvalidBudget`] when the budget cannot hold the
    /// superblock, the metadata and at least one data page, or when the geometry
    /// has a zero density (zero sized pages, entries or files, or inode entries
    /// larger than a page).
    pub fn plan(&self) -> Result<RegionLayout> {
        let geometry = Geometry::from_budget(self)?;
        // Everything but the superblock.
        let usable = u128::from(self.total_pages - 1);

        let estimate = geometry.closed_form(usable);
        let mut data = usable.saturating_sub(estimate.total());
        // Rounding every region up on its own can waste a few pages, or through
        // the inode bitmap overshoot by one. Settle on the largest data region
        // whose footprint still fits.
        while data > 0 && data + geometry.footprint(data).total() > usable {
            data -= 1;
        }
        while data + 1 + geometry.footprint(data + 1).total() <= usable {
            data += 1;
        }
        if data == 0 {
            return Err(TptfsError::InvalidBudget(format!(
                "{} pages cannot hold the metadata and a data page",
                self.total_pages
            )));
        }

        let mut metadata = geometry.footprint(data);
        metadata.page_bitmap += usable - data - metadata.total();

        let inode_count = metadata.inode_table * geometry.inodes_per_page;
        let reserved = u128::from(self.reserved_inodes);
        if reserved > inode_count {
            return Err(TptfsError::InvalidBudget(format!(
                "{} reserved inodes exceed the {} available",
                reserved, inode_count
            )));
        }

        let layout = RegionLayout {
            total_pages: self.total_pages,
            page_bitmap: pages(metadata.page_bitmap)?,
            inode_bitmap: pages(metadata.inode_bitmap)?,
            inode_table: pages(metadata.inode_table)?,
            data_region: pages(data)?,
            inode_count: pages(inode_count)?,
            free_inode_count: pages(inode_count - reserved)?,
        };
        debug!("planned {:?} for {:?}", layout, self);
        Ok(layout)
    }
}

/// Plans a layout for the given geometry with the default reserved inode count.
pub fn plan(
    total_pages: u64,
    page_size: u32,
    inode_entry_size: u32,
    pages_per_file: u32,
) -> Result<RegionLayout> {
    StorageBudget::new(total_pages)
        .with_page_size(page_size)
        .with_inode_entry_size(inode_entry_size)
        .with_pages_per_file(pages_per_file)
        .plan()
}

fn pages(count: u128) -> Result<u64> {
    u64::try_from(count)
        .map_err(|_| TptfsError::InvalidBudget(format!("{} does not fit in 64 bits", count)))
}

/// Page densities of a budget. Kept in u128 so that no product of a u64 page
/// count with the u32 derived densities can overflow.
struct Geometry {
    inodes_per_page: u128,
    bits_per_page: u128,
    pages_per_file: u128,
}

impl Geometry {
    fn from_budget(budget: &StorageBudget) -> Result<Self> {
        if budget.total_pages <= 1 {
            return Err(TptfsError::InvalidBudget(
                "a budget needs more pages than the superblock".to_string(),
            ));
        }
        if budget.page_size == 0 || budget.inode_entry_size == 0 || budget.pages_per_file == 0 {
            return Err(TptfsError::InvalidBudget(format!(
                "zero sized geometry: page {} inode entry {} pages per file {}",
                budget.page_size, budget.inode_entry_size, budget.pages_per_file
            )));
        }
        let inodes_per_page = budget.page_size / budget.inode_entry_size;
        if inodes_per_page == 0 {
            return Err(TptfsError::InvalidBudget(format!(
                "inode entries of {} bytes do not fit a {} byte page",
                budget.inode_entry_size, budget.page_size
            )));
        }
        Ok(Self {
            inodes_per_page: u128::from(inodes_per_page),
            bits_per_page: u128::from(budget.page_size) * 8,
            pages_per_file: u128::from(budget.pages_per_file),
        })
    }

    /// Solves `1 + x + x/bits + x/(ppf*ipp) + x/(ppf*bits) = total` for every
    /// region directly, rounding each one up.
    fn closed_form(&self, usable: u128) -> Metadata {
        let (ipp, bits, ppf) = (self.inodes_per_page, self.bits_per_page, self.pages_per_file);
        let divisor = ppf * ipp * bits + ppf * ipp + bits + ipp;
        Metadata {
            page_bitmap: (ppf * ipp * usable).div_ceil(divisor),
            inode_bitmap: (ipp * usable).div_ceil(divisor),
            inode_table: (bits * usable).div_ceil(divisor),
        }
    }

    /// Metadata pages needed to serve a data region of `data` pages.
    fn footprint(&self, data: u128) -> Metadata {
        let inode_table = data.div_ceil(self.pages_per_file * self.inodes_per_page);
        Metadata {
            page_bitmap: data.div_ceil(self.bits_per_page),
            inode_bitmap: (inode_table * self.inodes_per_page).div_ceil(self.bits_per_page),
            inode_table,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Metadata {
    page_bitmap: u128,
    inode_bitmap: u128,
    inode_table: u128,
}

impl Metadata {
    fn total(&self) -> u128 {
        self.page_bitmap + self.inode_bitmap + self.inode_table
    }
}

/// The regions of a laid out device, in on-disk order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    SuperBlock,
    PageBitmap,
    InodeBitmap,
    InodeTable,
    Data,
}

/// Page counts of every region of a device.
///
/// `1 + page_bitmap + inode_bitmap + inode_table + data_region` always equals
/// `total_pages`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub total_pages: u64,
    pub page_bitmap: u64,
    pub inode_bitmap: u64,
    pub inode_table: u64,
    pub data_region: u64,
    pub inode_count: u64,
    pub free_inode_count: u64,
}

impl RegionLayout {
    pub fn page_bitmap_start(&self) -> u64 {
        1
    }

    pub fn inode_bitmap_start(&self) -> u64 {
        self.page_bitmap_start() + self.page_bitmap
    }

    pub fn inode_table_start(&self) -> u64 {
        self.inode_bitmap_start() + self.inode_bitmap
    }

    pub fn data_start(&self) -> u64 {
        self.inode_table_start() + self.inode_table
    }

    /// Pages occupied by the given region.
    pub fn region(&self, region: Region) -> Range<u64> {
        match region {
            Region::SuperBlock => 0..1,
            Region::PageBitmap => self.page_bitmap_start()..self.inode_bitmap_start(),
            Region::InodeBitmap => self.inode_bitmap_start()..self.inode_table_start(),
            Region::InodeTable => self.inode_table_start()..self.data_start(),
            Region::Data => self.data_start()..self.total_pages,
        }
    }
}
