//! Logical to physical block mapping through direct and indirect pointers.
//!
//! An inode holds `direct` block pointers followed by one pointer per level of
//! indirection. The first `direct` logical blocks of a file are reached straight
//! from the inode, the next `ptrs_per_block` through the single indirect block,
//! the next `ptrs_per_block^2` through the double indirect block and so on.
//!
//! Indirect blocks get synthetic numbers in the same space as the file's data
//! blocks so they can be cached and looked up like any other block of the file.
//! The top level indirect block covering a range is numbered after the range's
//! first data block (plus the level), and its children count down from there.
use crate::fs::{Result, TptfsError};
use crate::{N_DIRECT, N_INDIRECT, POINTER_SIZE, PTRS_PER_BLOCK};

use std::convert::TryFrom;

/// Deepest indirection any [`BlockMap`] supports (triple indirect).
pub const MAX_DEPTH: usize = 3;

/// A file relative block number, tagged with what lives in the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockRef {
    /// Holds file contents.
    Data(u64),
    /// An indirect block holding pointers to other blocks of the file.
    Meta(u64),
}

impl BlockRef {
    /// Maps a signed block number where negative values name indirect blocks.
    pub fn from_lbn(lbn: i64) -> Self {
        if lbn < 0 {
            BlockRef::Meta(lbn.unsigned_abs())
        } else {
            BlockRef::Data(lbn.unsigned_abs())
        }
    }

    pub fn number(&self) -> u64 {
        match *self {
            BlockRef::Data(n) | BlockRef::Meta(n) => n,
        }
    }

    pub fn is_meta(&self) -> bool {
        matches!(self, BlockRef::Meta(_))
    }
}

/// One hop of a lookup: read `block` and follow the pointer at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Indirect {
    pub block: BlockRef,
    pub offset: u64,
}

/// The indirect blocks to walk to reach a logical block, outermost first.
///
/// A direct path has no inode slot and no hops. Otherwise `root_slot` picks the
/// inode's indirect pointer (0 single, 1 double, 2 triple) and each hop names an
/// indirect block and the pointer to follow inside it.
#[derive(Debug, Clone, Copy)]
pub struct IndirectionPath {
    root_slot: Option<usize>,
    hops: [Indirect; MAX_DEPTH],
    len: usize,
}

impl IndirectionPath {
    fn direct() -> Self {
        Self::rooted(None)
    }

    fn rooted(root_slot: Option<usize>) -> Self {
        Self {
            root_slot,
            hops: [Indirect {
                block: BlockRef::Meta(0),
                offset: 0,
            }; MAX_DEPTH],
            len: 0,
        }
    }

    fn push(&mut self, hop: Indirect) {
        self.hops[self.len] = hop;
        self.len += 1;
    }

    /// True when the block is addressed straight from the inode's direct pointers.
    pub fn is_direct(&self) -> bool {
        self.root_slot.is_none()
    }

    /// Index into the inode's indirect pointers, `None` for direct blocks.
    pub fn root_slot(&self) -> Option<usize> {
        self.root_slot
    }

    pub fn as_slice(&self) -> &[Indirect] {
        &self.hops[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Indirect> {
        self.as_slice().iter()
    }

    /// The hop holding the pointer to the requested block.
    pub fn last(&self) -> Option<&Indirect> {
        self.as_slice().last()
    }
}

impl PartialEq for IndirectionPath {
    fn eq(&self, other: &Self) -> bool {
        self.root_slot == other.root_slot && self.as_slice() == other.as_slice()
    }
}

impl Eq for IndirectionPath {}

impl<'a> IntoIterator for &'a IndirectionPath {
    type Item = &'a Indirect;
    type IntoIter = std::slice::Iter<'a, Indirect>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Pointer geometry of an inode: how many direct pointers it has, how many
/// pointers fit an indirect block and how many levels of indirection follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMap {
    direct: u64,
    ptrs_per_block: u64,
    depth: usize,
}

impl Default for BlockMap {
    fn default() -> Self {
        Self {
            direct: N_DIRECT,
            ptrs_per_block: PTRS_PER_BLOCK,
            depth: N_INDIRECT,
        }
    }
}

impl BlockMap {
    /// # Errors
    ///
    /// Returns [`TptfsError::InvalidGeometry`] if `depth` is zero or above
    /// [`MAX_DEPTH`], if an indirect block holds fewer than two pointers, or if
    /// the number of addressable blocks does not fit in 64 bits.
    pub fn new(direct: u64, ptrs_per_block: u64, depth: usize) -> Result<Self> {
        if depth == 0 || depth > MAX_DEPTH {
            return Err(TptfsError::InvalidGeometry(format!(
                "indirection depth {} outside 1..={}",
                depth, MAX_DEPTH
            )));
        }
        if ptrs_per_block < 2 {
            return Err(TptfsError::InvalidGeometry(format!(
                "{} pointers per indirect block",
                ptrs_per_block
            )));
        }
        let map = Self {
            direct,
            ptrs_per_block,
            depth,
        };
        if map.checked_capacity().is_none() {
            return Err(TptfsError::InvalidGeometry(format!(
                "{} direct and {} pointers over {} levels overflow 64 bits",
                direct, ptrs_per_block, depth
            )));
        }
        Ok(map)
    }

    /// Default direct and depth counts with indirect blocks of `page_size` bytes.
    pub fn for_page_size(page_size: u32) -> Result<Self> {
        Self::new(N_DIRECT, u64::from(page_size / POINTER_SIZE), N_INDIRECT)
    }

    pub fn direct(&self) -> u64 {
        self.direct
    }

    pub fn ptrs_per_block(&self) -> u64 {
        self.ptrs_per_block
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    fn checked_capacity(&self) -> Option<u64> {
        let mut capacity = self.direct;
        let mut level = 1u64;
        for _ in 0..self.depth {
            level = level.checked_mul(self.ptrs_per_block)?;
            capacity = capacity.checked_add(level)?;
        }
        Some(capacity)
    }

    /// Number of logical blocks a file can have. This is also the smallest data
    /// block number [`BlockMap::resolve`] rejects.
    pub fn capacity(&self) -> u64 {
        // Checked when the map was built.
        self.checked_capacity().unwrap_or(u64::MAX)
    }

    /// Largest file in bytes, saturating at `u64::MAX`.
    pub fn max_file_size(&self, page_size: u32) -> u64 {
        self.capacity().saturating_mul(u64::from(page_size))
    }

    /// Computes the chain of indirect blocks to read to find `target`.
    ///
    /// Data blocks below `direct` come back as a direct path. For an indirect
    /// block the walk stops at the hop whose pointer names it, so the top level
    /// block of a range yields its inode slot and no hops.
    ///
    /// # Errors
    ///
    /// Returns [`TptfsError::Overflow`] when the block lies beyond what the
    /// indirection depth can address.
    pub fn resolve(&self, target: BlockRef) -> Result<IndirectionPath> {
        let requested = target.number();
        if requested < self.direct {
            return Ok(IndirectionPath::direct());
        }

        // Find the level whose range holds the block, leaving `remaining` as the
        // offset into that range and `blockcnt` as the range's size.
        let mut remaining = requested - self.direct;
        let mut blockcnt = 1u64;
        let mut levels_left = self.depth;
        loop {
            if levels_left == 0 {
                return Err(TptfsError::Overflow(requested));
            }
            blockcnt *= self.ptrs_per_block;
            if remaining < blockcnt {
                break;
            }
            remaining -= blockcnt;
            levels_left -= 1;
        }

        let slot = self.depth - levels_left;
        let mut path = IndirectionPath::rooted(Some(slot));
        let mut meta = requested - remaining + slot as u64;
        for _ in 0..=slot {
            if target == BlockRef::Meta(meta) {
                break;
            }
            blockcnt /= self.ptrs_per_block;
            let offset = (remaining / blockcnt) % self.ptrs_per_block;
            path.push(Indirect {
                block: BlockRef::Meta(meta),
                offset,
            });
            meta = meta + offset * blockcnt - 1;
        }
        trace!("resolved {:?} through {:?}", target, path);
        Ok(path)
    }

    /// Like [`BlockMap::resolve`] for signed block numbers, negative ones naming
    /// indirect blocks.
    pub fn resolve_lbn(&self, lbn: i64) -> Result<IndirectionPath> {
        self.resolve(BlockRef::from_lbn(lbn))
    }

    /// Index into the inode's direct pointers for blocks that need no indirection.
    pub fn direct_index(&self, target: BlockRef) -> Option<usize> {
        match target {
            BlockRef::Data(n) if n < self.direct => usize::try_from(n).ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hops(path: &IndirectionPath) -> Vec<(BlockRef, u64)> {
        path.iter().map(|hop| (hop.block, hop.offset)).collect()
    }

    #[test]
    fn direct_blocks_need_no_indirection() {
        let map = BlockMap::default();
        for lbn in 0..12 {
            let path = map.resolve(BlockRef::Data(lbn)).unwrap();
            assert!(path.is_direct());
            assert!(path.is_empty());
            assert_eq!(map.direct_index(BlockRef::Data(lbn)), Some(lbn as usize));
        }
        assert_eq!(map.direct_index(BlockRef::Data(12)), None);
    }

    #[test]
    fn first_single_indirect_block_uses_slot_zero() {
        let path = BlockMap::default().resolve(BlockRef::Data(12)).unwrap();

        assert_eq!(path.root_slot(), Some(0));
        assert_eq!(path.len(), 1);
        assert_eq!(hops(&path), vec![(BlockRef::Meta(12), 0)]);
    }

    #[test]
    fn last_single_indirect_block_uses_last_pointer() {
        let path = BlockMap::default().resolve(BlockRef::Data(12 + 511)).unwrap();

        assert_eq!(path.root_slot(), Some(0));
        assert_eq!(hops(&path), vec![(BlockRef::Meta(12), 511)]);
    }

    #[test]
    fn double_indirect_blocks_take_two_hops() {
        let map = BlockMap::default();

        let first = map.resolve(BlockRef::Data(12 + 512)).unwrap();
        assert_eq!(first.root_slot(), Some(1));
        assert_eq!(
            hops(&first),
            vec![(BlockRef::Meta(525), 0), (BlockRef::Meta(524), 0)]
        );

        // Second pointer of the double indirect block, third pointer below it.
        let later = map.resolve(BlockRef::Data(12 + 512 + 512 + 2)).unwrap();
        assert_eq!(
            hops(&later),
            vec![(BlockRef::Meta(525), 1), (BlockRef::Meta(1036), 2)]
        );
    }

    #[test]
    fn triple_indirect_blocks_take_three_hops() {
        let map = BlockMap::default();
        let first = 12 + 512 + 512 * 512;

        let path = map.resolve(BlockRef::Data(first)).unwrap();
        assert_eq!(path.root_slot(), Some(2));
        assert_eq!(
            hops(&path),
            vec![
                (BlockRef::Meta(first + 2), 0),
                (BlockRef::Meta(first + 1), 0),
                (BlockRef::Meta(first), 0),
            ]
        );

        let last = map.resolve(BlockRef::Data(map.capacity() - 1)).unwrap();
        assert_eq!(last.len(), 3);
        let offsets: Vec<u64> = last.iter().map(|hop| hop.offset).collect();
        assert_eq!(offsets, vec![511, 511, 511]);
    }

    #[test]
    fn blocks_past_triple_indirect_overflow() {
        let map = BlockMap::default();
        let boundary = 12 + 512 + 512 * 512 + 512 * 512 * 512;

        assert_eq!(map.capacity(), boundary);
        assert!(map.resolve(BlockRef::Data(boundary - 1)).is_ok());
        match map.resolve(BlockRef::Data(boundary)) {
            Err(TptfsError::Overflow(lbn)) => assert_eq!(lbn, boundary),
            other => panic!("expected overflow, got {:?}", other),
        }
    }

    #[test]
    fn indirect_blocks_resolve_to_their_parent() {
        let map = BlockMap::default();

        // Top level blocks are reached from the inode alone.
        let single = map.resolve(BlockRef::Meta(12)).unwrap();
        assert_eq!(single.root_slot(), Some(0));
        assert!(single.is_empty());
        let double = map.resolve(BlockRef::Meta(525)).unwrap();
        assert_eq!(double.root_slot(), Some(1));
        assert!(double.is_empty());

        // First child of the double indirect block.
        let child = map.resolve(BlockRef::Meta(524)).unwrap();
        assert_eq!(hops(&child), vec![(BlockRef::Meta(525), 0)]);
    }

    #[test]
    fn signed_block_numbers_map_to_tags() {
        let map = BlockMap::default();

        assert_eq!(BlockRef::from_lbn(40), BlockRef::Data(40));
        assert_eq!(BlockRef::from_lbn(-525), BlockRef::Meta(525));
        assert_eq!(
            map.resolve_lbn(-525).unwrap(),
            map.resolve(BlockRef::Meta(525)).unwrap()
        );
        assert!(map.resolve_lbn(-3).unwrap().is_direct());
    }

    #[test]
    fn small_geometry_walks_every_level() {
        let map = BlockMap::new(2, 2, 2).unwrap();

        assert_eq!(map.capacity(), 2 + 2 + 4);
        assert_eq!(hops(&map.resolve(BlockRef::Data(3)).unwrap()), vec![(BlockRef::Meta(2), 1)]);
        assert_eq!(
            hops(&map.resolve(BlockRef::Data(7)).unwrap()),
            vec![(BlockRef::Meta(5), 1), (BlockRef::Meta(6), 1)]
        );
        assert!(map.resolve(BlockRef::Data(8)).is_err());
    }

    #[test]
    fn invalid_geometry_is_rejected() {
        assert!(BlockMap::new(12, 512, 0).is_err());
        assert!(BlockMap::new(12, 512, 4).is_err());
        assert!(BlockMap::new(12, 1, 3).is_err());
        assert!(BlockMap::new(u64::MAX, 2, 1).is_err());
        assert_eq!(BlockMap::for_page_size(4096).unwrap(), BlockMap::default());
    }
}
