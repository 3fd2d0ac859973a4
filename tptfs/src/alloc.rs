//! Free space bitmaps.
//!
//! One bit tracks one unit (a data page or an inode). A set bit means the unit
//! is free, a cleared bit means it is in use. Bits are numbered from the least
//! significant bit of the first byte.
use crate::fs::{Result, TptfsError};

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

/// Reads the state of `bit`. Bits past the end of the buffer read as used.
pub fn state(bitmap: &[u8], bit: usize) -> State {
    match bitmap.get(bit / 8) {
        Some(byte) if byte & (1 << (bit % 8)) != 0 => State::Free,
        _ => State::Used,
    }
}

/// Marks `bit` free.
///
/// # Panics
///
/// Panics if `bit` lies past the end of `bitmap`.
pub fn mark_free(bitmap: &mut [u8], bit: usize) {
    bitmap[bit / 8] |= 1 << (bit % 8);
}

/// Marks `bit` used.
///
/// # Panics
///
/// Panics if `bit` lies past the end of `bitmap`.
pub fn mark_used(bitmap: &mut [u8], bit: usize) {
    bitmap[bit / 8] &= !(1 << (bit % 8));
}

/// Number of free units tracked by the bitmap.
pub fn count_free(bitmap: &[u8]) -> usize {
    bitmap.iter().map(|byte| byte.count_ones() as usize).sum()
}

/// Finds the first run of `run_length` free bits, looking from the byte holding
/// `preferred_start_bit` to the end of the bitmap and then, once, from the start
/// of the bitmap. Returns the run's first bit.
///
/// The forward pass starts on the byte boundary, so bits of the first byte below
/// `preferred_start_bit` count toward a run. The second pass only accepts runs
/// starting before that byte, though they may reach into it or beyond.
///
/// Requests of eight or more units start on a byte boundary. Free high bits of
/// a partially used byte do not open such a run, so in `[0xf3, 0xff]` a run of
/// eight is found at bit 8 even though bits 4..8 are free as well.
///
/// A zero length request is satisfied at `preferred_start_bit`. `None` means no
/// such run exists anywhere in the bitmap.
pub fn find_free_run(bitmap: &[u8], preferred_start_bit: usize, run_length: usize) -> Option<usize> {
    if run_length == 0 {
        return Some(preferred_start_bit);
    }
    let start_byte = (preferred_start_bit / 8).min(bitmap.len());
    if let Some(found) = scan(bitmap, start_byte, usize::MAX, run_length) {
        return Some(found);
    }
    if start_byte == 0 {
        return None;
    }
    trace!(
        "no run of {} from byte {}, wrapping to the start",
        run_length,
        start_byte
    );
    scan(bitmap, 0, start_byte * 8, run_length)
}

/// First fit scan from `first_byte` for runs starting before `start_limit`.
fn scan(bitmap: &[u8], first_byte: usize, start_limit: usize, run_length: usize) -> Option<usize> {
    let mut run_start = first_byte * 8;
    let mut run_len = 0;

    for (index, &byte) in bitmap.iter().enumerate().skip(first_byte) {
        let base = index * 8;
        if run_len == 0 && base >= start_limit {
            return None;
        }
        match byte {
            0xff => {
                if run_len == 0 {
                    run_start = base;
                }
                run_len += 8;
                if run_len >= run_length {
                    return Some(run_start);
                }
            }
            0x00 => run_len = 0,
            _ => {
                // Free bits below the lowest used bit extend the open run.
                let head = byte.trailing_ones() as usize;
                if run_len == 0 {
                    run_start = base;
                }
                if run_len + head >= run_length {
                    return Some(run_start);
                }

                // Runs wholly inside the byte, between its lowest and highest used bits.
                let tail = byte.leading_ones() as usize;
                if run_length <= 6 {
                    let mut inner_len = 0;
                    for bit in head + 1..8 - tail {
                        if byte & (1 << bit) == 0 {
                            inner_len = 0;
                            continue;
                        }
                        inner_len += 1;
                        if inner_len == run_length {
                            let found = base + bit + 1 - run_length;
                            return if found < start_limit { Some(found) } else { None };
                        }
                    }
                }

                // Free bits above the highest used bit open the next run, unless
                // the request spans whole bytes.
                if run_length >= 8 {
                    run_len = 0;
                    continue;
                }
                run_len = tail;
                run_start = base + 8 - tail;
                if run_len == 0 {
                    continue;
                }
                if run_start >= start_limit {
                    return None;
                }
                if run_len >= run_length {
                    return Some(run_start);
                }
            }
        }
    }
    None
}

/// Implements a first fit allocation policy over an owned bitmap. Searches start
/// where the previous allocation ended so consecutive requests come out close
/// together, falling back to the start of the bitmap once the end is reached.
///
/// Iterating hands out single units the same way.
pub struct RunAllocator {
    /// Keeps track of the next starting place for looking for available units.
    marker: usize,
    /// The bitmap tracking which units are allocated and which are free.
    bitmap: Vec<u8>,
    /// The number of units the bitmap tracks. For example, if you have 80 inodes
    /// on disk, this value would be 80 regardless of the bitmap's byte length.
    cap: usize,
}

impl RunAllocator {
    /// Takes over `bitmap`, tracking its first `cap` bits (all of them when
    /// `None`). Bits past `cap` are marked used so they are never handed out.
    pub fn new(mut bitmap: Vec<u8>, cap: Option<usize>) -> Self {
        let cap = cap.unwrap_or(bitmap.len() * 8).min(bitmap.len() * 8);
        for bit in cap..bitmap.len() * 8 {
            mark_used(&mut bitmap, bit);
        }
        Self {
            marker: 0,
            bitmap,
            cap,
        }
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn free_count(&self) -> usize {
        count_free(&self.bitmap)
    }

    pub fn state(&self, unit: usize) -> State {
        state(&self.bitmap, unit)
    }

    /// Claims `run_length` consecutive units and returns the first one, or `None`
    /// when no run that long is free.
    pub fn alloc(&mut self, run_length: usize) -> Option<usize> {
        if run_length == 0 {
            return None;
        }
        let start = find_free_run(&self.bitmap, self.marker, run_length)?;
        for unit in start..start + run_length {
            mark_used(&mut self.bitmap, unit);
        }
        self.marker = start + run_length;
        if self.marker >= self.cap {
            self.marker = 0;
        }
        Some(start)
    }

    /// Returns `run_length` units starting at `start` to the free pool.
    ///
    /// # Errors
    ///
    /// Fails with [`TptfsError::NotAllocated`] without changing anything if a
    /// unit in the range is already free or out of range.
    pub fn release(&mut self, start: usize, run_length: usize) -> Result<()> {
        let end = start.saturating_add(run_length);
        if let Some(unit) = (start..end).find(|&unit| unit >= self.cap || self.state(unit) == State::Free) {
            return Err(TptfsError::NotAllocated(unit as u64));
        }
        for unit in start..end {
            mark_free(&mut self.bitmap, unit);
        }
        Ok(())
    }
}

impl Iterator for RunAllocator {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        self.alloc(1)
    }
}
