//! Persistent free-block bitmap.
//!
//! One bit per block, bit value 1 = allocated, stored LSB-first starting at
//! block 0 (byte `i`, bit `b` is block `8i + b`). The whole metadata region
//! `[0, data_start)` is kept permanently allocated; allocation scans
//! first-fit from [`FIRST_ALLOCATABLE_BLOCK`] and ties break toward the
//! lowest index.

use std::sync::RwLock;

use bitvec::prelude::*;
use log::debug;

use crate::error::{FsError, FsResult};
use crate::fs::cache::Cache;
use crate::fs::layout::Layout;
use crate::fs::{BLOCK_SIZE, FIRST_ALLOCATABLE_BLOCK};

struct BitmapState {
    bits: BitVec<u8, Lsb0>,
    free_blocks: u32,
}

pub struct Bitmap {
    total_blocks: u32,
    bitmap_blocks: u32,
    /// First block the allocator may hand out; everything below is metadata.
    reserved: u32,
    state: RwLock<BitmapState>,
}

impl Bitmap {
    /// A bitmap for `layout`, initialized with only the metadata region
    /// allocated.
    pub fn new(layout: &Layout) -> Self {
        let bitmap = Bitmap {
            total_blocks: layout.total_blocks,
            bitmap_blocks: layout.bitmap_blocks,
            reserved: layout.data_start,
            state: RwLock::new(BitmapState {
                bits: bitvec![u8, Lsb0; 0; layout.total_blocks as usize],
                free_blocks: layout.total_blocks,
            }),
        };
        bitmap.initialize();
        bitmap
    }

    /// Reset to the freshly-formatted state: every bit clear except the
    /// metadata region.
    pub fn initialize(&self) {
        let mut state = self.state.write().unwrap();
        state.bits.fill(false);
        state.bits[..self.reserved as usize].fill(true);
        state.free_blocks = self.total_blocks - self.reserved;
    }

    /// Load the bitmap block(s) through the cache, recompute the free count
    /// by scan, and reassert the metadata reservation.
    pub fn load(&self, cache: &Cache) -> FsResult<()> {
        let mut raw = vec![0u8; self.bitmap_blocks as usize * BLOCK_SIZE];
        for i in 0..self.bitmap_blocks {
            let start = i as usize * BLOCK_SIZE;
            cache.read_block(i, &mut raw[start..start + BLOCK_SIZE])?;
        }
        let mut bits = BitVec::<u8, Lsb0>::from_slice(&raw);
        bits.truncate(self.total_blocks as usize);

        let mut state = self.state.write().unwrap();
        state.bits = bits;
        state.bits[..self.reserved as usize].fill(true);
        state.free_blocks = state.bits.count_zeros() as u32;
        Ok(())
    }

    /// Write the bitmap block(s) through the cache.
    pub fn save(&self, cache: &Cache) -> FsResult<()> {
        let state = self.state.read().unwrap();
        let raw = state.bits.as_raw_slice();
        let mut block = vec![0u8; BLOCK_SIZE];
        for i in 0..self.bitmap_blocks as usize {
            block.fill(0);
            let start = i * BLOCK_SIZE;
            let end = raw.len().min(start + BLOCK_SIZE);
            if start < end {
                block[..end - start].copy_from_slice(&raw[start..end]);
            }
            cache.write_block(i as u32, &block)?;
        }
        Ok(())
    }

    /// Allocate the lowest-index free block.
    pub fn allocate_one(&self) -> FsResult<u32> {
        let mut state = self.state.write().unwrap();
        let idx = state.bits[FIRST_ALLOCATABLE_BLOCK as usize..]
            .first_zero()
            .map(|p| p as u32 + FIRST_ALLOCATABLE_BLOCK)
            .ok_or(FsError::NoSpace)?;
        state.bits.set(idx as usize, true);
        state.free_blocks -= 1;
        Ok(idx)
    }

    /// Allocate `count` contiguous blocks, first-fit from the lowest index.
    pub fn allocate_contiguous(&self, count: u32) -> FsResult<u32> {
        if count == 0 || count > self.total_blocks {
            return Err(FsError::NoSpace);
        }
        let mut state = self.state.write().unwrap();
        if count > state.free_blocks {
            return Err(FsError::NoSpace);
        }
        let start = Self::find_run(&state.bits, count).ok_or(FsError::NoSpace)?;
        state.bits[start as usize..(start + count) as usize].fill(true);
        state.free_blocks -= count;
        Ok(start)
    }

    /// Extend the run ending at `start` by `count` blocks in place, if the
    /// trailing blocks are all free. Verification and marking happen under a
    /// single write lock.
    pub fn try_extend(&self, start: u32, count: u32) -> bool {
        let end = match start.checked_add(count) {
            Some(end) if end <= self.total_blocks => end as usize,
            _ => return false,
        };
        let mut state = self.state.write().unwrap();
        if state.bits[start as usize..end].any() {
            return false;
        }
        state.bits[start as usize..end].fill(true);
        state.free_blocks -= count;
        true
    }

    /// Free one block. Freeing a reserved or already-free block is a no-op.
    pub fn free_one(&self, idx: u32) {
        self.free_contiguous(idx, 1);
    }

    /// Free `count` blocks starting at `start`, clamped to the device and
    /// skipping the reserved metadata region.
    pub fn free_contiguous(&self, start: u32, count: u32) {
        let end = start.saturating_add(count).min(self.total_blocks);
        let start = start.max(self.reserved);
        if start >= end {
            return;
        }
        let mut state = self.state.write().unwrap();
        for idx in start as usize..end as usize {
            if state.bits[idx] {
                state.bits.set(idx, false);
                state.free_blocks += 1;
            } else {
                debug!("block {idx} freed twice");
            }
        }
    }

    /// Whether `idx` is allocated. Out-of-range indices report allocated.
    pub fn is_allocated(&self, idx: u32) -> bool {
        if idx >= self.total_blocks {
            return true;
        }
        self.state.read().unwrap().bits[idx as usize]
    }

    pub fn free_blocks(&self) -> u32 {
        self.state.read().unwrap().free_blocks
    }

    pub fn used_blocks(&self) -> u32 {
        self.total_blocks - self.free_blocks()
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// Verify that the cached free count matches the popcount of the bits.
    pub fn validate(&self) -> FsResult<()> {
        let state = self.state.read().unwrap();
        let scanned = state.bits.count_zeros() as u32;
        if scanned != state.free_blocks {
            return Err(FsError::Corruption(format!(
                "bitmap free count is {} but {} bits are clear",
                state.free_blocks, scanned
            )));
        }
        Ok(())
    }

    /// Lowest `start` such that `[start, start + count)` is entirely free.
    fn find_run(bits: &BitSlice<u8, Lsb0>, count: u32) -> Option<u32> {
        let count = count as usize;
        let mut start = FIRST_ALLOCATABLE_BLOCK as usize;
        while start + count <= bits.len() {
            // Jump past the last allocated block in the window, if any.
            match bits[start..start + count].last_one() {
                None => return Some(start as u32),
                Some(conflict) => start += conflict + 1,
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::fs::device::BlockDevice;

    const TOTAL: u32 = 2048;

    fn scratch_bitmap() -> (Bitmap, Layout) {
        let layout = Layout::for_total_blocks(TOTAL).unwrap();
        (Bitmap::new(&layout), layout)
    }

    #[test]
    fn initialize_reserves_metadata() {
        let (bitmap, layout) = scratch_bitmap();
        for idx in 0..layout.data_start {
            assert!(bitmap.is_allocated(idx), "metadata block {idx}");
        }
        assert!(!bitmap.is_allocated(layout.data_start));
        assert_eq!(bitmap.free_blocks(), TOTAL - layout.data_start);
    }

    #[test]
    fn allocate_one_returns_lowest_free() {
        let (bitmap, layout) = scratch_bitmap();
        assert_eq!(bitmap.allocate_one().unwrap(), layout.data_start);
        assert_eq!(bitmap.allocate_one().unwrap(), layout.data_start + 1);
        bitmap.free_one(layout.data_start);
        assert_eq!(bitmap.allocate_one().unwrap(), layout.data_start);
    }

    #[test]
    fn contiguous_allocation_is_first_fit() {
        let (bitmap, layout) = scratch_bitmap();
        let d = layout.data_start;
        assert_eq!(bitmap.allocate_contiguous(4).unwrap(), d);
        assert_eq!(bitmap.allocate_contiguous(2).unwrap(), d + 4);
        assert_eq!(bitmap.allocate_one().unwrap(), d + 6);
        bitmap.free_contiguous(d + 4, 2);
        // A 3-block request must skip the 2-block gap; a 2-block one fits it.
        assert_eq!(bitmap.allocate_contiguous(3).unwrap(), d + 7);
        assert_eq!(bitmap.allocate_contiguous(2).unwrap(), d + 4);
    }

    #[test]
    fn exhaustion_reports_no_space() {
        let (bitmap, _layout) = scratch_bitmap();
        let free = bitmap.free_blocks();
        assert!(bitmap.allocate_contiguous(free + 1).is_err());
        bitmap.allocate_contiguous(free).unwrap();
        assert!(matches!(bitmap.allocate_one(), Err(FsError::NoSpace)));
        assert_eq!(bitmap.free_blocks(), 0);
    }

    #[test]
    fn frees_are_idempotent_and_skip_metadata() {
        let (bitmap, layout) = scratch_bitmap();
        let used = bitmap.used_blocks();
        bitmap.free_one(0);
        bitmap.free_contiguous(0, layout.data_start);
        assert_eq!(bitmap.used_blocks(), used);

        let idx = bitmap.allocate_one().unwrap();
        bitmap.free_one(idx);
        bitmap.free_one(idx);
        assert_eq!(bitmap.used_blocks(), used);
    }

    #[test]
    fn out_of_range_reports_allocated() {
        let (bitmap, _layout) = scratch_bitmap();
        assert!(bitmap.is_allocated(TOTAL));
        assert!(bitmap.is_allocated(u32::MAX));
    }

    #[test]
    fn try_extend_requires_free_run() {
        let (bitmap, layout) = scratch_bitmap();
        let d = layout.data_start;
        assert_eq!(bitmap.allocate_contiguous(2).unwrap(), d);
        assert!(bitmap.try_extend(d + 2, 3));
        assert!(bitmap.is_allocated(d + 4));
        // The run is now occupied, a second extend must fail.
        assert!(!bitmap.try_extend(d + 2, 1));
        // Out of range never extends.
        assert!(!bitmap.try_extend(TOTAL - 1, 2));
    }

    #[test]
    fn free_count_matches_popcount_after_churn() {
        let (bitmap, _layout) = scratch_bitmap();
        let mut allocated = Vec::new();
        // Deterministic pseudo-random churn.
        let mut seed = 0x2545F491u32;
        for _ in 0..500 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            if seed % 3 == 0 && !allocated.is_empty() {
                let idx = allocated.swap_remove(seed as usize % allocated.len());
                bitmap.free_one(idx);
            } else if seed % 7 == 0 {
                if let Ok(start) = bitmap.allocate_contiguous(1 + seed % 5) {
                    for i in 0..(1 + seed % 5) {
                        allocated.push(start + i);
                    }
                }
            } else if let Ok(idx) = bitmap.allocate_one() {
                allocated.push(idx);
            }
            bitmap.validate().unwrap();
        }
    }

    #[test]
    fn save_load_round_trips_through_cache() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::for_total_blocks(TOTAL).unwrap();
        let device = Arc::new(
            BlockDevice::create(dir.path().join("disk.img"), TOTAL as u64 * BLOCK_SIZE as u64)
                .unwrap(),
        );
        let cache = Cache::new(device);

        let bitmap = Bitmap::new(&layout);
        let a = bitmap.allocate_one().unwrap();
        let b = bitmap.allocate_contiguous(5).unwrap();
        bitmap.save(&cache).unwrap();
        cache.flush_all().unwrap();

        let restored = Bitmap::new(&layout);
        restored.load(&cache).unwrap();
        assert_eq!(restored.free_blocks(), bitmap.free_blocks());
        assert!(restored.is_allocated(a));
        for i in 0..5 {
            assert!(restored.is_allocated(b + i));
        }
        assert!(!restored.is_allocated(b + 5));
        restored.validate().unwrap();
    }
}
