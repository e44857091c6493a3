//! Fixed-capacity block cache with FIFO eviction and write-back.
//!
//! Frames are filled in ascending index order; once full, the victim is the
//! frame that was *inserted* earliest (reads do not touch queue order). A
//! dirty victim is written back before its frame is reused. During steady
//! state every block transfer in the system goes through here.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use log::debug;

use crate::error::FsResult;
use crate::fs::device::BlockDevice;
use crate::fs::{BLOCK_SIZE, CACHE_PAGES};

struct Frame {
    /// Cached block index, or `None` for an empty frame.
    block: Option<u32>,
    dirty: bool,
    data: Vec<u8>,
}

impl Frame {
    fn new() -> Self {
        Frame {
            block: None,
            dirty: false,
            data: vec![0; BLOCK_SIZE],
        }
    }
}

struct FrameTable {
    frames: Vec<Frame>,
    /// Insertion order; the front is the next eviction victim.
    queue: VecDeque<usize>,
    /// block index -> frame index, for O(1) residency lookup.
    map: HashMap<u32, usize>,
}

pub struct Cache {
    device: Arc<BlockDevice>,
    table: RwLock<FrameTable>,
}

/// Snapshot of one occupied frame, for the `cache` shell command and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameStatus {
    pub block: u32,
    pub dirty: bool,
}

#[derive(Debug, Clone)]
pub struct CacheStatus {
    pub capacity: usize,
    /// Occupied frames in FIFO order, oldest first.
    pub resident: Vec<FrameStatus>,
}

impl Cache {
    pub fn new(device: Arc<BlockDevice>) -> Self {
        Self::with_capacity(device, CACHE_PAGES)
    }

    pub fn with_capacity(device: Arc<BlockDevice>, pages: usize) -> Self {
        assert!(pages > 0, "cache needs at least one frame");
        Cache {
            device,
            table: RwLock::new(FrameTable {
                frames: (0..pages).map(|_| Frame::new()).collect(),
                queue: VecDeque::with_capacity(pages),
                map: HashMap::with_capacity(pages),
            }),
        }
    }

    pub fn device(&self) -> &Arc<BlockDevice> {
        &self.device
    }

    /// Read block `idx` through the cache into `buf`.
    pub fn read_block(&self, idx: u32, buf: &mut [u8]) -> FsResult<()> {
        assert_eq!(buf.len(), BLOCK_SIZE, "not a complete block");
        {
            let table = self.table.read().unwrap();
            if let Some(&frame_idx) = table.map.get(&idx) {
                buf.copy_from_slice(&table.frames[frame_idx].data);
                return Ok(());
            }
        }

        let mut table = self.table.write().unwrap();
        // Another thread may have loaded the block between the read lock
        // being dropped and the write lock being taken.
        if let Some(&frame_idx) = table.map.get(&idx) {
            buf.copy_from_slice(&table.frames[frame_idx].data);
            return Ok(());
        }
        let frame_idx = Self::get_free_frame(&mut table, self.device.as_ref())?;
        self.device.read_block(idx, &mut table.frames[frame_idx].data)?;
        Self::install(&mut table, frame_idx, idx);
        buf.copy_from_slice(&table.frames[frame_idx].data);
        Ok(())
    }

    /// Write `buf` to block `idx` through the cache; the frame is marked
    /// dirty and written back on eviction or [`Cache::flush_all`].
    pub fn write_block(&self, idx: u32, buf: &[u8]) -> FsResult<()> {
        assert_eq!(buf.len(), BLOCK_SIZE, "not a complete block");
        let mut table = self.table.write().unwrap();
        let frame_idx = match table.map.get(&idx) {
            Some(&frame_idx) => frame_idx,
            None => {
                let frame_idx = Self::get_free_frame(&mut table, self.device.as_ref())?;
                // Fetch the current block content first so a write that is
                // logically partial still preserves what it does not cover.
                self.device.read_block(idx, &mut table.frames[frame_idx].data)?;
                Self::install(&mut table, frame_idx, idx);
                frame_idx
            }
        };
        let frame = &mut table.frames[frame_idx];
        frame.data.copy_from_slice(buf);
        frame.dirty = true;
        Ok(())
    }

    /// Write back every dirty frame and clear the dirty bits. Residency is
    /// unaffected.
    pub fn flush_all(&self) -> FsResult<()> {
        let mut table = self.table.write().unwrap();
        for frame in table.frames.iter_mut() {
            if frame.dirty {
                let block = frame.block.expect("dirty frame without a block");
                self.device.write_block(block, &frame.data)?;
                frame.dirty = false;
            }
        }
        Ok(())
    }

    /// Whether block `idx` currently occupies a frame.
    pub fn is_resident(&self, idx: u32) -> bool {
        self.table.read().unwrap().map.contains_key(&idx)
    }

    pub fn status(&self) -> CacheStatus {
        let table = self.table.read().unwrap();
        CacheStatus {
            capacity: table.frames.len(),
            resident: table
                .queue
                .iter()
                .map(|&frame_idx| {
                    let frame = &table.frames[frame_idx];
                    FrameStatus {
                        block: frame.block.expect("queued frame without a block"),
                        dirty: frame.dirty,
                    }
                })
                .collect(),
        }
    }

    /// Pick a frame for a new block: the lowest-index empty frame if any,
    /// otherwise the FIFO head after writing it back if dirty.
    fn get_free_frame(table: &mut FrameTable, device: &BlockDevice) -> FsResult<usize> {
        if let Some(frame_idx) = table.frames.iter().position(|f| f.block.is_none()) {
            return Ok(frame_idx);
        }

        let &victim = table.queue.front().expect("full cache with empty queue");
        let old_block = table.frames[victim].block.expect("queued frame without a block");
        if table.frames[victim].dirty {
            device.write_block(old_block, &table.frames[victim].data)?;
            table.frames[victim].dirty = false;
        }
        debug!("evicting block {old_block} from frame {victim}");
        table.queue.pop_front();
        table.map.remove(&old_block);
        table.frames[victim].block = None;
        Ok(victim)
    }

    fn install(table: &mut FrameTable, frame_idx: usize, block: u32) {
        table.frames[frame_idx].block = Some(block);
        table.frames[frame_idx].dirty = false;
        table.queue.push_back(frame_idx);
        table.map.insert(block, frame_idx);
    }
}
