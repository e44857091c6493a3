//! Block device over a single backing file.
//!
//! The file is the byte-exact concatenation of [`BLOCK_SIZE`] blocks. All
//! transfers are exactly one block; writes are flushed to the host before
//! returning. Errors at this layer are hard, callers never retry.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use log::info;

use crate::error::FsResult;
use crate::fs::BLOCK_SIZE;

pub struct BlockDevice {
    file: Mutex<File>,
    file_len: u64,
    total_blocks: u32,
}

impl BlockDevice {
    /// Create (or truncate) the backing file, zero-fill it to `size_bytes`,
    /// and reopen it read/write.
    pub fn create<P: AsRef<Path>>(path: P, size_bytes: u64) -> FsResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size_bytes)?;
        file.sync_all()?;
        drop(file);

        let device = Self::open(path)?;
        info!(
            "created image {} ({} blocks of {} bytes)",
            path.display(),
            device.total_blocks,
            BLOCK_SIZE
        );
        Ok(device)
    }

    /// Open an existing backing file and derive the block count from its size.
    pub fn open<P: AsRef<Path>>(path: P) -> FsResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();
        let total_blocks = (file_len / BLOCK_SIZE as u64) as u32;
        info!(
            "opened image {} ({total_blocks} blocks, {file_len} bytes)",
            path.display()
        );
        Ok(BlockDevice {
            file: Mutex::new(file),
            file_len,
            total_blocks,
        })
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// Exact size of the backing file in bytes.
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Read block `idx` into `buf`. `buf` must be exactly one block.
    pub fn read_block(&self, idx: u32, buf: &mut [u8]) -> FsResult<()> {
        assert_eq!(buf.len(), BLOCK_SIZE, "not a complete block");
        self.check_index(idx)?;
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(idx as u64 * BLOCK_SIZE as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Write `buf` to block `idx` and flush. `buf` must be exactly one block.
    pub fn write_block(&self, idx: u32, buf: &[u8]) -> FsResult<()> {
        assert_eq!(buf.len(), BLOCK_SIZE, "not a complete block");
        self.check_index(idx)?;
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(idx as u64 * BLOCK_SIZE as u64))?;
        file.write_all(buf)?;
        file.flush()?;
        Ok(())
    }

    /// Copy `count` contiguous blocks from `src` to `dst`, one block at a
    /// time.
    pub fn copy_blocks(&self, src: u32, dst: u32, count: u32) -> FsResult<()> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        for i in 0..count {
            self.read_block(src + i, &mut buf)?;
            self.write_block(dst + i, &buf)?;
        }
        Ok(())
    }

    fn check_index(&self, idx: u32) -> FsResult<()> {
        if idx >= self.total_blocks {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "block {idx} exceeds device capacity ({} blocks)",
                    self.total_blocks
                ),
            )
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FsError;

    fn scratch_device(blocks: u32) -> (tempfile::TempDir, BlockDevice) {
        let dir = tempfile::tempdir().unwrap();
        let device =
            BlockDevice::create(dir.path().join("disk.img"), blocks as u64 * BLOCK_SIZE as u64)
                .unwrap();
        (dir, device)
    }

    #[test]
    fn create_derives_block_count() {
        let (_dir, device) = scratch_device(64);
        assert_eq!(device.total_blocks(), 64);
        assert_eq!(device.file_len(), 64 * BLOCK_SIZE as u64);
    }

    #[test]
    fn fresh_image_reads_zero() {
        let (_dir, device) = scratch_device(8);
        let mut buf = vec![0xFFu8; BLOCK_SIZE];
        device.read_block(7, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, device) = scratch_device(8);
        let block: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
        device.write_block(3, &block).unwrap();
        let mut back = vec![0u8; BLOCK_SIZE];
        device.read_block(3, &mut back).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let block = vec![0xA5u8; BLOCK_SIZE];
        {
            let device = BlockDevice::create(&path, 8 * BLOCK_SIZE as u64).unwrap();
            device.write_block(5, &block).unwrap();
        }
        let device = BlockDevice::open(&path).unwrap();
        assert_eq!(device.total_blocks(), 8);
        let mut back = vec![0u8; BLOCK_SIZE];
        device.read_block(5, &mut back).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let (_dir, device) = scratch_device(8);
        let mut buf = vec![0u8; BLOCK_SIZE];
        assert!(matches!(
            device.read_block(8, &mut buf),
            Err(FsError::Io(_))
        ));
        assert!(matches!(device.write_block(9, &buf), Err(FsError::Io(_))));
    }

    #[test]
    fn copy_blocks_is_byte_exact() {
        let (_dir, device) = scratch_device(16);
        for i in 0..3u32 {
            let block = vec![i as u8 + 1; BLOCK_SIZE];
            device.write_block(2 + i, &block).unwrap();
        }
        device.copy_blocks(2, 10, 3).unwrap();
        let mut buf = vec![0u8; BLOCK_SIZE];
        for i in 0..3u32 {
            device.read_block(10 + i, &mut buf).unwrap();
            assert!(buf.iter().all(|&b| b == i as u8 + 1));
        }
    }
}
