//! The 128-byte on-disk inode record.
//!
//! Little-endian, packed:
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 4 | `id` (0 marks a free slot) |
//! | 4 | 1 | `type` (0 = file, 1 = directory) |
//! | 5 | 3 | padding |
//! | 8 | 4 | `size` |
//! | 12 | 4 | `start_block` |
//! | 16 | 4 | `block_count` |
//! | 20 | 4 | `parent_id` |
//! | 24 | 8 | `create_time` |
//! | 32 | 8 | `modify_time` |
//! | 40 | 64 | `name`, NUL-padded |
//! | 104 | 24 | reserved |

use std::io::{Cursor, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{FsError, FsResult};
use crate::fs::{BLOCK_SIZE, INODE_SIZE, MAX_NAME_LEN};
use crate::utils::time_util;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileKind {
    File = 0,
    Directory = 1,
}

impl FileKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for FileKind {
    type Error = FsError;

    fn try_from(value: u8) -> FsResult<Self> {
        match value {
            0 => Ok(FileKind::File),
            1 => Ok(FileKind::Directory),
            other => Err(FsError::Corruption(format!("unknown file type {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    /// 1-based slot index; 1 is the root directory.
    pub id: u32,
    pub kind: FileKind,
    /// Bytes of file content, or serialized directory-page bytes.
    pub size: u32,
    /// First block of the contiguous extent.
    pub start_block: u32,
    /// Extent length in blocks.
    pub block_count: u32,
    /// Parent directory id; the root points to itself.
    pub parent_id: u32,
    pub create_time: u64,
    pub modify_time: u64,
    pub name: String,
}

impl Inode {
    pub fn new(id: u32, kind: FileKind, name: &str, parent_id: u32) -> Self {
        let now = time_util::now();
        Inode {
            id,
            kind,
            size: 0,
            start_block: 0,
            block_count: 0,
            parent_id,
            create_time: now,
            modify_time: now,
            name: name.to_string(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn touch(&mut self) {
        self.modify_time = time_util::now();
    }

    /// Blocks needed for `size` bytes of content; empty files still get one.
    pub fn blocks_for(size: usize) -> u32 {
        size.max(1).div_ceil(BLOCK_SIZE) as u32
    }

    /// Serialize into a 128-byte record.
    pub fn encode(&self) -> [u8; INODE_SIZE] {
        let mut buf = [0u8; INODE_SIZE];
        let mut w = Cursor::new(&mut buf[..]);
        w.write_u32::<LittleEndian>(self.id).unwrap();
        w.write_u8(self.kind.as_u8()).unwrap();
        w.set_position(8); // 3 padding bytes stay zero
        w.write_u32::<LittleEndian>(self.size).unwrap();
        w.write_u32::<LittleEndian>(self.start_block).unwrap();
        w.write_u32::<LittleEndian>(self.block_count).unwrap();
        w.write_u32::<LittleEndian>(self.parent_id).unwrap();
        w.write_u64::<LittleEndian>(self.create_time).unwrap();
        w.write_u64::<LittleEndian>(self.modify_time).unwrap();
        let name = self.name.as_bytes();
        debug_assert!(name.len() <= MAX_NAME_LEN);
        w.write_all(name).unwrap();
        buf
    }

    /// Decode a 128-byte record. `Ok(None)` is a free slot.
    pub fn decode(buf: &[u8]) -> FsResult<Option<Inode>> {
        assert_eq!(buf.len(), INODE_SIZE);
        let mut r = Cursor::new(buf);
        let id = r.read_u32::<LittleEndian>()?;
        if id == 0 {
            return Ok(None);
        }
        let kind = FileKind::try_from(r.read_u8()?)?;
        r.set_position(8);
        let size = r.read_u32::<LittleEndian>()?;
        let start_block = r.read_u32::<LittleEndian>()?;
        let block_count = r.read_u32::<LittleEndian>()?;
        let parent_id = r.read_u32::<LittleEndian>()?;
        let create_time = r.read_u64::<LittleEndian>()?;
        let modify_time = r.read_u64::<LittleEndian>()?;
        let name_bytes = &buf[40..40 + 64];
        let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(64);
        if name_len > MAX_NAME_LEN {
            return Err(FsError::Corruption(format!(
                "inode {id} name is not NUL-terminated"
            )));
        }
        let name = std::str::from_utf8(&name_bytes[..name_len])
            .map_err(|_| FsError::Corruption(format!("inode {id} name is not valid UTF-8")))?
            .to_string();
        Ok(Some(Inode {
            id,
            kind,
            size,
            start_block,
            block_count,
            parent_id,
            create_time,
            modify_time,
            name,
        }))
    }
}
