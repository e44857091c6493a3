//! In-memory directory page and its on-disk codec.
//!
//! A directory serializes as a little-endian `u32` entry count followed by
//! packed 70-byte entries: `{ u32 inode_id, u8 type, u8 name_len,
//! [u8; 64] name }`. Every directory carries `.` and `..` as its first two
//! entries; the root's `..` points back at the root.

use std::io::{Cursor, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{FsError, FsResult};
use crate::fs::inode::FileKind;
use crate::fs::{MAX_ENTRIES, MAX_NAME_LEN};

/// Bytes per serialized entry.
pub const ENTRY_SIZE: usize = 4 + 1 + 1 + 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode_id: u32,
    pub kind: FileKind,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryPage {
    entries: Vec<DirEntry>,
}

impl DirectoryPage {
    /// A fresh page seeded with `.` and `..`.
    pub fn new_linked(self_id: u32, parent_id: u32) -> Self {
        DirectoryPage {
            entries: vec![
                DirEntry {
                    inode_id: self_id,
                    kind: FileKind::Directory,
                    name: ".".to_string(),
                },
                DirEntry {
                    inode_id: parent_id,
                    kind: FileKind::Directory,
                    name: "..".to_string(),
                },
            ],
        }
    }

    /// Append an entry, rejecting duplicates, over-long names, and overflow.
    pub fn add(&mut self, name: &str, inode_id: u32, kind: FileKind) -> FsResult<()> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(FsError::InvalidName(name.to_string()));
        }
        if self.find(name).is_some() {
            return Err(FsError::Exists(name.to_string()));
        }
        if self.entries.len() >= MAX_ENTRIES {
            return Err(FsError::NoSpace);
        }
        self.entries.push(DirEntry {
            inode_id,
            kind,
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> FsResult<DirEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        Ok(self.entries.remove(pos))
    }

    pub fn find(&self, name: &str) -> Option<&DirEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    /// Whether only `.` and `..` remain.
    pub fn is_empty(&self) -> bool {
        !self.entries.iter().any(|e| e.name != "." && e.name != "..")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn serialized_len(&self) -> usize {
        4 + self.entries.len() * ENTRY_SIZE
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_len());
        let mut w = Cursor::new(&mut buf);
        w.write_u32::<LittleEndian>(self.entries.len() as u32).unwrap();
        for entry in &self.entries {
            let name = entry.name.as_bytes();
            debug_assert!(!name.is_empty() && name.len() <= MAX_NAME_LEN);
            w.write_u32::<LittleEndian>(entry.inode_id).unwrap();
            w.write_u8(entry.kind.as_u8()).unwrap();
            w.write_u8(name.len() as u8).unwrap();
            w.write_all(name).unwrap();
            w.write_all(&[0u8; 64][..64 - name.len()]).unwrap();
        }
        buf
    }

    pub fn deserialize(data: &[u8]) -> FsResult<Self> {
        let mut r = Cursor::new(data);
        let count = r
            .read_u32::<LittleEndian>()
            .map_err(|_| FsError::Corruption("directory page is truncated".to_string()))?
            as usize;
        if count > MAX_ENTRIES {
            return Err(FsError::Corruption(format!(
                "directory claims {count} entries (limit {MAX_ENTRIES})"
            )));
        }
        if data.len() < 4 + count * ENTRY_SIZE {
            return Err(FsError::Corruption(format!(
                "directory page of {} bytes cannot hold {count} entries",
                data.len()
            )));
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let inode_id = r.read_u32::<LittleEndian>()?;
            let kind = FileKind::try_from(r.read_u8()?)?;
            let name_len = r.read_u8()? as usize;
            if name_len == 0 || name_len > MAX_NAME_LEN {
                return Err(FsError::Corruption(format!(
                    "directory entry has name length {name_len}"
                )));
            }
            let start = r.position() as usize;
            let name = std::str::from_utf8(&data[start..start + name_len])
                .map_err(|_| {
                    FsError::Corruption("directory entry name is not valid UTF-8".to_string())
                })?
                .to_string();
            r.set_position((start + 64) as u64);
            entries.push(DirEntry {
                inode_id,
                kind,
                name,
            });
        }
        Ok(DirectoryPage { entries })
    }
}
