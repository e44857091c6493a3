//! An educational user-space filesystem kept in a single image file.
//!
//! The image is treated as an array of 4 KiB blocks: a free-block bitmap at
//! block 0, a fixed inode table behind it, and data blocks for file contents
//! and directory pages. Files occupy one contiguous extent each. All block
//! traffic goes through a fixed-capacity FIFO write-back cache.

pub mod cli_interface;
pub mod error;
pub mod fs;
pub mod utils;

pub use error::{FsError, FsResult};
pub use fs::filesystem::{DiskUsage, FileInfo, FileSystem};
pub use fs::inode::{FileKind, Inode};
