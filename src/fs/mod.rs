//! The filesystem proper: block device, cache, allocator, inodes, facade.

pub mod bitmap;
pub mod cache;
pub mod device;
pub mod directory;
pub mod filesystem;
pub mod inode;
pub mod inode_manager;
pub mod layout;

/// Size of one block in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Number of page frames held by the block cache.
pub const CACHE_PAGES: usize = 16;

/// On-disk size of one inode record. Divides [`BLOCK_SIZE`].
pub const INODE_SIZE: usize = 128;

/// Inode records per inode-table block.
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;

/// Number of inode slots. Slot 0 is never used, slot 1 is the root.
pub const INODE_CAPACITY: usize = 1024;

/// Inode id of the root directory.
pub const ROOT_INODE: u32 = 1;

/// Longest permitted file or directory name, in bytes.
pub const MAX_NAME_LEN: usize = 63;

/// Entry limit for a single directory.
pub const MAX_ENTRIES: usize = 256;

/// Block allocation never returns indices below this.
pub const FIRST_ALLOCATABLE_BLOCK: u32 = 2;
