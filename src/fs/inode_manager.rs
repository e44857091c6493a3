//! Inode table management: allocation, contiguous-extent storage, directory
//! bookkeeping, and path resolution.
//!
//! Every file occupies one contiguous run of data blocks. Growth first tries
//! to extend the run in place; when the trailing blocks are taken the whole
//! extent relocates to a fresh run and the old one is freed. Directory pages
//! are cached in memory and written through on every mutation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};

use crate::error::{FsError, FsResult};
use crate::fs::bitmap::Bitmap;
use crate::fs::cache::Cache;
use crate::fs::directory::{DirEntry, DirectoryPage};
use crate::fs::inode::{FileKind, Inode};
use crate::fs::layout::Layout;
use crate::fs::{BLOCK_SIZE, INODES_PER_BLOCK, INODE_CAPACITY, INODE_SIZE, MAX_NAME_LEN, ROOT_INODE};

const ILLEGAL_NAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|', '\0'];

/// Reject empty, over-long, and reserved names and illegal characters.
pub fn validate_name(name: &str) -> FsResult<()> {
    if name.is_empty()
        || name.len() > MAX_NAME_LEN
        || name == "."
        || name == ".."
        || name.chars().any(|c| ILLEGAL_NAME_CHARS.contains(&c))
    {
        return Err(FsError::InvalidName(name.to_string()));
    }
    Ok(())
}

struct SlotTable {
    used: Vec<bool>,
    live: u32,
}

pub struct InodeManager {
    cache: Arc<Cache>,
    bitmap: Arc<Bitmap>,
    layout: Layout,
    slots: Mutex<SlotTable>,
    inode_locks: Vec<Mutex<()>>,
    /// Write-through cache of directory pages, keyed by inode id. Consulted
    /// only while the directory's inode lock is held.
    dir_cache: Mutex<HashMap<u32, DirectoryPage>>,
}

impl InodeManager {
    /// Scan the inode table and rebuild the in-memory slot map.
    pub fn new(cache: Arc<Cache>, bitmap: Arc<Bitmap>, layout: Layout) -> FsResult<Self> {
        let mut used = vec![false; INODE_CAPACITY];
        let mut live = 0u32;
        let mut block = vec![0u8; BLOCK_SIZE];
        for table_block in 0..layout.inode_table_blocks {
            cache.read_block(layout.inode_table_start + table_block, &mut block)?;
            for slot_in_block in 0..INODES_PER_BLOCK {
                let slot = table_block as usize * INODES_PER_BLOCK + slot_in_block;
                if slot == 0 {
                    continue;
                }
                let offset = slot_in_block * INODE_SIZE;
                if let Some(inode) = Inode::decode(&block[offset..offset + INODE_SIZE])? {
                    if inode.id as usize == slot {
                        used[slot] = true;
                        live += 1;
                    } else {
                        warn!("inode slot {slot} holds a record with id {}", inode.id);
                    }
                }
            }
        }
        debug!("inode table scan found {live} live inode(s)");
        Ok(InodeManager {
            cache,
            bitmap,
            layout,
            slots: Mutex::new(SlotTable { used, live }),
            inode_locks: (0..INODE_CAPACITY).map(|_| Mutex::new(())).collect(),
            dir_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Create the root directory if the image has none yet.
    pub fn ensure_root(&self) -> FsResult<()> {
        if self.slots.lock().unwrap().used[ROOT_INODE as usize] {
            return Ok(());
        }
        info!("image has no root directory, creating one");
        let start = self.bitmap.allocate_one()?;
        let mut root = Inode::new(ROOT_INODE, FileKind::Directory, "/", ROOT_INODE);
        root.start_block = start;
        root.block_count = 1;
        let page = DirectoryPage::new_linked(ROOT_INODE, ROOT_INODE);
        let bytes = page.serialize();
        root.size = bytes.len() as u32;
        self.write_extent(start, 1, &bytes)?;
        self.write_inode(&root)?;
        let mut slots = self.slots.lock().unwrap();
        slots.used[ROOT_INODE as usize] = true;
        slots.live += 1;
        drop(slots);
        self.dir_cache.lock().unwrap().insert(ROOT_INODE, page);
        Ok(())
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Number of live inodes.
    pub fn live_inodes(&self) -> u32 {
        self.slots.lock().unwrap().live
    }

    pub fn read_inode(&self, id: u32) -> FsResult<Inode> {
        if id == 0 || id as usize >= INODE_CAPACITY || !self.slots.lock().unwrap().used[id as usize]
        {
            return Err(FsError::NotFound(format!("inode {id}")));
        }
        self.read_slot(id)?.ok_or_else(|| {
            FsError::Corruption(format!("inode {id} is tracked as live but its slot is empty"))
        })
    }

    // ------------------------------------------------------------------
    // Node creation and deletion
    // ------------------------------------------------------------------

    pub fn create_file(&self, parent_id: u32, name: &str, content: &[u8]) -> FsResult<u32> {
        self.create_node(parent_id, name, FileKind::File, content)
    }

    pub fn create_directory(&self, parent_id: u32, name: &str) -> FsResult<u32> {
        self.create_node(parent_id, name, FileKind::Directory, &[])
    }

    fn create_node(
        &self,
        parent_id: u32,
        name: &str,
        kind: FileKind,
        content: &[u8],
    ) -> FsResult<u32> {
        validate_name(name)?;
        let _parent_guard = self.lock_inode(parent_id)?;
        let mut parent = self.read_inode(parent_id)?;
        let mut page = self.load_directory_locked(&parent)?;
        if page.find(name).is_some() {
            return Err(FsError::Exists(name.to_string()));
        }

        let id = self.allocate_slot()?;
        let block_count = match kind {
            FileKind::File => Inode::blocks_for(content.len()),
            FileKind::Directory => 1,
        };
        let start = match self.bitmap.allocate_contiguous(block_count) {
            Ok(start) => start,
            Err(e) => {
                self.release_slot(id);
                return Err(e);
            }
        };

        let mut inode = Inode::new(id, kind, name, parent_id);
        inode.start_block = start;
        inode.block_count = block_count;
        if let Err(e) = page
            .add(name, id, kind)
            .and_then(|_| self.populate_node(&mut inode, &mut parent, &page, kind, content))
        {
            // Undo in reverse; the directory entry only existed in our local
            // copy of the page unless the save went through.
            warn!("creating {name:?} failed, rolling back: {e}");
            self.dir_cache.lock().unwrap().remove(&id);
            let _ = self.clear_slot(id);
            self.bitmap.free_contiguous(start, block_count);
            self.release_slot(id);
            return Err(e);
        }
        debug!("created {kind:?} {name:?} as inode {id} at block {start}");
        Ok(id)
    }

    fn populate_node(
        &self,
        inode: &mut Inode,
        parent: &mut Inode,
        parent_page: &DirectoryPage,
        kind: FileKind,
        content: &[u8],
    ) -> FsResult<()> {
        match kind {
            FileKind::File => {
                inode.size = content.len() as u32;
                self.write_extent(inode.start_block, inode.block_count, content)?;
            }
            FileKind::Directory => {
                let child = DirectoryPage::new_linked(inode.id, parent.id);
                let bytes = child.serialize();
                inode.size = bytes.len() as u32;
                self.write_extent(inode.start_block, inode.block_count, &bytes)?;
                self.dir_cache.lock().unwrap().insert(inode.id, child);
            }
        }
        self.write_inode(inode)?;
        self.save_directory_locked(parent, parent_page)
    }

    /// Delete a file: free its extent, drop it from its parent, release the
    /// slot.
    pub fn delete_file(&self, id: u32) -> FsResult<()> {
        let inode = self.read_inode(id)?;
        if inode.is_dir() {
            return Err(FsError::WrongType(format!("{} is a directory", inode.name)));
        }
        let _parent_guard = self.lock_inode(inode.parent_id)?;
        let mut parent = self.read_inode(inode.parent_id)?;
        let mut page = self.load_directory_locked(&parent)?;
        page.remove(&inode.name)?;
        {
            let _guard = self.lock_inode(id)?;
            self.bitmap.free_contiguous(inode.start_block, inode.block_count);
            self.clear_slot(id)?;
            self.release_slot(id);
        }
        self.save_directory_locked(&mut parent, &page)?;
        debug!("deleted file {:?} (inode {id})", inode.name);
        Ok(())
    }

    /// Delete a directory and everything below it. The root is refused.
    pub fn delete_directory(&self, id: u32) -> FsResult<()> {
        if id == ROOT_INODE {
            return Err(FsError::Busy("/".to_string()));
        }
        let inode = self.read_inode(id)?;
        if !inode.is_dir() {
            return Err(FsError::WrongType(format!(
                "{} is not a directory",
                inode.name
            )));
        }
        let _parent_guard = self.lock_inode(inode.parent_id)?;
        let mut parent = self.read_inode(inode.parent_id)?;
        let mut page = self.load_directory_locked(&parent)?;
        page.remove(&inode.name)?;
        self.delete_tree(&inode)?;
        self.save_directory_locked(&mut parent, &page)?;
        debug!("deleted directory {:?} (inode {id})", inode.name);
        Ok(())
    }

    fn delete_tree(&self, dir: &Inode) -> FsResult<()> {
        let entries = {
            let _guard = self.lock_inode(dir.id)?;
            self.load_directory_locked(dir)?.entries().to_vec()
        };
        for entry in entries {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            let child = self.read_inode(entry.inode_id)?;
            match child.kind {
                FileKind::Directory => self.delete_tree(&child)?,
                FileKind::File => {
                    let _guard = self.lock_inode(child.id)?;
                    self.bitmap.free_contiguous(child.start_block, child.block_count);
                    self.clear_slot(child.id)?;
                    self.release_slot(child.id);
                }
            }
        }
        let _guard = self.lock_inode(dir.id)?;
        self.dir_cache.lock().unwrap().remove(&dir.id);
        self.bitmap.free_contiguous(dir.start_block, dir.block_count);
        self.clear_slot(dir.id)?;
        self.release_slot(dir.id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // File content
    // ------------------------------------------------------------------

    pub fn read_file(&self, id: u32) -> FsResult<Vec<u8>> {
        let _guard = self.lock_inode(id)?;
        let inode = self.read_inode(id)?;
        if inode.is_dir() {
            return Err(FsError::WrongType(format!("{} is a directory", inode.name)));
        }
        self.read_extent(inode.start_block, inode.block_count, inode.size as usize)
    }

    /// Replace the whole content, resizing the extent as needed.
    pub fn write_file(&self, id: u32, content: &[u8]) -> FsResult<()> {
        let _guard = self.lock_inode(id)?;
        let mut inode = self.read_inode(id)?;
        if inode.is_dir() {
            return Err(FsError::WrongType(format!("{} is a directory", inode.name)));
        }
        self.ensure_extent(&mut inode, content.len())?;
        inode.size = content.len() as u32;
        inode.touch();
        self.write_extent(inode.start_block, inode.block_count, content)?;
        self.write_inode(&inode)
    }

    /// Read one block of a file, clipped to the logical size.
    pub fn read_file_block(&self, id: u32, block_index: u32) -> FsResult<Vec<u8>> {
        let _guard = self.lock_inode(id)?;
        let inode = self.read_inode(id)?;
        if inode.is_dir() {
            return Err(FsError::WrongType(format!("{} is a directory", inode.name)));
        }
        if block_index >= inode.block_count {
            return Err(FsError::NotFound(format!(
                "block {block_index} of {}",
                inode.name
            )));
        }
        let mut block = vec![0u8; BLOCK_SIZE];
        self.cache.read_block(inode.start_block + block_index, &mut block)?;
        let offset = block_index as usize * BLOCK_SIZE;
        let len = (inode.size as usize).saturating_sub(offset).min(BLOCK_SIZE);
        block.truncate(len);
        Ok(block)
    }

    /// Overwrite the head of one existing block of a file; the rest of the
    /// block keeps its prior content.
    pub fn write_file_block(&self, id: u32, block_index: u32, data: &[u8]) -> FsResult<()> {
        if data.len() > BLOCK_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} bytes do not fit one block", data.len()),
            )
            .into());
        }
        let _guard = self.lock_inode(id)?;
        let mut inode = self.read_inode(id)?;
        if inode.is_dir() {
            return Err(FsError::WrongType(format!("{} is a directory", inode.name)));
        }
        if block_index >= inode.block_count {
            return Err(FsError::NotFound(format!(
                "block {block_index} of {}",
                inode.name
            )));
        }
        let mut block = vec![0u8; BLOCK_SIZE];
        self.cache.read_block(inode.start_block + block_index, &mut block)?;
        block[..data.len()].copy_from_slice(data);
        self.cache.write_block(inode.start_block + block_index, &block)?;
        let end = block_index as usize * BLOCK_SIZE + data.len();
        if end as u32 > inode.size {
            inode.size = end as u32;
        }
        inode.touch();
        self.write_inode(&inode)
    }

    /// Resize a file's content to `new_size` bytes, preserving the prefix.
    pub fn resize(&self, id: u32, new_size: usize) -> FsResult<()> {
        let _guard = self.lock_inode(id)?;
        let mut inode = self.read_inode(id)?;
        if inode.is_dir() {
            return Err(FsError::WrongType(format!("{} is a directory", inode.name)));
        }
        self.ensure_extent(&mut inode, new_size)?;
        inode.size = new_size as u32;
        inode.touch();
        self.write_inode(&inode)
    }

    // ------------------------------------------------------------------
    // Directories and path resolution
    // ------------------------------------------------------------------

    /// Walk a normalized absolute path down from the root.
    pub fn resolve(&self, path: &str) -> FsResult<u32> {
        let mut current = ROOT_INODE;
        for segment in path.split('/') {
            match segment {
                "" | "." => continue,
                ".." => current = self.read_inode(current)?.parent_id,
                name => {
                    let inode = self.read_inode(current)?;
                    let _guard = self.lock_inode(current)?;
                    let page = self.load_directory_locked(&inode)?;
                    current = page
                        .find(name)
                        .ok_or_else(|| FsError::NotFound(path.to_string()))?
                        .inode_id;
                }
            }
        }
        Ok(current)
    }

    pub fn list_directory(&self, id: u32) -> FsResult<Vec<DirEntry>> {
        let _guard = self.lock_inode(id)?;
        let inode = self.read_inode(id)?;
        Ok(self.load_directory_locked(&inode)?.entries().to_vec())
    }

    /// Whether a directory holds anything besides `.` and `..`.
    pub fn directory_is_empty(&self, id: u32) -> FsResult<bool> {
        let _guard = self.lock_inode(id)?;
        let inode = self.read_inode(id)?;
        Ok(self.load_directory_locked(&inode)?.is_empty())
    }

    fn load_directory_locked(&self, inode: &Inode) -> FsResult<DirectoryPage> {
        if !inode.is_dir() {
            return Err(FsError::WrongType(format!(
                "{} is not a directory",
                inode.name
            )));
        }
        if let Some(page) = self.dir_cache.lock().unwrap().get(&inode.id) {
            return Ok(page.clone());
        }
        let bytes = self.read_extent(inode.start_block, inode.block_count, inode.size as usize)?;
        let page = DirectoryPage::deserialize(&bytes)?;
        self.dir_cache.lock().unwrap().insert(inode.id, page.clone());
        Ok(page)
    }

    fn save_directory_locked(&self, inode: &mut Inode, page: &DirectoryPage) -> FsResult<()> {
        let bytes = page.serialize();
        self.ensure_extent(inode, bytes.len())?;
        inode.size = bytes.len() as u32;
        inode.touch();
        self.write_extent(inode.start_block, inode.block_count, &bytes)?;
        self.write_inode(inode)?;
        self.dir_cache.lock().unwrap().insert(inode.id, page.clone());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Extents
    // ------------------------------------------------------------------

    /// Grow or shrink an extent to fit `new_size` bytes. Growth extends in
    /// place when the trailing blocks are free, otherwise the content moves
    /// to a freshly allocated run.
    fn ensure_extent(&self, inode: &mut Inode, new_size: usize) -> FsResult<()> {
        let new_blocks = Inode::blocks_for(new_size);
        let old_blocks = inode.block_count;
        if new_blocks == old_blocks {
            return Ok(());
        }
        if new_blocks > old_blocks {
            let delta = new_blocks - old_blocks;
            if self.bitmap.try_extend(inode.start_block + old_blocks, delta) {
                debug!("inode {} grew in place to {new_blocks} block(s)", inode.id);
            } else {
                let new_start = self.bitmap.allocate_contiguous(new_blocks)?;
                if let Err(e) = self.copy_extent(inode.start_block, new_start, old_blocks) {
                    self.bitmap.free_contiguous(new_start, new_blocks);
                    return Err(e);
                }
                self.bitmap.free_contiguous(inode.start_block, old_blocks);
                info!(
                    "inode {} relocated from block {} to {new_start}",
                    inode.id, inode.start_block
                );
                inode.start_block = new_start;
            }
        } else {
            self.bitmap
                .free_contiguous(inode.start_block + new_blocks, old_blocks - new_blocks);
        }
        inode.block_count = new_blocks;
        Ok(())
    }

    fn copy_extent(&self, src: u32, dst: u32, count: u32) -> FsResult<()> {
        let mut block = vec![0u8; BLOCK_SIZE];
        for i in 0..count {
            self.cache.read_block(src + i, &mut block)?;
            self.cache.write_block(dst + i, &block)?;
        }
        Ok(())
    }

    fn write_extent(&self, start: u32, block_count: u32, data: &[u8]) -> FsResult<()> {
        let mut block = vec![0u8; BLOCK_SIZE];
        for i in 0..block_count {
            let lo = i as usize * BLOCK_SIZE;
            let hi = data.len().min(lo + BLOCK_SIZE);
            block.fill(0);
            if lo < hi {
                block[..hi - lo].copy_from_slice(&data[lo..hi]);
            }
            self.cache.write_block(start + i, &block)?;
        }
        Ok(())
    }

    fn read_extent(&self, start: u32, block_count: u32, len: usize) -> FsResult<Vec<u8>> {
        let mut data = vec![0u8; block_count as usize * BLOCK_SIZE];
        for i in 0..block_count {
            let lo = i as usize * BLOCK_SIZE;
            self.cache.read_block(start + i, &mut data[lo..lo + BLOCK_SIZE])?;
        }
        data.truncate(len);
        Ok(data)
    }

    // ------------------------------------------------------------------
    // Inode table plumbing
    // ------------------------------------------------------------------

    fn read_slot(&self, id: u32) -> FsResult<Option<Inode>> {
        let (block_idx, offset) = self.layout.inode_position(id);
        let mut block = vec![0u8; BLOCK_SIZE];
        self.cache.read_block(block_idx, &mut block)?;
        Inode::decode(&block[offset..offset + INODE_SIZE])
    }

    fn write_inode(&self, inode: &Inode) -> FsResult<()> {
        let (block_idx, offset) = self.layout.inode_position(inode.id);
        let mut block = vec![0u8; BLOCK_SIZE];
        self.cache.read_block(block_idx, &mut block)?;
        block[offset..offset + INODE_SIZE].copy_from_slice(&inode.encode());
        self.cache.write_block(block_idx, &block)
    }

    fn clear_slot(&self, id: u32) -> FsResult<()> {
        let (block_idx, offset) = self.layout.inode_position(id);
        let mut block = vec![0u8; BLOCK_SIZE];
        self.cache.read_block(block_idx, &mut block)?;
        block[offset..offset + INODE_SIZE].fill(0);
        self.cache.write_block(block_idx, &block)
    }

    fn allocate_slot(&self) -> FsResult<u32> {
        let mut slots = self.slots.lock().unwrap();
        // Slot 0 stays unused and slot 1 belongs to the root.
        let id = (2..INODE_CAPACITY)
            .find(|&i| !slots.used[i])
            .ok_or(FsError::NoInodes)? as u32;
        slots.used[id as usize] = true;
        slots.live += 1;
        Ok(id)
    }

    fn release_slot(&self, id: u32) {
        let mut slots = self.slots.lock().unwrap();
        if slots.used[id as usize] {
            slots.used[id as usize] = false;
            slots.live -= 1;
        }
    }

    fn lock_inode(&self, id: u32) -> FsResult<MutexGuard<'_, ()>> {
        let lock = self
            .inode_locks
            .get(id as usize)
            .ok_or_else(|| FsError::Corruption(format!("inode id {id} is out of range")))?;
        Ok(lock.lock().unwrap())
    }

    // ------------------------------------------------------------------
    // Consistency checking
    // ------------------------------------------------------------------

    /// Walk every live inode and check the structural invariants: extents
    /// inside the data region and fully marked in the bitmap, no two extents
    /// overlapping, directory entries naming live children that point back at
    /// their parent, exactly one `.` and `..` per directory, and a bitmap
    /// free count matching its popcount.
    pub fn verify(&self) -> FsResult<()> {
        self.bitmap.validate()?;
        let live: Vec<u32> = {
            let slots = self.slots.lock().unwrap();
            (1..INODE_CAPACITY as u32)
                .filter(|&i| slots.used[i as usize])
                .collect()
        };

        let mut extents: Vec<(u32, u32, u32)> = Vec::with_capacity(live.len());
        for id in live {
            let inode = self.read_inode(id)?;
            let end = inode.start_block.saturating_add(inode.block_count);
            if inode.block_count == 0
                || !self.layout.is_data_block(inode.start_block)
                || end > self.layout.total_blocks
            {
                return Err(FsError::Corruption(format!(
                    "inode {id} extent [{}, {end}) leaves the data region",
                    inode.start_block
                )));
            }
            for idx in inode.start_block..end {
                if !self.bitmap.is_allocated(idx) {
                    return Err(FsError::Corruption(format!(
                        "inode {id} owns block {idx} but the bitmap has it free"
                    )));
                }
            }
            extents.push((inode.start_block, end, id));

            if inode.is_dir() {
                self.verify_directory(&inode)?;
            }
        }

        extents.sort_unstable();
        for pair in extents.windows(2) {
            let (_, prev_end, prev_id) = pair[0];
            let (next_start, _, next_id) = pair[1];
            if next_start < prev_end {
                return Err(FsError::Corruption(format!(
                    "inodes {prev_id} and {next_id} have overlapping extents"
                )));
            }
        }
        Ok(())
    }

    fn verify_directory(&self, dir: &Inode) -> FsResult<()> {
        let page = {
            let _guard = self.lock_inode(dir.id)?;
            self.load_directory_locked(dir)?
        };
        let mut names = HashSet::with_capacity(page.len());
        let mut dots = 0;
        let mut dotdots = 0;
        for entry in page.entries() {
            if !names.insert(entry.name.clone()) {
                return Err(FsError::Corruption(format!(
                    "directory {} lists {:?} twice",
                    dir.id, entry.name
                )));
            }
            match entry.name.as_str() {
                "." => {
                    dots += 1;
                    if entry.inode_id != dir.id {
                        return Err(FsError::Corruption(format!(
                            "directory {} has a '.' entry pointing at {}",
                            dir.id, entry.inode_id
                        )));
                    }
                }
                ".." => {
                    dotdots += 1;
                    if entry.inode_id != dir.parent_id {
                        return Err(FsError::Corruption(format!(
                            "directory {} has a '..' entry pointing at {}",
                            dir.id, entry.inode_id
                        )));
                    }
                }
                name => {
                    let child = self.read_inode(entry.inode_id).map_err(|_| {
                        FsError::Corruption(format!(
                            "directory {} entry {name:?} names dead inode {}",
                            dir.id, entry.inode_id
                        ))
                    })?;
                    if child.parent_id != dir.id {
                        return Err(FsError::Corruption(format!(
                            "inode {} has parent {} but is listed in {}",
                            child.id, child.parent_id, dir.id
                        )));
                    }
                    if child.kind != entry.kind {
                        return Err(FsError::Corruption(format!(
                            "directory {} entry {name:?} disagrees with inode {} about its type",
                            dir.id, child.id
                        )));
                    }
                }
            }
        }
        if dots != 1 || dotdots != 1 {
            return Err(FsError::Corruption(format!(
                "directory {} has {dots} '.' and {dotdots} '..' entries",
                dir.id
            )));
        }
        Ok(())
    }
}
