//! The filesystem facade: mount lifecycle, current working directory,
//! open-file reference counts, and the path-based operation surface.
//!
//! Each [`FileSystem`] value is fully independent, so tests can run several
//! instances side by side. The facade owns the component stack; everything
//! below it is reached through shared handles.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::error::{FsError, FsResult};
use crate::fs::bitmap::Bitmap;
use crate::fs::cache::{Cache, CacheStatus};
use crate::fs::device::BlockDevice;
use crate::fs::inode::{FileKind, Inode};
use crate::fs::inode_manager::InodeManager;
use crate::fs::layout::Layout;
use crate::fs::{BLOCK_SIZE, INODE_CAPACITY};

/// Metadata snapshot of one file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub inode_id: u32,
    pub name: String,
    pub kind: FileKind,
    pub size: u32,
    pub start_block: u32,
    pub block_count: u32,
    pub parent_id: u32,
    pub create_time: u64,
    pub modify_time: u64,
}

impl From<&Inode> for FileInfo {
    fn from(inode: &Inode) -> Self {
        FileInfo {
            inode_id: inode.id,
            name: inode.name.clone(),
            kind: inode.kind,
            size: inode.size,
            start_block: inode.start_block,
            block_count: inode.block_count,
            parent_id: inode.parent_id,
            create_time: inode.create_time,
            modify_time: inode.modify_time,
        }
    }
}

/// Usage numbers for the `df` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_blocks: u32,
    pub used_blocks: u32,
    pub free_blocks: u32,
    pub metadata_blocks: u32,
    pub used_inodes: u32,
    pub inode_capacity: u32,
}

#[derive(Clone)]
struct Mounted {
    image: PathBuf,
    cache: Arc<Cache>,
    bitmap: Arc<Bitmap>,
    inodes: Arc<InodeManager>,
}

struct FsState {
    mounted: Option<Mounted>,
    cwd: String,
    /// Normalized path -> open reference count.
    open_files: HashMap<String, u32>,
}

pub struct FileSystem {
    state: Mutex<FsState>,
}

impl Default for FileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem {
    pub fn new() -> Self {
        FileSystem {
            state: Mutex::new(FsState {
                mounted: None,
                cwd: "/".to_string(),
                open_files: HashMap::new(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Mount lifecycle
    // ------------------------------------------------------------------

    /// Lay a fresh filesystem onto `image`. The image is left unmounted.
    pub fn format<P: AsRef<Path>>(&self, image: P, size_mb: u64) -> FsResult<()> {
        let state = self.state.lock().unwrap();
        if state.mounted.is_some() {
            return Err(FsError::AlreadyMounted);
        }
        drop(state);

        let size_bytes = size_mb * 1024 * 1024;
        let total_blocks = (size_bytes / BLOCK_SIZE as u64) as u32;
        let layout = Layout::for_total_blocks(total_blocks)?;
        let device = Arc::new(BlockDevice::create(&image, size_bytes)?);
        // The image was just zero-filled, so the inode table already reads
        // as all-free; only the bitmap needs to reach the disk.
        let cache = Cache::new(device);
        let bitmap = Bitmap::new(&layout);
        bitmap.save(&cache)?;
        cache.flush_all()?;
        info!(
            "formatted {} ({size_mb} MiB, {total_blocks} blocks, {} reserved)",
            image.as_ref().display(),
            layout.metadata_blocks()
        );
        Ok(())
    }

    /// Open an image and bring the component stack up. Creates the root
    /// directory on first mount.
    pub fn mount<P: AsRef<Path>>(&self, image: P) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.mounted.is_some() {
            return Err(FsError::AlreadyMounted);
        }

        let image = image.as_ref();
        let device = Arc::new(BlockDevice::open(image)?);
        if device.file_len() % BLOCK_SIZE as u64 != 0 {
            return Err(FsError::Corruption(format!(
                "{} is not block-aligned",
                image.display()
            )));
        }
        let layout = Layout::for_total_blocks(device.total_blocks())?;
        let cache = Arc::new(Cache::new(device));
        let bitmap = Arc::new(Bitmap::new(&layout));
        bitmap.load(cache.as_ref())?;
        let inodes = Arc::new(InodeManager::new(cache.clone(), bitmap.clone(), layout)?);
        inodes.ensure_root()?;

        state.mounted = Some(Mounted {
            image: image.to_path_buf(),
            cache,
            bitmap,
            inodes,
        });
        state.cwd = "/".to_string();
        info!("mounted {}", image.display());
        Ok(())
    }

    /// Flush everything and tear the component stack down.
    pub fn unmount(&self) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        let mounted = state.mounted.take().ok_or(FsError::NotMounted)?;
        mounted.cache.flush_all()?;
        mounted.bitmap.save(mounted.cache.as_ref())?;
        mounted.cache.flush_all()?;
        state.open_files.clear();
        state.cwd = "/".to_string();
        info!("unmounted {}", mounted.image.display());
        Ok(())
    }

    pub fn is_mounted(&self) -> bool {
        self.state.lock().unwrap().mounted.is_some()
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// Create a file with the given content. Fails if the path exists.
    pub fn create_file(&self, path: &str, content: &[u8]) -> FsResult<u32> {
        let (mounted, target) = self.target_unused(path)?;
        let (parent_path, name) = split_parent(&target);
        let parent_id = mounted.inodes.resolve(parent_path)?;
        mounted.inodes.create_file(parent_id, name, content)
    }

    /// Replace a file's content, creating the file when it does not exist.
    pub fn write_file(&self, path: &str, content: &[u8]) -> FsResult<()> {
        let (mounted, target) = self.target_unused(path)?;
        match mounted.inodes.resolve(&target) {
            Ok(id) => mounted.inodes.write_file(id, content),
            Err(FsError::NotFound(_)) => {
                let (parent_path, name) = split_parent(&target);
                let parent_id = mounted.inodes.resolve(parent_path)?;
                mounted.inodes.create_file(parent_id, name, content)?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Read a whole file. The open count is held for the duration of the
    /// read.
    pub fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let (mounted, target) = self.mounted_and(path)?;
        let id = mounted.inodes.resolve(&target)?;
        self.retain(&target);
        let result = mounted.inodes.read_file(id);
        self.release(&target);
        result
    }

    /// Read one block of a file.
    pub fn read_file_block(&self, path: &str, block_index: u32) -> FsResult<Vec<u8>> {
        let (mounted, target) = self.mounted_and(path)?;
        let id = mounted.inodes.resolve(&target)?;
        self.retain(&target);
        let result = mounted.inodes.read_file_block(id, block_index);
        self.release(&target);
        result
    }

    /// Overwrite one block of a file in place.
    pub fn write_file_block(&self, path: &str, block_index: u32, data: &[u8]) -> FsResult<()> {
        let (mounted, target) = self.target_unused(path)?;
        let id = mounted.inodes.resolve(&target)?;
        mounted.inodes.write_file_block(id, block_index, data)
    }

    /// Delete a file. Open files are refused.
    pub fn delete_file(&self, path: &str) -> FsResult<()> {
        let (mounted, target) = self.target_unused(path)?;
        let id = mounted.inodes.resolve(&target)?;
        mounted.inodes.delete_file(id)
    }

    // ------------------------------------------------------------------
    // Directories
    // ------------------------------------------------------------------

    pub fn create_directory(&self, path: &str) -> FsResult<u32> {
        let (mounted, target) = self.mounted_and(path)?;
        if target == "/" {
            return Err(FsError::Exists("/".to_string()));
        }
        let (parent_path, name) = split_parent(&target);
        let parent_id = mounted.inodes.resolve(parent_path)?;
        mounted.inodes.create_directory(parent_id, name)
    }

    /// Remove a directory. Without `recursive`, a directory that still holds
    /// entries is refused; with it, the whole subtree goes. Directories with
    /// open descendants are refused either way.
    pub fn delete_directory(&self, path: &str, recursive: bool) -> FsResult<()> {
        let (mounted, target) = self.mounted_and(path)?;
        if target == "/" {
            return Err(FsError::Busy("/".to_string()));
        }
        {
            let state = self.state.lock().unwrap();
            let prefix = format!("{target}/");
            if let Some(open) = state
                .open_files
                .keys()
                .find(|p| **p == target || p.starts_with(&prefix))
            {
                return Err(FsError::Busy(open.clone()));
            }
        }
        let id = mounted.inodes.resolve(&target)?;
        if !recursive && !mounted.inodes.directory_is_empty(id)? {
            return Err(FsError::NotEmpty(target));
        }
        mounted.inodes.delete_directory(id)
    }

    /// List a directory, resolving each entry to its metadata.
    pub fn list_directory(&self, path: &str) -> FsResult<Vec<FileInfo>> {
        let (mounted, target) = self.mounted_and(path)?;
        let id = mounted.inodes.resolve(&target)?;
        let entries = mounted.inodes.list_directory(id)?;
        let mut infos = Vec::with_capacity(entries.len());
        for entry in entries {
            let inode = mounted.inodes.read_inode(entry.inode_id)?;
            let mut info = FileInfo::from(&inode);
            // `.` and `..` keep their entry names rather than the inode's.
            info.name = entry.name;
            infos.push(info);
        }
        Ok(infos)
    }

    pub fn stat(&self, path: &str) -> FsResult<FileInfo> {
        let (mounted, target) = self.mounted_and(path)?;
        let id = mounted.inodes.resolve(&target)?;
        Ok(FileInfo::from(&mounted.inodes.read_inode(id)?))
    }

    // ------------------------------------------------------------------
    // Working directory
    // ------------------------------------------------------------------

    /// Change the working directory; the target must be a directory.
    pub fn change_directory(&self, path: &str) -> FsResult<()> {
        let (mounted, target) = self.mounted_and(path)?;
        let id = mounted.inodes.resolve(&target)?;
        if !mounted.inodes.read_inode(id)?.is_dir() {
            return Err(FsError::WrongType(target));
        }
        self.state.lock().unwrap().cwd = target;
        Ok(())
    }

    pub fn working_directory(&self) -> String {
        self.state.lock().unwrap().cwd.clone()
    }

    /// Resolve `path` against the current working directory into an absolute
    /// path without `.` or `..` segments.
    pub fn normalize(&self, path: &str) -> String {
        normalize_with(&self.state.lock().unwrap().cwd, path)
    }

    // ------------------------------------------------------------------
    // Open-file tracking
    // ------------------------------------------------------------------

    /// Increment the open count of an existing path.
    pub fn open(&self, path: &str) -> FsResult<()> {
        let (mounted, target) = self.mounted_and(path)?;
        mounted.inodes.resolve(&target)?;
        self.retain(&target);
        Ok(())
    }

    /// Decrement the open count; the last close forgets the path.
    pub fn close(&self, path: &str) -> FsResult<()> {
        let (_, target) = self.mounted_and(path)?;
        let mut state = self.state.lock().unwrap();
        match state.open_files.get_mut(&target) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                state.open_files.remove(&target);
            }
            None => return Err(FsError::NotFound(format!("{target} is not open"))),
        }
        Ok(())
    }

    pub fn open_count(&self, path: &str) -> u32 {
        let target = self.normalize(path);
        self.state
            .lock()
            .unwrap()
            .open_files
            .get(&target)
            .copied()
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn disk_usage(&self) -> FsResult<DiskUsage> {
        let mounted = self.mounted()?;
        Ok(DiskUsage {
            total_blocks: mounted.bitmap.total_blocks(),
            used_blocks: mounted.bitmap.used_blocks(),
            free_blocks: mounted.bitmap.free_blocks(),
            metadata_blocks: mounted.inodes.layout().metadata_blocks(),
            used_inodes: mounted.inodes.live_inodes(),
            inode_capacity: INODE_CAPACITY as u32,
        })
    }

    pub fn cache_status(&self) -> FsResult<CacheStatus> {
        Ok(self.mounted()?.cache.status())
    }

    /// Check the structural invariants of the mounted image.
    pub fn verify(&self) -> FsResult<()> {
        self.mounted()?.inodes.verify()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn mounted(&self) -> FsResult<Mounted> {
        self.state
            .lock()
            .unwrap()
            .mounted
            .clone()
            .ok_or(FsError::NotMounted)
    }

    /// The mounted stack plus the normalized target path.
    fn mounted_and(&self, path: &str) -> FsResult<(Mounted, String)> {
        let state = self.state.lock().unwrap();
        let mounted = state.mounted.clone().ok_or(FsError::NotMounted)?;
        Ok((mounted, normalize_with(&state.cwd, path)))
    }

    /// Like [`Self::mounted_and`], but refuses paths with open references;
    /// used by every destructive operation.
    fn target_unused(&self, path: &str) -> FsResult<(Mounted, String)> {
        let state = self.state.lock().unwrap();
        let mounted = state.mounted.clone().ok_or(FsError::NotMounted)?;
        let target = normalize_with(&state.cwd, path);
        if state.open_files.get(&target).copied().unwrap_or(0) > 0 {
            return Err(FsError::Busy(target));
        }
        Ok((mounted, target))
    }

    fn retain(&self, target: &str) {
        *self
            .state
            .lock()
            .unwrap()
            .open_files
            .entry(target.to_string())
            .or_insert(0) += 1;
    }

    fn release(&self, target: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(count) = state.open_files.get_mut(target) {
            *count -= 1;
            if *count == 0 {
                state.open_files.remove(target);
            }
        }
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        if self.is_mounted() {
            if let Err(e) = self.unmount() {
                warn!("unmount during drop failed: {e}");
            }
        }
    }
}

/// Resolve `path` against `cwd`: absolute paths stand alone, relative ones
/// are appended; `.` segments drop out, `..` pops (bounded at the root), and
/// empty segments are ignored. The result always starts with `/`.
pub fn normalize_with(cwd: &str, path: &str) -> String {
    let full = if path.starts_with('/') {
        path.to_string()
    } else if path.is_empty() {
        cwd.to_string()
    } else if cwd == "/" {
        format!("/{path}")
    } else {
        format!("{cwd}/{path}")
    };

    let mut components: Vec<&str> = Vec::new();
    for segment in full.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            other => components.push(other),
        }
    }
    if components.is_empty() {
        "/".to_string()
    } else {
        let mut result = String::new();
        for component in components {
            result.push('/');
            result.push_str(component);
        }
        result
    }
}

/// Split a normalized path into its parent path and final name.
fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("/", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, FileSystem) {
        let dir = tempfile::tempdir().unwrap();
        let fs = FileSystem::new();
        let image = dir.path().join("d.img");
        fs.format(image.to_str().unwrap(), 8).unwrap();
        fs.mount(image.to_str().unwrap()).unwrap();
        (dir, fs)
    }

    #[test]
    fn format_and_mount_leave_a_root() {
        // 8 MiB image: 1 bitmap block + 32 inode-table blocks reserved, plus
        // one data block for the root directory page.
        let (_dir, fs) = scratch();
        let names: Vec<String> = fs
            .list_directory("/")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![".", ".."]);

        let usage = fs.disk_usage().unwrap();
        assert_eq!(usage.total_blocks, 2048);
        assert_eq!(usage.metadata_blocks, 33);
        assert_eq!(usage.used_blocks, usage.metadata_blocks + 1);
        assert_eq!(usage.free_blocks, 2048 - 34);
        assert_eq!(usage.used_inodes, 1);
        fs.verify().unwrap();
    }

    #[test]
    fn format_requires_unmounted() {
        let (dir, fs) = scratch();
        let other = dir.path().join("other.img");
        assert!(matches!(
            fs.format(other.to_str().unwrap(), 8),
            Err(FsError::AlreadyMounted)
        ));
        assert!(matches!(
            fs.mount(dir.path().join("d.img").to_str().unwrap()),
            Err(FsError::AlreadyMounted)
        ));
    }

    #[test]
    fn operations_require_a_mount() {
        let fs = FileSystem::new();
        assert!(matches!(fs.list_directory("/"), Err(FsError::NotMounted)));
        assert!(matches!(fs.create_file("/a", b""), Err(FsError::NotMounted)));
        assert!(matches!(fs.disk_usage(), Err(FsError::NotMounted)));
        assert!(matches!(fs.unmount(), Err(FsError::NotMounted)));
    }

    #[test]
    fn create_write_read_stat() {
        let (_dir, fs) = scratch();
        fs.create_file("/a.txt", b"").unwrap();
        fs.write_file("/a.txt", b"hello").unwrap();
        assert_eq!(fs.read_file("/a.txt").unwrap(), b"hello");

        let info = fs.stat("/a.txt").unwrap();
        assert_eq!(info.size, 5);
        assert_eq!(info.block_count, 1);
        assert_eq!(info.kind, FileKind::File);
        assert_eq!(info.name, "a.txt");
        fs.verify().unwrap();
    }

    #[test]
    fn write_creates_missing_files() {
        let (_dir, fs) = scratch();
        fs.write_file("/fresh", b"made by write").unwrap();
        assert_eq!(fs.read_file("/fresh").unwrap(), b"made by write");
    }

    #[test]
    fn nested_directories_and_stat_parents() {
        let (_dir, fs) = scratch();
        fs.create_directory("/d1").unwrap();
        fs.create_directory("/d1/d2").unwrap();
        fs.create_file("/d1/d2/x", b"").unwrap();

        let names: Vec<String> = fs
            .list_directory("/d1/d2")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![".", "..", "x"]);

        let file = fs.stat("/d1/d2/x").unwrap();
        let dir = fs.stat("/d1/d2").unwrap();
        assert_eq!(file.parent_id, dir.inode_id);
        fs.verify().unwrap();
    }

    #[test]
    fn open_references_block_deletion() {
        let (_dir, fs) = scratch();
        fs.create_file("/b", b"held").unwrap();
        fs.open("/b").unwrap();
        assert!(matches!(fs.delete_file("/b"), Err(FsError::Busy(_))));
        assert!(matches!(fs.write_file("/b", b"no"), Err(FsError::Busy(_))));
        fs.close("/b").unwrap();
        fs.delete_file("/b").unwrap();
        assert!(fs.list_directory("/").unwrap().iter().all(|e| e.name != "b"));
        fs.verify().unwrap();
    }

    #[test]
    fn open_descendants_block_directory_deletion() {
        let (_dir, fs) = scratch();
        fs.create_directory("/d").unwrap();
        fs.create_file("/d/inner", b"x").unwrap();
        fs.open("/d/inner").unwrap();
        assert!(matches!(
            fs.delete_directory("/d", true),
            Err(FsError::Busy(_))
        ));
        fs.close("/d/inner").unwrap();
        fs.delete_directory("/d", true).unwrap();
        fs.verify().unwrap();
    }

    #[test]
    fn rmdir_refuses_non_empty_without_recursive() {
        let (_dir, fs) = scratch();
        fs.create_directory("/d").unwrap();
        fs.create_file("/d/keep", b"").unwrap();
        assert!(matches!(
            fs.delete_directory("/d", false),
            Err(FsError::NotEmpty(_))
        ));
        fs.delete_file("/d/keep").unwrap();
        fs.delete_directory("/d", false).unwrap();
    }

    #[test]
    fn the_root_never_goes_away() {
        let (_dir, fs) = scratch();
        assert!(matches!(
            fs.delete_directory("/", true),
            Err(FsError::Busy(_))
        ));
        assert!(matches!(fs.delete_file("/"), Err(FsError::WrongType(_))));
    }

    #[test]
    fn close_without_open_is_an_error() {
        let (_dir, fs) = scratch();
        fs.create_file("/f", b"").unwrap();
        assert!(matches!(fs.close("/f"), Err(FsError::NotFound(_))));
        fs.open("/f").unwrap();
        fs.open("/f").unwrap();
        assert_eq!(fs.open_count("/f"), 2);
        fs.close("/f").unwrap();
        fs.close("/f").unwrap();
        assert_eq!(fs.open_count("/f"), 0);
    }

    #[test]
    fn cwd_navigation_and_normalization() {
        let (_dir, fs) = scratch();
        fs.create_directory("/d1").unwrap();
        fs.create_directory("/d1/d2").unwrap();
        fs.change_directory("/d1/d2").unwrap();
        assert_eq!(fs.working_directory(), "/d1/d2");

        // The S7 table: every input resolved from /d1/d2.
        for (input, expected) in [
            (".", "/d1/d2"),
            ("./", "/d1/d2"),
            ("../", "/d1"),
            ("../../", "/"),
            ("../d2", "/d1/d2"),
            ("/d1/./d2/../d2", "/d1/d2"),
        ] {
            assert_eq!(fs.normalize(input), expected, "input {input:?}");
            fs.change_directory(input).unwrap();
            assert_eq!(fs.working_directory(), expected);
            fs.change_directory("/d1/d2").unwrap();
        }

        assert!(matches!(
            fs.change_directory("/absent"),
            Err(FsError::NotFound(_))
        ));
        fs.create_file("/d1/file", b"").unwrap();
        assert!(matches!(
            fs.change_directory("/d1/file"),
            Err(FsError::WrongType(_))
        ));
    }

    #[test]
    fn relative_paths_use_the_cwd() {
        let (_dir, fs) = scratch();
        fs.create_directory("/work").unwrap();
        fs.change_directory("/work").unwrap();
        fs.create_file("notes", b"relative").unwrap();
        assert_eq!(fs.read_file("/work/notes").unwrap(), b"relative");
        assert_eq!(fs.read_file("../work/notes").unwrap(), b"relative");
    }

    #[test]
    fn contents_survive_remount() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("d.img");
        let image = image.to_str().unwrap();

        let fs = FileSystem::new();
        fs.format(image, 8).unwrap();
        fs.mount(image).unwrap();
        fs.create_directory("/docs").unwrap();
        fs.create_file("/docs/a", b"alpha").unwrap();
        fs.write_file("/docs/b", &vec![0x42; BLOCK_SIZE * 2]).unwrap();
        let usage_before = fs.disk_usage().unwrap();
        fs.unmount().unwrap();

        let fs = FileSystem::new();
        fs.mount(image).unwrap();
        assert_eq!(fs.read_file("/docs/a").unwrap(), b"alpha");
        assert_eq!(fs.read_file("/docs/b").unwrap(), vec![0x42; BLOCK_SIZE * 2]);
        assert_eq!(fs.disk_usage().unwrap(), usage_before);
        fs.verify().unwrap();
    }

    #[test]
    fn mkdir_rmdir_cycles_leave_no_trace() {
        let (_dir, fs) = scratch();
        let usage_before = fs.disk_usage().unwrap();
        for round in 0..3 {
            fs.create_directory("/t").unwrap();
            fs.create_directory("/t/inner").unwrap();
            fs.change_directory("/t/inner").unwrap();
            fs.create_directory("deep").unwrap();
            fs.change_directory("/").unwrap();
            fs.delete_directory("/t", true).unwrap();
            assert_eq!(fs.disk_usage().unwrap(), usage_before, "round {round}");
            fs.verify().unwrap();
        }
    }

    #[test]
    fn grow_past_occupied_tail_relocates_exactly_once() {
        let (_dir, fs) = scratch();
        // Fill the head of the data region with single-block files, then put
        // a wall directly behind /big so tail extension cannot succeed.
        for i in 0..100 {
            fs.create_file(&format!("/pad-{i:03}"), b"p").unwrap();
        }
        fs.create_file("/big", &vec![1u8; 100]).unwrap();
        let before = fs.stat("/big").unwrap();
        fs.create_file("/wall", b"w").unwrap();
        assert_eq!(fs.stat("/wall").unwrap().start_block, before.start_block + 1);

        let payload: Vec<u8> = (0..10 * BLOCK_SIZE).map(|i| (i / 7 % 256) as u8).collect();
        fs.write_file("/big", &payload).unwrap();
        let after = fs.stat("/big").unwrap();
        assert_ne!(after.start_block, before.start_block);
        assert_eq!(after.block_count, 10);
        assert_eq!(fs.read_file("/big").unwrap(), payload);

        // The old block must be free again and reusable exactly once.
        let usage = fs.disk_usage().unwrap();
        fs.create_file("/reuse", b"r").unwrap();
        assert_eq!(fs.stat("/reuse").unwrap().start_block, before.start_block);
        assert_eq!(fs.disk_usage().unwrap().used_blocks, usage.used_blocks + 1);
        fs.verify().unwrap();
    }

    #[test]
    fn block_level_io_through_paths() {
        let (_dir, fs) = scratch();
        let content = vec![3u8; BLOCK_SIZE + 50];
        fs.create_file("/chunky", &content).unwrap();
        assert_eq!(fs.read_file_block("/chunky", 0).unwrap(), vec![3u8; BLOCK_SIZE]);
        assert_eq!(fs.read_file_block("/chunky", 1).unwrap(), vec![3u8; 50]);
        fs.write_file_block("/chunky", 0, b"head").unwrap();
        let back = fs.read_file("/chunky").unwrap();
        assert_eq!(&back[..4], b"head");
        assert_eq!(back[4], 3);
    }

    #[test]
    fn cache_status_is_visible() {
        let (_dir, fs) = scratch();
        fs.create_file("/f", b"x").unwrap();
        let status = fs.cache_status().unwrap();
        assert_eq!(status.capacity, crate::fs::CACHE_PAGES);
        assert!(!status.resident.is_empty());
    }

    #[test]
    fn normalize_handles_edge_cases() {
        assert_eq!(normalize_with("/", "/"), "/");
        assert_eq!(normalize_with("/", ""), "/");
        assert_eq!(normalize_with("/", "a//b"), "/a/b");
        assert_eq!(normalize_with("/", "../.."), "/");
        assert_eq!(normalize_with("/a", "b"), "/a/b");
        assert_eq!(normalize_with("/a/b", "/c"), "/c");
        assert_eq!(normalize_with("/a/b", "../x/./y"), "/a/x/y");
    }

    #[test]
    fn two_instances_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let fs1 = FileSystem::new();
        let fs2 = FileSystem::new();
        let img1 = dir.path().join("one.img");
        let img2 = dir.path().join("two.img");
        fs1.format(img1.to_str().unwrap(), 8).unwrap();
        fs2.format(img2.to_str().unwrap(), 8).unwrap();
        fs1.mount(img1.to_str().unwrap()).unwrap();
        fs2.mount(img2.to_str().unwrap()).unwrap();

        fs1.create_file("/only-in-one", b"1").unwrap();
        fs1.change_directory("/").unwrap();
        assert!(matches!(
            fs2.read_file("/only-in-one"),
            Err(FsError::NotFound(_))
        ));
    }
}
