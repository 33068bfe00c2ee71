//! Kernel-protocol operations over the shared tree + registry state.
//!
//! Every handler takes the update lock for registry and listing access. File content I/O happens
//! after the lock is released, so a slow reader never holds up the rest of the mount.

use std::ffi::OsStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use tracing::{debug, trace};

use super::file_table::FileHandleTable;
use super::inode_registry::InodeRegistry;
use super::{
    DirEntry, FileHandle, FsStats, INode, INodeType, InodeAddr, InodePerms, OpenFlags, VfsError,
};
use crate::vfs::{ContentItem, ContentReader, DirContent, DirItem, VfsTree, path};

/// Filesystem block size reported to the kernel.
pub const BLOCK_SIZE: u32 = 4096;

/// Longest entry name the mount accepts.
const MAX_NAME_LEN: u32 = 255;

/// What the registry keeps for every inode.
pub struct NodeData {
    /// The content item the inode projects.
    pub item: ContentItem,
    /// Whether the children of this directory have been registered.
    pub content_read: bool,
    /// Outstanding kernel lookups, decremented by `forget`.
    pub lookups: u64,
}

impl NodeData {
    /// Fresh data for an item the kernel has not looked up yet.
    #[must_use]
    pub fn new(item: ContentItem) -> Self {
        Self {
            item,
            content_read: false,
            lookups: 0,
        }
    }
}

/// The tree and its inode projection, always mutated together.
pub struct VfsState {
    /// The directory tree producers write to.
    pub tree: VfsTree,
    /// Inodes handed to the kernel.
    pub inodes: InodeRegistry<NodeData>,
}

impl VfsState {
    /// Project `tree` with only the root registered.
    #[must_use]
    pub fn new(tree: VfsTree) -> Self {
        let root = DirItem::new("", DirContent::Tree(path::ROOT.to_owned()));
        Self {
            tree,
            inodes: InodeRegistry::new(NodeData::new(ContentItem::Dir(root))),
        }
    }

    /// Wrap into the shared, lock-guarded form.
    #[must_use]
    pub fn shared(self) -> SharedState {
        Arc::new(tokio::sync::Mutex::new(self))
    }
}

/// The update lock and everything it guards.
pub type SharedState = Arc<tokio::sync::Mutex<VfsState>>;

/// Ownership and timestamps applied to every inode.
#[derive(Debug, Clone, Copy)]
pub struct AttrDefaults {
    /// Owner user ID.
    pub uid: u32,
    /// Owner group ID.
    pub gid: u32,
    /// Timestamp for items that carry no creation time.
    pub time: SystemTime,
}

impl Default for AttrDefaults {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            time: SystemTime::UNIX_EPOCH,
        }
    }
}

struct OpenFile {
    inode: InodeAddr,
    reader: Box<dyn ContentReader>,
}

/// A directory listing frozen at `opendir` time.
struct OpenDir {
    inode: InodeAddr,
    entries: Vec<DirEntry>,
}

/// Handlers for the read-only kernel operations.
pub struct VfsOps {
    state: SharedState,
    attrs: AttrDefaults,
    files: FileHandleTable<OpenFile>,
    dirs: FileHandleTable<OpenDir>,
    read_passes: AtomicU64,
}

impl VfsOps {
    /// Serve `state` with the given attribute defaults.
    #[must_use]
    pub fn new(state: SharedState, attrs: AttrDefaults) -> Self {
        Self {
            state,
            attrs,
            files: FileHandleTable::new(),
            dirs: FileHandleTable::new(),
            read_passes: AtomicU64::new(0),
        }
    }

    /// The state shared with the update bridge.
    #[must_use]
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// How many directories have had their children registered so far.
    #[must_use]
    pub fn read_passes(&self) -> u64 {
        self.read_passes.load(Ordering::Relaxed)
    }

    /// Number of open file handles.
    #[must_use]
    pub fn open_file_count(&self) -> usize {
        self.files.len()
    }

    fn attr_of(&self, inode: InodeAddr, parent: Option<InodeAddr>, item: &ContentItem) -> INode {
        let time = item.created_at().unwrap_or(self.attrs.time);
        let (itype, permissions, size) = match item {
            ContentItem::File(file) => (INodeType::File, InodePerms::FILE_DEFAULT, file.size()),
            ContentItem::Dir(_) => (INodeType::Directory, InodePerms::DIR_DEFAULT, 0),
        };
        INode {
            addr: inode,
            permissions,
            uid: self.attrs.uid,
            gid: self.attrs.gid,
            create_time: time,
            last_modified_at: time,
            parent,
            size,
            itype,
        }
    }

    /// Register the children of directory `inode` the first time it is visited.
    async fn read_dir_content(&self, state: &mut VfsState, inode: InodeAddr) -> Result<(), VfsError> {
        let entry = state
            .inodes
            .get_item_by_inode(inode)
            .ok_or(VfsError::NoSuchInode(inode))?;
        let ContentItem::Dir(dir) = &entry.data.item else {
            return Err(VfsError::NotADirectory(inode));
        };
        if entry.data.content_read {
            return Ok(());
        }
        let content = dir.content.clone();

        let snapshot = state.tree.open_dir_content(&content).await?;
        let mut registered = 0usize;
        for item in snapshot.items() {
            if state.inodes.get_child_by_name(item.name(), inode).is_some() {
                continue;
            }
            state
                .inodes
                .add_item(item.name(), NodeData::new(item.clone()), inode)?;
            registered += 1;
        }
        state.tree.release_dir_content(&content, snapshot).await;

        let entry = state
            .inodes
            .get_mut(inode)
            .ok_or_else(|| VfsError::Inconsistent(format!("inode {inode} vanished while read")))?;
        entry.data.content_read = true;
        self.read_passes.fetch_add(1, Ordering::Relaxed);
        debug!(inode, registered, "registered directory children");
        Ok(())
    }

    /// Resolve `name` inside directory `parent`, counting one kernel lookup on success.
    pub async fn lookup(&self, parent: InodeAddr, name: &OsStr) -> Result<INode, VfsError> {
        let mut state = self.state.lock().await;
        self.read_dir_content(&mut state, parent).await?;
        let child = state
            .inodes
            .get_child_by_name(name, parent)
            .map(|entry| entry.inode)
            .ok_or_else(|| VfsError::NoSuchEntry {
                parent,
                name: name.to_os_string(),
            })?;
        let entry = state
            .inodes
            .get_mut(child)
            .ok_or_else(|| VfsError::Inconsistent(format!("child {child} of {parent} missing")))?;
        entry.data.lookups += 1;
        Ok(self.attr_of(entry.inode, entry.parent, &entry.data.item))
    }

    /// Attributes of `inode`.
    pub async fn getattr(&self, inode: InodeAddr) -> Result<INode, VfsError> {
        let state = self.state.lock().await;
        let entry = state
            .inodes
            .get_item_by_inode(inode)
            .ok_or(VfsError::NoSuchInode(inode))?;
        Ok(self.attr_of(entry.inode, entry.parent, &entry.data.item))
    }

    /// Open directory `inode`, freezing its current children under a new handle.
    pub async fn opendir(&self, inode: InodeAddr) -> Result<FileHandle, VfsError> {
        let mut state = self.state.lock().await;
        self.read_dir_content(&mut state, inode).await?;
        let mut entries = Vec::new();
        for (name, child) in state.inodes.children(inode) {
            let entry = state.inodes.get_item_by_inode(child).ok_or_else(|| {
                VfsError::Inconsistent(format!("child {child} of {inode} missing"))
            })?;
            let itype = if entry.data.item.is_dir() {
                INodeType::Directory
            } else {
                INodeType::File
            };
            entries.push(DirEntry {
                ino: child,
                name: name.to_os_string(),
                itype,
            });
        }
        drop(state);

        let count = entries.len();
        let fh = self.dirs.insert(OpenDir { inode, entries });
        trace!(inode, fh, count, "opened directory");
        Ok(fh)
    }

    /// Entries of an open directory starting at `offset`.
    ///
    /// The offset of the entry at index `i` is `i + 1`, so the kernel can resume after any entry.
    pub fn readdir(&self, fh: FileHandle, offset: u64) -> Result<Vec<DirEntry>, VfsError> {
        let dir = self.dirs.get(fh).ok_or(VfsError::BadHandle(fh))?;
        let start = usize::try_from(offset).map_or(dir.entries.len(), |o| o.min(dir.entries.len()));
        trace!(inode = dir.inode, fh, offset, "reading directory");
        Ok(dir.entries[start..].to_vec())
    }

    /// Drop a directory handle. Releasing an unknown handle is not an error.
    pub fn releasedir(&self, fh: FileHandle) {
        if self.dirs.remove(fh).is_none() {
            debug!(fh, "directory handle already released");
        }
    }

    /// Open file `inode` for reading.
    pub async fn open(&self, inode: InodeAddr, flags: OpenFlags) -> Result<FileHandle, VfsError> {
        if flags.is_write_intent() {
            return Err(VfsError::PermissionDenied(inode));
        }
        let content = {
            let state = self.state.lock().await;
            let entry = state
                .inodes
                .get_item_by_inode(inode)
                .ok_or(VfsError::NoSuchInode(inode))?;
            match &entry.data.item {
                ContentItem::File(file) => Arc::clone(&file.content),
                ContentItem::Dir(_) => return Err(VfsError::IsADirectory(inode)),
            }
        };

        let reader = content.open().await?;
        let fh = self.files.insert(OpenFile { inode, reader });
        trace!(inode, fh, "opened file");
        Ok(fh)
    }

    /// Read up to `size` bytes at `offset` from an open file.
    pub async fn read(&self, fh: FileHandle, offset: u64, size: u32) -> Result<Bytes, VfsError> {
        let file = self.files.get(fh).ok_or(VfsError::BadHandle(fh))?;
        let data = file.reader.read(offset, size).await?;
        trace!(inode = file.inode, fh, offset, read = data.len(), "read file");
        Ok(data)
    }

    /// Close an open file. Releasing a handle twice is a no-op.
    pub async fn release(&self, fh: FileHandle) {
        let Some(file) = self.files.remove(fh) else {
            debug!(fh, "file handle already released");
            return;
        };
        if let Err(e) = file.reader.close().await {
            debug!(fh, error = %e, "reader close reported error");
        }
    }

    /// The kernel dropped `nlookup` references to `inode`.
    ///
    /// The entry stays registered while it is part of the tree; only the count changes.
    pub async fn forget(&self, inode: InodeAddr, nlookup: u64) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.inodes.get_mut(inode) {
            entry.data.lookups = entry.data.lookups.saturating_sub(nlookup);
            trace!(inode, remaining = entry.data.lookups, "forgot lookups");
        }
    }

    /// Fixed statistics for a virtual read-only filesystem.
    pub async fn statfs(&self) -> FsStats {
        let inodes = self.state.lock().await.inodes.len() as u64;
        FsStats {
            block_size: BLOCK_SIZE,
            total_blocks: 0,
            free_blocks: 0,
            available_blocks: 0,
            total_inodes: inodes,
            free_inodes: 0,
            max_filename_length: MAX_NAME_LEN,
        }
    }
}
