//! Inode projection of the tree and the kernel-facing operations.
/// Open file and directory handles.
pub mod file_table;
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`ops::VfsOps`].
pub mod fuser;
/// Inode allocation and the parent/child index.
pub mod inode_registry;
/// Kernel operation handlers bound to the registry and the tree.
pub mod ops;
/// Applies tree events to the registry and the kernel caches.
pub mod update_bridge;

use std::ffi::OsString;
use std::time::SystemTime;

use bitflags::bitflags;
use thiserror::Error;
use tracing::error;

use crate::vfs::TreeError;

/// Type representing an inode identifier.
pub type InodeAddr = u64;

/// Type representing a file handle.
pub type FileHandle = u64;

/// The inode the kernel uses for the mount root.
pub const ROOT_INODE: InodeAddr = 1;

bitflags! {
    /// Permission bits for an inode, similar to Unix file permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InodePerms: u16 {
        /// Other: execute permission.
        const OTHER_EXECUTE = 1 << 0;
        /// Other: write permission.
        const OTHER_WRITE   = 1 << 1;
        /// Other: read permission.
        const OTHER_READ    = 1 << 2;

        /// Group: execute permission.
        const GROUP_EXECUTE = 1 << 3;
        /// Group: write permission.
        const GROUP_WRITE   = 1 << 4;
        /// Group: read permission.
        const GROUP_READ    = 1 << 5;

        /// Owner: execute permission.
        const OWNER_EXECUTE = 1 << 6;
        /// Owner: write permission.
        const OWNER_WRITE   = 1 << 7;
        /// Owner: read permission.
        const OWNER_READ    = 1 << 8;

        /// Read access for everyone.
        const ALL_READ = Self::OWNER_READ.bits()
            | Self::GROUP_READ.bits()
            | Self::OTHER_READ.bits();
        /// Execute (search) access for everyone.
        const ALL_EXECUTE = Self::OWNER_EXECUTE.bits()
            | Self::GROUP_EXECUTE.bits()
            | Self::OTHER_EXECUTE.bits();

        /// `0o444`, used for every file.
        const FILE_DEFAULT = Self::ALL_READ.bits();
        /// `0o555`, used for every directory.
        const DIR_DEFAULT = Self::ALL_READ.bits() | Self::ALL_EXECUTE.bits();
    }
}

bitflags! {
    /// Flags for opening a file, similar to Unix open(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;

        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;

        /// Non-blocking mode.
        const NONBLOCK = libc::O_NONBLOCK;
        /// Do not follow symlinks.
        const NOFOLLOW = libc::O_NOFOLLOW;
        /// Set close-on-exec.
        const CLOEXEC = libc::O_CLOEXEC;
        /// Fail if not a directory.
        const DIRECTORY = libc::O_DIRECTORY;
    }
}

impl OpenFlags {
    /// Flags that would modify the file in any way.
    pub const WRITE_INTENT: Self = Self::WRONLY
        .union(Self::RDWR)
        .union(Self::APPEND)
        .union(Self::TRUNC)
        .union(Self::CREAT);

    /// Whether the open asks for anything beyond reading.
    #[must_use]
    pub fn is_write_intent(self) -> bool {
        self.intersects(Self::WRITE_INTENT)
    }
}

/// The type of an inode entry in the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum INodeType {
    /// A regular file.
    File,
    /// A directory.
    Directory,
}

/// Representation of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct INode {
    /// The address of this inode, which serves as its unique identifier.
    pub addr: InodeAddr,
    /// The permissions associated with this inode, represented as a bitfield.
    pub permissions: InodePerms,
    /// The user ID of the owner of this inode.
    pub uid: u32,
    /// The group ID of the owner of this inode.
    pub gid: u32,
    /// The time this inode was created at.
    pub create_time: SystemTime,
    /// The time this inode was last modified at.
    pub last_modified_at: SystemTime,
    /// The parent inode address, if any. This is `None` for the root inode.
    pub parent: Option<InodeAddr>,
    /// The size of the file represented by this inode, in bytes.
    pub size: u64,
    /// Additional information about the type of this inode (e.g., file vs directory).
    pub itype: INodeType,
}

impl INode {
    /// Check if this inode is the root inode (i.e., has no parent).
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// A directory entry yielded by [`ops::VfsOps::readdir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Inode of the entry.
    pub ino: InodeAddr,
    /// Name of this entry within its parent directory.
    pub name: OsString,
    /// Kind of the entry.
    pub itype: INodeType,
}

/// Filesystem statistics returned by [`ops::VfsOps::statfs`].
///
/// Block-related sizes are in units of `block_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsStats {
    /// Filesystem block size (bytes).
    pub block_size: u32,
    /// Total number of data blocks.
    pub total_blocks: u64,
    /// Number of free blocks.
    pub free_blocks: u64,
    /// Number of blocks available to unprivileged users.
    pub available_blocks: u64,
    /// Total number of file nodes (inodes).
    pub total_inodes: u64,
    /// Number of free file nodes.
    pub free_inodes: u64,
    /// Maximum filename length (bytes).
    pub max_filename_length: u32,
}

/// Errors surfaced by the kernel-facing operations.
#[derive(Debug, Error)]
pub enum VfsError {
    /// The inode is not registered.
    #[error("inode {0} not found")]
    NoSuchInode(InodeAddr),

    /// The directory has no entry with that name.
    #[error("no entry {name:?} in inode {parent}")]
    NoSuchEntry {
        /// Directory that was searched.
        parent: InodeAddr,
        /// Name that was looked up.
        name: OsString,
    },

    /// A directory operation was attempted on a file.
    #[error("inode {0} is not a directory")]
    NotADirectory(InodeAddr),

    /// A file operation was attempted on a directory.
    #[error("inode {0} is a directory")]
    IsADirectory(InodeAddr),

    /// The mount is read-only.
    #[error("write access to inode {0} denied")]
    PermissionDenied(InodeAddr),

    /// The registry disagrees with itself or with the tree.
    #[error("inconsistent state: {0}")]
    Inconsistent(String),

    /// The handle is not open.
    #[error("file handle {0} is not open")]
    BadHandle(FileHandle),

    /// A content accessor failed.
    #[error("content access failed: {0}")]
    Content(#[from] std::io::Error),

    /// The tree rejected an operation.
    #[error("tree error: {0}")]
    Tree(#[from] TreeError),
}

/// Convert an I/O error to the corresponding errno value for FUSE replies.
#[expect(
    clippy::wildcard_enum_match_arm,
    reason = "ErrorKind is non_exhaustive; EIO is the safe default"
)]
pub(crate) fn io_to_errno(e: &std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or_else(|| match e.kind() {
        std::io::ErrorKind::NotFound => libc::ENOENT,
        std::io::ErrorKind::PermissionDenied => libc::EACCES,
        _ => libc::EIO,
    })
}

impl From<VfsError> for i32 {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::NoSuchInode(_) | VfsError::NoSuchEntry { .. } => libc::ENOENT,
            VfsError::NotADirectory(_) => libc::ENOTDIR,
            VfsError::IsADirectory(_) => libc::EISDIR,
            VfsError::PermissionDenied(_) => libc::EACCES,
            VfsError::Inconsistent(ref what) => {
                error!(what, "registry inconsistency, reporting not found");
                libc::ENOENT
            }
            VfsError::BadHandle(_) => libc::EBADF,
            VfsError::Content(ref io_err) => io_to_errno(io_err),
            VfsError::Tree(tree_err) => tree_err.into(),
        }
    }
}
