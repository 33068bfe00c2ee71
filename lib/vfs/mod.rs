//! The virtual filesystem tree.
//!
//! Producers mutate a [`VfsTree`] through `create_dir`, `put_content`, `remove_content` and
//! `remove_dir`. Each mutation raises [`UpdateEvent`]s at the node it touched; the events climb
//! through the wrapper chains of every ancestor and the survivors are returned at the root.

use std::ffi::OsString;

use thiserror::Error;

/// Content items and their accessors.
pub mod content;
/// Two-phase directory enumeration.
pub mod dir_content;
/// Update events.
pub mod events;
pub mod path;
/// Node storage and propagation.
pub mod tree;
pub mod wrappers;

pub use content::{
    BytesContent, ContentItem, ContentReader, DelayedContent, DirContent, DirItem, FileContent,
    FileItem,
};
pub use dir_content::{DirContentSource, DirSnapshot, StaticDirContent};
pub use events::{UpdateEvent, UpdateListener};
pub use tree::{VfsTree, VfsTreeDir};
pub use wrappers::{ArchiveAsDir, ExcludeEmpty, UpdateOrigin, Wrapper};

/// Errors raised by tree operations.
#[derive(Debug, Error)]
pub enum TreeError {
    /// No node exists at the path.
    #[error("no directory at {0}")]
    NotFound(String),

    /// The root node cannot be removed.
    #[error("the root directory cannot be removed")]
    RootRemoval,

    /// The node exists but does not hold the item.
    #[error("item {name:?} not found in {path}")]
    ItemNotFound {
        /// Node that was searched.
        path: String,
        /// Name of the missing item.
        name: OsString,
    },

    /// A directory content source failed to produce its listing.
    #[error("content source failed: {0}")]
    Content(#[from] std::io::Error),
}

impl From<TreeError> for i32 {
    fn from(e: TreeError) -> Self {
        match e {
            TreeError::NotFound(_) | TreeError::ItemNotFound { .. } => libc::ENOENT,
            TreeError::RootRemoval => libc::EBUSY,
            TreeError::Content(ref io_err) => io_err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
