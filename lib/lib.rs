//! msg-fs shared library: a live-mutable virtual tree projected onto FUSE.

/// Inode projection, kernel operations and the update bridge.
pub mod fs;
/// Mirrors host directories into the tree.
pub mod local_source;
/// The virtual directory tree, its content items and wrappers.
pub mod vfs;
