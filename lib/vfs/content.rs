//! Content items stored in the tree and the accessor traits behind them.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;

use super::dir_content::DirContentSource;

/// A reader for an open file, returned by [`FileContent::open`].
///
/// Each open handle owns one reader, so readers never have to coordinate with each other.
#[async_trait]
pub trait ContentReader: Send + Sync {
    /// Read up to `size` bytes starting at byte `offset`.
    ///
    /// Returns fewer bytes than requested at end of file, and an empty buffer past it.
    async fn read(&self, offset: u64, size: u32) -> Result<Bytes, std::io::Error>;

    /// Release any resources held by this reader. The default implementation is a no-op.
    async fn close(&self) -> Result<(), std::io::Error> {
        Ok(())
    }
}

/// Byte-range access to the body of a file item.
#[async_trait]
pub trait FileContent: Send + Sync {
    /// Size of the content in bytes.
    fn size(&self) -> u64;

    /// Open the content for reading.
    async fn open(&self) -> Result<Box<dyn ContentReader>, std::io::Error>;
}

/// A file-like content item.
#[derive(Clone)]
pub struct FileItem {
    /// Name of the entry within its directory.
    pub name: OsString,
    /// Accessor for the file body.
    pub content: Arc<dyn FileContent>,
    /// Creation time reported to the kernel. Falls back to the mount-wide default.
    pub created_at: Option<SystemTime>,
}

impl FileItem {
    /// Create a file item with no explicit creation time.
    pub fn new(name: impl Into<OsString>, content: Arc<dyn FileContent>) -> Self {
        Self {
            name: name.into(),
            content,
            created_at: None,
        }
    }

    /// Set the creation time reported for this item.
    #[must_use]
    pub fn with_created_at(mut self, created_at: SystemTime) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Size of the file body in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.content.size()
    }
}

/// Where the children of a directory item come from.
#[derive(Clone)]
pub enum DirContent {
    /// A node of the owning [`VfsTree`](super::VfsTree), addressed by its canonical path.
    Tree(String),
    /// An opaque provider, e.g. the synthesized view of an archive.
    Source(Arc<dyn DirContentSource>),
}

impl DirContent {
    fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Tree(a), Self::Tree(b)) => a == b,
            (Self::Source(a), Self::Source(b)) => Arc::ptr_eq(a, b),
            (Self::Tree(_), Self::Source(_)) | (Self::Source(_), Self::Tree(_)) => false,
        }
    }
}

/// A directory-like content item.
#[derive(Clone)]
pub struct DirItem {
    /// Name of the entry within its parent.
    pub name: OsString,
    /// Provider of the directory's children.
    pub content: DirContent,
    /// Creation time reported to the kernel. Falls back to the mount-wide default.
    pub created_at: Option<SystemTime>,
}

impl DirItem {
    /// Create a directory item with no explicit creation time.
    pub fn new(name: impl Into<OsString>, content: DirContent) -> Self {
        Self {
            name: name.into(),
            content,
            created_at: None,
        }
    }
}

/// A file or directory entry inside the tree, before inode assignment.
#[derive(Clone)]
pub enum ContentItem {
    /// A regular file.
    File(FileItem),
    /// A directory.
    Dir(DirItem),
}

impl ContentItem {
    /// Name of the entry within its directory.
    #[must_use]
    pub fn name(&self) -> &OsStr {
        match self {
            Self::File(f) => &f.name,
            Self::Dir(d) => &d.name,
        }
    }

    /// Creation time, if the item carries one.
    #[must_use]
    pub fn created_at(&self) -> Option<SystemTime> {
        match self {
            Self::File(f) => f.created_at,
            Self::Dir(d) => d.created_at,
        }
    }

    /// Whether this item is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Dir(_))
    }

    /// Identity comparison: same name and the same underlying content.
    ///
    /// Two distinct messages that happen to share a name are different items.
    #[must_use]
    pub fn same_item(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::File(a), Self::File(b)) => a.name == b.name && Arc::ptr_eq(&a.content, &b.content),
            (Self::Dir(a), Self::Dir(b)) => a.name == b.name && a.content.same(&b.content),
            (Self::File(_), Self::Dir(_)) | (Self::Dir(_), Self::File(_)) => false,
        }
    }
}

impl From<FileItem> for ContentItem {
    fn from(item: FileItem) -> Self {
        Self::File(item)
    }
}

impl From<DirItem> for ContentItem {
    fn from(item: DirItem) -> Self {
        Self::Dir(item)
    }
}

impl fmt::Debug for ContentItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(item) => f
                .debug_struct("File")
                .field("name", &item.name)
                .field("size", &item.size())
                .finish_non_exhaustive(),
            Self::Dir(item) => {
                let mut s = f.debug_struct("Dir");
                s.field("name", &item.name);
                if let DirContent::Tree(path) = &item.content {
                    s.field("path", path);
                }
                s.finish_non_exhaustive()
            }
        }
    }
}

/// Slice `data` by a byte range, clamping to its length.
#[expect(
    clippy::cast_possible_truncation,
    reason = "offsets fit in usize on supported 64-bit platforms"
)]
pub(crate) fn slice_range(data: &Bytes, offset: u64, size: u32) -> Bytes {
    let start = (offset as usize).min(data.len());
    let end = start.saturating_add(size as usize).min(data.len());
    data.slice(start..end)
}

/// In-memory file content.
#[derive(Debug, Clone)]
pub struct BytesContent {
    data: Bytes,
}

impl BytesContent {
    /// Wrap a buffer as file content.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

/// Reader over an in-memory buffer.
#[derive(Debug, Clone)]
pub struct BytesReader {
    data: Bytes,
}

impl BytesReader {
    /// Create a reader over `data`.
    #[must_use]
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }
}

#[async_trait]
impl ContentReader for BytesReader {
    async fn read(&self, offset: u64, size: u32) -> Result<Bytes, std::io::Error> {
        Ok(slice_range(&self.data, offset, size))
    }
}

#[async_trait]
impl FileContent for BytesContent {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn open(&self) -> Result<Box<dyn ContentReader>, std::io::Error> {
        Ok(Box::new(BytesReader::new(self.data.clone())))
    }
}

/// Decorator injecting a fixed latency before every open and read of the wrapped content.
///
/// Useful to reproduce the interleavings a slow message store causes without a network.
pub struct DelayedContent<C> {
    inner: C,
    delay: Duration,
}

impl<C: FileContent> DelayedContent<C> {
    /// Delay every operation on `inner` by `delay`.
    pub fn new(inner: C, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

struct DelayedReader {
    inner: Box<dyn ContentReader>,
    delay: Duration,
}

#[async_trait]
impl ContentReader for DelayedReader {
    async fn read(&self, offset: u64, size: u32) -> Result<Bytes, std::io::Error> {
        tokio::time::sleep(self.delay).await;
        self.inner.read(offset, size).await
    }

    async fn close(&self) -> Result<(), std::io::Error> {
        self.inner.close().await
    }
}

#[async_trait]
impl<C: FileContent> FileContent for DelayedContent<C> {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    async fn open(&self) -> Result<Box<dyn ContentReader>, std::io::Error> {
        tokio::time::sleep(self.delay).await;
        let inner = self.inner.open().await?;
        Ok(Box::new(DelayedReader {
            inner,
            delay: self.delay,
        }))
    }
}
