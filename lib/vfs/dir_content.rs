//! Two-phase directory enumeration.
//!
//! A listing is materialized once by `open`, served in slices by [`DirSnapshot::read`] across as
//! many kernel `readdir` calls as needed, and dropped on release. Nothing is cached between two
//! opens, so every `opendir` reflects the tree as it is at that moment.

use std::sync::Arc;

use async_trait::async_trait;

use super::content::ContentItem;

/// An opaque provider of directory children.
#[async_trait]
pub trait DirContentSource: Send + Sync {
    /// Materialize the current listing.
    async fn open(&self) -> Result<Vec<ContentItem>, std::io::Error>;

    /// Advisory cleanup once `snapshot`, returned by an earlier `open`, is no longer needed.
    async fn release(&self, _snapshot: &DirSnapshot) {}
}

/// A materialized listing, cheap to clone and safe to hold across calls.
#[derive(Debug, Clone, Default)]
pub struct DirSnapshot {
    items: Arc<[ContentItem]>,
}

impl DirSnapshot {
    /// Wrap a listing.
    #[must_use]
    pub fn new(items: Vec<ContentItem>) -> Self {
        Self {
            items: items.into(),
        }
    }

    /// Items at and after `offset`. Empty once the offset is past the end.
    #[must_use]
    pub fn read(&self, offset: usize) -> &[ContentItem] {
        self.items.get(offset..).unwrap_or_default()
    }

    /// Number of items in the listing.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the listing has no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// All items of the listing.
    #[must_use]
    pub fn items(&self) -> &[ContentItem] {
        &self.items
    }
}

/// A fixed listing.
#[derive(Debug, Clone, Default)]
pub struct StaticDirContent {
    items: Vec<ContentItem>,
}

impl StaticDirContent {
    /// Serve `items` on every open.
    #[must_use]
    pub fn new(items: Vec<ContentItem>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl DirContentSource for StaticDirContent {
    async fn open(&self) -> Result<Vec<ContentItem>, std::io::Error> {
        Ok(self.items.clone())
    }
}
