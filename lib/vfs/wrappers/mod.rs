//! Per-directory view transforms.
//!
//! A wrapper attached to a node rewrites two things: the node's materialized listing, and the
//! update events surfacing through the node on their way to the root. Wrappers on one node run in
//! attachment order, each seeing the output of the previous one.

use async_trait::async_trait;

use super::VfsTree;
use super::content::ContentItem;
use super::events::UpdateEvent;

/// Show archive files as directories of their entries.
pub mod archive;
/// Hide subdirectories with nothing in them.
pub mod exclude_empty;

pub use archive::ArchiveAsDir;
pub use exclude_empty::ExcludeEmpty;

/// Where a batch of events handed to [`Wrapper::wrap_updates`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin<'a> {
    /// The wrapped node's own items changed.
    Own,
    /// The events surfaced from the direct child at this canonical path. The child may be gone
    /// already, e.g. for the `RemovedDirs` it raised on removal.
    Child(&'a str),
}

/// A pluggable transform attached to one tree node.
#[async_trait]
pub trait Wrapper: Send + Sync {
    /// Transform the materialized listing of the node at `dir`.
    async fn wrap_dir_content(
        &self,
        tree: &VfsTree,
        dir: &str,
        items: Vec<ContentItem>,
    ) -> Vec<ContentItem>;

    /// Rewrite, expand or suppress events passing through the node at `dir`.
    async fn wrap_updates(
        &self,
        tree: &VfsTree,
        dir: &str,
        origin: UpdateOrigin<'_>,
        events: Vec<UpdateEvent>,
    ) -> Vec<UpdateEvent>;
}
