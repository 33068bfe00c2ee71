//! Typed diff events raised by tree mutations.

use super::content::ContentItem;

/// A change observed at one tree node.
///
/// `path` is always the node where the change was observed: the directory whose items changed,
/// or the parent whose set of subdirectories changed.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    /// Items were added to the node at `path`.
    NewItems {
        /// Node holding the items.
        path: String,
        /// The added items.
        items: Vec<ContentItem>,
    },
    /// Items were removed from the node at `path`.
    RemovedItems {
        /// Node that held the items.
        path: String,
        /// The removed items.
        items: Vec<ContentItem>,
    },
    /// Subdirectories appeared under `path`.
    NewDirs {
        /// Parent node.
        path: String,
        /// Canonical paths of the new subdirectories.
        dirs: Vec<String>,
    },
    /// Subdirectories disappeared from under `path`, along with their subtrees.
    RemovedDirs {
        /// Parent node.
        path: String,
        /// Canonical paths of the removed subdirectories.
        dirs: Vec<String>,
    },
}

impl UpdateEvent {
    /// The node where this change was observed.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::NewItems { path, .. }
            | Self::RemovedItems { path, .. }
            | Self::NewDirs { path, .. }
            | Self::RemovedDirs { path, .. } => path,
        }
    }
}

/// Diagnostic observer of the events reaching the tree root.
///
/// Listeners run synchronously while the update lock is held and must not block.
pub trait UpdateListener: Send + Sync {
    /// Called with every non-empty aggregated batch, in order.
    fn on_updates(&self, events: &[UpdateEvent]);
}
