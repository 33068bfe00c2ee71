use std::sync::Mutex;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::vfs::VfsTree;
use crate::vfs::content::{ContentItem, DirContent};
use crate::vfs::events::UpdateEvent;
use crate::vfs::path;

use super::{UpdateOrigin, Wrapper};

/// Hides subdirectories whose listing is empty.
///
/// The wrapper remembers, for every direct child of the nodes it is attached to, whether that
/// child was last seen non-empty. Any update surfacing through a child re-evaluates it: the
/// empty to non-empty transition becomes a synthetic `NewDirs`, the reverse a synthetic
/// `RemovedDirs`, and updates inside a child that stays hidden are dropped. Emptiness is judged on
/// the child's own wrapper-transformed listing, so stacking this wrapper on nested nodes hides
/// whole chains of empty directories.
///
/// A child with no recorded state predates the wrapper and counts as visible.
///
/// Every update from a child materializes that child's full wrapped listing while the update lock
/// is held. A child wrapped by [`ArchiveAsDir`](super::ArchiveAsDir) therefore pays for parsing an
/// archive it has not cached yet.
#[derive(Default)]
pub struct ExcludeEmpty {
    /// Direct child path -> whether it was non-empty when last observed.
    non_empty: Mutex<FxHashMap<String, bool>>,
}

impl ExcludeEmpty {
    /// Create a wrapper with no recorded state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn states(&self) -> std::sync::MutexGuard<'_, FxHashMap<String, bool>> {
        self.non_empty
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn recorded(&self, child: &str) -> Option<bool> {
        self.states().get(child).copied()
    }

    fn record(&self, child: &str, non_empty: bool) {
        self.states().insert(child.to_owned(), non_empty);
    }

    /// Drop the state of `child` and of anything recorded beneath it.
    fn forget(&self, child: &str) -> Option<bool> {
        let mut states = self.states();
        let prior = states.remove(child);
        states.retain(|recorded, _| !path::is_within(recorded, child));
        prior
    }

    async fn has_entries(tree: &VfsTree, content: &DirContent) -> bool {
        match tree.open_dir_content(content).await {
            Ok(snapshot) => !snapshot.is_empty(),
            Err(e) => {
                debug!(error = %e, "treating unreadable directory as empty");
                false
            }
        }
    }

    /// Whether `events` announce the creation of `child` under `dir`.
    fn announces(events: &[UpdateEvent], dir: &str, child: &str) -> bool {
        events.iter().any(|event| {
            matches!(event, UpdateEvent::NewDirs { path, dirs }
                if path == dir && dirs.iter().any(|d| d == child))
        })
    }
}

#[async_trait]
impl Wrapper for ExcludeEmpty {
    async fn wrap_dir_content(
        &self,
        tree: &VfsTree,
        dir: &str,
        items: Vec<ContentItem>,
    ) -> Vec<ContentItem> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let ContentItem::Dir(sub) = &item else {
                out.push(item);
                continue;
            };
            let non_empty = Self::has_entries(tree, &sub.content).await;
            if let DirContent::Tree(child) = &sub.content
                && path::parent(child) == Some(dir)
            {
                self.record(child, non_empty);
            }
            if non_empty {
                out.push(item);
            } else {
                trace!(dir, name = ?sub.name, "hiding empty directory");
            }
        }
        out
    }

    async fn wrap_updates(
        &self,
        tree: &VfsTree,
        dir: &str,
        origin: UpdateOrigin<'_>,
        events: Vec<UpdateEvent>,
    ) -> Vec<UpdateEvent> {
        let UpdateOrigin::Child(child) = origin else {
            return events;
        };

        if !tree.contains(child) {
            let prior = self.forget(child);
            if prior == Some(false) {
                trace!(dir, child, "hidden directory removed, suppressing");
                return Vec::new();
            }
            return events;
        }

        let prior = self.recorded(child);
        let now = Self::has_entries(tree, &DirContent::Tree(child.to_owned())).await;
        self.record(child, now);

        if Self::announces(&events, dir, child) {
            return if now { events } else { Vec::new() };
        }

        match (prior.unwrap_or(true), now) {
            (false, true) => {
                debug!(dir, child, "directory became non-empty");
                vec![UpdateEvent::NewDirs {
                    path: dir.to_owned(),
                    dirs: vec![child.to_owned()],
                }]
            }
            (true, false) => {
                debug!(dir, child, "directory became empty");
                vec![UpdateEvent::RemovedDirs {
                    path: dir.to_owned(),
                    dirs: vec![child.to_owned()],
                }]
            }
            (false, false) => Vec::new(),
            (true, true) => events,
        }
    }
}
