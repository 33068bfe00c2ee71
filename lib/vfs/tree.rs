//! Path-addressed directory tree with bottom-up event propagation.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::sync::Arc;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use super::TreeError;
use super::content::{ContentItem, DirContent, DirItem};
use super::dir_content::DirSnapshot;
use super::events::{UpdateEvent, UpdateListener};
use super::path::{self, ROOT};
use super::wrappers::{UpdateOrigin, Wrapper};

/// A directory node.
pub struct VfsTreeDir {
    path: String,
    items: Vec<ContentItem>,
    wrappers: Vec<Arc<dyn Wrapper>>,
}

impl VfsTreeDir {
    fn new(path: String) -> Self {
        Self {
            path,
            items: Vec::new(),
            wrappers: Vec::new(),
        }
    }

    /// Canonical path of this node.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw, untransformed items in insertion order.
    #[must_use]
    pub fn items(&self) -> &[ContentItem] {
        &self.items
    }

    /// Number of wrappers attached to this node.
    #[must_use]
    pub fn wrapper_count(&self) -> usize {
        self.wrappers.len()
    }
}

/// The directory tree.
///
/// Nodes live in a flat `path -> node` map, with a `parent -> children` index kept up to date on
/// every structural change, so resolving a node, its parent or its subdirectories never walks the
/// tree. Mutations return the events that survived propagation to the root; the caller owns
/// delivering them to the inode projection.
pub struct VfsTree {
    dirs: FxHashMap<String, VfsTreeDir>,
    subdirs: FxHashMap<String, BTreeSet<String>>,
    listeners: Vec<Arc<dyn UpdateListener>>,
}

impl Default for VfsTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep the last item for every name, preserving the order of the survivors.
fn reconcile(items: Vec<ContentItem>) -> Vec<ContentItem> {
    let mut seen: FxHashSet<OsString> = FxHashSet::default();
    let mut out: Vec<ContentItem> = items
        .into_iter()
        .rev()
        .filter(|item| seen.insert(item.name().to_os_string()))
        .collect();
    out.reverse();
    out
}

impl VfsTree {
    /// Create a tree holding only the root node.
    #[must_use]
    pub fn new() -> Self {
        let mut dirs = FxHashMap::default();
        dirs.insert(ROOT.to_owned(), VfsTreeDir::new(ROOT.to_owned()));
        let mut subdirs = FxHashMap::default();
        subdirs.insert(ROOT.to_owned(), BTreeSet::new());
        Self {
            dirs,
            subdirs,
            listeners: Vec::new(),
        }
    }

    /// Register a diagnostic listener for events reaching the root.
    pub fn subscribe(&mut self, listener: Arc<dyn UpdateListener>) {
        self.listeners.push(listener);
    }

    /// Number of nodes, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    /// Always `false`: the root is never removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Whether a node exists at `path`.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.dirs.contains_key(&path::normalize(path))
    }

    /// The node at `path`.
    pub fn get_dir(&self, path: &str) -> Result<&VfsTreeDir, TreeError> {
        let path = path::normalize(path);
        self.dirs.get(&path).ok_or(TreeError::NotFound(path))
    }

    /// The parent of the node at `path`, or `None` for the root.
    pub fn get_parent(&self, path: &str) -> Result<Option<&VfsTreeDir>, TreeError> {
        let dir = self.get_dir(path)?;
        Ok(path::parent(&dir.path).and_then(|p| self.dirs.get(p)))
    }

    /// Canonical paths of the direct subdirectories of `path`, in name order.
    pub fn get_subdirs(&self, path: &str) -> Result<Vec<String>, TreeError> {
        let path = path::normalize(path);
        self.subdirs
            .get(&path)
            .map(|children| children.iter().cloned().collect())
            .ok_or(TreeError::NotFound(path))
    }

    /// Attach a wrapper to the node at `path`.
    pub fn add_wrapper(&mut self, path: &str, wrapper: Arc<dyn Wrapper>) -> Result<(), TreeError> {
        let path = path::normalize(path);
        let dir = self
            .dirs
            .get_mut(&path)
            .ok_or_else(|| TreeError::NotFound(path.clone()))?;
        dir.wrappers.push(wrapper);
        debug!(path, wrappers = dir.wrappers.len(), "attached wrapper");
        Ok(())
    }

    /// Create the node at `path` and any missing ancestors.
    ///
    /// Returns the canonical path together with the propagated events. Creating a node that
    /// already exists is a no-op raising nothing.
    pub async fn create_dir(
        &mut self,
        path: &str,
    ) -> Result<(String, Vec<UpdateEvent>), TreeError> {
        let path = path::normalize(path);
        let mut missing = Vec::new();
        let mut cursor = path.as_str();
        while !self.dirs.contains_key(cursor) {
            missing.push(cursor.to_owned());
            cursor = path::parent(cursor).unwrap_or(ROOT);
        }

        let mut out = Vec::new();
        for child in missing.into_iter().rev() {
            let parent = path::parent(&child).unwrap_or(ROOT).to_owned();
            self.subdirs
                .entry(parent.clone())
                .or_default()
                .insert(child.clone());
            self.subdirs.entry(child.clone()).or_default();
            self.dirs
                .insert(child.clone(), VfsTreeDir::new(child.clone()));
            debug!(path = child, "created directory");

            let event = UpdateEvent::NewDirs {
                path: parent,
                dirs: vec![child.clone()],
            };
            out.extend(self.child_updated(&child, vec![event]).await);
        }
        Ok((path, out))
    }

    /// Remove the node at `path` with its whole subtree.
    pub async fn remove_dir(&mut self, path: &str) -> Result<Vec<UpdateEvent>, TreeError> {
        let path = path::normalize(path);
        if path == ROOT {
            return Err(TreeError::RootRemoval);
        }
        if !self.dirs.contains_key(&path) {
            return Err(TreeError::NotFound(path));
        }

        let mut stack = vec![path.clone()];
        let mut removed = 0usize;
        while let Some(current) = stack.pop() {
            if let Some(children) = self.subdirs.remove(&current) {
                stack.extend(children);
            }
            self.dirs.remove(&current);
            removed += 1;
        }
        let parent = path::parent(&path).unwrap_or(ROOT).to_owned();
        if let Some(siblings) = self.subdirs.get_mut(&parent) {
            siblings.remove(&path);
        }
        debug!(path, removed, "removed directory subtree");

        let event = UpdateEvent::RemovedDirs {
            path: parent,
            dirs: vec![path.clone()],
        };
        Ok(self.child_updated(&path, vec![event]).await)
    }

    /// Add `items` to the node at `path`, or replace its items when `overwrite` is set.
    pub async fn put_content(
        &mut self,
        items: Vec<ContentItem>,
        path: &str,
        overwrite: bool,
    ) -> Result<Vec<UpdateEvent>, TreeError> {
        let path = path::normalize(path);
        let dir = self
            .dirs
            .get_mut(&path)
            .ok_or_else(|| TreeError::NotFound(path.clone()))?;

        let mut events = Vec::new();
        if overwrite {
            let old = std::mem::replace(&mut dir.items, items.clone());
            if !old.is_empty() {
                events.push(UpdateEvent::RemovedItems {
                    path: path.clone(),
                    items: reconcile(old),
                });
            }
        } else {
            dir.items.extend(items.iter().cloned());
        }
        if !items.is_empty() {
            events.push(UpdateEvent::NewItems {
                path: path.clone(),
                items: reconcile(items),
            });
        }
        trace!(path, events = events.len(), "put content");

        if events.is_empty() {
            return Ok(events);
        }
        Ok(self.raise_own(&path, events).await)
    }

    /// Remove one item, matched by identity, from the node at `path`.
    ///
    /// When two raw items share a name only the newest is visible; removing a shadowed one raises
    /// nothing, and removing the visible one reveals the next newest.
    pub async fn remove_content(
        &mut self,
        item: &ContentItem,
        path: &str,
    ) -> Result<Vec<UpdateEvent>, TreeError> {
        let path = path::normalize(path);
        let dir = self
            .dirs
            .get_mut(&path)
            .ok_or_else(|| TreeError::NotFound(path.clone()))?;
        let pos = dir
            .items
            .iter()
            .position(|existing| existing.same_item(item))
            .ok_or_else(|| TreeError::ItemNotFound {
                path: path.clone(),
                name: item.name().to_os_string(),
            })?;

        let shadowed = dir.items[pos + 1..]
            .iter()
            .any(|later| later.name() == item.name());
        let revealed = dir.items[..pos]
            .iter()
            .rev()
            .find(|earlier| earlier.name() == item.name())
            .cloned();
        let removed = dir.items.remove(pos);
        if shadowed {
            trace!(path, name = ?removed.name(), "removed shadowed item");
            return Ok(Vec::new());
        }

        let mut events = vec![UpdateEvent::RemovedItems {
            path: path.clone(),
            items: vec![removed],
        }];
        if let Some(revealed) = revealed {
            events.push(UpdateEvent::NewItems {
                path: path.clone(),
                items: vec![revealed],
            });
        }
        Ok(self.raise_own(&path, events).await)
    }

    /// A lazy content handle for the node at `path`.
    pub fn get_dir_content(&self, path: &str) -> Result<DirContent, TreeError> {
        let path = path::normalize(path);
        if self.dirs.contains_key(&path) {
            Ok(DirContent::Tree(path))
        } else {
            Err(TreeError::NotFound(path))
        }
    }

    /// Directory entries for the subdirectories of a canonical path.
    fn subdir_items(&self, path: &str) -> impl Iterator<Item = ContentItem> + '_ {
        self.subdirs.get(path).into_iter().flatten().map(|child| {
            ContentItem::Dir(DirItem::new(
                path::file_name(child),
                DirContent::Tree(child.clone()),
            ))
        })
    }

    /// Materialize the listing of the node at `path`: its items, one entry per live subdirectory,
    /// then the node's wrapper chain. Later items win over earlier ones with the same name.
    pub fn list_dir<'a>(
        &'a self,
        path: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ContentItem>, TreeError>> {
        async move {
            let path = path::normalize(path);
            let dir = self
                .dirs
                .get(&path)
                .ok_or_else(|| TreeError::NotFound(path.clone()))?;
            let mut items = dir.items.clone();
            items.extend(self.subdir_items(&path));
            for wrapper in &dir.wrappers {
                items = wrapper.wrap_dir_content(self, &path, items).await;
            }
            Ok(reconcile(items))
        }
        .boxed()
    }

    /// Open any directory content, tree-backed or not.
    pub async fn open_dir_content(&self, content: &DirContent) -> Result<DirSnapshot, TreeError> {
        let items = match content {
            DirContent::Tree(path) => self.list_dir(path).await?,
            DirContent::Source(source) => source.open().await?,
        };
        Ok(DirSnapshot::new(items))
    }

    /// Release a snapshot obtained from [`open_dir_content`](Self::open_dir_content).
    pub async fn release_dir_content(&self, content: &DirContent, snapshot: DirSnapshot) {
        if let DirContent::Source(source) = content {
            source.release(&snapshot).await;
        }
        drop(snapshot);
    }

    /// Run events raised by the node's own items through its wrappers, then propagate them.
    async fn raise_own(&self, path: &str, mut events: Vec<UpdateEvent>) -> Vec<UpdateEvent> {
        if let Some(dir) = self.dirs.get(path) {
            for wrapper in &dir.wrappers {
                if events.is_empty() {
                    break;
                }
                events = wrapper
                    .wrap_updates(self, path, UpdateOrigin::Own, events)
                    .await;
            }
        }
        self.child_updated(path, events).await
    }

    /// Propagate events surfacing from `child` through every ancestor's wrappers.
    ///
    /// The root terminates propagation: listeners are notified and the surviving events are
    /// returned.
    pub async fn child_updated(&self, child: &str, mut events: Vec<UpdateEvent>) -> Vec<UpdateEvent> {
        let mut child = child.to_owned();
        while let Some(parent) = path::parent(&child).map(str::to_owned) {
            if events.is_empty() {
                break;
            }
            if let Some(dir) = self.dirs.get(&parent) {
                for wrapper in &dir.wrappers {
                    events = wrapper
                        .wrap_updates(self, &parent, UpdateOrigin::Child(&child), events)
                        .await;
                }
            }
            child = parent;
        }
        self.notify(&events);
        events
    }

    fn notify(&self, events: &[UpdateEvent]) {
        if events.is_empty() {
            return;
        }
        trace!(count = events.len(), "events reached root");
        for listener in &self.listeners {
            listener.on_updates(events);
        }
    }
}
