//! Serializes producer mutations and projects their events onto the inode registry.
//!
//! Producers hold a [`TreeProducer`] and send commands over a bounded channel. The
//! [`UpdateBridge`] executes one command at a time: it takes the update lock, mutates the tree op
//! by op, applies the events each op raised to the registry, and only then releases the lock. A
//! kernel lookup therefore sees either none or all of a command's consequences. Kernel cache
//! invalidations are sent after the lock is released.

use std::ffi::{OsStr, OsString};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::inode_registry::InodeEntry;
use super::ops::{NodeData, SharedState, VfsState};
use super::InodeAddr;
use crate::vfs::{ContentItem, DirContent, DirItem, TreeError, UpdateEvent, Wrapper, path};

/// Receives kernel cache invalidations.
pub trait KernelNotifier: Send + Sync {
    /// Drop the kernel's cached dentry for `name` in `parent`.
    fn inval_entry(&self, parent: InodeAddr, name: &OsStr);
    /// Drop the kernel's cached attributes and data of `inode`.
    fn inval_inode(&self, inode: InodeAddr);
}

/// A notifier for when no kernel is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl KernelNotifier for NoopNotifier {
    fn inval_entry(&self, _parent: InodeAddr, _name: &OsStr) {}
    fn inval_inode(&self, _inode: InodeAddr) {}
}

/// A kernel cache entry made stale by a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// A name appeared or disappeared in a directory.
    Entry {
        /// Directory inode.
        parent: InodeAddr,
        /// Entry name.
        name: OsString,
    },
    /// An inode the kernel had looked up was removed.
    Inode(InodeAddr),
}

/// One tree mutation.
pub enum TreeOp {
    /// Create a directory and its missing ancestors.
    CreateDir(String),
    /// Remove a directory subtree.
    RemoveDir(String),
    /// Add items to a directory, or replace its items.
    PutContent {
        /// Items to add.
        items: Vec<ContentItem>,
        /// Target directory.
        path: String,
        /// Replace the existing items instead of appending.
        overwrite: bool,
    },
    /// Remove one item, matched by identity.
    RemoveContent {
        /// The item previously put.
        item: ContentItem,
        /// Directory holding it.
        path: String,
    },
    /// Attach a wrapper to a directory.
    AddWrapper {
        /// Target directory.
        path: String,
        /// The wrapper.
        wrapper: Arc<dyn Wrapper>,
    },
}

impl std::fmt::Debug for TreeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateDir(path) => f.debug_tuple("CreateDir").field(path).finish(),
            Self::RemoveDir(path) => f.debug_tuple("RemoveDir").field(path).finish(),
            Self::PutContent {
                items,
                path,
                overwrite,
            } => f
                .debug_struct("PutContent")
                .field("items", &items.len())
                .field("path", path)
                .field("overwrite", overwrite)
                .finish(),
            Self::RemoveContent { item, path } => f
                .debug_struct("RemoveContent")
                .field("item", &item.name())
                .field("path", path)
                .finish(),
            Self::AddWrapper { path, .. } => f
                .debug_struct("AddWrapper")
                .field("path", path)
                .finish_non_exhaustive(),
        }
    }
}

/// Errors returned to producers.
#[derive(Debug, Error)]
pub enum ProducerError {
    /// The bridge has stopped.
    #[error("update bridge is not running")]
    Closed,

    /// The tree rejected the mutation.
    #[error(transparent)]
    Tree(#[from] TreeError),
}

/// Ops applied atomically, with the channel for their outcome.
struct TreeCommand {
    ops: Vec<TreeOp>,
    /// Skip removals whose target is already gone instead of failing.
    missing_ok: bool,
    reply: oneshot::Sender<Result<(), TreeError>>,
}

/// Handle producers use to mutate the tree.
///
/// Every call waits until the mutation is visible to the kernel.
#[derive(Clone)]
pub struct TreeProducer {
    tx: mpsc::Sender<TreeCommand>,
}

impl TreeProducer {
    /// Apply `ops` in order as one atomic unit.
    ///
    /// Stops at the first failing op; the ops before it stay applied.
    pub async fn apply(&self, ops: Vec<TreeOp>) -> Result<(), ProducerError> {
        self.send(ops, false).await
    }

    /// Apply `ops` like [`apply`](Self::apply), except that a `RemoveDir` or `RemoveContent`
    /// whose target no longer exists is skipped.
    ///
    /// Meant for producers that share directories with others and may remove something another
    /// producer already removed.
    pub async fn sync(&self, ops: Vec<TreeOp>) -> Result<(), ProducerError> {
        self.send(ops, true).await
    }

    async fn send(&self, ops: Vec<TreeOp>, missing_ok: bool) -> Result<(), ProducerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TreeCommand {
                ops,
                missing_ok,
                reply,
            })
            .await
            .map_err(|_| ProducerError::Closed)?;
        rx.await.map_err(|_| ProducerError::Closed)??;
        Ok(())
    }

    /// Create the directory at `path`, returning its canonical path.
    pub async fn create_dir(&self, path: &str) -> Result<String, ProducerError> {
        let canonical = path::normalize(path);
        self.apply(vec![TreeOp::CreateDir(canonical.clone())]).await?;
        Ok(canonical)
    }

    /// Remove the directory at `path` with everything beneath it.
    pub async fn remove_dir(&self, path: &str) -> Result<(), ProducerError> {
        self.apply(vec![TreeOp::RemoveDir(path.to_owned())]).await
    }

    /// Add `items` to the directory at `path`.
    pub async fn put_content(
        &self,
        items: Vec<ContentItem>,
        path: &str,
        overwrite: bool,
    ) -> Result<(), ProducerError> {
        self.apply(vec![TreeOp::PutContent {
            items,
            path: path.to_owned(),
            overwrite,
        }])
        .await
    }

    /// Remove `item` from the directory at `path`.
    pub async fn remove_content(&self, item: ContentItem, path: &str) -> Result<(), ProducerError> {
        self.apply(vec![TreeOp::RemoveContent {
            item,
            path: path.to_owned(),
        }])
        .await
    }

    /// Attach `wrapper` to the directory at `path`.
    pub async fn add_wrapper(
        &self,
        path: &str,
        wrapper: Arc<dyn Wrapper>,
    ) -> Result<(), ProducerError> {
        self.apply(vec![TreeOp::AddWrapper {
            path: path.to_owned(),
            wrapper,
        }])
        .await
    }
}

/// The single consumer of producer commands.
pub struct UpdateBridge {
    state: SharedState,
    notifier: Arc<dyn KernelNotifier>,
    rx: mpsc::Receiver<TreeCommand>,
}

impl UpdateBridge {
    /// Create a bridge over `state` accepting up to `capacity` queued commands.
    #[must_use]
    pub fn new(
        state: SharedState,
        notifier: Arc<dyn KernelNotifier>,
        capacity: usize,
    ) -> (Self, TreeProducer) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                state,
                notifier,
                rx,
            },
            TreeProducer { tx },
        )
    }

    /// Execute commands until every producer is dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            self.execute(command).await;
        }
        info!("all producers gone, update bridge stopping");
    }

    async fn execute(&self, command: TreeCommand) {
        let TreeCommand {
            ops,
            missing_ok,
            reply,
        } = command;
        let mut state = self.state.lock().await;

        let mut invalidations = Vec::new();
        let mut result = Ok(());
        for op in ops {
            trace!(?op, "applying tree op");
            let removal = matches!(op, TreeOp::RemoveDir(_) | TreeOp::RemoveContent { .. });
            match apply_op(&mut state, op).await {
                Ok(produced) => invalidations.extend(produced),
                Err(e @ (TreeError::NotFound(_) | TreeError::ItemNotFound { .. }))
                    if missing_ok && removal =>
                {
                    debug!(error = %e, "removal target already gone, skipping");
                }
                Err(e) => {
                    debug!(error = %e, "tree op failed");
                    result = Err(e);
                    break;
                }
            }
        }
        drop(state);

        for invalidation in &invalidations {
            match invalidation {
                Invalidation::Entry { parent, name } => self.notifier.inval_entry(*parent, name),
                Invalidation::Inode(inode) => self.notifier.inval_inode(*inode),
            }
        }
        if reply.send(result).is_err() {
            trace!("producer stopped waiting for the result");
        }
    }
}

async fn apply_op(state: &mut VfsState, op: TreeOp) -> Result<Vec<Invalidation>, TreeError> {
    let events = match op {
        TreeOp::CreateDir(path) => state.tree.create_dir(&path).await?.1,
        TreeOp::RemoveDir(path) => state.tree.remove_dir(&path).await?,
        TreeOp::PutContent {
            items,
            path,
            overwrite,
        } => state.tree.put_content(items, &path, overwrite).await?,
        TreeOp::RemoveContent { item, path } => state.tree.remove_content(&item, &path).await?,
        TreeOp::AddWrapper { path, wrapper } => {
            state.tree.add_wrapper(&path, wrapper)?;
            // The new wrapper may change the listing of the node and of every ancestor.
            let mut out = Vec::new();
            let mut dir = Some(path::normalize(&path));
            while let Some(current) = dir {
                out.extend(resync_dir(state, &current).await);
                dir = path::parent(&current).map(str::to_owned);
            }
            return Ok(out);
        }
    };

    let mut out = apply_events(state, &events);
    for event in &events {
        if let UpdateEvent::RemovedDirs { path, dirs } = event
            && reveals_items(state, path, dirs)
        {
            out.extend(resync_dir(state, path).await);
        }
    }
    Ok(out)
}

/// Whether removing `dirs` from `parent` uncovers items of the same names.
fn reveals_items(state: &VfsState, parent: &str, dirs: &[String]) -> bool {
    state.tree.get_dir(parent).is_ok_and(|node| {
        dirs.iter().any(|dir| {
            let name = path::file_name(dir);
            node.items().iter().any(|item| item.name() == name)
        })
    })
}

/// Bring the registered children of a read directory in line with its current listing.
async fn resync_dir(state: &mut VfsState, dir: &str) -> Vec<Invalidation> {
    let mut out = Vec::new();
    let Some(parent) = read_dir_inode(state, dir) else {
        return out;
    };
    let listing = match state.tree.list_dir(dir).await {
        Ok(listing) => listing,
        Err(e) => {
            warn!(dir, error = %e, "could not list directory to resync it");
            return out;
        }
    };

    let stale: Vec<OsString> = state
        .inodes
        .children(parent)
        .filter(|(name, _)| !listing.iter().any(|item| item.name() == *name))
        .map(|(name, _)| name.to_os_string())
        .collect();
    for name in stale {
        unregister(state, parent, &name, &mut out);
    }
    for item in listing {
        let unchanged = state
            .inodes
            .get_child_by_name(item.name(), parent)
            .is_some_and(|e| e.data.item.same_item(&item));
        if !unchanged {
            unregister(state, parent, item.name(), &mut out);
            register(state, parent, item, &mut out);
        }
    }
    if !out.is_empty() {
        debug!(dir, changes = out.len(), "resynced directory");
    }
    out
}

/// A directory whose children are registered, so events in it must be mirrored.
fn read_dir_inode(state: &VfsState, dir: &str) -> Option<InodeAddr> {
    let entry = state.inodes.get_by_path(dir)?;
    (entry.data.item.is_dir() && entry.data.content_read).then_some(entry.inode)
}

fn unregister(
    state: &mut VfsState,
    parent: InodeAddr,
    name: &OsStr,
    out: &mut Vec<Invalidation>,
) {
    let Some(child) = state.inodes.get_child_by_name(name, parent).map(|e| e.inode) else {
        return;
    };
    let removed: Vec<InodeEntry<NodeData>> = state.inodes.remove_item_with_children(child);
    out.push(Invalidation::Entry {
        parent,
        name: name.to_os_string(),
    });
    out.extend(
        removed
            .iter()
            .filter(|entry| entry.data.lookups > 0)
            .map(|entry| Invalidation::Inode(entry.inode)),
    );
}

fn register(
    state: &mut VfsState,
    parent: InodeAddr,
    item: ContentItem,
    out: &mut Vec<Invalidation>,
) {
    let name = item.name().to_os_string();
    if let Err(e) = state.inodes.add_item(name.clone(), NodeData::new(item), parent) {
        warn!(parent, ?name, error = %e, "could not register new entry");
        return;
    }
    out.push(Invalidation::Entry { parent, name });
}

/// Mirror root-level events onto the registry, returning the kernel entries they invalidate.
///
/// Directories that were never read are skipped: their children are registered from the current
/// tree when first visited. A failing event is logged and the rest still apply.
pub fn apply_events(state: &mut VfsState, events: &[UpdateEvent]) -> Vec<Invalidation> {
    let mut out = Vec::new();
    for event in events {
        let Some(parent) = read_dir_inode(state, event.path()) else {
            trace!(path = event.path(), "directory not read yet, skipping event");
            continue;
        };
        match event {
            UpdateEvent::NewItems { items, .. } => {
                for item in items {
                    // A subdirectory outranks an item of the same name.
                    let shadowed_by_subdir = state
                        .inodes
                        .get_child_by_name(item.name(), parent)
                        .is_some_and(|e| {
                            matches!(
                                &e.data.item,
                                ContentItem::Dir(DirItem {
                                    content: DirContent::Tree(_),
                                    ..
                                })
                            ) && !e.data.item.same_item(item)
                        });
                    if shadowed_by_subdir {
                        debug!(parent, name = ?item.name(), "item hidden by subdirectory");
                        continue;
                    }
                    unregister(state, parent, item.name(), &mut out);
                    register(state, parent, item.clone(), &mut out);
                }
            }
            UpdateEvent::RemovedItems { items, .. } => {
                for item in items {
                    // Only the exact item the kernel was shown is taken away.
                    let registered = state
                        .inodes
                        .get_child_by_name(item.name(), parent)
                        .is_some_and(|e| e.data.item.same_item(item));
                    if registered {
                        unregister(state, parent, item.name(), &mut out);
                    } else {
                        debug!(parent, name = ?item.name(), "removed item not registered");
                    }
                }
            }
            UpdateEvent::NewDirs { dirs, .. } => {
                for dir in dirs {
                    let content = match state.tree.get_dir_content(dir) {
                        Ok(content) => content,
                        Err(e) => {
                            warn!(dir, error = %e, "new directory vanished before registration");
                            continue;
                        }
                    };
                    let name = OsString::from(path::file_name(dir));
                    let already = state
                        .inodes
                        .get_child_by_name(&name, parent)
                        .is_some_and(|e| e.data.item.is_dir());
                    if already {
                        continue;
                    }
                    unregister(state, parent, &name, &mut out);
                    register(
                        state,
                        parent,
                        ContentItem::Dir(DirItem::new(name, content)),
                        &mut out,
                    );
                }
            }
            UpdateEvent::RemovedDirs { dirs, .. } => {
                for dir in dirs {
                    let name = OsString::from(path::file_name(dir));
                    let is_dir = state
                        .inodes
                        .get_child_by_name(&name, parent)
                        .is_some_and(|e| e.data.item.is_dir());
                    if is_dir {
                        unregister(state, parent, &name, &mut out);
                    }
                }
            }
        }
    }
    out
}
