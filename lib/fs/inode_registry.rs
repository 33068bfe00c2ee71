use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};

use rustc_hash::FxHashMap;
use tracing::trace;

use super::{InodeAddr, ROOT_INODE, VfsError};

/// One registered inode.
#[derive(Debug)]
pub struct InodeEntry<T> {
    /// The allocated inode number.
    pub inode: InodeAddr,
    /// Name within the parent directory. Empty for the root.
    pub name: OsString,
    /// Parent inode, `None` for the root.
    pub parent: Option<InodeAddr>,
    /// Caller data attached to the entry.
    pub data: T,
}

/// Inode allocation with a parent -> children index.
///
/// Inodes are handed out from a monotonically increasing counter and never reused, so a removed
/// entry that reappears gets a fresh inode. Paths are never stored: they are derived by walking
/// parent pointers.
#[derive(Debug)]
pub struct InodeRegistry<T> {
    entries: FxHashMap<InodeAddr, InodeEntry<T>>,
    /// Sorted child names per directory, so listings are stable.
    children: FxHashMap<InodeAddr, BTreeMap<OsString, InodeAddr>>,
    next_inode: InodeAddr,
}

impl<T> InodeRegistry<T> {
    /// Create a registry holding only the root entry at [`ROOT_INODE`].
    pub fn new(root: T) -> Self {
        let mut entries = FxHashMap::default();
        entries.insert(
            ROOT_INODE,
            InodeEntry {
                inode: ROOT_INODE,
                name: OsString::new(),
                parent: None,
                data: root,
            },
        );
        let mut children = FxHashMap::default();
        children.insert(ROOT_INODE, BTreeMap::new());
        Self {
            entries,
            children,
            next_inode: ROOT_INODE + 1,
        }
    }

    /// Number of registered entries, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always `false`: the root cannot be removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register `name` under `parent` with a freshly allocated inode.
    ///
    /// Fails when the parent is unknown or already has a child with that name; replacing an entry
    /// means removing it first.
    pub fn add_item(
        &mut self,
        name: impl Into<OsString>,
        data: T,
        parent: InodeAddr,
    ) -> Result<&InodeEntry<T>, VfsError> {
        let name = name.into();
        let siblings = self
            .children
            .get_mut(&parent)
            .ok_or(VfsError::NoSuchInode(parent))?;
        if siblings.contains_key(&name) {
            return Err(VfsError::Inconsistent(format!(
                "{name:?} already registered under inode {parent}"
            )));
        }

        let inode = self.next_inode;
        self.next_inode += 1;
        siblings.insert(name.clone(), inode);
        self.children.insert(inode, BTreeMap::new());
        trace!(inode, parent, ?name, "registered inode");

        let entry = self.entries.entry(inode).or_insert(InodeEntry {
            inode,
            name,
            parent: Some(parent),
            data,
        });
        Ok(entry)
    }

    /// Remove `inode` and every descendant, returning the removed entries.
    ///
    /// The root cannot be removed; an unknown inode removes nothing.
    pub fn remove_item_with_children(&mut self, inode: InodeAddr) -> Vec<InodeEntry<T>> {
        if inode == ROOT_INODE {
            return Vec::new();
        }
        let Some(entry) = self.entries.get(&inode) else {
            return Vec::new();
        };
        if let Some(siblings) = entry.parent.and_then(|p| self.children.get_mut(&p)) {
            siblings.remove(&entry.name);
        }

        let mut removed = Vec::new();
        let mut stack = vec![inode];
        while let Some(current) = stack.pop() {
            if let Some(children) = self.children.remove(&current) {
                stack.extend(children.into_values());
            }
            if let Some(entry) = self.entries.remove(&current) {
                removed.push(entry);
            }
        }
        trace!(inode, removed = removed.len(), "removed inode subtree");
        removed
    }

    /// The entry named `name` directly under `parent`.
    #[must_use]
    pub fn get_child_by_name(&self, name: &OsStr, parent: InodeAddr) -> Option<&InodeEntry<T>> {
        let inode = self.children.get(&parent)?.get(name)?;
        self.entries.get(inode)
    }

    /// Resolve an absolute path inside the mount.
    pub fn get_by_path(&self, path: impl AsRef<Path>) -> Option<&InodeEntry<T>> {
        let mut current = ROOT_INODE;
        for component in path.as_ref().components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    current = self.entries.get(&current)?.parent.unwrap_or(ROOT_INODE);
                }
                Component::Normal(name) => {
                    current = *self.children.get(&current)?.get(name)?;
                }
                Component::Prefix(_) => return None,
            }
        }
        self.entries.get(&current)
    }

    /// The absolute mount path of `inode`, rebuilt from parent pointers.
    #[must_use]
    pub fn get_item_path(&self, inode: InodeAddr) -> Option<PathBuf> {
        let mut names = Vec::new();
        let mut current = self.entries.get(&inode)?;
        while let Some(parent) = current.parent {
            names.push(current.name.as_os_str());
            current = self.entries.get(&parent)?;
        }
        let mut path = PathBuf::from("/");
        path.extend(names.into_iter().rev());
        Some(path)
    }

    /// The entry registered at `inode`.
    #[must_use]
    pub fn get_item_by_inode(&self, inode: InodeAddr) -> Option<&InodeEntry<T>> {
        self.entries.get(&inode)
    }

    /// Mutable access to the entry registered at `inode`.
    pub fn get_mut(&mut self, inode: InodeAddr) -> Option<&mut InodeEntry<T>> {
        self.entries.get_mut(&inode)
    }

    /// `(name, inode)` of every child of `parent`, in name order.
    pub fn children(&self, parent: InodeAddr) -> impl Iterator<Item = (&OsStr, InodeAddr)> + '_ {
        self.children
            .get(&parent)
            .into_iter()
            .flatten()
            .map(|(name, inode)| (name.as_os_str(), *inode))
    }
}
