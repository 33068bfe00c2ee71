use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{Cursor, Read as _};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::vfs::VfsTree;
use crate::vfs::content::{
    BytesReader, ContentItem, ContentReader, DirContent, DirItem, FileContent, FileItem,
};
use crate::vfs::dir_content::StaticDirContent;
use crate::vfs::events::UpdateEvent;

use super::{UpdateOrigin, Wrapper};

/// Chunk size used to pull an archive out of its content accessor.
const READ_CHUNK: u32 = 1 << 20;

/// Archives larger than this are left as plain files by default.
pub const DEFAULT_MAX_ARCHIVE_SIZE: u64 = 256 * 1024 * 1024;

/// (directory, item name) of archives that were already examined.
type ArchiveKey = (String, OsString);

/// The outcome of examining one archive.
#[derive(Clone)]
struct Expanded {
    /// Held so the identity stays valid for as long as the entry is cached.
    content: Arc<dyn FileContent>,
    /// `None` records an archive that failed to parse.
    view: Option<ContentItem>,
}

/// Replaces `.zip` files with a directory view of their entries.
///
/// Applies to the items of the node it is attached to, both in listings and in the
/// `NewItems`/`RemovedItems` events that node raises. An archive is read and parsed once; a file
/// that fails to parse stays exposed as the original file. Archives that left the node are
/// forgotten on its next listing.
pub struct ArchiveAsDir {
    max_size: u64,
    expanded: Mutex<FxHashMap<ArchiveKey, Vec<Expanded>>>,
}

impl Default for ArchiveAsDir {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ARCHIVE_SIZE)
    }
}

/// A single file stored inside an archive.
struct ArchiveEntry {
    archive: Bytes,
    index: usize,
    size: u64,
}

#[async_trait]
impl FileContent for ArchiveEntry {
    fn size(&self) -> u64 {
        self.size
    }

    async fn open(&self) -> Result<Box<dyn ContentReader>, std::io::Error> {
        let archive = self.archive.clone();
        let index = self.index;
        let body = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, std::io::Error> {
            let mut zip = zip::ZipArchive::new(Cursor::new(archive)).map_err(std::io::Error::other)?;
            let mut entry = zip.by_index(index).map_err(std::io::Error::other)?;
            let mut body = Vec::new();
            entry.read_to_end(&mut body)?;
            Ok(body)
        })
        .await
        .map_err(std::io::Error::other)??;
        Ok(Box::new(BytesReader::new(Bytes::from(body))))
    }
}

/// Intermediate directory structure built from the flat entry list.
#[derive(Default)]
struct EntryDir {
    dirs: BTreeMap<String, EntryDir>,
    files: BTreeMap<String, (usize, u64)>,
}

impl EntryDir {
    fn dir_mut(&mut self, components: &[&str]) -> &mut Self {
        components.iter().fold(self, |dir, name| {
            dir.dirs.entry((*name).to_owned()).or_default()
        })
    }

    fn into_items(self, archive: &Bytes) -> Vec<ContentItem> {
        let mut items = Vec::with_capacity(self.dirs.len() + self.files.len());
        for (name, dir) in self.dirs {
            let children = dir.into_items(archive);
            items.push(ContentItem::Dir(DirItem::new(
                name,
                DirContent::Source(Arc::new(StaticDirContent::new(children))),
            )));
        }
        for (name, (index, size)) in self.files {
            let entry = ArchiveEntry {
                archive: archive.clone(),
                index,
                size,
            };
            items.push(ContentItem::File(FileItem::new(name, Arc::new(entry))));
        }
        items
    }
}

/// Split an entry name into safe path components, rejecting anything that would escape.
fn entry_components(name: &str) -> Option<Vec<&str>> {
    let mut components = Vec::new();
    for component in name.split(['/', '\\']) {
        match component {
            "" | "." => {}
            ".." => return None,
            other => components.push(other),
        }
    }
    (!components.is_empty()).then_some(components)
}

/// Build the entry tree of a zip archive held in memory.
fn parse_archive(archive: &Bytes) -> Result<Vec<ContentItem>, std::io::Error> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive.clone())).map_err(std::io::Error::other)?;
    let mut root = EntryDir::default();
    for index in 0..zip.len() {
        let entry = zip.by_index(index).map_err(std::io::Error::other)?;
        let name = entry.name().to_owned();
        let Some(components) = entry_components(&name) else {
            debug!(name, "skipping unsafe archive entry");
            continue;
        };
        if entry.is_dir() {
            root.dir_mut(&components);
        } else if let Some((file, parents)) = components.split_last() {
            root.dir_mut(parents)
                .files
                .insert((*file).to_owned(), (index, entry.size()));
        }
    }
    Ok(root.into_items(archive))
}

/// Pull the whole body of a file through its accessor.
async fn read_all(file: &FileItem) -> Result<Bytes, std::io::Error> {
    let size = file.size();
    let reader = file.content.open().await?;
    let mut buf = BytesMut::new();
    let mut offset = 0u64;
    let result = async {
        while offset < size {
            let chunk = reader.read(offset, READ_CHUNK).await?;
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            buf.extend_from_slice(&chunk);
        }
        Ok::<_, std::io::Error>(())
    }
    .await;
    if let Err(e) = reader.close().await {
        debug!(error = %e, "archive reader close reported error");
    }
    result?;
    Ok(buf.freeze())
}

impl ArchiveAsDir {
    /// Expand archives of at most `max_size` bytes.
    #[must_use]
    pub fn new(max_size: u64) -> Self {
        Self {
            max_size,
            expanded: Mutex::new(FxHashMap::default()),
        }
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, FxHashMap<ArchiveKey, Vec<Expanded>>> {
        self.expanded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of archives whose expansion is currently cached.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache().values().map(Vec::len).sum()
    }

    fn is_archive(&self, file: &FileItem) -> bool {
        file.size() <= self.max_size
            && file
                .name
                .to_str()
                .is_some_and(|name| name.to_ascii_lowercase().ends_with(".zip"))
    }

    fn key(dir: &str, file: &FileItem) -> ArchiveKey {
        (dir.to_owned(), file.name.clone())
    }

    fn lookup(&self, dir: &str, file: &FileItem) -> Option<Expanded> {
        self.cache().get(&Self::key(dir, file)).and_then(|entries| {
            entries
                .iter()
                .find(|e| Arc::ptr_eq(&e.content, &file.content))
                .cloned()
        })
    }

    fn forget(&self, dir: &str, file: &FileItem) -> Option<ContentItem> {
        let mut cache = self.cache();
        let key = Self::key(dir, file);
        let entries = cache.get_mut(&key)?;
        let idx = entries
            .iter()
            .position(|e| Arc::ptr_eq(&e.content, &file.content))?;
        let view = entries.swap_remove(idx).view;
        if entries.is_empty() {
            cache.remove(&key);
        }
        view
    }

    /// Drop cached archives of `dir` that are not among `items`.
    fn evict_missing(&self, dir: &str, items: &[ContentItem]) {
        self.cache().retain(|(cached_dir, name), entries| {
            if cached_dir != dir {
                return true;
            }
            entries.retain(|e| {
                items.iter().any(|item| {
                    matches!(item, ContentItem::File(f)
                        if f.name == *name && Arc::ptr_eq(&f.content, &e.content))
                })
            });
            if entries.is_empty() {
                debug!(dir, ?name, "forgetting archive no longer listed");
            }
            !entries.is_empty()
        });
    }

    /// The directory view of `file`, parsing it on first sight.
    async fn expand(&self, dir: &str, file: &FileItem) -> Option<ContentItem> {
        if let Some(known) = self.lookup(dir, file) {
            return known.view;
        }

        let parsed = match read_all(file).await {
            Ok(data) => tokio::task::spawn_blocking(move || parse_archive(&data))
                .await
                .map_err(std::io::Error::other)
                .and_then(|parsed| parsed),
            Err(e) => Err(e),
        };
        let expanded = match parsed {
            Ok(children) => {
                debug!(dir, name = ?file.name, entries = children.len(), "expanded archive");
                let mut item = DirItem::new(
                    file.name.clone(),
                    DirContent::Source(Arc::new(StaticDirContent::new(children))),
                );
                item.created_at = file.created_at;
                Some(ContentItem::Dir(item))
            }
            Err(e) => {
                warn!(dir, name = ?file.name, error = %e, "failed to read archive, exposing it as a file");
                None
            }
        };
        self.cache()
            .entry(Self::key(dir, file))
            .or_default()
            .push(Expanded {
                content: Arc::clone(&file.content),
                view: expanded.clone(),
            });
        expanded
    }

    async fn substitute(&self, dir: &str, items: Vec<ContentItem>) -> Vec<ContentItem> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match &item {
                ContentItem::File(file) if self.is_archive(file) => {
                    out.push(self.expand(dir, file).await.unwrap_or(item));
                }
                ContentItem::File(_) | ContentItem::Dir(_) => out.push(item),
            }
        }
        out
    }

    /// Map removed archives to the view the kernel saw, forgetting them.
    fn substitute_removed(&self, dir: &str, items: Vec<ContentItem>) -> Vec<ContentItem> {
        items
            .into_iter()
            .map(|item| match &item {
                ContentItem::File(file) if self.is_archive(file) => {
                    self.forget(dir, file).unwrap_or(item)
                }
                ContentItem::File(_) | ContentItem::Dir(_) => item,
            })
            .collect()
    }
}

#[async_trait]
impl Wrapper for ArchiveAsDir {
    async fn wrap_dir_content(
        &self,
        _tree: &VfsTree,
        dir: &str,
        items: Vec<ContentItem>,
    ) -> Vec<ContentItem> {
        self.evict_missing(dir, &items);
        self.substitute(dir, items).await
    }

    async fn wrap_updates(
        &self,
        _tree: &VfsTree,
        dir: &str,
        origin: UpdateOrigin<'_>,
        events: Vec<UpdateEvent>,
    ) -> Vec<UpdateEvent> {
        if origin != UpdateOrigin::Own {
            return events;
        }
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            out.push(match event {
                UpdateEvent::NewItems { path, items } if path == dir => {
                    let items = self.substitute(dir, items).await;
                    UpdateEvent::NewItems { path, items }
                }
                UpdateEvent::RemovedItems { path, items } if path == dir => {
                    let items = self.substitute_removed(dir, items);
                    UpdateEvent::RemovedItems { path, items }
                }
                other => other,
            });
        }
        out
    }
}
