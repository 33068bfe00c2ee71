//! Mirrors a host directory into the tree.
//!
//! Each scan walks the host directory, compares it with what was mirrored last time and sends
//! the difference to the update bridge as one atomic command. Files are identified by size and
//! modification time; a changed file is removed and put again. Sources may share tree
//! directories, so a removal of something already gone is not an error.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};
use tracing::{debug, info, warn};

use crate::fs::update_bridge::{ProducerError, TreeOp, TreeProducer};
use crate::vfs::wrappers::{ArchiveAsDir, ExcludeEmpty};
use crate::vfs::{ContentItem, ContentReader, FileContent, FileItem, Wrapper, path};

/// Errors raised while mirroring.
#[derive(Debug, Error)]
pub enum LocalSourceError {
    /// Walking the host directory failed.
    #[error("failed to scan {path}: {source}")]
    Scan {
        /// Directory being read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The update bridge rejected or dropped the command.
    #[error(transparent)]
    Producer(#[from] ProducerError),
}

/// Views applied to every mirrored directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalSourceOptions {
    /// Hide directories with nothing in them.
    pub exclude_empty: bool,
    /// Show `.zip` files as directories.
    pub expand_archives: bool,
}

/// File content read straight from the host filesystem.
struct LocalFileContent {
    path: PathBuf,
    size: u64,
}

struct LocalFileReader {
    file: tokio::sync::Mutex<tokio::fs::File>,
}

#[async_trait]
impl ContentReader for LocalFileReader {
    async fn read(&self, offset: u64, size: u32) -> Result<Bytes, std::io::Error> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::new();
        (&mut *file).take(u64::from(size)).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

#[async_trait]
impl FileContent for LocalFileContent {
    fn size(&self) -> u64 {
        self.size
    }

    async fn open(&self) -> Result<Box<dyn ContentReader>, std::io::Error> {
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(Box::new(LocalFileReader {
            file: tokio::sync::Mutex::new(file),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

struct ScannedFile {
    host_path: PathBuf,
    fingerprint: Fingerprint,
    created_at: Option<SystemTime>,
}

/// What one walk of the host directory found, keyed by tree path.
#[derive(Default)]
struct Scan {
    dirs: BTreeSet<String>,
    files: BTreeMap<(String, OsString), ScannedFile>,
}

struct MirroredFile {
    fingerprint: Fingerprint,
    item: ContentItem,
}

/// What the tree currently holds on behalf of this source.
#[derive(Default)]
struct Mirrored {
    dirs: BTreeSet<String>,
    files: BTreeMap<(String, OsString), MirroredFile>,
}

/// A host directory kept in sync with one tree path.
pub struct LocalSource {
    root: PathBuf,
    tree_path: String,
    options: LocalSourceOptions,
    producer: TreeProducer,
    mirrored: Mirrored,
}

impl LocalSource {
    /// Mirror `root` at `tree_path`.
    pub fn new(
        root: impl Into<PathBuf>,
        tree_path: &str,
        options: LocalSourceOptions,
        producer: TreeProducer,
    ) -> Self {
        Self {
            root: root.into(),
            tree_path: path::normalize(tree_path),
            options,
            producer,
            mirrored: Mirrored::default(),
        }
    }

    /// Scan once per `interval` until the bridge goes away. With no interval, scan once.
    pub async fn run(mut self, interval: Option<Duration>) {
        let Some(interval) = interval else {
            if let Err(e) = self.scan_once().await {
                warn!(root = %self.root.display(), error = %e, "initial scan failed");
            }
            return;
        };

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.scan_once().await {
                Ok(()) => {}
                Err(LocalSourceError::Producer(ProducerError::Closed)) => {
                    info!(root = %self.root.display(), "update bridge stopped, ending rescans");
                    return;
                }
                Err(e) => warn!(root = %self.root.display(), error = %e, "rescan failed"),
            }
        }
    }

    /// Walk the host directory and push the difference into the tree.
    pub async fn scan_once(&mut self) -> Result<(), LocalSourceError> {
        let scan = self.walk().await?;
        let (ops, mirrored) = self.diff(scan);
        if ops.is_empty() {
            return Ok(());
        }
        debug!(root = %self.root.display(), ops = ops.len(), "applying host changes");
        self.producer.sync(ops).await?;
        self.mirrored = mirrored;
        Ok(())
    }

    async fn walk(&self) -> Result<Scan, LocalSourceError> {
        let mut scan = Scan::default();
        scan.dirs.insert(self.tree_path.clone());
        let mut pending = vec![(self.root.clone(), self.tree_path.clone())];

        while let Some((host_dir, tree_dir)) = pending.pop() {
            let scan_err = |source| LocalSourceError::Scan {
                path: host_dir.clone(),
                source,
            };
            let mut entries = tokio::fs::read_dir(&host_dir).await.map_err(scan_err)?;
            while let Some(entry) = entries.next_entry().await.map_err(scan_err)? {
                let host_path = entry.path();
                // Symlinks are followed for files only, so a link cycle cannot trap the walk.
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                let metadata = match tokio::fs::metadata(&host_path).await {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        debug!(path = %host_path.display(), error = %e, "skipping unreadable entry");
                        continue;
                    }
                };

                if metadata.is_dir() {
                    if file_type.is_symlink() {
                        continue;
                    }
                    let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                        warn!(path = %host_path.display(), "skipping directory with non UTF-8 name");
                        continue;
                    };
                    let child = path::join(&tree_dir, &name);
                    scan.dirs.insert(child.clone());
                    pending.push((host_path, child));
                } else if metadata.is_file() {
                    let fingerprint = Fingerprint {
                        len: metadata.len(),
                        modified: metadata.modified().ok(),
                    };
                    scan.files.insert(
                        (tree_dir.clone(), entry.file_name()),
                        ScannedFile {
                            host_path,
                            fingerprint,
                            created_at: metadata.created().or_else(|_| metadata.modified()).ok(),
                        },
                    );
                }
            }
        }
        Ok(scan)
    }

    fn wrappers(&self) -> Vec<Arc<dyn Wrapper>> {
        let mut wrappers: Vec<Arc<dyn Wrapper>> = Vec::new();
        if self.options.expand_archives {
            wrappers.push(Arc::new(ArchiveAsDir::default()));
        }
        if self.options.exclude_empty {
            wrappers.push(Arc::new(ExcludeEmpty::new()));
        }
        wrappers
    }

    /// The ops turning the mirrored state into `scan`, and the state they produce.
    fn diff(&self, scan: Scan) -> (Vec<TreeOp>, Mirrored) {
        let mut ops = Vec::new();

        let removed_dirs: BTreeSet<&String> = self.mirrored.dirs.difference(&scan.dirs).collect();
        for dir in &removed_dirs {
            let parent_removed =
                path::parent(dir).is_some_and(|p| removed_dirs.contains(&p.to_owned()));
            if !parent_removed {
                ops.push(TreeOp::RemoveDir((*dir).clone()));
            }
        }

        let mut files = BTreeMap::new();
        for (key, old) in &self.mirrored.files {
            let (dir, _) = key;
            if removed_dirs.contains(dir) {
                continue;
            }
            let unchanged = scan
                .files
                .get(key)
                .is_some_and(|new| new.fingerprint == old.fingerprint);
            if unchanged {
                continue;
            }
            ops.push(TreeOp::RemoveContent {
                item: old.item.clone(),
                path: dir.clone(),
            });
        }

        for dir in scan.dirs.difference(&self.mirrored.dirs) {
            ops.push(TreeOp::CreateDir(dir.clone()));
            for wrapper in self.wrappers() {
                ops.push(TreeOp::AddWrapper {
                    path: dir.clone(),
                    wrapper,
                });
            }
        }

        let mut puts: BTreeMap<String, Vec<ContentItem>> = BTreeMap::new();
        for (key, new) in scan.files {
            let unchanged = self
                .mirrored
                .files
                .get(&key)
                .filter(|old| old.fingerprint == new.fingerprint);
            let item = if let Some(old) = unchanged {
                old.item.clone()
            } else {
                let item = local_file_item(key.1.clone(), &new);
                puts.entry(key.0.clone()).or_default().push(item.clone());
                item
            };
            files.insert(
                key,
                MirroredFile {
                    fingerprint: new.fingerprint,
                    item,
                },
            );
        }
        for (dir, items) in puts {
            // Another source sharing the directory may have removed it.
            if self.mirrored.dirs.contains(&dir) {
                ops.push(TreeOp::CreateDir(dir.clone()));
            }
            ops.push(TreeOp::PutContent {
                items,
                path: dir,
                overwrite: false,
            });
        }

        let mirrored = Mirrored {
            dirs: scan.dirs,
            files,
        };
        (ops, mirrored)
    }
}

fn local_file_item(name: OsString, scanned: &ScannedFile) -> ContentItem {
    let content = LocalFileContent {
        path: scanned.host_path.clone(),
        size: scanned.fingerprint.len,
    };
    let mut item = FileItem::new(name, Arc::new(content));
    item.created_at = scanned.created_at;
    ContentItem::File(item)
}
