#![allow(dead_code, missing_docs, clippy::unwrap_used)]

pub mod vfs_mocks;

use std::ffi::{OsStr, OsString};
use std::sync::{Arc, Mutex};

use msg_fs::fs::InodeAddr;
use msg_fs::fs::ops::{AttrDefaults, VfsOps, VfsState};
use msg_fs::fs::update_bridge::{KernelNotifier, TreeProducer, UpdateBridge};
use msg_fs::vfs::VfsTree;

/// What a [`RecordingNotifier`] was told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inval {
    Entry(InodeAddr, OsString),
    Inode(InodeAddr),
}

/// A notifier that records every invalidation it receives.
#[derive(Default)]
pub struct RecordingNotifier {
    pub calls: Mutex<Vec<Inval>>,
}

impl RecordingNotifier {
    pub fn take(&self) -> Vec<Inval> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }
}

impl KernelNotifier for RecordingNotifier {
    fn inval_entry(&self, parent: InodeAddr, name: &OsStr) {
        self.calls
            .lock()
            .unwrap()
            .push(Inval::Entry(parent, name.to_os_string()));
    }

    fn inval_inode(&self, inode: InodeAddr) {
        self.calls.lock().unwrap().push(Inval::Inode(inode));
    }
}

/// A running bridge with dispatcher ops over a fresh tree.
pub struct Mount {
    pub ops: Arc<VfsOps>,
    pub producer: TreeProducer,
    pub notifier: Arc<RecordingNotifier>,
}

/// Wire up tree, registry, bridge and ops the way the daemon does.
pub fn mount() -> Mount {
    mount_with_capacity(16)
}

pub fn mount_with_capacity(capacity: usize) -> Mount {
    let state = VfsState::new(VfsTree::new()).shared();
    let notifier = Arc::new(RecordingNotifier::default());
    let (bridge, producer) = UpdateBridge::new(
        Arc::clone(&state),
        Arc::clone(&notifier) as Arc<dyn KernelNotifier>,
        capacity,
    );
    tokio::spawn(bridge.run());
    let ops = Arc::new(VfsOps::new(
        state,
        AttrDefaults {
            uid: 1000,
            gid: 1000,
            ..AttrDefaults::default()
        },
    ));
    Mount {
        ops,
        producer,
        notifier,
    }
}

impl Mount {
    /// Resolve an absolute path by issuing one `lookup` per component from the root.
    pub async fn resolve(&self, path: &str) -> Result<InodeAddr, i32> {
        let mut current = msg_fs::fs::ROOT_INODE;
        for name in path.split('/').filter(|c| !c.is_empty()) {
            current = self
                .ops
                .lookup(current, OsStr::new(name))
                .await
                .map_err(i32::from)?
                .addr;
        }
        Ok(current)
    }

    /// Names visible in directory `ino`, through a full opendir/readdir/releasedir cycle.
    pub async fn list(&self, ino: InodeAddr) -> Vec<OsString> {
        let fh = self.ops.opendir(ino).await.unwrap();
        let names = self
            .ops
            .readdir(fh, 0)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        self.ops.releasedir(fh);
        names
    }

    /// Names visible at an absolute path.
    pub async fn list_path(&self, path: &str) -> Vec<OsString> {
        let ino = self.resolve(path).await.unwrap();
        self.list(ino).await
    }

    /// The full contents of file `ino`.
    pub async fn read_all(&self, ino: InodeAddr) -> Vec<u8> {
        let fh = self
            .ops
            .open(ino, msg_fs::fs::OpenFlags::RDONLY)
            .await
            .unwrap();
        let data = self.ops.read(fh, 0, 1 << 20).await.unwrap();
        self.ops.release(fh).await;
        data.to_vec()
    }
}

pub fn names(list: &[&str]) -> Vec<OsString> {
    list.iter().map(OsString::from).collect()
}
