use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::FileHandle;

/// Open handles keyed by a monotonically increasing handle number.
///
/// One item may be open under several handles at once; each handle owns its own value. Handle
/// numbers are never reused within a mount.
pub struct FileHandleTable<V> {
    next_fh: AtomicU64,
    open: scc::HashMap<FileHandle, Arc<V>>,
}

impl<V> Default for FileHandleTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> FileHandleTable<V> {
    /// Create an empty table. The first handle is `1`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            open: scc::HashMap::new(),
        }
    }

    /// Store `value` under a fresh handle.
    pub fn insert(&self, value: V) -> FileHandle {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        // A fresh handle cannot collide, so the insert always succeeds.
        let _ = self.open.insert_sync(fh, Arc::new(value));
        fh
    }

    /// The value bound to `fh`, if still open.
    #[must_use]
    pub fn get(&self, fh: FileHandle) -> Option<Arc<V>> {
        self.open.read_sync(&fh, |_, v| Arc::clone(v))
    }

    /// Unbind `fh`. Returns `None` when the handle was already released.
    pub fn remove(&self, fh: FileHandle) -> Option<Arc<V>> {
        self.open.remove_sync(&fh).map(|(_, v)| v)
    }

    /// Number of open handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.open.len()
    }

    /// Whether no handle is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}
