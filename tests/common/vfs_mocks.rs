#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::io::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use msg_fs::vfs::{
    BytesContent, ContentItem, ContentReader, DirContentSource, DirSnapshot, FileContent, FileItem,
    UpdateEvent, UpdateListener, UpdateOrigin, VfsTree, Wrapper,
};

/// A file item backed by an in-memory buffer.
pub fn file(name: &str, data: &'static [u8]) -> ContentItem {
    ContentItem::File(FileItem::new(name, Arc::new(BytesContent::new(data))))
}

/// Content that counts how often it was opened and closed.
#[derive(Default)]
pub struct CountingContent {
    pub data: Bytes,
    pub opens: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
}

impl CountingContent {
    pub fn new(data: &'static [u8]) -> Self {
        Self {
            data: Bytes::from_static(data),
            ..Self::default()
        }
    }
}

struct CountingReader {
    data: Bytes,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl ContentReader for CountingReader {
    #[expect(
        clippy::cast_possible_truncation,
        reason = "test mock, offsets stay small"
    )]
    async fn read(&self, offset: u64, size: u32) -> Result<Bytes, std::io::Error> {
        let start = (offset as usize).min(self.data.len());
        let end = (start + size as usize).min(self.data.len());
        Ok(self.data.slice(start..end))
    }

    async fn close(&self) -> Result<(), std::io::Error> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl FileContent for CountingContent {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn open(&self) -> Result<Box<dyn ContentReader>, std::io::Error> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingReader {
            data: self.data.clone(),
            closes: Arc::clone(&self.closes),
        }))
    }
}

/// Content whose accessor always fails with `errno`.
pub struct FailingContent {
    pub errno: i32,
    pub size: u64,
}

#[async_trait]
impl FileContent for FailingContent {
    fn size(&self) -> u64 {
        self.size
    }

    async fn open(&self) -> Result<Box<dyn ContentReader>, std::io::Error> {
        Err(std::io::Error::from_raw_os_error(self.errno))
    }
}

/// A directory provider that records the length of every snapshot handed back to it.
#[derive(Default)]
pub struct RecordingDirSource {
    pub items: Vec<ContentItem>,
    pub released: Mutex<Vec<usize>>,
}

#[async_trait]
impl DirContentSource for RecordingDirSource {
    async fn open(&self) -> Result<Vec<ContentItem>, std::io::Error> {
        Ok(self.items.clone())
    }

    async fn release(&self, snapshot: &DirSnapshot) {
        self.released.lock().unwrap().push(snapshot.len());
    }
}

/// Records every event batch reaching the root.
#[derive(Default)]
pub struct RecordingListener {
    pub batches: Mutex<Vec<Vec<UpdateEvent>>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<UpdateEvent> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }
}

impl UpdateListener for RecordingListener {
    fn on_updates(&self, events: &[UpdateEvent]) {
        self.batches.lock().unwrap().push(events.to_vec());
    }
}

/// A pass-through wrapper that records which node saw events from where.
#[derive(Default)]
pub struct RecordingWrapper {
    pub seen: Mutex<Vec<(String, Option<String>)>>,
}

#[async_trait]
impl Wrapper for RecordingWrapper {
    async fn wrap_dir_content(
        &self,
        _tree: &VfsTree,
        _dir: &str,
        items: Vec<ContentItem>,
    ) -> Vec<ContentItem> {
        items
    }

    async fn wrap_updates(
        &self,
        _tree: &VfsTree,
        dir: &str,
        origin: UpdateOrigin<'_>,
        events: Vec<UpdateEvent>,
    ) -> Vec<UpdateEvent> {
        let child = match origin {
            UpdateOrigin::Own => None,
            UpdateOrigin::Child(child) => Some(child.to_owned()),
        };
        self.seen.lock().unwrap().push((dir.to_owned(), child));
        events
    }
}

/// Build a zip archive in memory. Names ending in `/` become directory entries.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Bytes {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    for (name, data) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
    }
    Bytes::from(writer.finish().unwrap().into_inner())
}

/// A `.zip` file item holding `entries`.
pub fn zip_file(name: &str, entries: &[(&str, &[u8])]) -> ContentItem {
    ContentItem::File(FileItem::new(
        name,
        Arc::new(BytesContent::new(zip_bytes(entries))),
    ))
}
