//! Folder repository collaborator
//!
//! The engine never scans disk itself: the repository supplies the local
//! listing and ignore rules per folder, serves upload bytes and lands
//! download bytes. [`MemoryRepository`] is the in-memory implementation
//! used by tests and the demo daemon.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use skiff_proto::{FileInfo, FolderId, FolderInfo, Range};
use skiff_sync::IgnoreRules;
use skiff_transfer::{ChunkSink, ChunkSource, MemoryStore, Result as TransferResult};

/// What the engine needs from the folder layer.
#[async_trait]
pub trait FolderRepository: ChunkSource + ChunkSink {
    /// Folders this node takes part in, with their ignore rules.
    async fn folders(&self) -> Vec<(FolderInfo, IgnoreRules)>;

    /// Current local listing of one folder.
    async fn file_list(&self, folder: &FolderId) -> Vec<FileInfo>;
}

/// In-memory repository over a [`MemoryStore`].
#[derive(Default, Clone)]
pub struct MemoryRepository {
    store: MemoryStore,
    folders: Arc<Mutex<Vec<(FolderInfo, IgnoreRules)>>>,
    files: Arc<Mutex<HashMap<FolderId, Vec<FileInfo>>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_folder(&self, info: FolderInfo, ignore: IgnoreRules) {
        self.files.lock().unwrap().entry(info.id.clone()).or_default();
        self.folders.lock().unwrap().push((info, ignore));
    }

    /// Register a file and its content, bumping folder statistics.
    pub fn add_file(&self, file: FileInfo, data: Vec<u8>) {
        assert_eq!(file.size as usize, data.len(), "size must match content");
        self.store.put(&file, data);
        self.files
            .lock()
            .unwrap()
            .entry(file.folder.clone())
            .or_default()
            .push(file);
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

#[async_trait]
impl ChunkSource for MemoryRepository {
    async fn read_range(&self, file: &FileInfo, range: &Range) -> TransferResult<Vec<u8>> {
        self.store.read_range(file, range).await
    }
}

#[async_trait]
impl ChunkSink for MemoryRepository {
    async fn write_chunk(&self, file: &FileInfo, offset: u64, data: &[u8]) -> TransferResult<()> {
        self.store.write_chunk(file, offset, data).await
    }

    async fn commit(&self, file: &FileInfo) -> TransferResult<()> {
        // A committed download becomes part of the local listing.
        {
            let mut files = self.files.lock().unwrap();
            let entries = files.entry(file.folder.clone()).or_default();
            entries.retain(|f| f.path != file.path);
            entries.push(file.clone());
        }
        self.store.commit(file).await
    }
}

#[async_trait]
impl FolderRepository for MemoryRepository {
    async fn folders(&self) -> Vec<(FolderInfo, IgnoreRules)> {
        self.folders.lock().unwrap().clone()
    }

    async fn file_list(&self, folder: &FolderId) -> Vec<FileInfo> {
        self.files
            .lock()
            .unwrap()
            .get(folder)
            .cloned()
            .unwrap_or_default()
    }
}
