//! Seams to the folder storage layer
//!
//! The transfer manager never touches disk itself: uploads read through a
//! [`ChunkSource`], downloads land through a [`ChunkSink`]. The folder
//! repository collaborator implements both; [`MemoryStore`] backs tests
//! and small deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use skiff_proto::{FileInfo, FolderId, Range};

use crate::errors::{Result, TransferError};

/// Read side: serve byte ranges of a file at the referenced version.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn read_range(&self, file: &FileInfo, range: &Range) -> Result<Vec<u8>>;
}

/// Write side: land received bytes and commit a finished download.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn write_chunk(&self, file: &FileInfo, offset: u64, data: &[u8]) -> Result<()>;

    /// All ranges arrived and were verified; hand the file to the folder
    /// layer. Partially-written data persists until then.
    async fn commit(&self, file: &FileInfo) -> Result<()>;
}

type FileKey = (FolderId, String);

/// In-memory backing store, addressed by (folder, path).
#[derive(Default, Clone)]
pub struct MemoryStore {
    files: Arc<Mutex<HashMap<FileKey, Vec<u8>>>>,
    committed: Arc<Mutex<Vec<FileKey>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, file: &FileInfo, data: Vec<u8>) {
        self.files
            .lock()
            .unwrap()
            .insert((file.folder.clone(), file.path.clone()), data);
    }

    pub fn get(&self, file: &FileInfo) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(&(file.folder.clone(), file.path.clone()))
            .cloned()
    }

    pub fn committed(&self) -> Vec<(FolderId, String)> {
        self.committed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChunkSource for MemoryStore {
    async fn read_range(&self, file: &FileInfo, range: &Range) -> Result<Vec<u8>> {
        let files = self.files.lock().unwrap();
        let data = files
            .get(&(file.folder.clone(), file.path.clone()))
            .ok_or_else(|| TransferError::UnknownFile(file.path.clone()))?;

        let start = range.offset as usize;
        let end = range.end() as usize;
        if end > data.len() {
            return Err(TransferError::Failed(format!(
                "range {}..{} beyond {} bytes of {}",
                start,
                end,
                data.len(),
                file.path
            )));
        }
        Ok(data[start..end].to_vec())
    }
}

#[async_trait]
impl ChunkSink for MemoryStore {
    async fn write_chunk(&self, file: &FileInfo, offset: u64, data: &[u8]) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let buffer = files
            .entry((file.folder.clone(), file.path.clone()))
            .or_insert_with(|| vec![0; file.size as usize]);
        if buffer.len() < (file.size as usize).max(offset as usize + data.len()) {
            buffer.resize((file.size as usize).max(offset as usize + data.len()), 0);
        }
        buffer[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    async fn commit(&self, file: &FileInfo) -> Result<()> {
        self.committed
            .lock()
            .unwrap()
            .push((file.folder.clone(), file.path.clone()));
        Ok(())
    }
}
