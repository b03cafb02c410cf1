//! Active and completed file-transfer metadata

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;

use crate::current_timestamp;
use crate::protocol::Scope;

/// Metadata for one stored-and-forwarded file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Server-minted id, also the storage filename under `uploads/`
    pub unique_id: String,
    pub original_filename: String,
    pub sender: String,
    pub target_scope: Scope,
    pub target_name: String,
    pub filesize: u64,
    /// Upload progress; equals `filesize` once complete
    pub bytes_received: u64,
    /// Relative storage path (`uploads/<unique_id>`)
    pub filepath: String,
    pub upload_complete: bool,
    /// Seconds since the Unix epoch at `REQ_UPLOAD` time
    pub upload_time: i64,
}

#[derive(Default)]
struct FileMaps {
    /// In-flight uploads, resumable until cancelled or completed
    active: HashMap<String, FileMetadata>,
    /// Durable store-and-forward entries available for download
    completed: HashMap<String, FileMetadata>,
}

/// File table: upload lifecycle tracking and id minting
pub struct FileTable {
    inner: RwLock<FileMaps>,
    counter: AtomicU64,
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(FileMaps::default()),
            counter: AtomicU64::new(0),
        }
    }

    /// Mint a file id: `<unix_seconds>_<counter>`
    pub fn mint_id(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}_{}", current_timestamp(), seq)
    }

    /// Register a fresh active upload
    pub async fn register_active(&self, meta: FileMetadata) {
        self.inner
            .write()
            .await
            .active
            .insert(meta.unique_id.clone(), meta);
    }

    /// Clone of an active upload's metadata
    pub async fn active(&self, file_id: &str) -> Option<FileMetadata> {
        self.inner.read().await.active.get(file_id).cloned()
    }

    /// Update an active upload's received byte count
    pub async fn set_progress(&self, file_id: &str, bytes_received: u64) {
        if let Some(meta) = self.inner.write().await.active.get_mut(file_id) {
            meta.bytes_received = bytes_received;
        }
    }

    /// Move an upload from active to completed, returning the final
    /// metadata
    pub async fn complete(&self, file_id: &str) -> Option<FileMetadata> {
        let mut maps = self.inner.write().await;
        let mut meta = maps.active.remove(file_id)?;
        meta.upload_complete = true;
        meta.bytes_received = meta.filesize;
        maps.completed.insert(file_id.to_string(), meta.clone());
        Some(meta)
    }

    /// Drop an active upload, returning its metadata so the caller can
    /// unlink the partial file
    pub async fn cancel(&self, file_id: &str) -> Option<FileMetadata> {
        self.inner.write().await.active.remove(file_id)
    }

    /// Clone of a completed entry's metadata
    pub async fn completed(&self, file_id: &str) -> Option<FileMetadata> {
        self.inner.read().await.completed.get(file_id).cloned()
    }

    /// Replace the completed set (startup load)
    pub async fn load_completed(&self, entries: Vec<FileMetadata>) {
        let mut maps = self.inner.write().await;
        maps.completed.clear();
        for meta in entries {
            maps.completed.insert(meta.unique_id.clone(), meta);
        }
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(table: &FileTable) -> FileMetadata {
        let id = table.mint_id();
        FileMetadata {
            filepath: format!("uploads/{}", id),
            unique_id: id,
            original_filename: "f.bin".to_string(),
            sender: "alice".to_string(),
            target_scope: Scope::User,
            target_name: "bob".to_string(),
            filesize: 200000,
            bytes_received: 0,
            upload_complete: false,
            upload_time: current_timestamp(),
        }
    }

    #[test]
    fn test_minted_ids_are_unique() {
        let table = FileTable::new();
        let a = table.mint_id();
        let b = table.mint_id();
        assert_ne!(a, b);
        assert!(a.contains('_'));
    }

    #[tokio::test]
    async fn test_upload_lifecycle() {
        let table = FileTable::new();
        let meta = sample(&table);
        let id = meta.unique_id.clone();

        table.register_active(meta).await;
        assert!(table.active(&id).await.is_some());
        assert!(table.completed(&id).await.is_none());

        table.set_progress(&id, 131072).await;
        assert_eq!(table.active(&id).await.unwrap().bytes_received, 131072);

        let done = table.complete(&id).await.unwrap();
        assert!(done.upload_complete);
        assert_eq!(done.bytes_received, done.filesize);
        assert!(table.active(&id).await.is_none());
        assert!(table.completed(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_cancel_removes_active_entry() {
        let table = FileTable::new();
        let meta = sample(&table);
        let id = meta.unique_id.clone();

        table.register_active(meta).await;
        let cancelled = table.cancel(&id).await.unwrap();
        assert_eq!(cancelled.unique_id, id);
        assert!(table.active(&id).await.is_none());
        assert!(table.cancel(&id).await.is_none());
    }
}
