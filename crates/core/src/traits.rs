use crate::error::StoreError;
use crate::feedback::FeedbackAction;
use crate::models::{FileStatus, KnowledgeBaseFile, MemoryItem, SourceType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// New values for a file's lifecycle columns.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: FileStatus,
    pub last_error: Option<String>,
    pub paused_from: Option<FileStatus>,
}

impl StatusUpdate {
    pub fn to(status: FileStatus) -> Self {
        Self {
            status,
            last_error: None,
            paused_from: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: FileStatus::Failed,
            last_error: Some(error.into()),
            paused_from: None,
        }
    }

    /// Put a file back exactly as it was before a speculative change.
    pub fn restore(file: &KnowledgeBaseFile) -> Self {
        Self {
            status: file.status,
            last_error: file.last_error.clone(),
            paused_from: file.paused_from,
        }
    }
}

/// Result of a guarded status change.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusSwap {
    /// The row was in one of the allowed states and now holds the new one.
    /// `previous` is the row as it was before the update.
    Swapped {
        previous: KnowledgeBaseFile,
        current: KnowledgeBaseFile,
    },
    /// The row was in some other state and was left untouched.
    Unchanged(KnowledgeBaseFile),
}

#[async_trait]
pub trait FileRepository: Send + Sync {
    async fn create_file(&self, file: KnowledgeBaseFile) -> Result<KnowledgeBaseFile, StoreError>;

    async fn get_file(&self, id: Uuid) -> Result<Option<KnowledgeBaseFile>, StoreError>;

    async fn list_files(
        &self,
        user_id: Uuid,
        character_id: Option<Uuid>,
    ) -> Result<Vec<KnowledgeBaseFile>, StoreError>;

    /// Unconditional lifecycle update.
    async fn set_status(
        &self,
        id: Uuid,
        update: StatusUpdate,
    ) -> Result<KnowledgeBaseFile, StoreError>;

    /// Move the file to `next` only if its current status is one of
    /// `allowed_from`, as a single atomic compare-and-swap. Moving to `paused`
    /// records the previous status in `paused_from`; any other target clears it.
    async fn compare_and_set_status(
        &self,
        id: Uuid,
        allowed_from: &[FileStatus],
        next: FileStatus,
    ) -> Result<StatusSwap, StoreError>;

    async fn update_tags(
        &self,
        id: Uuid,
        tags: Vec<String>,
    ) -> Result<KnowledgeBaseFile, StoreError>;

    /// Remove the record and every memory item sourced from it in one
    /// transaction. Returns the removed record, if any.
    async fn delete_file(&self, id: Uuid) -> Result<Option<KnowledgeBaseFile>, StoreError>;
}

#[async_trait]
pub trait MemoryItemStore: Send + Sync {
    /// Delete every item of the source and insert `items`, atomically.
    /// Readers never observe a partially replaced set. For a file source the
    /// file record must still exist; otherwise nothing is written and
    /// `StoreError::FileNotFound` is returned.
    async fn replace_for_source(
        &self,
        source_type: SourceType,
        source_id: Uuid,
        items: Vec<MemoryItem>,
    ) -> Result<usize, StoreError>;

    async fn list_for_source(
        &self,
        source_type: SourceType,
        source_id: Uuid,
    ) -> Result<Vec<MemoryItem>, StoreError>;

    async fn count_for_source(
        &self,
        source_type: SourceType,
        source_id: Uuid,
    ) -> Result<usize, StoreError>;

    /// Set the user-facing tags on every item of the source. Reserved
    /// internal tags already present on an item are kept.
    async fn retag_source(
        &self,
        source_type: SourceType,
        source_id: Uuid,
        tags: &[String],
    ) -> Result<usize, StoreError>;

    async fn get_item(&self, id: Uuid) -> Result<Option<MemoryItem>, StoreError>;

    /// Apply one feedback action to the item as a single update.
    async fn update_feedback(
        &self,
        id: Uuid,
        action: FeedbackAction,
    ) -> Result<MemoryItem, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub path: String,
    pub original_name: String,
    pub size_bytes: u64,
}

/// Byte storage for uploaded documents.
#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn store(
        &self,
        owner_id: Uuid,
        scope_id: Uuid,
        bytes: &[u8],
        name: &str,
    ) -> Result<StoredFile, StoreError>;

    async fn read(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    async fn delete(&self, path: &str) -> Result<(), StoreError>;
}
