use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Reserved tag appended by `lower_priority` feedback. Retrieval treats it as a
/// soft ranking penalty, never as a filter.
pub const DEPRIORITIZED_TAG: &str = "__rag_deprioritized";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    #[serde(alias = "processing")]
    Indexing,
    Ready,
    Failed,
    Paused,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Indexing => "indexing",
            FileStatus::Ready => "ready",
            FileStatus::Failed => "failed",
            FileStatus::Paused => "paused",
        }
    }

    /// Queued or running. A reindex request against such a file is deduplicated.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, FileStatus::Pending | FileStatus::Indexing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FileStatus::Ready | FileStatus::Failed)
    }

    /// Edges of the file lifecycle.
    ///
    /// `pending -> indexing -> {ready, failed}`, `{ready, failed} <-> paused`,
    /// and any settled state back to `pending`/`indexing` on reindex. A run may
    /// be handed back to `pending` when its worker is cancelled, and a pending
    /// or settled file may fail without starting (provider unreachable).
    pub fn can_transition_to(&self, next: FileStatus) -> bool {
        use FileStatus::*;
        match (self, next) {
            (Pending, Indexing) | (Pending, Failed) => true,
            (Indexing, Ready) | (Indexing, Failed) | (Indexing, Pending) => true,
            (Ready | Failed, Paused) | (Paused, Ready | Failed) => true,
            (Ready | Failed | Paused, Pending | Indexing) => true,
            (Ready | Failed, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(FileStatus::Pending),
            "indexing" | "processing" => Ok(FileStatus::Indexing),
            "ready" => Ok(FileStatus::Ready),
            "failed" => Ok(FileStatus::Failed),
            "paused" => Ok(FileStatus::Paused),
            other => Err(format!("unknown file status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeBaseFile {
    pub id: Uuid,
    pub user_id: Uuid,
    pub character_id: Option<Uuid>,
    pub file_name: String,
    pub file_type: String,
    pub size_bytes: u64,
    pub storage_path: String,
    pub checksum: String,
    pub status: FileStatus,
    /// Settled status to restore when a paused file is resumed.
    pub paused_from: Option<FileStatus>,
    pub last_error: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeBaseFile {
    /// Memory items produced from this file belong to its character when it
    /// has one, otherwise to the uploading user.
    pub fn memory_owner(&self) -> (OwnerType, Uuid) {
        match self.character_id {
            Some(character_id) => (OwnerType::Character, character_id),
            None => (OwnerType::User, self.user_id),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    User,
    Character,
}

impl OwnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerType::User => "user",
            OwnerType::Character => "character",
        }
    }
}

impl FromStr for OwnerType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(OwnerType::User),
            "character" => Ok(OwnerType::Character),
            other => Err(format!("unknown owner type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    File,
    Conversation,
    Manual,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::File => "file",
            SourceType::Conversation => "conversation",
            SourceType::Manual => "manual",
        }
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "file" => Ok(SourceType::File),
            "conversation" => Ok(SourceType::Conversation),
            "manual" => Ok(SourceType::Manual),
            other => Err(format!("unknown source type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityPolicy {
    #[default]
    Normal,
    ExcludeFromRag,
}

impl VisibilityPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisibilityPolicy::Normal => "normal",
            VisibilityPolicy::ExcludeFromRag => "exclude_from_rag",
        }
    }
}

impl FromStr for VisibilityPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "normal" => Ok(VisibilityPolicy::Normal),
            "exclude_from_rag" => Ok(VisibilityPolicy::ExcludeFromRag),
            other => Err(format!("unknown visibility policy: {other}")),
        }
    }
}

/// Where a memory item came from inside its source document, and which model
/// produced its vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub chunk_index: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryItem {
    pub id: Uuid,
    pub owner_type: OwnerType,
    pub owner_id: Uuid,
    pub source_type: SourceType,
    pub source_id: Uuid,
    pub content: String,
    pub embedding: Vec<f32>,
    pub tags: Vec<String>,
    pub visibility_policy: VisibilityPolicy,
    pub metadata: ChunkMetadata,
    pub created_at: DateTime<Utc>,
}

impl MemoryItem {
    pub fn is_deprioritized(&self) -> bool {
        self.tags.iter().any(|tag| tag == DEPRIORITIZED_TAG)
    }
}

/// Outcome of one indexing run. Expected failures are reported here rather
/// than as errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexResult {
    pub file_id: Uuid,
    pub success: bool,
    pub chunks_created: usize,
    pub total_chunks: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether running the same job again could succeed differently.
    #[serde(default)]
    pub retryable: bool,
}

impl IndexResult {
    pub fn succeeded(file_id: Uuid, chunks_created: usize, total_chunks: usize) -> Self {
        Self {
            file_id,
            success: true,
            chunks_created,
            total_chunks,
            error: None,
            retryable: false,
        }
    }

    pub fn failed(
        file_id: Uuid,
        total_chunks: usize,
        error: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            file_id,
            success: false,
            chunks_created: 0,
            total_chunks,
            error: Some(error.into()),
            retryable,
        }
    }
}

/// Trim every entry, drop empties and duplicates, keep first-seen order.
/// The reserved [`DEPRIORITIZED_TAG`] is only set through feedback and is
/// dropped here.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized: Vec<String> = Vec::new();
    for tag in tags {
        let trimmed = tag.as_ref().trim();
        if trimmed.is_empty()
            || trimmed == DEPRIORITIZED_TAG
            || normalized.iter().any(|seen| seen == trimmed)
        {
            continue;
        }
        normalized.push(trimmed.to_string());
    }
    normalized
}
