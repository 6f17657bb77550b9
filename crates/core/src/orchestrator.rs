use crate::cancel::CancellationSignal;
use crate::chunking::{split_text, ChunkingConfig, TextChunk};
use crate::config::IndexingConfig;
use crate::embeddings::{EmbeddingClient, GeneratedEmbedding};
use crate::error::{ConfigError, EmbeddingError, StoreError};
use crate::extractor::extract_text;
use crate::jobs::FileIndexer;
use crate::models::{
    ChunkMetadata, FileStatus, IndexResult, KnowledgeBaseFile, MemoryItem, SourceType,
    VisibilityPolicy,
};
use crate::traits::{FileRepository, FileStorage, MemoryItemStore, StatusUpdate};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub const FILE_NOT_FOUND: &str = "File not found";
pub const EMBEDDING_UNAVAILABLE_PREFIX: &str = "Embedding service unavailable";
pub const ALL_CHUNKS_FAILED: &str = "All chunks failed to embed";
pub const INDEXING_CANCELLED: &str = "Indexing cancelled";

/// Drives one file from stored bytes to persisted memory items.
///
/// Every expected failure ends in an [`IndexResult`] and a recorded file
/// status; `index_file` never returns an error. Nothing is written to the
/// memory item store until all embeddings are in hand, and then the whole set
/// for the file is swapped in one transaction.
pub struct IndexingOrchestrator {
    files: Arc<dyn FileRepository>,
    memories: Arc<dyn MemoryItemStore>,
    storage: Arc<dyn FileStorage>,
    embeddings: EmbeddingClient,
    chunking: ChunkingConfig,
    embedding_concurrency: usize,
}

impl IndexingOrchestrator {
    pub fn new(
        files: Arc<dyn FileRepository>,
        memories: Arc<dyn MemoryItemStore>,
        storage: Arc<dyn FileStorage>,
        embeddings: EmbeddingClient,
        config: &IndexingConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            files,
            memories,
            storage,
            embeddings,
            chunking: ChunkingConfig::try_from(config)?,
            embedding_concurrency: config.embedding_concurrency,
        })
    }

    pub fn embeddings(&self) -> &EmbeddingClient {
        &self.embeddings
    }

    #[instrument(skip(self, cancel), fields(file_id = %file_id))]
    pub async fn index_file(&self, file_id: Uuid, cancel: CancellationSignal) -> IndexResult {
        let file = match self.files.get_file(file_id).await {
            Ok(Some(file)) => file,
            Ok(None) => return IndexResult::failed(file_id, 0, FILE_NOT_FOUND, false),
            Err(error) => {
                error!(%error, "failed to load file record");
                let message = format!("Failed to load file: {error}");
                return IndexResult::failed(file_id, 0, message, true);
            }
        };

        if file.status == FileStatus::Paused {
            return IndexResult::failed(file_id, 0, "File is paused", false);
        }

        let availability = self.embeddings.check_availability().await;
        if !availability.available {
            let reason = availability
                .error
                .unwrap_or_else(|| "unknown error".to_string());
            let message = format!("{EMBEDDING_UNAVAILABLE_PREFIX}: {reason}");
            warn!(provider = self.embeddings.provider_name(), %reason, "skipping indexing");
            self.mark_failed(file_id, &message).await;
            return IndexResult::failed(file_id, 0, message, true);
        }

        if let Err(error) = self
            .files
            .set_status(file_id, StatusUpdate::to(FileStatus::Indexing))
            .await
        {
            error!(%error, "failed to mark file as indexing");
            let message = format!("Failed to update status: {error}");
            return IndexResult::failed(file_id, 0, message, true);
        }

        let chunks = match self.load_chunks(&file).await {
            Ok(chunks) => chunks,
            Err((message, retryable)) => {
                self.mark_failed(file_id, &message).await;
                return IndexResult::failed(file_id, 0, message, retryable);
            }
        };
        let total_chunks = chunks.len();
        debug!(total_chunks, "document chunked");

        let (embedded, failures) = self.embed_chunks(&chunks, &cancel).await;

        let cancelled = failures
            .iter()
            .any(|(_, failure)| matches!(failure, EmbeddingError::Cancelled));
        if cancelled || cancel.is_cancelled() {
            info!(total_chunks, "indexing cancelled before persistence");
            if let Err(error) = self
                .files
                .set_status(file_id, StatusUpdate::to(FileStatus::Pending))
                .await
            {
                error!(%error, "failed to hand cancelled file back to pending");
            }
            return IndexResult::failed(file_id, total_chunks, INDEXING_CANCELLED, true);
        }

        for (index, failure) in &failures {
            warn!(chunk_index = index, error = %failure, "chunk dropped");
        }

        if total_chunks > 0 && embedded.is_empty() {
            let retryable = failures
                .iter()
                .all(|(_, e)| matches!(e, EmbeddingError::RetriesExhausted { .. }));
            self.mark_failed(file_id, ALL_CHUNKS_FAILED).await;
            return IndexResult::failed(file_id, total_chunks, ALL_CHUNKS_FAILED, retryable);
        }

        let items = build_memory_items(&file, embedded);
        let chunks_created = match self
            .memories
            .replace_for_source(SourceType::File, file_id, items)
            .await
        {
            Ok(inserted) => inserted,
            Err(StoreError::FileNotFound(_)) => {
                info!(total_chunks, "file deleted while indexing, nothing persisted");
                return IndexResult::failed(file_id, total_chunks, FILE_NOT_FOUND, false);
            }
            Err(error) => {
                error!(%error, "failed to persist memory items");
                let message = format!("Failed to persist memory items: {error}");
                self.mark_failed(file_id, &message).await;
                return IndexResult::failed(file_id, total_chunks, message, true);
            }
        };

        if let Err(error) = self
            .files
            .set_status(file_id, StatusUpdate::to(FileStatus::Ready))
            .await
        {
            error!(%error, "memory items written but file could not be marked ready");
            return IndexResult::failed(
                file_id,
                total_chunks,
                format!("Failed to update status: {error}"),
                true,
            );
        }

        info!(
            chunks_created,
            total_chunks,
            dropped = failures.len(),
            "file indexed"
        );
        IndexResult::succeeded(file_id, chunks_created, total_chunks)
    }

    /// Read, extract and split the stored document. The error carries the
    /// message to record and whether a retry could help.
    async fn load_chunks(
        &self,
        file: &KnowledgeBaseFile,
    ) -> Result<Vec<TextChunk>, (String, bool)> {
        let bytes = self
            .storage
            .read(&file.storage_path)
            .await
            .map_err(|error| (format!("Failed to read file: {error}"), true))?;

        let text = extract_text(&file.file_type, &file.file_name, &bytes)
            .map_err(|error| (format!("Failed to extract text: {error}"), false))?;

        Ok(split_text(&text, self.chunking))
    }

    /// Embed every chunk with at most `embedding_concurrency` requests in
    /// flight. Successes and failures keep chunk order.
    async fn embed_chunks<'a>(
        &self,
        chunks: &'a [TextChunk],
        cancel: &CancellationSignal,
    ) -> (
        Vec<(&'a TextChunk, GeneratedEmbedding)>,
        Vec<(usize, EmbeddingError)>,
    ) {
        // Each request owns its inputs so the buffered stream stays `Send`
        // inside the boxed `FileIndexer` future.
        let requests: Vec<(usize, String)> = chunks
            .iter()
            .enumerate()
            .map(|(position, chunk)| (position, chunk.text.clone()))
            .collect();
        let client = self.embeddings.clone();
        let cancel = cancel.clone();

        let outcomes: Vec<(usize, Result<GeneratedEmbedding, EmbeddingError>)> =
            stream::iter(requests)
                .map(move |(position, text)| {
                    let client = client.clone();
                    let cancel = cancel.clone();
                    async move {
                        let outcome = client.generate_embedding_until(&text, &cancel).await;
                        (position, outcome)
                    }
                })
                .buffered(self.embedding_concurrency.max(1))
                .collect()
                .await;

        let mut embedded = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for (position, outcome) in outcomes {
            let chunk = &chunks[position];
            match outcome {
                Ok(embedding) => embedded.push((chunk, embedding)),
                Err(error) => failures.push((chunk.index, error)),
            }
        }
        (embedded, failures)
    }

    async fn mark_failed(&self, file_id: Uuid, message: &str) {
        if let Err(error) = self
            .files
            .set_status(file_id, StatusUpdate::failed(message))
            .await
        {
            error!(%file_id, %error, "failed to record indexing failure");
        }
    }
}

fn build_memory_items(
    file: &KnowledgeBaseFile,
    embedded: Vec<(&TextChunk, GeneratedEmbedding)>,
) -> Vec<MemoryItem> {
    let (owner_type, owner_id) = file.memory_owner();
    let created_at = Utc::now();

    embedded
        .into_iter()
        .map(|(chunk, generated)| MemoryItem {
            id: Uuid::new_v4(),
            owner_type,
            owner_id,
            source_type: SourceType::File,
            source_id: file.id,
            content: chunk.text.clone(),
            embedding: generated.embedding,
            tags: file.tags.clone(),
            visibility_policy: VisibilityPolicy::Normal,
            metadata: ChunkMetadata {
                chunk_index: chunk.index,
                start_offset: chunk.start,
                end_offset: chunk.end,
                provider: generated.provider,
                model: generated.model,
                dimensions: generated.dimensions,
            },
            created_at,
        })
        .collect()
}

#[async_trait]
impl FileIndexer for IndexingOrchestrator {
    async fn index_file(&self, file_id: Uuid, cancel: CancellationSignal) -> IndexResult {
        IndexingOrchestrator::index_file(self, file_id, cancel).await
    }
}
