//! File-level operations behind the knowledge base endpoints: upload,
//! reindex, pause/resume, tagging and deletion.

use crate::cancel::CancellationSignal;
use crate::config::IndexingConfig;
use crate::error::{IndexError, Result, StoreError};
use crate::jobs::{FileIndexer, JobScheduler};
use crate::models::{normalize_tags, FileStatus, IndexResult, KnowledgeBaseFile, SourceType};
use crate::traits::{FileRepository, FileStorage, MemoryItemStore, StatusSwap, StatusUpdate};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub const REINDEX_IN_PROGRESS: &str = "Reindex already in progress";

/// Statuses from which a reindex may start.
const REINDEXABLE: [FileStatus; 3] = [FileStatus::Ready, FileStatus::Failed, FileStatus::Paused];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    /// Hand the file to the job queue and return immediately.
    #[default]
    Queued,
    /// Index within the request.
    Inline,
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub user_id: Uuid,
    pub character_id: Option<Uuid>,
    pub file_name: String,
    pub file_type: String,
    pub bytes: Vec<u8>,
    pub tags: Vec<String>,
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub file: KnowledgeBaseFile,
    pub job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_result: Option<IndexResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReindexOutcome {
    pub file: KnowledgeBaseFile,
    /// `None` when the request was folded into work already queued or running.
    pub job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ReindexOutcome {
    /// 202 when new work was queued, 200 for a deduplicated request.
    pub fn http_status(&self) -> u16 {
        if self.job_id.is_some() {
            202
        } else {
            200
        }
    }
}

pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub struct KnowledgeBaseService {
    files: Arc<dyn FileRepository>,
    memories: Arc<dyn MemoryItemStore>,
    storage: Arc<dyn FileStorage>,
    scheduler: Arc<JobScheduler>,
    indexer: Arc<dyn FileIndexer>,
    config: IndexingConfig,
}

impl KnowledgeBaseService {
    pub fn new(
        files: Arc<dyn FileRepository>,
        memories: Arc<dyn MemoryItemStore>,
        storage: Arc<dyn FileStorage>,
        scheduler: Arc<JobScheduler>,
        indexer: Arc<dyn FileIndexer>,
        config: IndexingConfig,
    ) -> Self {
        Self {
            files,
            memories,
            storage,
            scheduler,
            indexer,
            config,
        }
    }

    #[instrument(
        skip(self, request),
        fields(user_id = %request.user_id, file_name = %request.file_name)
    )]
    pub async fn upload_file(
        &self,
        request: UploadRequest,
        mode: IndexMode,
    ) -> Result<UploadOutcome> {
        let file_name = request.file_name.trim();
        if file_name.is_empty() {
            return Err(IndexError::InvalidArgument("file name is required".to_string()));
        }

        let size = request.bytes.len() as u64;
        if size > self.config.max_file_size_bytes {
            return Err(IndexError::FileTooLarge {
                size,
                limit: self.config.max_file_size_bytes,
            });
        }

        let id = Uuid::new_v4();
        let scope_id = request.character_id.unwrap_or(request.user_id);
        let stored = self
            .storage
            .store(request.user_id, scope_id, &request.bytes, file_name)
            .await?;

        let now = Utc::now();
        let record = KnowledgeBaseFile {
            id,
            user_id: request.user_id,
            character_id: request.character_id,
            file_name: stored.original_name.clone(),
            file_type: request.file_type.trim().to_string(),
            size_bytes: stored.size_bytes,
            storage_path: stored.path.clone(),
            checksum: checksum(&request.bytes),
            status: FileStatus::Pending,
            paused_from: None,
            last_error: None,
            tags: normalize_tags(&request.tags),
            created_at: now,
            updated_at: now,
        };

        let file = match self.files.create_file(record).await {
            Ok(file) => file,
            Err(create_error) => {
                self.discard_bytes(&stored.path).await;
                return Err(create_error.into());
            }
        };

        match mode {
            IndexMode::Queued => {
                let job_id = match self
                    .scheduler
                    .enqueue_index_file(id, file.user_id, request.priority)
                    .await
                {
                    Ok(job_id) => job_id,
                    Err(enqueue_error) => {
                        warn!(
                            file_id = %id,
                            error = %enqueue_error,
                            "enqueue failed, removing upload"
                        );
                        if let Err(error) = self.files.delete_file(id).await {
                            error!(file_id = %id, %error, "failed to remove file record");
                        }
                        self.discard_bytes(&stored.path).await;
                        return Err(enqueue_error.into());
                    }
                };

                info!(file_id = %id, %job_id, size_bytes = size, "file uploaded");
                Ok(UploadOutcome {
                    file,
                    job_id: Some(job_id),
                    index_result: None,
                })
            }
            IndexMode::Inline => {
                let result = self.indexer.index_file(id, CancellationSignal::never()).await;
                let file = self.files.get_file(id).await?.unwrap_or(file);
                info!(
                    file_id = %id,
                    success = result.success,
                    chunks_created = result.chunks_created,
                    "file uploaded and indexed inline"
                );
                Ok(UploadOutcome {
                    file,
                    job_id: None,
                    index_result: Some(result),
                })
            }
        }
    }

    /// Queue a fresh indexing pass. A file already pending or indexing is left
    /// alone and no second job is created.
    #[instrument(skip(self))]
    pub async fn reindex_file(&self, file_id: Uuid, user_id: Uuid) -> Result<ReindexOutcome> {
        self.owned_file(file_id, user_id).await?;

        let previous = match self
            .files
            .compare_and_set_status(file_id, &REINDEXABLE, FileStatus::Pending)
            .await?
        {
            StatusSwap::Swapped { previous, .. } => previous,
            StatusSwap::Unchanged(file) if file.status.is_in_flight() => {
                info!(%file_id, status = %file.status, "reindex deduplicated");
                return Ok(ReindexOutcome {
                    file,
                    job_id: None,
                    message: Some(REINDEX_IN_PROGRESS.to_string()),
                });
            }
            StatusSwap::Unchanged(file) => {
                return Err(IndexError::InvalidTransition {
                    file_id,
                    from: file.status.to_string(),
                    to: FileStatus::Pending.to_string(),
                })
            }
        };

        match self
            .scheduler
            .enqueue_index_file(file_id, user_id, None)
            .await
        {
            Ok(job_id) => {
                let file = self
                    .files
                    .get_file(file_id)
                    .await?
                    .ok_or(StoreError::FileNotFound(file_id))?;
                info!(%file_id, %job_id, from = %previous.status, "reindex queued");
                Ok(ReindexOutcome {
                    file,
                    job_id: Some(job_id),
                    message: None,
                })
            }
            Err(enqueue_error) => {
                warn!(%file_id, error = %enqueue_error, "enqueue failed, restoring status");
                if let Err(error) = self
                    .files
                    .set_status(file_id, StatusUpdate::restore(&previous))
                    .await
                {
                    error!(%file_id, %error, "failed to restore status after enqueue failure");
                }
                Err(enqueue_error.into())
            }
        }
    }

    /// Take a settled file out of circulation, remembering how it ended.
    pub async fn pause_file(&self, file_id: Uuid, user_id: Uuid) -> Result<KnowledgeBaseFile> {
        self.owned_file(file_id, user_id).await?;

        match self
            .files
            .compare_and_set_status(
                file_id,
                &[FileStatus::Ready, FileStatus::Failed],
                FileStatus::Paused,
            )
            .await?
        {
            StatusSwap::Swapped { current, .. } => Ok(current),
            StatusSwap::Unchanged(file) => Err(IndexError::InvalidTransition {
                file_id,
                from: file.status.to_string(),
                to: FileStatus::Paused.to_string(),
            }),
        }
    }

    /// Put a paused file back into the status it was paused from.
    pub async fn resume_file(&self, file_id: Uuid, user_id: Uuid) -> Result<KnowledgeBaseFile> {
        let file = self.owned_file(file_id, user_id).await?;
        let target = file.paused_from.unwrap_or(FileStatus::Ready);

        if file.status != FileStatus::Paused || !file.status.can_transition_to(target) {
            return Err(IndexError::InvalidTransition {
                file_id,
                from: file.status.to_string(),
                to: target.to_string(),
            });
        }

        match self
            .files
            .compare_and_set_status(file_id, &[FileStatus::Paused], target)
            .await?
        {
            StatusSwap::Swapped { current, .. } => Ok(current),
            StatusSwap::Unchanged(file) => Err(IndexError::InvalidTransition {
                file_id,
                from: file.status.to_string(),
                to: target.to_string(),
            }),
        }
    }

    /// Replace the file's tags and carry them onto its memory items.
    pub async fn update_tags(
        &self,
        file_id: Uuid,
        user_id: Uuid,
        tags: &[String],
    ) -> Result<KnowledgeBaseFile> {
        self.owned_file(file_id, user_id).await?;

        let tags = normalize_tags(tags);
        let file = self.files.update_tags(file_id, tags.clone()).await?;
        let retagged = self
            .memories
            .retag_source(SourceType::File, file_id, &tags)
            .await?;

        info!(%file_id, tags = tags.len(), retagged, "file tags updated");
        Ok(file)
    }

    /// Remove the record, its memory items and the stored bytes.
    pub async fn delete_file(&self, file_id: Uuid, user_id: Uuid) -> Result<KnowledgeBaseFile> {
        self.owned_file(file_id, user_id).await?;

        let removed = self
            .files
            .delete_file(file_id)
            .await?
            .ok_or(StoreError::FileNotFound(file_id))?;
        self.storage.delete(&removed.storage_path).await?;

        info!(%file_id, "file deleted");
        Ok(removed)
    }

    pub async fn list_files(
        &self,
        user_id: Uuid,
        character_id: Option<Uuid>,
    ) -> Result<Vec<KnowledgeBaseFile>> {
        Ok(self.files.list_files(user_id, character_id).await?)
    }

    pub async fn get_file(&self, file_id: Uuid, user_id: Uuid) -> Result<KnowledgeBaseFile> {
        self.owned_file(file_id, user_id).await
    }

    async fn owned_file(&self, file_id: Uuid, user_id: Uuid) -> Result<KnowledgeBaseFile> {
        let file = self
            .files
            .get_file(file_id)
            .await?
            .ok_or(StoreError::FileNotFound(file_id))?;
        if file.user_id != user_id {
            return Err(IndexError::Forbidden(file_id));
        }
        Ok(file)
    }

    async fn discard_bytes(&self, path: &str) {
        if let Err(error) = self.storage.delete(path).await {
            error!(%path, %error, "failed to remove stored bytes");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingConfig, JobConfig};
    use crate::embeddings::{EmbeddingClient, LocalNgramProvider};
    use crate::error::JobError;
    use crate::jobs::{InMemoryJobQueue, Job, JobQueue, JobState, SendOptions};
    use crate::orchestrator::IndexingOrchestrator;
    use crate::stores::{InMemoryKnowledgeStore, LocalFileStorage};
    use async_trait::async_trait;
    use serde_json::Value as JsonValue;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// In-memory queue whose `send` can be switched to fail.
    #[derive(Default)]
    struct SwitchableQueue {
        inner: InMemoryJobQueue,
        broken: AtomicBool,
    }

    #[async_trait]
    impl JobQueue for SwitchableQueue {
        async fn send(
            &self,
            queue: &str,
            payload: JsonValue,
            options: SendOptions,
        ) -> std::result::Result<Uuid, JobError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(JobError::Queue("connection reset".to_string()));
            }
            self.inner.send(queue, payload, options).await
        }

        async fn fetch(
            &self,
            queue: &str,
            batch_size: usize,
        ) -> std::result::Result<Vec<Job>, JobError> {
            self.inner.fetch(queue, batch_size).await
        }

        async fn complete(&self, job: &Job) -> std::result::Result<(), JobError> {
            self.inner.complete(job).await
        }

        async fn fail(&self, job: &Job, error: &str) -> std::result::Result<JobState, JobError> {
            self.inner.fail(job, error).await
        }

        async fn get_job(&self, job_id: Uuid) -> std::result::Result<Option<Job>, JobError> {
            self.inner.get_job(job_id).await
        }

        async fn pending_count(&self, queue: &str) -> std::result::Result<usize, JobError> {
            self.inner.pending_count(queue).await
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<InMemoryKnowledgeStore>,
        queue: Arc<SwitchableQueue>,
        service: KnowledgeBaseService,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let storage = Arc::new(LocalFileStorage::new(dir.path()));
        let queue = Arc::new(SwitchableQueue::default());
        let scheduler = Arc::new(JobScheduler::new(queue.clone(), JobConfig::default()));
        let embedding_config = EmbeddingConfig::for_tests();
        let indexing = IndexingConfig {
            chunk_size: 50,
            chunk_overlap: 10,
            max_file_size_bytes: 1024,
            ..IndexingConfig::default()
        };
        let orchestrator = IndexingOrchestrator::new(
            store.clone(),
            store.clone(),
            storage.clone(),
            EmbeddingClient::new(
                Arc::new(LocalNgramProvider {
                    dimensions: embedding_config.dimensions,
                }),
                &embedding_config,
            ),
            &indexing,
        )
        .unwrap();

        let service = KnowledgeBaseService::new(
            store.clone(),
            store.clone(),
            storage,
            scheduler,
            Arc::new(orchestrator),
            indexing,
        );

        Fixture {
            _dir: dir,
            store,
            queue,
            service,
        }
    }

    fn upload(user_id: Uuid, text: &str) -> UploadRequest {
        UploadRequest {
            user_id,
            character_id: None,
            file_name: "harbor notes.md".to_string(),
            file_type: "text/markdown".to_string(),
            bytes: text.as_bytes().to_vec(),
            tags: vec![" lore ".to_string(), String::new(), "lore".to_string()],
            priority: None,
        }
    }

    const TEXT: &str = "The harbor master keeps a ledger of every ship.\n\n\
                        Storms come from the west in late autumn.";

    impl Fixture {
        async fn status(&self, file_id: Uuid) -> FileStatus {
            self.store.get_file(file_id).await.unwrap().unwrap().status
        }

        async fn job_count(&self) -> usize {
            self.queue.inner.jobs().await.len()
        }

        async fn indexed_file(&self, user_id: Uuid) -> KnowledgeBaseFile {
            let outcome = self
                .service
                .upload_file(upload(user_id, TEXT), IndexMode::Inline)
                .await
                .unwrap();
            assert!(outcome.index_result.as_ref().unwrap().success);
            outcome.file
        }
    }

    #[tokio::test]
    async fn queued_upload_creates_pending_record_and_one_job() {
        let fx = fixture();
        let user_id = Uuid::new_v4();

        let outcome = fx
            .service
            .upload_file(upload(user_id, TEXT), IndexMode::Queued)
            .await
            .unwrap();

        assert_eq!(outcome.file.status, FileStatus::Pending);
        assert_eq!(outcome.file.tags, vec!["lore".to_string()]);
        assert_eq!(outcome.file.checksum, checksum(TEXT.as_bytes()));
        assert_eq!(outcome.file.file_name, "harbor notes.md");
        let jobs = fx.queue.inner.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(Some(jobs[0].id), outcome.job_id);
    }

    #[tokio::test]
    async fn inline_upload_indexes_immediately() {
        let fx = fixture();
        let file = fx.indexed_file(Uuid::new_v4()).await;

        assert_eq!(file.status, FileStatus::Ready);
        assert!(fx.store.count_for_source(SourceType::File, file.id).await.unwrap() > 0);
        assert_eq!(fx.job_count().await, 0);
    }

    #[tokio::test]
    async fn oversized_and_unnamed_uploads_are_rejected() {
        let fx = fixture();
        let mut big = upload(Uuid::new_v4(), "");
        big.bytes = vec![b'x'; 2048];
        assert!(matches!(
            fx.service.upload_file(big, IndexMode::Queued).await,
            Err(IndexError::FileTooLarge { size: 2048, limit: 1024 })
        ));

        let mut unnamed = upload(Uuid::new_v4(), TEXT);
        unnamed.file_name = "   ".to_string();
        assert!(matches!(
            fx.service.upload_file(unnamed, IndexMode::Queued).await,
            Err(IndexError::InvalidArgument(_))
        ));
        assert_eq!(fx.job_count().await, 0);
    }

    #[tokio::test]
    async fn failed_enqueue_removes_the_upload() {
        let fx = fixture();
        let user_id = Uuid::new_v4();
        fx.queue.broken.store(true, Ordering::SeqCst);

        let error = fx
            .service
            .upload_file(upload(user_id, TEXT), IndexMode::Queued)
            .await
            .unwrap_err();

        assert!(matches!(error, IndexError::Job(_)));
        assert!(fx.service.list_files(user_id, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reindex_queues_new_work_for_settled_files() {
        let fx = fixture();
        let user_id = Uuid::new_v4();
        let file = fx.indexed_file(user_id).await;

        let outcome = fx.service.reindex_file(file.id, user_id).await.unwrap();

        assert_eq!(outcome.http_status(), 202);
        assert!(outcome.job_id.is_some());
        assert_eq!(outcome.file.status, FileStatus::Pending);
        assert_eq!(fx.job_count().await, 1);
    }

    #[tokio::test]
    async fn reindex_of_in_flight_file_is_deduplicated() {
        let fx = fixture();
        let user_id = Uuid::new_v4();
        let queued = fx
            .service
            .upload_file(upload(user_id, TEXT), IndexMode::Queued)
            .await
            .unwrap()
            .file;

        let pending = fx.service.reindex_file(queued.id, user_id).await.unwrap();
        assert_eq!(pending.job_id, None);
        assert_eq!(pending.http_status(), 200);
        assert_eq!(pending.message.as_deref(), Some("Reindex already in progress"));
        assert_eq!(pending.file, queued);

        fx.store
            .set_status(queued.id, StatusUpdate::to(FileStatus::Indexing))
            .await
            .unwrap();
        let running = fx.service.reindex_file(queued.id, user_id).await.unwrap();
        assert_eq!(running.job_id, None);
        assert_eq!(running.file.status, FileStatus::Indexing);

        assert_eq!(fx.job_count().await, 1);
    }

    #[tokio::test]
    async fn failed_reindex_enqueue_restores_the_previous_status() {
        let fx = fixture();
        let user_id = Uuid::new_v4();
        let file = fx.indexed_file(user_id).await;
        fx.queue.broken.store(true, Ordering::SeqCst);

        let error = fx.service.reindex_file(file.id, user_id).await.unwrap_err();

        assert!(matches!(error, IndexError::Job(_)));
        assert_eq!(fx.status(file.id).await, FileStatus::Ready);
    }

    #[tokio::test]
    async fn other_users_cannot_touch_a_file() {
        let fx = fixture();
        let file = fx.indexed_file(Uuid::new_v4()).await;
        let stranger = Uuid::new_v4();

        assert!(matches!(
            fx.service.reindex_file(file.id, stranger).await,
            Err(IndexError::Forbidden(_))
        ));
        assert!(matches!(
            fx.service.delete_file(file.id, stranger).await,
            Err(IndexError::Forbidden(_))
        ));
        assert!(matches!(
            fx.service.reindex_file(Uuid::new_v4(), stranger).await,
            Err(IndexError::Store(StoreError::FileNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn pause_and_resume_restore_the_settled_status() {
        let fx = fixture();
        let user_id = Uuid::new_v4();
        let file = fx.indexed_file(user_id).await;

        let paused = fx.service.pause_file(file.id, user_id).await.unwrap();
        assert_eq!(paused.status, FileStatus::Paused);
        assert_eq!(paused.paused_from, Some(FileStatus::Ready));
        assert!(fx.service.pause_file(file.id, user_id).await.is_err());

        let resumed = fx.service.resume_file(file.id, user_id).await.unwrap();
        assert_eq!(resumed.status, FileStatus::Ready);
        assert_eq!(resumed.paused_from, None);
        assert!(matches!(
            fx.service.resume_file(file.id, user_id).await,
            Err(IndexError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn pending_files_cannot_be_paused() {
        let fx = fixture();
        let user_id = Uuid::new_v4();
        let queued = fx
            .service
            .upload_file(upload(user_id, TEXT), IndexMode::Queued)
            .await
            .unwrap()
            .file;

        assert!(matches!(
            fx.service.pause_file(queued.id, user_id).await,
            Err(IndexError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn tag_updates_reach_memory_items() {
        let fx = fixture();
        let user_id = Uuid::new_v4();
        let file = fx.indexed_file(user_id).await;

        let updated = fx
            .service
            .update_tags(
                file.id,
                user_id,
                &[" maps ".to_string(), "".to_string(), "maps".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(updated.tags, vec!["maps".to_string()]);

        let items = fx.store.list_for_source(SourceType::File, file.id).await.unwrap();
        assert!(!items.is_empty());
        assert!(items.iter().all(|item| item.tags == vec!["maps".to_string()]));
    }

    #[tokio::test]
    async fn delete_removes_record_items_and_bytes() {
        let fx = fixture();
        let user_id = Uuid::new_v4();
        let file = fx.indexed_file(user_id).await;
        assert!(std::path::Path::new(&file.storage_path).exists());

        let removed = fx.service.delete_file(file.id, user_id).await.unwrap();

        assert_eq!(removed.id, file.id);
        assert!(fx.store.get_file(file.id).await.unwrap().is_none());
        assert_eq!(fx.store.memory_item_count().await, 0);
        assert!(!std::path::Path::new(&file.storage_path).exists());
    }

    #[test]
    fn checksum_is_sha256_hex() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
