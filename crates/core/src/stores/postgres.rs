//! PostgreSQL + pgvector persistence for knowledge-base files and memory items.

use crate::error::StoreError;
use crate::feedback::FeedbackAction;
use crate::models::{
    ChunkMetadata, FileStatus, KnowledgeBaseFile, MemoryItem, SourceType, VisibilityPolicy,
    DEPRIORITIZED_TAG,
};
use crate::traits::{FileRepository, MemoryItemStore, StatusSwap, StatusUpdate};
use async_trait::async_trait;
use pgvector::Vector;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

const FILE_COLUMNS: &str = "id, user_id, character_id, file_name, file_type, size_bytes, \
     storage_path, checksum, status, paused_from, last_error, tags, created_at, updated_at";

const ITEM_COLUMNS: &str = "id, owner_type, owner_id, source_type, source_id, content, \
     embedding, tags, visibility_policy, chunk_index, start_offset, end_offset, provider, \
     model, dimensions, created_at";

/// Connect a pool with the defaults used by the CLI and worker.
pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(DEFAULT_MAX_CONNECTIONS)
        .acquire_timeout(Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS))
        .connect(database_url)
        .await?;
    info!(max_connections = DEFAULT_MAX_CONNECTIONS, "database pool ready");
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Clone)]
pub struct PgKnowledgeStore {
    pool: PgPool,
}

impl PgKnowledgeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Status values as stored. `indexing` also matches rows written with the
/// legacy `processing` spelling.
fn status_values(statuses: &[FileStatus]) -> Vec<String> {
    let mut values: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
    if statuses.contains(&FileStatus::Indexing) {
        values.push("processing".to_string());
    }
    values
}

fn parse_status(raw: &str) -> Result<FileStatus, StoreError> {
    raw.parse::<FileStatus>().map_err(StoreError::CorruptRow)
}

fn parse_file_row(row: &PgRow) -> Result<KnowledgeBaseFile, StoreError> {
    let status: String = row.try_get("status")?;
    let paused_from: Option<String> = row.try_get("paused_from")?;
    let size_bytes: i64 = row.try_get("size_bytes")?;

    Ok(KnowledgeBaseFile {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        character_id: row.try_get("character_id")?,
        file_name: row.try_get("file_name")?,
        file_type: row.try_get("file_type")?,
        size_bytes: u64::try_from(size_bytes)
            .map_err(|_| StoreError::CorruptRow(format!("negative size {size_bytes}")))?,
        storage_path: row.try_get("storage_path")?,
        checksum: row.try_get("checksum")?,
        status: parse_status(&status)?,
        paused_from: paused_from.as_deref().map(parse_status).transpose()?,
        last_error: row.try_get("last_error")?,
        tags: row.try_get("tags")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_item_row(row: &PgRow) -> Result<MemoryItem, StoreError> {
    let owner_type: String = row.try_get("owner_type")?;
    let source_type: String = row.try_get("source_type")?;
    let visibility: String = row.try_get("visibility_policy")?;
    let embedding: Vector = row.try_get("embedding")?;
    let chunk_index: i32 = row.try_get("chunk_index")?;
    let start_offset: i32 = row.try_get("start_offset")?;
    let end_offset: i32 = row.try_get("end_offset")?;
    let dimensions: i32 = row.try_get("dimensions")?;

    Ok(MemoryItem {
        id: row.try_get("id")?,
        owner_type: owner_type.parse().map_err(StoreError::CorruptRow)?,
        owner_id: row.try_get("owner_id")?,
        source_type: source_type.parse().map_err(StoreError::CorruptRow)?,
        source_id: row.try_get("source_id")?,
        content: row.try_get("content")?,
        embedding: embedding.to_vec(),
        tags: row.try_get("tags")?,
        visibility_policy: visibility.parse().map_err(StoreError::CorruptRow)?,
        metadata: ChunkMetadata {
            chunk_index: chunk_index.max(0) as usize,
            start_offset: start_offset.max(0) as usize,
            end_offset: end_offset.max(0) as usize,
            provider: row.try_get("provider")?,
            model: row.try_get("model")?,
            dimensions: dimensions.max(0) as usize,
        },
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl FileRepository for PgKnowledgeStore {
    async fn create_file(&self, file: KnowledgeBaseFile) -> Result<KnowledgeBaseFile, StoreError> {
        let sql = format!(
            "INSERT INTO knowledge_base_files ({FILE_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             RETURNING {FILE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(file.id)
            .bind(file.user_id)
            .bind(file.character_id)
            .bind(&file.file_name)
            .bind(&file.file_type)
            .bind(file.size_bytes as i64)
            .bind(&file.storage_path)
            .bind(&file.checksum)
            .bind(file.status.as_str())
            .bind(file.paused_from.map(|status| status.as_str()))
            .bind(&file.last_error)
            .bind(&file.tags)
            .bind(file.created_at)
            .bind(file.updated_at)
            .fetch_one(&self.pool)
            .await?;
        parse_file_row(&row)
    }

    async fn get_file(&self, id: Uuid) -> Result<Option<KnowledgeBaseFile>, StoreError> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM knowledge_base_files WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_file_row).transpose()
    }

    async fn list_files(
        &self,
        user_id: Uuid,
        character_id: Option<Uuid>,
    ) -> Result<Vec<KnowledgeBaseFile>, StoreError> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM knowledge_base_files
             WHERE user_id = $1 AND ($2::uuid IS NULL OR character_id = $2)
             ORDER BY created_at DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(character_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(parse_file_row).collect()
    }

    async fn set_status(
        &self,
        id: Uuid,
        update: StatusUpdate,
    ) -> Result<KnowledgeBaseFile, StoreError> {
        let sql = format!(
            "UPDATE knowledge_base_files
             SET status = $2, last_error = $3, paused_from = $4, updated_at = now()
             WHERE id = $1
             RETURNING {FILE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(update.status.as_str())
            .bind(&update.last_error)
            .bind(update.paused_from.map(|status| status.as_str()))
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::FileNotFound(id))?;
        parse_file_row(&row)
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        allowed_from: &[FileStatus],
        next: FileStatus,
    ) -> Result<StatusSwap, StoreError> {
        let mut tx = self.pool.begin().await?;

        let select = format!("SELECT {FILE_COLUMNS} FROM knowledge_base_files WHERE id = $1");
        let previous = sqlx::query(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::FileNotFound(id))?;
        let previous = parse_file_row(&previous)?;

        let update = format!(
            "UPDATE knowledge_base_files
             SET status = $2,
                 paused_from = CASE WHEN $2 = 'paused' THEN status ELSE NULL END,
                 updated_at = now()
             WHERE id = $1 AND status = ANY($3)
             RETURNING {FILE_COLUMNS}"
        );
        let swapped = sqlx::query(&update)
            .bind(id)
            .bind(next.as_str())
            .bind(status_values(allowed_from))
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;

        match swapped {
            Some(row) => {
                let current = parse_file_row(&row)?;
                debug!(file_id = %id, from = %previous.status, to = %current.status, "status swapped");
                Ok(StatusSwap::Swapped { previous, current })
            }
            None => Ok(StatusSwap::Unchanged(previous)),
        }
    }

    async fn update_tags(
        &self,
        id: Uuid,
        tags: Vec<String>,
    ) -> Result<KnowledgeBaseFile, StoreError> {
        let sql = format!(
            "UPDATE knowledge_base_files SET tags = $2, updated_at = now()
             WHERE id = $1
             RETURNING {FILE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(&tags)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::FileNotFound(id))?;
        parse_file_row(&row)
    }

    async fn delete_file(&self, id: Uuid) -> Result<Option<KnowledgeBaseFile>, StoreError> {
        let mut tx = self.pool.begin().await?;

        // The row lock taken here serializes against `replace_for_source`,
        // which holds the file row FOR SHARE while it writes items.
        let sql = format!("DELETE FROM knowledge_base_files WHERE id = $1 RETURNING {FILE_COLUMNS}");
        let removed = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM memory_items WHERE source_type = $1 AND source_id = $2")
            .bind(SourceType::File.as_str())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        removed.as_ref().map(parse_file_row).transpose()
    }
}

#[async_trait]
impl MemoryItemStore for PgKnowledgeStore {
    async fn replace_for_source(
        &self,
        source_type: SourceType,
        source_id: Uuid,
        items: Vec<MemoryItem>,
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;

        if source_type == SourceType::File {
            // Blocks a concurrent delete of the file until this replace commits.
            let exists = sqlx::query("SELECT 1 FROM knowledge_base_files WHERE id = $1 FOR SHARE")
                .bind(source_id)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                return Err(StoreError::FileNotFound(source_id));
            }
        }

        let deleted = sqlx::query("DELETE FROM memory_items WHERE source_type = $1 AND source_id = $2")
            .bind(source_type.as_str())
            .bind(source_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let insert = format!(
            "INSERT INTO memory_items ({ITEM_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
        );
        let inserted = items.len();
        for item in items {
            sqlx::query(&insert)
                .bind(item.id)
                .bind(item.owner_type.as_str())
                .bind(item.owner_id)
                .bind(item.source_type.as_str())
                .bind(item.source_id)
                .bind(&item.content)
                .bind(Vector::from(item.embedding))
                .bind(&item.tags)
                .bind(item.visibility_policy.as_str())
                .bind(item.metadata.chunk_index as i32)
                .bind(item.metadata.start_offset as i32)
                .bind(item.metadata.end_offset as i32)
                .bind(&item.metadata.provider)
                .bind(&item.metadata.model)
                .bind(item.metadata.dimensions as i32)
                .bind(item.created_at)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(%source_id, deleted, inserted, "memory items replaced");
        Ok(inserted)
    }

    async fn list_for_source(
        &self,
        source_type: SourceType,
        source_id: Uuid,
    ) -> Result<Vec<MemoryItem>, StoreError> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM memory_items
             WHERE source_type = $1 AND source_id = $2
             ORDER BY chunk_index"
        );
        let rows = sqlx::query(&sql)
            .bind(source_type.as_str())
            .bind(source_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(parse_item_row).collect()
    }

    async fn count_for_source(
        &self,
        source_type: SourceType,
        source_id: Uuid,
    ) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM memory_items WHERE source_type = $1 AND source_id = $2",
        )
        .bind(source_type.as_str())
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }

    async fn retag_source(
        &self,
        source_type: SourceType,
        source_id: Uuid,
        tags: &[String],
    ) -> Result<usize, StoreError> {
        let updated = sqlx::query(
            "UPDATE memory_items
             SET tags = CASE WHEN $3 = ANY(tags) THEN array_append($4::text[], $3) ELSE $4::text[] END
             WHERE source_type = $1 AND source_id = $2",
        )
        .bind(source_type.as_str())
        .bind(source_id)
        .bind(DEPRIORITIZED_TAG)
        .bind(tags)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated as usize)
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<MemoryItem>, StoreError> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM memory_items WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_item_row).transpose()
    }

    async fn update_feedback(
        &self,
        id: Uuid,
        action: FeedbackAction,
    ) -> Result<MemoryItem, StoreError> {
        let sql = format!(
            "UPDATE memory_items SET
                 visibility_policy = CASE $2
                     WHEN 'exclude' THEN $4
                     WHEN 'restore' THEN $5
                     ELSE visibility_policy END,
                 tags = CASE $2
                     WHEN 'lower_priority' THEN
                         CASE WHEN $3 = ANY(tags) THEN tags ELSE array_append(tags, $3) END
                     WHEN 'restore' THEN array_remove(tags, $3)
                     ELSE tags END
             WHERE id = $1
             RETURNING {ITEM_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(action.as_str())
            .bind(DEPRIORITIZED_TAG)
            .bind(VisibilityPolicy::ExcludeFromRag.as_str())
            .bind(VisibilityPolicy::Normal.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::MemoryItemNotFound(id))?;
        parse_item_row(&row)
    }
}

#[cfg(test)]
mod tests {
    use super::status_values;
    use crate::models::FileStatus;

    #[test]
    fn indexing_matches_legacy_spelling() {
        let values = status_values(&[FileStatus::Ready, FileStatus::Indexing]);
        assert_eq!(values, vec!["ready", "indexing", "processing"]);
    }

    #[test]
    fn other_statuses_are_passed_through() {
        let values = status_values(&[FileStatus::Paused]);
        assert_eq!(values, vec!["paused"]);
    }
}
