use crate::error::StoreError;
use crate::feedback::FeedbackAction;
use crate::models::{FileStatus, KnowledgeBaseFile, MemoryItem, SourceType, DEPRIORITIZED_TAG};
use crate::traits::{FileRepository, MemoryItemStore, StatusSwap, StatusUpdate};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    files: HashMap<Uuid, KnowledgeBaseFile>,
    items: Vec<MemoryItem>,
}

/// Process-local store for files and memory items. A single lock guards both
/// tables, so every operation is a transaction.
#[derive(Default)]
pub struct InMemoryKnowledgeStore {
    state: RwLock<State>,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn memory_item_count(&self) -> usize {
        self.state.read().await.items.len()
    }
}

fn file_mut(state: &mut State, id: Uuid) -> Result<&mut KnowledgeBaseFile, StoreError> {
    state.files.get_mut(&id).ok_or(StoreError::FileNotFound(id))
}

#[async_trait]
impl FileRepository for InMemoryKnowledgeStore {
    async fn create_file(&self, file: KnowledgeBaseFile) -> Result<KnowledgeBaseFile, StoreError> {
        let mut state = self.state.write().await;
        if state.files.contains_key(&file.id) {
            return Err(StoreError::Conflict(format!("file {} already exists", file.id)));
        }
        state.files.insert(file.id, file.clone());
        Ok(file)
    }

    async fn get_file(&self, id: Uuid) -> Result<Option<KnowledgeBaseFile>, StoreError> {
        Ok(self.state.read().await.files.get(&id).cloned())
    }

    async fn list_files(
        &self,
        user_id: Uuid,
        character_id: Option<Uuid>,
    ) -> Result<Vec<KnowledgeBaseFile>, StoreError> {
        let state = self.state.read().await;
        let mut files: Vec<KnowledgeBaseFile> = state
            .files
            .values()
            .filter(|file| file.user_id == user_id)
            .filter(|file| character_id.is_none() || file.character_id == character_id)
            .cloned()
            .collect();
        files.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        Ok(files)
    }

    async fn set_status(
        &self,
        id: Uuid,
        update: StatusUpdate,
    ) -> Result<KnowledgeBaseFile, StoreError> {
        let mut state = self.state.write().await;
        let file = file_mut(&mut state, id)?;
        file.status = update.status;
        file.last_error = update.last_error;
        file.paused_from = update.paused_from;
        file.updated_at = Utc::now();
        Ok(file.clone())
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        allowed_from: &[FileStatus],
        next: FileStatus,
    ) -> Result<StatusSwap, StoreError> {
        let mut state = self.state.write().await;
        let file = file_mut(&mut state, id)?;
        if !allowed_from.contains(&file.status) {
            return Ok(StatusSwap::Unchanged(file.clone()));
        }

        let previous = file.clone();
        file.paused_from = (next == FileStatus::Paused).then_some(previous.status);
        file.status = next;
        file.updated_at = Utc::now();
        Ok(StatusSwap::Swapped {
            previous,
            current: file.clone(),
        })
    }

    async fn update_tags(
        &self,
        id: Uuid,
        tags: Vec<String>,
    ) -> Result<KnowledgeBaseFile, StoreError> {
        let mut state = self.state.write().await;
        let file = file_mut(&mut state, id)?;
        file.tags = tags;
        file.updated_at = Utc::now();
        Ok(file.clone())
    }

    async fn delete_file(&self, id: Uuid) -> Result<Option<KnowledgeBaseFile>, StoreError> {
        let mut state = self.state.write().await;
        let removed = state.files.remove(&id);
        if removed.is_some() {
            state
                .items
                .retain(|item| !(item.source_type == SourceType::File && item.source_id == id));
        }
        Ok(removed)
    }
}

#[async_trait]
impl MemoryItemStore for InMemoryKnowledgeStore {
    async fn replace_for_source(
        &self,
        source_type: SourceType,
        source_id: Uuid,
        items: Vec<MemoryItem>,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        if source_type == SourceType::File && !state.files.contains_key(&source_id) {
            return Err(StoreError::FileNotFound(source_id));
        }
        state
            .items
            .retain(|item| !(item.source_type == source_type && item.source_id == source_id));
        let inserted = items.len();
        state.items.extend(items);
        Ok(inserted)
    }

    async fn list_for_source(
        &self,
        source_type: SourceType,
        source_id: Uuid,
    ) -> Result<Vec<MemoryItem>, StoreError> {
        let state = self.state.read().await;
        let mut items: Vec<MemoryItem> = state
            .items
            .iter()
            .filter(|item| item.source_type == source_type && item.source_id == source_id)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.metadata.chunk_index);
        Ok(items)
    }

    async fn count_for_source(
        &self,
        source_type: SourceType,
        source_id: Uuid,
    ) -> Result<usize, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .items
            .iter()
            .filter(|item| item.source_type == source_type && item.source_id == source_id)
            .count())
    }

    async fn retag_source(
        &self,
        source_type: SourceType,
        source_id: Uuid,
        tags: &[String],
    ) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        let mut updated = 0;
        for item in state
            .items
            .iter_mut()
            .filter(|item| item.source_type == source_type && item.source_id == source_id)
        {
            let deprioritized = item.is_deprioritized();
            item.tags = tags.to_vec();
            if deprioritized {
                item.tags.push(DEPRIORITIZED_TAG.to_string());
            }
            updated += 1;
        }
        Ok(updated)
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<MemoryItem>, StoreError> {
        let state = self.state.read().await;
        Ok(state.items.iter().find(|item| item.id == id).cloned())
    }

    async fn update_feedback(
        &self,
        id: Uuid,
        action: FeedbackAction,
    ) -> Result<MemoryItem, StoreError> {
        let mut state = self.state.write().await;
        let item = state
            .items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or(StoreError::MemoryItemNotFound(id))?;
        action.apply_to(item);
        Ok(item.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkMetadata, OwnerType, VisibilityPolicy};

    fn file(status: FileStatus) -> KnowledgeBaseFile {
        KnowledgeBaseFile {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            character_id: None,
            file_name: "lore.txt".to_string(),
            file_type: "text/plain".to_string(),
            size_bytes: 10,
            storage_path: "/tmp/lore.txt".to_string(),
            checksum: String::new(),
            status,
            paused_from: None,
            last_error: None,
            tags: vec!["lore".to_string()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn item(source_id: Uuid, index: usize) -> MemoryItem {
        MemoryItem {
            id: Uuid::new_v4(),
            owner_type: OwnerType::User,
            owner_id: Uuid::new_v4(),
            source_type: SourceType::File,
            source_id,
            content: format!("chunk {index}"),
            embedding: vec![0.0; 4],
            tags: Vec::new(),
            visibility_policy: VisibilityPolicy::Normal,
            metadata: ChunkMetadata {
                chunk_index: index,
                start_offset: 0,
                end_offset: 1,
                provider: "local".to_string(),
                model: "char-trigram".to_string(),
                dimensions: 4,
            },
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn compare_and_set_only_moves_allowed_states() {
        let store = InMemoryKnowledgeStore::new();
        let ready = store.create_file(file(FileStatus::Ready)).await.unwrap();
        let pending = store.create_file(file(FileStatus::Pending)).await.unwrap();
        let allowed = [FileStatus::Ready, FileStatus::Failed];

        let swap = store
            .compare_and_set_status(ready.id, &allowed, FileStatus::Pending)
            .await
            .unwrap();
        assert!(matches!(
            swap,
            StatusSwap::Swapped { ref previous, ref current }
                if previous.status == FileStatus::Ready && current.status == FileStatus::Pending
        ));

        let swap = store
            .compare_and_set_status(pending.id, &allowed, FileStatus::Pending)
            .await
            .unwrap();
        assert!(matches!(swap, StatusSwap::Unchanged(ref file) if file.status == FileStatus::Pending));
    }

    #[tokio::test]
    async fn pausing_remembers_previous_status() {
        let store = InMemoryKnowledgeStore::new();
        let failed = store.create_file(file(FileStatus::Failed)).await.unwrap();
        let swap = store
            .compare_and_set_status(failed.id, &[FileStatus::Failed], FileStatus::Paused)
            .await
            .unwrap();
        match swap {
            StatusSwap::Swapped { current, .. } => {
                assert_eq!(current.status, FileStatus::Paused);
                assert_eq!(current.paused_from, Some(FileStatus::Failed));
            }
            StatusSwap::Unchanged(_) => panic!("expected swap"),
        }
    }

    #[tokio::test]
    async fn replace_does_not_accumulate() {
        let store = InMemoryKnowledgeStore::new();
        let source = store.create_file(file(FileStatus::Ready)).await.unwrap().id;
        let other = store.create_file(file(FileStatus::Ready)).await.unwrap().id;
        store
            .replace_for_source(SourceType::File, other, vec![item(other, 0)])
            .await
            .unwrap();

        store
            .replace_for_source(SourceType::File, source, (0..3).map(|i| item(source, i)).collect())
            .await
            .unwrap();
        store
            .replace_for_source(SourceType::File, source, (0..2).map(|i| item(source, i)).collect())
            .await
            .unwrap();

        assert_eq!(store.count_for_source(SourceType::File, source).await.unwrap(), 2);
        assert_eq!(store.count_for_source(SourceType::File, other).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_file_removes_its_memory_items() {
        let store = InMemoryKnowledgeStore::new();
        let record = store.create_file(file(FileStatus::Ready)).await.unwrap();
        store
            .replace_for_source(SourceType::File, record.id, vec![item(record.id, 0)])
            .await
            .unwrap();

        let removed = store.delete_file(record.id).await.unwrap();
        assert_eq!(removed.map(|f| f.id), Some(record.id));
        assert_eq!(store.memory_item_count().await, 0);
        assert!(store.get_file(record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retag_keeps_reserved_tag() {
        let store = InMemoryKnowledgeStore::new();
        let source = store.create_file(file(FileStatus::Ready)).await.unwrap().id;
        let mut flagged = item(source, 0);
        flagged.tags = vec!["old".to_string(), DEPRIORITIZED_TAG.to_string()];
        store
            .replace_for_source(SourceType::File, source, vec![flagged, item(source, 1)])
            .await
            .unwrap();

        store
            .retag_source(SourceType::File, source, &["new".to_string()])
            .await
            .unwrap();

        let items = store.list_for_source(SourceType::File, source).await.unwrap();
        assert_eq!(items[0].tags, vec!["new".to_string(), DEPRIORITIZED_TAG.to_string()]);
        assert_eq!(items[1].tags, vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn replace_for_a_deleted_file_inserts_nothing() {
        let store = InMemoryKnowledgeStore::new();
        let record = store.create_file(file(FileStatus::Indexing)).await.unwrap();
        store.delete_file(record.id).await.unwrap();

        let error = store
            .replace_for_source(SourceType::File, record.id, vec![item(record.id, 0)])
            .await
            .unwrap_err();

        assert!(matches!(error, StoreError::FileNotFound(id) if id == record.id));
        assert_eq!(store.memory_item_count().await, 0);
    }
}
