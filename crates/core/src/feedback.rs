use crate::error::{FeedbackError, StoreError};
use crate::models::{MemoryItem, OwnerType, VisibilityPolicy, DEPRIORITIZED_TAG};
use crate::traits::MemoryItemStore;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackAction {
    /// Hide the item from retrieval until restored.
    Exclude,
    /// Keep the item retrievable but rank it lower.
    LowerPriority,
    Restore,
}

impl FeedbackAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackAction::Exclude => "exclude",
            FeedbackAction::LowerPriority => "lower_priority",
            FeedbackAction::Restore => "restore",
        }
    }

    /// Apply the action to one item in place. Stores run this inside their
    /// own update so concurrent feedback on the same item cannot lose writes.
    pub fn apply_to(&self, item: &mut MemoryItem) {
        match self {
            FeedbackAction::Exclude => item.visibility_policy = VisibilityPolicy::ExcludeFromRag,
            FeedbackAction::LowerPriority => {
                if !item.is_deprioritized() {
                    item.tags.push(DEPRIORITIZED_TAG.to_string());
                }
            }
            FeedbackAction::Restore => {
                item.tags.retain(|tag| tag != DEPRIORITIZED_TAG);
                item.visibility_policy = VisibilityPolicy::Normal;
            }
        }
    }
}

impl FromStr for FeedbackAction {
    type Err = FeedbackError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "exclude" => Ok(FeedbackAction::Exclude),
            "lower_priority" => Ok(FeedbackAction::LowerPriority),
            "restore" => Ok(FeedbackAction::Restore),
            other => Err(FeedbackError::UnknownAction(other.to_string())),
        }
    }
}

/// Who is sending feedback: the authenticated user and, in a character chat,
/// the character whose context they are acting in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackCaller {
    pub user_id: Uuid,
    pub character_id: Option<Uuid>,
}

impl FeedbackCaller {
    fn may_modify(&self, item: &MemoryItem) -> bool {
        match item.owner_type {
            OwnerType::User => item.owner_id == self.user_id,
            // Any caller in the character's context passes; the character's
            // owning user is not checked here.
            OwnerType::Character => self.character_id == Some(item.owner_id),
        }
    }
}

pub struct MemoryFeedbackService {
    memories: Arc<dyn MemoryItemStore>,
}

impl MemoryFeedbackService {
    pub fn new(memories: Arc<dyn MemoryItemStore>) -> Self {
        Self { memories }
    }

    pub async fn apply_feedback(
        &self,
        caller: &FeedbackCaller,
        item_id: Uuid,
        action: FeedbackAction,
    ) -> Result<MemoryItem, FeedbackError> {
        let item = self
            .memories
            .get_item(item_id)
            .await?
            .ok_or(FeedbackError::NotFound(item_id))?;

        if !caller.may_modify(&item) {
            return Err(FeedbackError::Forbidden(item_id));
        }

        let updated = self
            .memories
            .update_feedback(item_id, action)
            .await
            .map_err(|error| match error {
                StoreError::MemoryItemNotFound(id) => FeedbackError::NotFound(id),
                other => FeedbackError::Store(other),
            })?;

        info!(
            memory_item_id = %item_id,
            action = action.as_str(),
            visibility = updated.visibility_policy.as_str(),
            "applied memory feedback"
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkMetadata, SourceType};
    use crate::stores::InMemoryKnowledgeStore;
    use async_trait::async_trait;
    use chrono::Utc;

    fn item(owner_type: OwnerType, owner_id: Uuid) -> MemoryItem {
        MemoryItem {
            id: Uuid::new_v4(),
            owner_type,
            owner_id,
            source_type: SourceType::Manual,
            source_id: Uuid::new_v4(),
            content: "The lighthouse keeper hates fog.".to_string(),
            embedding: vec![0.1; 4],
            tags: vec!["lore".to_string()],
            visibility_policy: VisibilityPolicy::Normal,
            metadata: ChunkMetadata {
                chunk_index: 0,
                start_offset: 0,
                end_offset: 32,
                provider: "local".to_string(),
                model: "char-trigram".to_string(),
                dimensions: 4,
            },
            created_at: Utc::now(),
        }
    }

    async fn service_with(item: MemoryItem) -> MemoryFeedbackService {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        store
            .replace_for_source(item.source_type, item.source_id, vec![item])
            .await
            .unwrap();
        MemoryFeedbackService::new(store)
    }

    fn user(user_id: Uuid) -> FeedbackCaller {
        FeedbackCaller {
            user_id,
            character_id: None,
        }
    }

    #[test]
    fn actions_parse_from_wire_names() {
        assert_eq!(
            "lower_priority".parse::<FeedbackAction>().unwrap(),
            FeedbackAction::LowerPriority
        );
        assert!(matches!(
            "delete".parse::<FeedbackAction>(),
            Err(FeedbackError::UnknownAction(_))
        ));
    }

    #[tokio::test]
    async fn exclude_then_restore() {
        let owner = Uuid::new_v4();
        let memory = item(OwnerType::User, owner);
        let id = memory.id;
        let service = service_with(memory).await;

        let excluded = service
            .apply_feedback(&user(owner), id, FeedbackAction::Exclude)
            .await
            .unwrap();
        assert_eq!(excluded.visibility_policy, VisibilityPolicy::ExcludeFromRag);

        let restored = service
            .apply_feedback(&user(owner), id, FeedbackAction::Restore)
            .await
            .unwrap();
        assert_eq!(restored.visibility_policy, VisibilityPolicy::Normal);
    }

    #[tokio::test]
    async fn lower_priority_is_idempotent_and_restore_strips_it() {
        let owner = Uuid::new_v4();
        let memory = item(OwnerType::User, owner);
        let id = memory.id;
        let service = service_with(memory).await;

        service
            .apply_feedback(&user(owner), id, FeedbackAction::LowerPriority)
            .await
            .unwrap();
        let twice = service
            .apply_feedback(&user(owner), id, FeedbackAction::LowerPriority)
            .await
            .unwrap();
        assert_eq!(
            twice.tags,
            vec!["lore".to_string(), DEPRIORITIZED_TAG.to_string()]
        );
        assert_eq!(twice.visibility_policy, VisibilityPolicy::Normal);

        let restored = service
            .apply_feedback(&user(owner), id, FeedbackAction::Restore)
            .await
            .unwrap();
        assert_eq!(restored.tags, vec!["lore".to_string()]);
    }

    #[tokio::test]
    async fn user_items_require_exact_owner() {
        let memory = item(OwnerType::User, Uuid::new_v4());
        let id = memory.id;
        let service = service_with(memory).await;

        let error = service
            .apply_feedback(&user(Uuid::new_v4()), id, FeedbackAction::Exclude)
            .await
            .unwrap_err();
        assert!(matches!(error, FeedbackError::Forbidden(found) if found == id));
    }

    #[tokio::test]
    async fn missing_item_is_not_found() {
        let service = MemoryFeedbackService::new(Arc::new(InMemoryKnowledgeStore::new()));
        let error = service
            .apply_feedback(&user(Uuid::new_v4()), Uuid::new_v4(), FeedbackAction::Restore)
            .await
            .unwrap_err();
        assert!(matches!(error, FeedbackError::NotFound(_)));
    }

    // Pins the current, looser rule for character-owned items: any user acting
    // in the character's context may modify them, including one who does not
    // own the character. Revisit if character ownership should be enforced.
    #[tokio::test]
    async fn character_items_accept_any_caller_in_that_character_context() {
        let character_id = Uuid::new_v4();
        let memory = item(OwnerType::Character, character_id);
        let id = memory.id;
        let service = service_with(memory).await;

        let stranger = FeedbackCaller {
            user_id: Uuid::new_v4(),
            character_id: Some(character_id),
        };
        let updated = service
            .apply_feedback(&stranger, id, FeedbackAction::Exclude)
            .await
            .unwrap();
        assert_eq!(updated.visibility_policy, VisibilityPolicy::ExcludeFromRag);

        let elsewhere = FeedbackCaller {
            user_id: stranger.user_id,
            character_id: Some(Uuid::new_v4()),
        };
        assert!(matches!(
            service
                .apply_feedback(&elsewhere, id, FeedbackAction::Restore)
                .await,
            Err(FeedbackError::Forbidden(_))
        ));
        assert!(matches!(
            service
                .apply_feedback(&user(stranger.user_id), id, FeedbackAction::Restore)
                .await,
            Err(FeedbackError::Forbidden(_))
        ));
    }

    /// Serves every `get_item` from a snapshot taken up front, the way a
    /// request that read the item before a concurrent update would see it.
    struct SnapshotReads {
        inner: Arc<InMemoryKnowledgeStore>,
        snapshot: MemoryItem,
    }

    #[async_trait]
    impl MemoryItemStore for SnapshotReads {
        async fn replace_for_source(
            &self,
            source_type: SourceType,
            source_id: Uuid,
            items: Vec<MemoryItem>,
        ) -> Result<usize, StoreError> {
            self.inner.replace_for_source(source_type, source_id, items).await
        }

        async fn list_for_source(
            &self,
            source_type: SourceType,
            source_id: Uuid,
        ) -> Result<Vec<MemoryItem>, StoreError> {
            self.inner.list_for_source(source_type, source_id).await
        }

        async fn count_for_source(
            &self,
            source_type: SourceType,
            source_id: Uuid,
        ) -> Result<usize, StoreError> {
            self.inner.count_for_source(source_type, source_id).await
        }

        async fn retag_source(
            &self,
            source_type: SourceType,
            source_id: Uuid,
            tags: &[String],
        ) -> Result<usize, StoreError> {
            self.inner.retag_source(source_type, source_id, tags).await
        }

        async fn get_item(&self, _id: Uuid) -> Result<Option<MemoryItem>, StoreError> {
            Ok(Some(self.snapshot.clone()))
        }

        async fn update_feedback(
            &self,
            id: Uuid,
            action: FeedbackAction,
        ) -> Result<MemoryItem, StoreError> {
            self.inner.update_feedback(id, action).await
        }
    }

    #[tokio::test]
    async fn lower_priority_read_before_an_exclude_keeps_the_exclusion() {
        let owner = Uuid::new_v4();
        let memory = item(OwnerType::User, owner);
        let id = memory.id;
        let store = Arc::new(InMemoryKnowledgeStore::new());
        store
            .replace_for_source(memory.source_type, memory.source_id, vec![memory.clone()])
            .await
            .unwrap();

        MemoryFeedbackService::new(store.clone())
            .apply_feedback(&user(owner), id, FeedbackAction::Exclude)
            .await
            .unwrap();

        let stale = MemoryFeedbackService::new(Arc::new(SnapshotReads {
            inner: store.clone(),
            snapshot: memory,
        }));
        let updated = stale
            .apply_feedback(&user(owner), id, FeedbackAction::LowerPriority)
            .await
            .unwrap();

        assert_eq!(updated.visibility_policy, VisibilityPolicy::ExcludeFromRag);
        assert!(updated.is_deprioritized());
    }

    #[test]
    fn restore_clears_both_exclusion_and_penalty() {
        let mut memory = item(OwnerType::User, Uuid::new_v4());
        FeedbackAction::Exclude.apply_to(&mut memory);
        FeedbackAction::LowerPriority.apply_to(&mut memory);
        assert_eq!(memory.visibility_policy, VisibilityPolicy::ExcludeFromRag);
        assert!(memory.is_deprioritized());

        FeedbackAction::Restore.apply_to(&mut memory);
        assert_eq!(memory.visibility_policy, VisibilityPolicy::Normal);
        assert_eq!(memory.tags, vec!["lore".to_string()]);
    }
}
