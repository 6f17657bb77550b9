use crate::config::RetrievalDefaults;
use crate::models::{MemoryItem, VisibilityPolicy};
use crate::rag_config::{EffectiveRagConfig, RagMode};
use serde::{Deserialize, Serialize};

/// Multiplier applied to the similarity of items flagged by `lower_priority`.
pub const DEPRIORITIZED_PENALTY: f32 = 0.8;

/// A similarity candidate returned by the vector store.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMemory {
    pub item: MemoryItem,
    pub similarity: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedMemory {
    pub item: MemoryItem,
    pub similarity: f32,
    /// Similarity after the deprioritization penalty; the sort key.
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalPlan {
    pub rag_mode: RagMode,
    pub top_k: usize,
    pub min_similarity_score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_filters: Option<Vec<String>>,
}

/// Turn an effective config into retrieval limits. Returns `None` when the
/// mode is `ignore`, meaning no retrieval should run at all.
pub fn plan_retrieval(
    effective: &EffectiveRagConfig,
    requested_top_k: Option<usize>,
    defaults: &RetrievalDefaults,
) -> Option<RetrievalPlan> {
    let max_top_k = defaults.max_top_k.max(1);
    let mut top_k = requested_top_k
        .unwrap_or(defaults.default_top_k)
        .clamp(1, max_top_k);

    match effective.rag_mode {
        RagMode::Ignore => return None,
        RagMode::Light => top_k = (top_k / 2).max(1),
        RagMode::Heavy => {}
    }

    Some(RetrievalPlan {
        rag_mode: effective.rag_mode,
        top_k,
        min_similarity_score: defaults.min_similarity_score,
        tag_filters: effective.tag_filters.clone(),
    })
}

fn matches_filters(item: &MemoryItem, filters: Option<&[String]>) -> bool {
    match filters {
        None => true,
        Some(filters) => item.tags.iter().any(|tag| filters.contains(tag)),
    }
}

/// Post-filter and rank candidates under `plan`.
///
/// Excluded items and items below the similarity floor are dropped, the tag
/// filter keeps items carrying at least one listed tag, and deprioritized
/// items are scored down rather than removed.
pub fn select_memories(plan: &RetrievalPlan, candidates: Vec<ScoredMemory>) -> Vec<RankedMemory> {
    let filters = plan.tag_filters.as_deref();

    let mut ranked: Vec<RankedMemory> = candidates
        .into_iter()
        .filter(|candidate| candidate.item.visibility_policy != VisibilityPolicy::ExcludeFromRag)
        .filter(|candidate| candidate.similarity >= plan.min_similarity_score)
        .filter(|candidate| matches_filters(&candidate.item, filters))
        .map(|candidate| {
            let score = if candidate.item.is_deprioritized() {
                candidate.similarity * DEPRIORITIZED_PENALTY
            } else {
                candidate.similarity
            };
            RankedMemory {
                item: candidate.item,
                similarity: candidate.similarity,
                score,
            }
        })
        .collect();

    ranked.sort_by(|left, right| right.score.total_cmp(&left.score));
    ranked.truncate(plan.top_k);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkMetadata, OwnerType, SourceType, DEPRIORITIZED_TAG};
    use chrono::Utc;
    use uuid::Uuid;

    fn candidate(content: &str, similarity: f32, tags: &[&str]) -> ScoredMemory {
        ScoredMemory {
            item: MemoryItem {
                id: Uuid::new_v4(),
                owner_type: OwnerType::User,
                owner_id: Uuid::nil(),
                source_type: SourceType::File,
                source_id: Uuid::nil(),
                content: content.to_string(),
                embedding: Vec::new(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                visibility_policy: VisibilityPolicy::Normal,
                metadata: ChunkMetadata {
                    chunk_index: 0,
                    start_offset: 0,
                    end_offset: content.chars().count(),
                    provider: "local".to_string(),
                    model: "char-trigram".to_string(),
                    dimensions: 0,
                },
                created_at: Utc::now(),
            },
            similarity,
        }
    }

    fn effective(mode: RagMode, tags: Option<&[&str]>) -> EffectiveRagConfig {
        EffectiveRagConfig {
            rag_mode: mode,
            tag_filters: tags.map(|tags| tags.iter().map(|t| t.to_string()).collect()),
        }
    }

    fn contents(ranked: &[RankedMemory]) -> Vec<&str> {
        ranked.iter().map(|r| r.item.content.as_str()).collect()
    }

    #[test]
    fn ignore_mode_skips_retrieval() {
        let defaults = RetrievalDefaults::default();
        assert!(plan_retrieval(&effective(RagMode::Ignore, None), None, &defaults).is_none());
    }

    #[test]
    fn top_k_is_clamped_and_halved_in_light_mode() {
        let defaults = RetrievalDefaults::default();

        let heavy = plan_retrieval(&effective(RagMode::Heavy, None), Some(100), &defaults).unwrap();
        assert_eq!(heavy.top_k, 20);

        let zero = plan_retrieval(&effective(RagMode::Heavy, None), Some(0), &defaults).unwrap();
        assert_eq!(zero.top_k, 1);

        let light = plan_retrieval(&effective(RagMode::Light, None), None, &defaults).unwrap();
        assert_eq!(light.top_k, 2);

        let tiny = plan_retrieval(&effective(RagMode::Light, None), Some(1), &defaults).unwrap();
        assert_eq!(tiny.top_k, 1);
    }

    #[test]
    fn excluded_and_weak_matches_are_dropped() {
        let plan = plan_retrieval(
            &effective(RagMode::Heavy, None),
            None,
            &RetrievalDefaults::default(),
        )
        .unwrap();

        let mut excluded = candidate("excluded", 0.9, &[]);
        excluded.item.visibility_policy = VisibilityPolicy::ExcludeFromRag;

        let ranked = select_memories(
            &plan,
            vec![excluded, candidate("weak", 0.1, &[]), candidate("good", 0.7, &[])],
        );
        assert_eq!(contents(&ranked), vec!["good"]);
    }

    #[test]
    fn tag_filters_keep_any_match() {
        let plan = plan_retrieval(
            &effective(RagMode::Heavy, Some(&["lore", "maps"])),
            None,
            &RetrievalDefaults::default(),
        )
        .unwrap();

        let ranked = select_memories(
            &plan,
            vec![
                candidate("lore", 0.9, &["lore"]),
                candidate("untagged", 0.95, &[]),
                candidate("map", 0.8, &["maps", "other"]),
                candidate("other", 0.85, &["other"]),
            ],
        );
        assert_eq!(contents(&ranked), vec!["lore", "map"]);
    }

    #[test]
    fn deprioritized_items_rank_lower_but_stay() {
        let plan = plan_retrieval(
            &effective(RagMode::Heavy, None),
            Some(2),
            &RetrievalDefaults::default(),
        )
        .unwrap();

        let ranked = select_memories(
            &plan,
            vec![
                candidate("flagged", 0.9, &[DEPRIORITIZED_TAG]),
                candidate("plain", 0.8, &[]),
                candidate("tail", 0.4, &[]),
            ],
        );
        assert_eq!(contents(&ranked), vec!["plain", "flagged"]);
        assert!((ranked[1].score - 0.72).abs() < 1e-6);
        assert_eq!(ranked[1].similarity, 0.9);
    }
}
