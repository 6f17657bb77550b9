//! Resolution of the retrieval policy for one chat turn.
//!
//! Settings can come from four places: the request itself, the conversation,
//! the character and the global configuration. [`compute_effective_rag_config`]
//! merges them into one [`EffectiveRagConfig`].
//!
//! Mode precedence is request > conversation > character > global, falling
//! back to `heavy`. Tag filter precedence is request > conversation > global.
//! A source whose value is unusable (unknown mode, or a tag list that is empty
//! after trimming) counts as not set, so a client that sends `[]` as a default
//! does not silently switch retrieval filtering off for everyone below it.

use crate::models::normalize_tags;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum RagMode {
    #[default]
    Heavy,
    Light,
    Ignore,
}

impl RagMode {
    /// Exact, case-sensitive match on `heavy`, `light` or `ignore`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "heavy" => Some(RagMode::Heavy),
            "light" => Some(RagMode::Light),
            "ignore" => Some(RagMode::Ignore),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RagMode::Heavy => "heavy",
            RagMode::Light => "light",
            RagMode::Ignore => "ignore",
        }
    }
}

impl fmt::Display for RagMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overrides attached to a single request or to a conversation. Values are
/// kept raw so that unknown modes can be skipped instead of rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RagOverrides {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub tag_filters: Option<Vec<String>>,
}

impl RagOverrides {
    /// `enabled: false` reads as mode `ignore` at this scope.
    fn resolved_mode(&self) -> Option<RagMode> {
        if self.enabled == Some(false) {
            return Some(RagMode::Ignore);
        }
        self.mode.as_deref().and_then(RagMode::parse)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CharacterRagSettings {
    #[serde(default)]
    pub rag_mode: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlobalRagSettings {
    #[serde(default)]
    pub rag_mode: Option<String>,
    #[serde(default)]
    pub tag_filters: Option<Vec<String>>,
}

impl From<&crate::config::RetrievalDefaults> for GlobalRagSettings {
    fn from(value: &crate::config::RetrievalDefaults) -> Self {
        Self {
            rag_mode: Some(value.rag_mode.as_str().to_string()),
            tag_filters: Some(value.tag_filters.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RagConfigSources<'a> {
    pub request: Option<&'a RagOverrides>,
    pub conversation: Option<&'a RagOverrides>,
    pub character: Option<&'a CharacterRagSettings>,
    pub global: Option<&'a GlobalRagSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveRagConfig {
    pub rag_mode: RagMode,
    /// `None` means no tag restriction. Never `Some(vec![])`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_filters: Option<Vec<String>>,
}

fn usable_tags(tags: Option<&Vec<String>>) -> Option<Vec<String>> {
    let normalized = normalize_tags(tags?.iter());
    (!normalized.is_empty()).then_some(normalized)
}

pub fn compute_effective_rag_config(sources: &RagConfigSources<'_>) -> EffectiveRagConfig {
    let rag_mode = sources
        .request
        .and_then(RagOverrides::resolved_mode)
        .or_else(|| sources.conversation.and_then(RagOverrides::resolved_mode))
        .or_else(|| {
            sources
                .character
                .and_then(|character| character.rag_mode.as_deref())
                .and_then(RagMode::parse)
        })
        .or_else(|| {
            sources
                .global
                .and_then(|global| global.rag_mode.as_deref())
                .and_then(RagMode::parse)
        })
        .unwrap_or_default();

    let tag_filters = usable_tags(sources.request.and_then(|r| r.tag_filters.as_ref()))
        .or_else(|| usable_tags(sources.conversation.and_then(|c| c.tag_filters.as_ref())))
        .or_else(|| usable_tags(sources.global.and_then(|g| g.tag_filters.as_ref())));

    EffectiveRagConfig {
        rag_mode,
        tag_filters,
    }
}
