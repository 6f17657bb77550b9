use crate::config::IndexingConfig;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self, ConfigError> {
        if chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "chunk_size",
                details: "must be greater than zero".to_string(),
            });
        }
        if chunk_overlap >= chunk_size {
            return Err(ConfigError::Invalid {
                field: "chunk_overlap",
                details: format!(
                    "overlap {chunk_overlap} must be smaller than chunk size {chunk_size}"
                ),
            });
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }
}

impl TryFrom<&IndexingConfig> for ChunkingConfig {
    type Error = ConfigError;

    fn try_from(value: &IndexingConfig) -> Result<Self, Self::Error> {
        Self::new(value.chunk_size, value.chunk_overlap)
    }
}

/// A window of the source text. `start` and `end` are character (not byte)
/// offsets into the original document, end exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// Split `text` into ordered, overlapping windows of at most `chunk_size`
/// characters.
///
/// Each window after the first starts exactly `chunk_overlap` characters before
/// the previous one ended, so the windows cover the whole document without
/// gaps. Inside the second half of a window the split point moves back to the
/// nearest paragraph break, line break or whitespace, in that order of
/// preference. Text that is empty or only whitespace yields no chunks.
pub fn split_text(text: &str, config: ChunkingConfig) -> Vec<TextChunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let hard_end = start.saturating_add(config.chunk_size).min(chars.len());
        let end = if hard_end == chars.len() {
            hard_end
        } else {
            let earliest = (start + config.chunk_overlap + 1).max(start + config.chunk_size / 2);
            find_break(&chars, earliest, hard_end).unwrap_or(hard_end)
        };

        chunks.push(TextChunk {
            index: chunks.len(),
            start,
            end,
            text: chars[start..end].iter().collect(),
        });

        if end == chars.len() {
            break;
        }
        start = end - config.chunk_overlap;
    }

    chunks
}

/// Latest split position in `earliest..=latest` that follows a natural break.
fn find_break(chars: &[char], earliest: usize, latest: usize) -> Option<usize> {
    if earliest > latest {
        return None;
    }

    let candidates = || (earliest..=latest).rev();

    candidates()
        .find(|&pos| pos >= 2 && chars[pos - 1] == '\n' && chars[pos - 2] == '\n')
        .or_else(|| candidates().find(|&pos| pos >= 1 && chars[pos - 1] == '\n'))
        .or_else(|| candidates().find(|&pos| pos >= 1 && chars[pos - 1].is_whitespace()))
}
