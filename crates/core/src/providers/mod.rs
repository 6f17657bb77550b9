mod ollama;
mod openai;

pub use ollama::OllamaProvider;
pub use openai::OpenAiCompatibleProvider;

use crate::error::EmbeddingError;
use reqwest::Response;
use url::Url;

/// Parse a provider base URL so that relative joins append to its path.
pub(crate) fn base_url(raw: &str) -> Result<Url, EmbeddingError> {
    let trimmed = raw.trim();
    if trimmed.ends_with('/') {
        Ok(Url::parse(trimmed)?)
    } else {
        Ok(Url::parse(&format!("{trimmed}/"))?)
    }
}

/// Map non-success statuses onto retryable (5xx) and final (4xx) errors.
pub(crate) async fn check_status(
    provider: &str,
    response: Response,
) -> Result<Response, EmbeddingError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let details: String = body.chars().take(200).collect();

    if status.is_client_error() {
        Err(EmbeddingError::ClientStatus {
            provider: provider.to_string(),
            status: status.as_u16(),
            details,
        })
    } else {
        Err(EmbeddingError::ServerStatus {
            provider: provider.to_string(),
            status: status.as_u16(),
            details,
        })
    }
}
