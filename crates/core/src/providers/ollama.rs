use super::{base_url, check_status};
use crate::config::EmbeddingConfig;
use crate::embeddings::EmbeddingProvider;
use crate::error::EmbeddingError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use url::Url;

const PROVIDER: &str = "ollama";

pub struct OllamaProvider {
    client: Client,
    endpoint: Url,
    model: String,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        Ok(Self {
            client: Client::builder().timeout(config.request_timeout()).build()?,
            endpoint: base_url(&config.base_url)?,
            model: config.model.clone(),
            dimensions: config.dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn probe(&self) -> Result<(), EmbeddingError> {
        let response = self
            .client
            .get(self.endpoint.join("api/tags")?)
            .send()
            .await
            .map_err(|error| EmbeddingError::Unavailable(error.to_string()))?;
        check_status(PROVIDER, response).await?;
        Ok(())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let response = self
            .client
            .post(self.endpoint.join("api/embeddings")?)
            .json(&json!({
                "model": self.model,
                "prompt": text,
            }))
            .send()
            .await?;

        let body: OllamaEmbeddingResponse = check_status(PROVIDER, response).await?.json().await?;
        if body.embedding.is_empty() {
            return Err(EmbeddingError::MalformedResponse {
                provider: PROVIDER.to_string(),
                details: "response carried no embedding".to_string(),
            });
        }
        Ok(body.embedding)
    }
}
