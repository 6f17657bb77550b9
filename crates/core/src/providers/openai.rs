use super::{base_url, check_status};
use crate::config::EmbeddingConfig;
use crate::embeddings::EmbeddingProvider;
use crate::error::EmbeddingError;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::json;
use url::Url;

const PROVIDER: &str = "openai-compatible";

/// Any server exposing the OpenAI `/embeddings` and `/models` routes.
pub struct OpenAiCompatibleProvider {
    client: Client,
    endpoint: Url,
    model: String,
    dimensions: usize,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        Ok(Self {
            client: Client::builder().timeout(config.request_timeout()).build()?,
            endpoint: base_url(&config.base_url)?,
            model: config.model.clone(),
            dimensions: config.dimensions,
            api_key: config.api_key.clone(),
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatibleProvider {
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
            .authorize(self.client.get(self.endpoint.join("models")?))
            .send()
            .await
            .map_err(|error| EmbeddingError::Unavailable(error.to_string()))?;
        check_status(PROVIDER, response).await?;
        Ok(())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let request = self
            .client
            .post(self.endpoint.join("embeddings")?)
            .json(&json!({
                "model": self.model,
                "input": text,
                "dimensions": self.dimensions,
            }));

        let response = self.authorize(request).send().await?;
        let body: EmbeddingResponse = check_status(PROVIDER, response).await?.json().await?;

        body.data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or_else(|| EmbeddingError::MalformedResponse {
                provider: PROVIDER.to_string(),
                details: "response carried no embedding data".to_string(),
            })
    }
}
