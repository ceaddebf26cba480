//! [`EmbeddingClient`] – OpenAI-compatible `/embeddings` client behind the
//! memory crate's [`Embedder`] seam.
//!
//! Embeddings are best-effort everywhere they are used (semantic recall,
//! skill matching): a transport failure or unexpected shape logs a warning
//! and returns `None`, downgrading that lookup to keyword matching instead
//! of failing the loop.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use cua_memory::Embedder;
use cua_types::Settings;

#[derive(Deserialize)]
struct EmbeddingsResponse {
    #[serde(default)]
    data: Vec<EmbeddingRecord>,
}

#[derive(Deserialize)]
struct EmbeddingRecord {
    embedding: Vec<f32>,
}

/// HTTP embeddings client. Construct with [`EmbeddingClient::from_settings`];
/// `None` when embeddings are disabled or no credentials are configured.
pub struct EmbeddingClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl EmbeddingClient {
    /// Connection + request deadline for embedding calls.
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn from_settings(settings: &Settings) -> Option<Self> {
        if !settings.enable_embeddings {
            return None;
        }
        let Some(api_key) = settings.embedding_api_key.clone() else {
            info!("embeddings disabled: no EMBEDDING_API_KEY/OPENAI_API_KEY configured");
            return None;
        };
        let http = reqwest::ClientBuilder::new()
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Self::REQUEST_TIMEOUT)
            .build()
            .ok()?;
        Some(Self {
            http,
            base_url: settings.embedding_base_url.clone(),
            api_key,
            model: settings.embedding_model.clone(),
        })
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let body = json!({"model": self.model, "input": text});

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await;

        let parsed: EmbeddingsResponse = match response {
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => match resp.json().await {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        warn!(error = %err, "embedding response was not parseable");
                        return None;
                    }
                },
                Err(err) => {
                    warn!(error = %err, "embedding request was rejected");
                    return None;
                }
            },
            Err(err) => {
                warn!(error = %err, "embedding request failed; continuing without vector search");
                return None;
            }
        };

        let vector = parsed.data.into_iter().next()?.embedding;
        (!vector.is_empty()).then_some(vector)
    }
}
