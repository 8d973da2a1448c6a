//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`GeminiEmbedder`]** — calls the Gemini `embedContent` API.
//! - **[`OpenAiEmbedder`]** — calls the OpenAI embeddings API.
//! - **[`FixedEmbedder`]** — deterministic offline vectors for tests and
//!   air-gapped development; no network.
//!
//! # Retry Strategy
//!
//! The network providers retry transient failures with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately, permanent
//! - Network errors and timeouts → retry
//! - Backoff: 1s, 2s, 4s (capped at 2^4)
//!
//! Every request carries an explicit timeout; an expired call is treated as
//! a transient failure so a stalled upstream cannot wedge the ingestion or
//! query pipeline.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::EngineError;

/// Maps text to a fixed-dimension vector.
///
/// The engine treats this as a pure function with latency and failure
/// modes. Implementations must report their dimension up front so the
/// index layer can fail fast on mixed-dimension data.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text. The merger calls this once per chunk (never
    /// per message) and the retriever once per query.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError>;

    /// The vector dimension every call returns.
    fn dims(&self) -> usize;
}

/// Instantiate the embedder named by the configuration.
pub fn create_embedder(config: &EmbeddingConfig) -> anyhow::Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "gemini" => Ok(Box::new(GeminiEmbedder::new(config)?)),
        "openai" => Ok(Box::new(OpenAiEmbedder::new(config)?)),
        "fixed" => Ok(Box::new(FixedEmbedder::new(config.dims.unwrap_or(32)))),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1).min(4))
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client, EngineError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| EngineError::embedding(e.to_string(), false))
}

// ============ Gemini ============

/// Embedding provider using the Gemini `embedContent` endpoint.
///
/// Requires the `GEMINI_API_KEY` environment variable.
pub struct GeminiEmbedder {
    model: String,
    dims: usize,
    base_url: String,
    api_key: String,
    max_retries: u32,
    timeout_secs: u64,
}

impl GeminiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Gemini provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Gemini provider"))?;
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| anyhow::anyhow!("GEMINI_API_KEY environment variable not set"))?;
        let base_url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string());

        Ok(Self {
            model,
            dims,
            base_url,
            api_key,
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl Embedder for GeminiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        let client = http_client(self.timeout_secs)?;
        let url = format!(
            "{}/models/{}:embedContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let body = serde_json::json!({
            "model": format!("models/{}", self.model),
            "content": { "parts": [{ "text": text }] },
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let resp = client.post(&url).json(&body).send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| EngineError::embedding(e.to_string(), true))?;
                        return parse_gemini_embedding(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(EngineError::embedding(
                            format!("Gemini API error {}: {}", status, body_text),
                            true,
                        ));
                        continue;
                    }

                    return Err(EngineError::embedding(
                        format!("Gemini API error {}: {}", status, body_text),
                        false,
                    ));
                }
                Err(e) => {
                    last_err = Some(EngineError::embedding(e.to_string(), true));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| EngineError::embedding("embedding failed after retries", true)))
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

fn parse_gemini_embedding(json: &serde_json::Value) -> Result<Vec<f32>, EngineError> {
    let values = json
        .get("embedding")
        .and_then(|e| e.get("values"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| {
            EngineError::embedding("Invalid Gemini response: missing embedding.values", false)
        })?;

    Ok(values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ OpenAI ============

/// Embedding provider using `POST /v1/embeddings`.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    base_url: String,
    api_key: String,
    max_retries: u32,
    timeout_secs: u64,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base_url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            model,
            dims,
            base_url,
            api_key,
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        let client = http_client(self.timeout_secs)?;
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let resp = client
                .post(format!("{}/embeddings", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| EngineError::embedding(e.to_string(), true))?;
                        return parse_openai_embedding(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(EngineError::embedding(
                            format!("OpenAI API error {}: {}", status, body_text),
                            true,
                        ));
                        continue;
                    }

                    return Err(EngineError::embedding(
                        format!("OpenAI API error {}: {}", status, body_text),
                        false,
                    ));
                }
                Err(e) => {
                    last_err = Some(EngineError::embedding(e.to_string(), true));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| EngineError::embedding("embedding failed after retries", true)))
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

fn parse_openai_embedding(json: &serde_json::Value) -> Result<Vec<f32>, EngineError> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            EngineError::embedding("Invalid OpenAI response: missing data[0].embedding", false)
        })?;

    Ok(embedding
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ Fixed (offline) ============

/// Deterministic embedder with no network dependency.
///
/// Derives a unit-length vector from a SHA-256 digest of the text, so the
/// same text always maps to the same point. Semantically meaningless, but
/// exercises the full buffer → merge → index → rerank pipeline in tests
/// and air-gapped setups.
pub struct FixedEmbedder {
    dims: usize,
}

impl FixedEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        let mut vector = Vec::with_capacity(self.dims);
        let mut counter: u32 = 0;

        while vector.len() < self.dims {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for pair in digest.chunks_exact(2) {
                if vector.len() == self.dims {
                    break;
                }
                let raw = u16::from_le_bytes([pair[0], pair[1]]);
                // Map to [-1, 1).
                vector.push(raw as f32 / 32768.0 - 1.0);
            }
            counter += 1;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }

        Ok(vector)
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_embedder_is_deterministic() {
        let embedder = FixedEmbedder::new(32);
        let a = embedder.embed("hello world").await.unwrap();
        let b = embedder.embed("hello world").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[tokio::test]
    async fn fixed_embedder_distinguishes_texts() {
        let embedder = FixedEmbedder::new(32);
        let a = embedder.embed("alpha").await.unwrap();
        let b = embedder.embed("beta").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn fixed_embedder_unit_norm() {
        let embedder = FixedEmbedder::new(64);
        let v = embedder.embed("normalize me").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn parse_gemini_shape() {
        let json = serde_json::json!({
            "embedding": { "values": [0.1, 0.2, 0.3] }
        });
        let v = parse_gemini_embedding(&json).unwrap();
        assert_eq!(v.len(), 3);
    }

    #[test]
    fn parse_openai_shape() {
        let json = serde_json::json!({
            "data": [{ "embedding": [0.5, -0.5] }]
        });
        let v = parse_openai_embedding(&json).unwrap();
        assert_eq!(v, vec![0.5, -0.5]);
    }

    #[test]
    fn parse_rejects_missing_fields() {
        assert!(parse_gemini_embedding(&serde_json::json!({})).is_err());
        assert!(parse_openai_embedding(&serde_json::json!({"data": []})).is_err());
    }
}
