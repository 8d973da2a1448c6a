//! Answer generation boundary.
//!
//! The retriever hands this layer an ordered list of chunk transcripts and
//! the original question; everything past that point — prompt assembly,
//! the generation call, the final wording — is the answerer's concern, and
//! its output is treated as an opaque string.
//!
//! Providers mirror the embedding layer: Gemini, an OpenAI-compatible
//! endpoint, and an offline `echo` implementation for tests. Network
//! providers use the same timeout + exponential-backoff policy as
//! [`crate::embedding`].

use async_trait::async_trait;
use std::time::Duration;

use crate::config::{AnswererConfig, RetrievalConfig};
use crate::embedding::Embedder;
use crate::error::EngineError;
use crate::retrieve::{retrieve, RetrievalRequest};
use crate::store::ChunkStore;

/// Reply used when a tenant has no indexed chunks yet. A successful empty
/// result, not an error.
pub const NOTHING_INDEXED_REPLY: &str =
    "No relevant messages have been indexed for this community yet.";

/// Short user-facing reply for transient answerer failures; internal
/// detail stays in the logs.
pub const TRY_AGAIN_REPLY: &str =
    "Sorry, I couldn't generate an answer right now. Please try again in a moment.";

/// Generates a natural-language answer from a fully assembled prompt.
#[async_trait]
pub trait Answerer: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, EngineError>;
}

/// Instantiate the answerer named by the configuration.
pub fn create_answerer(config: &AnswererConfig) -> anyhow::Result<Box<dyn Answerer>> {
    match config.provider.as_str() {
        "gemini" => Ok(Box::new(GeminiAnswerer::new(config)?)),
        "openai" => Ok(Box::new(OpenAiAnswerer::new(config)?)),
        "echo" => Ok(Box::new(EchoAnswerer)),
        other => anyhow::bail!("Unknown answerer provider: {}", other),
    }
}

/// Assemble the generation prompt from retrieved transcripts.
pub fn build_prompt(question: &str, contexts: &[String]) -> String {
    let context = if contexts.is_empty() {
        "No similar messages were found for this community.".to_string()
    } else {
        contexts.join("\n")
    };

    format!(
        "Based on past messages from this community, here is a response:\n\n{}\n\nUser query: {}",
        context, question
    )
}

/// The query entry point: retrieve context for the question and compose
/// it with the answerer.
///
/// An empty index short-circuits to [`NOTHING_INDEXED_REPLY`] without
/// calling the embedder or the answerer. Answerer failures propagate as
/// [`EngineError::AnswererFailure`]; boundaries render those as
/// [`TRY_AGAIN_REPLY`].
pub async fn ask(
    store: &dyn ChunkStore,
    embedder: &dyn Embedder,
    answerer: &dyn Answerer,
    retrieval: &RetrievalConfig,
    tenant_id: i64,
    question: &str,
) -> Result<String, EngineError> {
    let req = RetrievalRequest {
        tenant_id,
        query: question,
        top_k: retrieval.top_k,
        rerank: retrieval.rerank,
    };
    let retrieved = retrieve(store, embedder, &req).await?;

    if retrieved.is_empty() {
        return Ok(NOTHING_INDEXED_REPLY.to_string());
    }

    let contexts: Vec<String> = retrieved.into_iter().map(|c| c.text).collect();
    let prompt = build_prompt(question, &contexts);
    answerer.generate(&prompt).await
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1).min(4))
}

// ============ Gemini ============

/// Answer generation via the Gemini `generateContent` endpoint.
///
/// Requires the `GEMINI_API_KEY` environment variable.
pub struct GeminiAnswerer {
    model: String,
    base_url: String,
    api_key: String,
    max_retries: u32,
    timeout_secs: u64,
}

impl GeminiAnswerer {
    pub fn new(config: &AnswererConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("answerer.model required for Gemini provider"))?;
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| anyhow::anyhow!("GEMINI_API_KEY environment variable not set"))?;
        let base_url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string());

        Ok(Self {
            model,
            base_url,
            api_key,
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl Answerer for GeminiAnswerer {
    async fn generate(&self, prompt: &str) -> Result<String, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| EngineError::answerer(e.to_string(), false))?;

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
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
                            .map_err(|e| EngineError::answerer(e.to_string(), true))?;
                        return parse_gemini_answer(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(EngineError::answerer(
                            format!("Gemini API error {}: {}", status, body_text),
                            true,
                        ));
                        continue;
                    }

                    return Err(EngineError::answerer(
                        format!("Gemini API error {}: {}", status, body_text),
                        false,
                    ));
                }
                Err(e) => {
                    last_err = Some(EngineError::answerer(e.to_string(), true));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| EngineError::answerer("generation failed after retries", true)))
    }
}

fn parse_gemini_answer(json: &serde_json::Value) -> Result<String, EngineError> {
    json.get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.pointer("/content/parts/0/text"))
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            EngineError::answerer("Invalid Gemini response: missing candidate text", false)
        })
}

// ============ OpenAI-compatible ============

/// Answer generation via `POST /v1/chat/completions`.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiAnswerer {
    model: String,
    base_url: String,
    api_key: String,
    max_retries: u32,
    timeout_secs: u64,
}

impl OpenAiAnswerer {
    pub fn new(config: &AnswererConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("answerer.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base_url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            model,
            base_url,
            api_key,
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl Answerer for OpenAiAnswerer {
    async fn generate(&self, prompt: &str) -> Result<String, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| EngineError::answerer(e.to_string(), false))?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let resp = client
                .post(format!("{}/chat/completions", self.base_url))
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
                            .map_err(|e| EngineError::answerer(e.to_string(), true))?;
                        return parse_openai_answer(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(EngineError::answerer(
                            format!("OpenAI API error {}: {}", status, body_text),
                            true,
                        ));
                        continue;
                    }

                    return Err(EngineError::answerer(
                        format!("OpenAI API error {}: {}", status, body_text),
                        false,
                    ));
                }
                Err(e) => {
                    last_err = Some(EngineError::answerer(e.to_string(), true));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| EngineError::answerer("generation failed after retries", true)))
    }
}

fn parse_openai_answer(json: &serde_json::Value) -> Result<String, EngineError> {
    json.pointer("/choices/0/message/content")
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            EngineError::answerer(
                "Invalid OpenAI response: missing choices[0].message.content",
                false,
            )
        })
}

// ============ Echo (offline) ============

/// Offline answerer that returns the prompt it was given. Lets tests and
/// air-gapped setups verify what context actually reached the generation
/// boundary.
pub struct EchoAnswerer;

#[async_trait]
impl Answerer for EchoAnswerer {
    async fn generate(&self, prompt: &str) -> Result<String, EngineError> {
        Ok(prompt.to_string())
    }
}
