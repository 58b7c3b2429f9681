//! Embedding provider boundary.
//!
//! [`Embedder`] wraps one external call: text in, fixed-length vector out.
//! The HTTP implementation targets an OpenAI-compatible `/embeddings`
//! endpoint with retry and exponential backoff for transient failures.
//!
//! Also provides vector utilities:
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`vec_to_blob`] — encode a `Vec<f32>` as little-endian bytes for BLOB storage
//! - [`blob_to_vec`] — decode a stored BLOB back into a `Vec<f32>`
//!
//! # Retry strategy
//!
//! - HTTP 429 and 5xx → retry with backoff (1s, 2s, 4s, ...)
//! - Other 4xx → permanent failure, no retry
//! - Network errors and timeouts → retry
//! - Empty input → rejected before any network call

use std::time::Duration;

use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// An embedding backend: text in, one fixed-length vector out.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Output vector dimensionality.
    fn dims(&self) -> usize;

    /// Embed a single text. Inputs longer than the provider's accepted
    /// length are truncated from the end (leading context is preserved)
    /// before the call; truncation is deterministic.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Embed several texts, one vector per text, preserving input order.
///
/// Calls are issued independently; there is no implicit batching, so a
/// failure on any text fails the whole operation.
pub async fn embed_all(embedder: &dyn Embedder, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let mut vectors = Vec::with_capacity(texts.len());
    for text in texts {
        vectors.push(embedder.embed(text).await?);
    }
    Ok(vectors)
}

/// Instantiate the embedder matching the configuration.
///
/// | Config value | Implementation |
/// |--------------|----------------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"openai"` | [`HttpEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledEmbedder)),
        "openai" => Ok(Box::new(HttpEmbedder::new(config)?)),
        other => Err(Error::Validation(format!(
            "unknown embedding provider: {other}"
        ))),
    }
}

/// No-op embedder used when embeddings are not configured. Any embed call
/// fails, which surfaces as a clear configuration error instead of a
/// silent empty knowledge base.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(Error::Validation(
            "embedding provider is disabled; set [embedding] provider in config".into(),
        ))
    }
}

/// Embedder calling an OpenAI-compatible embeddings API.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dims: usize,
    max_input_chars: usize,
    max_retries: u32,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::Validation("embedding.model required".into()))?;
        let dims = config
            .dims
            .ok_or_else(|| Error::Validation("embedding.dims required".into()))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::Validation("OPENAI_API_KEY environment variable not set".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::PermanentProvider(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            model,
            dims,
            max_input_chars: config.max_input_chars,
            max_retries: config.max_retries,
        })
    }

    async fn call_once(&self, input: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": input,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::TransientProvider(format!(
                "embeddings API error {status}: {text}"
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::PermanentProvider(format!(
                "embeddings API error {status}: {text}"
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::PermanentProvider(format!("invalid embeddings response: {e}")))?;
        parse_embedding_response(&json)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(Error::Validation("cannot embed empty input".into()));
        }

        let input = truncate_input(text, self.max_input_chars);

        let mut last_err = None;
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.call_once(&input).await {
                Ok(vector) => {
                    if vector.len() != self.dims {
                        return Err(Error::PermanentProvider(format!(
                            "embedding dimensionality mismatch: expected {}, got {}",
                            self.dims,
                            vector.len()
                        )));
                    }
                    return Ok(vector);
                }
                Err(e) if e.is_retryable() => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::TransientProvider("embedding failed after retries".into())))
    }
}

/// Truncate to at most `max_chars` characters, always dropping the tail.
pub fn truncate_input(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<f32>> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|arr| arr.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            Error::PermanentProvider("invalid embeddings response: missing data[0].embedding".into())
        })?;

    Ok(embedding
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ Vector utilities ============

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two vectors, in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_mismatched_or_empty() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn truncation_keeps_leading_context() {
        let text = "abcdefghij";
        assert_eq!(truncate_input(text, 4), "abcd");
        assert_eq!(truncate_input(text, 20), text);
        // Deterministic: same input, same output.
        assert_eq!(truncate_input(text, 4), truncate_input(text, 4));
    }

    #[test]
    fn truncation_counts_chars_not_bytes() {
        let text = "äöüß";
        assert_eq!(truncate_input(text, 2), "äö");
    }

    #[test]
    fn parse_response_extracts_first_vector() {
        let json = serde_json::json!({
            "data": [{"embedding": [0.25, -0.5, 1.0]}]
        });
        assert_eq!(
            parse_embedding_response(&json).unwrap(),
            vec![0.25f32, -0.5, 1.0]
        );
    }

    #[test]
    fn parse_response_rejects_missing_data() {
        let json = serde_json::json!({"object": "list"});
        assert!(parse_embedding_response(&json).is_err());
    }
}
