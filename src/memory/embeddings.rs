//! Embedding providers for the knowledge index.
//!
//! Remote providers (OpenAI-compatible, Gemini) are used when an API key is
//! available; otherwise a deterministic local token-hash embedding keeps
//! vector search working offline. Every provider returns unit vectors of
//! the configured dimension.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::VectorConfig;

/// Error type for embedding operations.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("rate limited")]
    RateLimited,
}

impl From<reqwest::Error> for EmbeddingError {
    fn from(e: reqwest::Error) -> Self {
        EmbeddingError::Http(e.to_string())
    }
}

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Vector dimension this provider produces.
    fn dimension(&self) -> usize;

    /// Model identifier for stats and logs.
    fn model_name(&self) -> &str;

    /// Embed a batch of texts. Must return one unit vector per input.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut batch = self.embed_batch(&[text.to_string()]).await?;
        batch
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidResponse("empty batch result".to_string()))
    }
}

/// Scale a vector to unit length and force it to `dims` entries.
pub fn normalize_to(mut vector: Vec<f32>, dims: usize) -> Vec<f32> {
    vector.resize(dims, 0.0);
    let magnitude: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for x in &mut vector {
            *x /= magnitude;
        }
    }
    vector
}

/// Non-negative cosine similarity between two unit vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot.max(0.0)
}

// ---------------------------------------------------------------------------
// OpenAI-compatible remote provider
// ---------------------------------------------------------------------------

pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbeddings {
    pub fn new(api_key: impl Into<String>, model: &str, dims: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: if model.is_empty() {
                "text-embedding-3-small".to_string()
            } else {
                model.to_string()
            },
            dims,
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiDatum>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn dimension(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&OpenAiRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(EmbeddingError::AuthFailed);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EmbeddingError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Http(format!("status {status}: {body}")));
        }

        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
        if parsed.data.len() != texts.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} vectors, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        Ok(parsed
            .data
            .into_iter()
            .map(|d| normalize_to(d.embedding, self.dims))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Gemini remote provider
// ---------------------------------------------------------------------------

pub struct GeminiEmbeddings {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dims: usize,
}

impl GeminiEmbeddings {
    pub fn new(api_key: impl Into<String>, model: &str, dims: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: if model.is_empty() {
                "text-embedding-004".to_string()
            } else {
                model.to_string()
            },
            dims,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbeddings {
    fn dimension(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let requests: Vec<serde_json::Value> = texts
            .iter()
            .map(|text| {
                serde_json::json!({
                    "model": format!("models/{}", self.model),
                    "content": { "parts": [{ "text": text }] }
                })
            })
            .collect();

        let url = format!(
            "{}/models/{}:batchEmbedContents",
            self.base_url, self.model
        );
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&serde_json::json!({ "requests": requests }))
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(EmbeddingError::AuthFailed);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EmbeddingError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Http(format!("status {status}: {body}")));
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
        let embeddings = parsed
            .get("embeddings")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                EmbeddingError::InvalidResponse("missing 'embeddings' field".to_string())
            })?;

        let mut out = Vec::with_capacity(embeddings.len());
        for item in embeddings {
            let values = item
                .get("values")
                .and_then(|v| v.as_array())
                .ok_or_else(|| {
                    EmbeddingError::InvalidResponse("missing 'values' in embedding".to_string())
                })?;
            let vector: Vec<f32> = values
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            out.push(normalize_to(vector, self.dims));
        }
        if out.len() != texts.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} vectors, got {}",
                texts.len(),
                out.len()
            )));
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Local deterministic provider
// ---------------------------------------------------------------------------

/// Offline fallback: a token-hashed sparse vector. Identical text always
/// produces the identical unit vector, which is all hybrid search needs
/// from the vector leg when no API key is configured.
pub struct LocalEmbeddings {
    dims: usize,
}

impl LocalEmbeddings {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(16) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if token.len() < 2 {
                continue;
            }
            // FNV-1a over the token picks the bucket and the sign.
            let mut hash: u64 = 0xcbf29ce484222325;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(0x100000001b3);
            }
            let bucket = (hash % self.dims as u64) as usize;
            let sign = if hash & 0x8000_0000_0000_0000 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        normalize_to(vector, self.dims)
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbeddings {
    fn dimension(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        "local-token-hash"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ---------------------------------------------------------------------------
// Mock provider for tests
// ---------------------------------------------------------------------------

/// Deterministic provider that counts how many texts it was asked to embed,
/// so cache behaviour is observable in tests.
pub struct MockEmbeddings {
    inner: LocalEmbeddings,
    calls: AtomicUsize,
}

impl MockEmbeddings {
    pub fn new(dims: usize) -> Self {
        Self {
            inner: LocalEmbeddings::new(dims),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of texts embedded so far.
    pub fn embedded_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddings {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn model_name(&self) -> &str {
        "mock"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(texts.len(), Ordering::SeqCst);
        self.inner.embed_batch(texts).await
    }
}

// ---------------------------------------------------------------------------
// Provider selection
// ---------------------------------------------------------------------------

/// Pick a provider: explicit config first, then whichever API key is
/// present (OpenAI before Gemini), else local.
pub fn create_provider(config: &VectorConfig) -> Box<dyn EmbeddingProvider> {
    let openai_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());
    let gemini_key = std::env::var("GEMINI_API_KEY").ok().filter(|k| !k.is_empty());

    match config.provider.as_str() {
        "openai" => {
            if let Some(key) = openai_key {
                return Box::new(OpenAiEmbeddings::new(key, &config.model, config.dims));
            }
            tracing::warn!("openai embeddings requested but OPENAI_API_KEY unset; using local");
        }
        "gemini" => {
            if let Some(key) = gemini_key {
                return Box::new(GeminiEmbeddings::new(key, &config.model, config.dims));
            }
            tracing::warn!("gemini embeddings requested but GEMINI_API_KEY unset; using local");
        }
        "local" => return Box::new(LocalEmbeddings::new(config.dims)),
        "" => {
            if let Some(key) = openai_key {
                return Box::new(OpenAiEmbeddings::new(key, &config.model, config.dims));
            }
            if let Some(key) = gemini_key {
                return Box::new(GeminiEmbeddings::new(key, &config.model, config.dims));
            }
        }
        other => {
            tracing::warn!("unknown embedding provider '{}'; using local", other);
        }
    }
    Box::new(LocalEmbeddings::new(config.dims))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_embeddings_are_unit_and_deterministic() {
        let provider = LocalEmbeddings::new(128);

        let a = provider.embed("the quick brown fox").await.unwrap();
        let b = provider.embed("the quick brown fox").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 128);

        let magnitude: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_local_embeddings_differ_by_text() {
        let provider = LocalEmbeddings::new(64);
        let a = provider.embed("database migrations").await.unwrap();
        let b = provider.embed("birthday party planning").await.unwrap();
        assert_ne!(a, b);
        // Related text scores above unrelated text.
        let related = provider.embed("database migration plan").await.unwrap();
        assert!(cosine(&a, &related) > cosine(&a, &b));
    }

    #[tokio::test]
    async fn test_empty_text_is_zero_vector() {
        let provider = LocalEmbeddings::new(32);
        let v = provider.embed("").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_normalize_resizes_and_scales() {
        let v = normalize_to(vec![3.0, 4.0], 4);
        assert_eq!(v.len(), 4);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(v[2], 0.0);
    }

    #[test]
    fn test_cosine_clamps_negative() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert_eq!(cosine(&a, &b), 0.0);
        assert_eq!(cosine(&a, &a), 1.0);
    }

    #[tokio::test]
    async fn test_mock_counts_embeddings() {
        let provider = MockEmbeddings::new(16);
        provider
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        provider.embed("c").await.unwrap();
        assert_eq!(provider.embedded_count(), 3);
    }
}
