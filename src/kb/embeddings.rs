//! Embedding providers for lexrag
//! Capability contract `embed_batch(texts) -> vectors` with a deterministic
//! local provider and an OpenAI-compatible HTTP provider. Query-time embedding
//! must use the same configuration as ingest; the registry enforces that.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("Unknown embedding provider: {0}")]
    UnknownProvider(String),
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Embedding model mismatch: provider serves {expected}, requested {requested}")]
    ModelMismatch { expected: String, requested: String },
    #[error("Provider request failed: {0}")]
    Request(String),
    #[error("Provider returned malformed response: {0}")]
    MalformedResponse(String),
}

/// Capability contract for embedding backends. Truncation and pooling live
/// behind this seam; callers only see fixed-dimension vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name recorded in snapshots (e.g. "hash", "openai")
    fn name(&self) -> &str;

    /// Model identifier recorded in snapshots
    fn model(&self) -> &str;

    /// Output vector dimension
    fn dim(&self) -> usize;

    /// Embed a batch of texts, one unit-normalized vector per input
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Normalize an embedding to unit length
pub fn normalize_embedding(embedding: &[f32]) -> Vec<f32> {
    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        embedding.iter().map(|x| x / norm).collect()
    } else {
        embedding.to_vec()
    }
}

/// Cosine similarity between two embeddings
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a > 0.0 && norm_b > 0.0 {
        dot / (norm_a * norm_b)
    } else {
        0.0
    }
}

// ── Deterministic hash provider ───────────────────────────────────────────────

/// Deterministic local embedder: tokens are hashed into dimension buckets.
/// No semantics, but stable across runs, which makes ingest and retrieval
/// replayable in tests and offline deployments.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % self.dim;
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        normalize_embedding(&vector)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn name(&self) -> &str {
        "hash"
    }

    fn model(&self) -> &str {
        "hash-v1"
    }

    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ── OpenAI-compatible HTTP provider ───────────────────────────────────────────

#[derive(Debug, Serialize)]
struct EmbeddingApiRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingApiItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiItem {
    embedding: Vec<f32>,
}

/// HTTP embedder against an OpenAI-compatible `/v1/embeddings` endpoint
/// (hosted APIs, local servers such as Ollama's compat layer, vLLM).
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    provider_name: String,
    model: String,
    dim: usize,
}

impl HttpEmbedder {
    pub fn new(
        provider_name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        dim: usize,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(4)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            provider_name: provider_name.into(),
            model: model.into(),
            dim,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let url = format!("{}/v1/embeddings", self.base_url);
        let mut request = self.client.post(&url).json(&EmbeddingApiRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EmbeddingError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EmbeddingError::Request(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        let body: EmbeddingApiResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::MalformedResponse(e.to_string()))?;
        if body.data.len() != texts.len() {
            return Err(EmbeddingError::MalformedResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                body.data.len()
            )));
        }

        let mut out = Vec::with_capacity(body.data.len());
        for item in body.data {
            if item.embedding.len() != self.dim {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.dim,
                    actual: item.embedding.len(),
                });
            }
            out.push(normalize_embedding(&item.embedding));
        }
        Ok(out)
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Resolves `(provider, model, dim)` triples from KB configuration or
/// `ChatContext` overrides to concrete providers. The `hash` provider is
/// always available; HTTP providers must be registered explicitly.
#[derive(Default)]
pub struct EmbeddingRegistry {
    providers: HashMap<String, Arc<dyn EmbeddingProvider>>,
}

impl EmbeddingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn EmbeddingProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Resolve a provider and verify the requested configuration matches it.
    /// A dimension or model mismatch is an explicit error, never a silent
    /// re-embed under a different configuration.
    pub fn resolve(
        &self,
        provider: &str,
        model: &str,
        dim: usize,
    ) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
        if provider == "hash" {
            let embedder = HashEmbedder::new(dim);
            if embedder.model() != model {
                return Err(EmbeddingError::ModelMismatch {
                    expected: embedder.model().to_string(),
                    requested: model.to_string(),
                });
            }
            return Ok(Arc::new(embedder));
        }
        let found = self
            .providers
            .get(provider)
            .ok_or_else(|| EmbeddingError::UnknownProvider(provider.to_string()))?;
        if found.dim() != dim {
            return Err(EmbeddingError::DimensionMismatch {
                expected: found.dim(),
                actual: dim,
            });
        }
        if found.model() != model {
            return Err(EmbeddingError::ModelMismatch {
                expected: found.model().to_string(),
                requested: model.to_string(),
            });
        }
        Ok(Arc::clone(found))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(64);
        let texts = vec!["rental rules".to_string(), "eviction notice".to_string()];
        let a = embedder.embed_batch(&texts).await.unwrap();
        let b = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].len(), 64);
    }

    #[tokio::test]
    async fn test_hash_embedder_similarity_ordering() {
        let embedder = HashEmbedder::new(128);
        let texts = vec![
            "the landlord may not increase the rent".to_string(),
            "rent increase by the landlord".to_string(),
            "maritime cargo insurance claims".to_string(),
        ];
        let vecs = embedder.embed_batch(&texts).await.unwrap();
        let close = cosine_similarity(&vecs[0], &vecs[1]);
        let far = cosine_similarity(&vecs[0], &vecs[2]);
        assert!(close > far, "shared tokens must score higher");
    }

    #[test]
    fn test_normalize_embedding() {
        let normalized = normalize_embedding(&[3.0, 4.0]);
        assert!((normalized[0] - 0.6).abs() < 0.001);
        assert!((normalized[1] - 0.8).abs() < 0.001);
        let length: f32 = normalized.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((length - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0];
        assert!((cosine_similarity(&a, &[1.0, 0.0]) - 1.0).abs() < 0.001);
        assert!(cosine_similarity(&a, &[0.0, 1.0]).abs() < 0.001);
        assert!((cosine_similarity(&a, &[-1.0, 0.0]) + 1.0).abs() < 0.001);
        assert_eq!(cosine_similarity(&a, &[1.0, 0.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_registry_resolves_hash_with_any_dim() {
        let registry = EmbeddingRegistry::new();
        let provider = registry.resolve("hash", "hash-v1", 32).unwrap();
        assert_eq!(provider.dim(), 32);
        let vecs = provider.embed_batch(&["abc".to_string()]).await.unwrap();
        assert_eq!(vecs[0].len(), 32);
    }

    #[test]
    fn test_registry_rejects_unknown_and_mismatched() {
        let mut registry = EmbeddingRegistry::new();
        assert!(matches!(
            registry.resolve("openai", "text-embedding-3-small", 1536),
            Err(EmbeddingError::UnknownProvider(_))
        ));

        registry.register(Arc::new(HttpEmbedder::new(
            "openai",
            "https://api.openai.com",
            None,
            "text-embedding-3-small",
            1536,
        )));
        assert!(registry
            .resolve("openai", "text-embedding-3-small", 1536)
            .is_ok());
        assert!(matches!(
            registry.resolve("openai", "text-embedding-3-small", 768),
            Err(EmbeddingError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            registry.resolve("openai", "text-embedding-3-large", 1536),
            Err(EmbeddingError::ModelMismatch { .. })
        ));
    }

    #[test]
    fn test_registry_rejects_hash_model_mismatch() {
        let registry = EmbeddingRegistry::new();
        // The hash provider serves exactly one model; requesting another is a
        // configuration error, not a silent substitution
        assert!(matches!(
            registry.resolve("hash", "text-embedding-3-small", 64),
            Err(EmbeddingError::ModelMismatch { .. })
        ));
    }
}
