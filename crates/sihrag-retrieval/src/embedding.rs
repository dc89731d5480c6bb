//! The embedding capability: text in, fixed-length vector out.
//!
//! [`HttpEmbedder`] talks to an OpenAI-compatible `/embeddings` endpoint
//! serving the multilingual sentence-transformer model. [`HashEmbedder`] is
//! a deterministic offline stand-in for tests and air-gapped runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sihrag_core::{EmbeddingConfig, SihragError};

use crate::normalize::analyze;

/// Environment variable consulted when `embedding.api_key` is unset.
pub const API_KEY_ENV: &str = "SIHRAG_EMBEDDING_API_KEY";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Something that turns text into vectors.
///
/// Implementations must be deterministic for a fixed model and safe to call
/// concurrently. Failures surface as [`SihragError::EmbeddingUnavailable`].
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier, recorded in index snapshots.
    fn name(&self) -> &str;

    /// Length of every vector this embedder returns.
    fn dimensions(&self) -> usize;

    /// Embed many texts, returning vectors in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SihragError>;

    /// Embed a single query.
    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, SihragError> {
        self.embed_batch(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SihragError::EmbeddingUnavailable("no vector returned for query".into()))
    }
}

/// Build the embedder selected by `config.provider`.
///
/// # Errors
///
/// Returns [`SihragError::Config`] for an unknown provider or a client that
/// cannot be constructed.
///
/// # Examples
///
/// ```
/// use sihrag_core::EmbeddingConfig;
/// use sihrag_retrieval::embedding::from_config;
///
/// let config = EmbeddingConfig { provider: "hash".into(), dimensions: 64, ..Default::default() };
/// let embedder = from_config(&config).unwrap();
/// assert_eq!(embedder.dimensions(), 64);
/// ```
pub fn from_config(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, SihragError> {
    match config.provider.as_str() {
        "http" => Ok(Arc::new(HttpEmbedder::with_config(config)?)),
        "hash" => Ok(Arc::new(HashEmbedder::new(config.dimensions))),
        other => Err(SihragError::Config(format!(
            "unknown embedding provider `{other}` (expected \"http\" or \"hash\")"
        ))),
    }
}

/// Client for an OpenAI-compatible embeddings endpoint.
///
/// # Examples
///
/// ```
/// use sihrag_retrieval::embedding::{Embedder, HttpEmbedder};
///
/// let embedder = HttpEmbedder::new("http://localhost:8080/v1", "paraphrase-multilingual-MiniLM-L12-v2", 384);
/// assert_eq!(embedder.name(), "paraphrase-multilingual-MiniLM-L12-v2");
/// ```
pub struct HttpEmbedder {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    dimensions: usize,
}

impl std::fmt::Debug for HttpEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEmbedder")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'static str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDataItem>,
}

#[derive(Deserialize)]
struct EmbedDataItem {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    /// Create a client without an API key.
    pub fn new(base_url: &str, model: &str, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: None,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimensions,
        }
    }

    /// Create a client from an [`EmbeddingConfig`].
    ///
    /// Falls back to the `SIHRAG_EMBEDDING_API_KEY` env var if no key is
    /// configured; a local endpoint needs none.
    ///
    /// # Errors
    ///
    /// Returns [`SihragError::Config`] if the HTTP client cannot be built.
    pub fn with_config(config: &EmbeddingConfig) -> Result<Self, SihragError> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|k| !k.is_empty());
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SihragError::Config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimensions: config.dimensions,
        })
    }

    fn build_request<'a>(&'a self, texts: &'a [String]) -> EmbedRequest<'a> {
        EmbedRequest {
            model: &self.model,
            input: texts,
            encoding_format: "float",
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SihragError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&self.build_request(texts));
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SihragError::EmbeddingUnavailable(format!("HTTP request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read response body".into());
            return Err(SihragError::EmbeddingUnavailable(format!(
                "embeddings endpoint returned {status}: {body}"
            )));
        }

        let parsed: EmbedResponse = response.json().await.map_err(|e| {
            SihragError::EmbeddingUnavailable(format!("failed to parse response: {e}"))
        })?;
        order_response(parsed, texts.len())
    }
}

/// Put response vectors back in request order and check the count.
fn order_response(response: EmbedResponse, expected: usize) -> Result<Vec<Vec<f32>>, SihragError> {
    let mut items = response.data;
    if items.len() != expected {
        return Err(SihragError::EmbeddingUnavailable(format!(
            "expected {expected} vectors, got {}",
            items.len()
        )));
    }
    if items.iter().all(|item| item.index.is_some()) {
        items.sort_by_key(|item| item.index);
    }
    Ok(items.into_iter().map(|item| item.embedding).collect())
}

/// Deterministic feature-hashing embedder.
///
/// Each analyzed token is hashed with SHA-256 into one of `dimensions`
/// buckets with a pseudo-random sign; the result is L2-normalized. Texts
/// sharing vocabulary get high cosine similarity, which is enough for
/// offline runs and tests.
///
/// # Examples
///
/// ```
/// use sihrag_retrieval::embedding::{Embedder, HashEmbedder};
///
/// let embedder = HashEmbedder::new(32);
/// let a = embedder.embed("internação clínica");
/// let b = embedder.embed("Internacao CLINICA");
/// assert_eq!(a, b);
/// assert_eq!(embedder.dimensions(), 32);
/// ```
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
    name: String,
}

impl HashEmbedder {
    /// Create an embedder producing `dimensions`-long vectors.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            name: format!("feature-hash-{}", dimensions.max(1)),
        }
    }

    /// Embed synchronously.
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in analyze(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimensions as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        crate::semantic::l2_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SihragError> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }
}
