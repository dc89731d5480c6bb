use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SihragError;
use crate::Result;
use crate::types::QueryHint;

/// Top-level configuration loaded from `.sihrag.toml`.
///
/// Supports layered resolution: CLI flags > env vars > local config > defaults.
/// Every field has a default, so an empty file is a valid configuration.
///
/// # Examples
///
/// ```
/// use sihrag_core::SihragConfig;
///
/// let config = SihragConfig::default();
/// assert_eq!(config.search.default_top_k, 5);
/// assert_eq!(config.fusion.rrf_k, 60.0);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SihragConfig {
    /// Parent/child chunking limits.
    #[serde(default)]
    pub chunking: ChunkingConfig,
    /// BM25 parameters.
    #[serde(default)]
    pub lexical: LexicalConfig,
    /// Rank fusion parameters.
    #[serde(default)]
    pub fusion: FusionConfig,
    /// Query-time behavior.
    #[serde(default)]
    pub search: SearchConfig,
    /// Embedding provider settings.
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Optional second-stage reranker.
    #[serde(default)]
    pub rerank: RerankConfig,
    /// On-disk locations of the chunk store and the index.
    #[serde(default)]
    pub paths: PathsConfig,
}

impl SihragConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SihragError::Io`] if the file cannot be read, or
    /// [`SihragError::Toml`] if the content is not valid TOML.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use sihrag_core::SihragConfig;
    /// use std::path::Path;
    ///
    /// let config = SihragConfig::from_file(Path::new(".sihrag.toml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`SihragError::Toml`] if parsing fails, or
    /// [`SihragError::Config`] if a value is out of range.
    ///
    /// # Examples
    ///
    /// ```
    /// use sihrag_core::SihragConfig;
    ///
    /// let toml = r#"
    /// [search]
    /// default_top_k = 10
    /// "#;
    /// let config = SihragConfig::from_toml(toml).unwrap();
    /// assert_eq!(config.search.default_top_k, 10);
    /// ```
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`SihragError::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        let c = &self.chunking;
        if c.child_max_chars == 0 || c.parent_max_chars == 0 {
            return Err(SihragError::Config(
                "chunking.parent_max_chars and chunking.child_max_chars must be positive".into(),
            ));
        }
        if c.child_max_chars > c.parent_max_chars {
            return Err(SihragError::Config(format!(
                "chunking.child_max_chars ({}) exceeds chunking.parent_max_chars ({})",
                c.child_max_chars, c.parent_max_chars
            )));
        }
        if self.lexical.k1 < 0.0 || !(0.0..=1.0).contains(&self.lexical.b) {
            return Err(SihragError::Config(
                "lexical.k1 must be >= 0 and lexical.b must be within [0, 1]".into(),
            ));
        }
        if self.fusion.rrf_k <= 0.0 {
            return Err(SihragError::Config("fusion.rrf_k must be positive".into()));
        }
        if self.fusion.candidate_pool == 0 {
            return Err(SihragError::Config(
                "fusion.candidate_pool must be positive".into(),
            ));
        }
        for (name, weights) in [
            ("free_form", &self.fusion.free_form),
            ("procedure_code", &self.fusion.procedure_code),
            ("section_number", &self.fusion.section_number),
        ] {
            if weights.lexical < 0.0 || weights.semantic < 0.0 {
                return Err(SihragError::Config(format!(
                    "fusion.{name} weights must be non-negative"
                )));
            }
            if weights.lexical == 0.0 && weights.semantic == 0.0 {
                return Err(SihragError::Config(format!(
                    "fusion.{name} needs at least one non-zero weight"
                )));
            }
        }
        if self.embedding.dimensions == 0 {
            return Err(SihragError::Config(
                "embedding.dimensions must be positive".into(),
            ));
        }
        if self.embedding.batch_size == 0 || self.embedding.concurrency == 0 {
            return Err(SihragError::Config(
                "embedding.batch_size and embedding.concurrency must be positive".into(),
            ));
        }
        if self.rerank.pool_size == 0 || self.rerank.pool_factor == 0 {
            return Err(SihragError::Config(
                "rerank.pool_size and rerank.pool_factor must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Chunking pipeline limits, in characters.
///
/// # Examples
///
/// ```
/// use sihrag_core::ChunkingConfig;
///
/// let config = ChunkingConfig::default();
/// assert_eq!(config.parent_max_chars, 3000);
/// assert_eq!(config.child_max_chars, 500);
/// assert_eq!(config.annex_max_pages, 10);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Maximum size of a parent chunk (default: 3000).
    #[serde(default = "default_parent_max_chars")]
    pub parent_max_chars: usize,
    /// Maximum size of a child chunk (default: 500).
    #[serde(default = "default_child_max_chars")]
    pub child_max_chars: usize,
    /// Trailing text carried into the next piece (default: 200).
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
    /// Pages kept from a reference-table annex (default: 10).
    #[serde(default = "default_annex_max_pages")]
    pub annex_max_pages: usize,
    /// Paragraphs shorter than this are dropped from page blocks (default: 20).
    #[serde(default = "default_min_paragraph_chars")]
    pub min_paragraph_chars: usize,
}

fn default_parent_max_chars() -> usize {
    3000
}

fn default_child_max_chars() -> usize {
    500
}

fn default_overlap_chars() -> usize {
    200
}

fn default_annex_max_pages() -> usize {
    10
}

fn default_min_paragraph_chars() -> usize {
    20
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            parent_max_chars: default_parent_max_chars(),
            child_max_chars: default_child_max_chars(),
            overlap_chars: default_overlap_chars(),
            annex_max_pages: default_annex_max_pages(),
            min_paragraph_chars: default_min_paragraph_chars(),
        }
    }
}

/// BM25 parameters.
///
/// # Examples
///
/// ```
/// use sihrag_core::LexicalConfig;
///
/// let config = LexicalConfig::default();
/// assert_eq!(config.k1, 1.5);
/// assert_eq!(config.b, 0.75);
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LexicalConfig {
    /// Term-frequency saturation (default: 1.5).
    #[serde(default = "default_k1")]
    pub k1: f64,
    /// Length normalization (default: 0.75).
    #[serde(default = "default_b")]
    pub b: f64,
}

fn default_k1() -> f64 {
    1.5
}

fn default_b() -> f64 {
    0.75
}

impl Default for LexicalConfig {
    fn default() -> Self {
        Self {
            k1: default_k1(),
            b: default_b(),
        }
    }
}

/// Relative weight of the lexical and semantic signals in fusion.
///
/// # Examples
///
/// ```
/// use sihrag_core::FusionWeights;
///
/// let lexical_only = FusionWeights::new(1.0, 0.0);
/// assert_eq!(lexical_only.semantic, 0.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    /// Weight of the BM25 rank.
    pub lexical: f64,
    /// Weight of the embedding rank.
    pub semantic: f64,
}

impl FusionWeights {
    /// Create a weight pair.
    pub fn new(lexical: f64, semantic: f64) -> Self {
        Self { lexical, semantic }
    }
}

/// Reciprocal-rank fusion parameters with one weight profile per query kind.
///
/// # Examples
///
/// ```
/// use sihrag_core::{FusionConfig, QueryHint};
///
/// let config = FusionConfig::default();
/// assert_eq!(config.candidate_pool, 20);
/// let code = config.weights_for(QueryHint::ProcedureCode);
/// assert!(code.lexical > code.semantic);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// RRF smoothing constant (default: 60).
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    /// Candidates fetched from each sub-index before fusion (default: 20).
    #[serde(default = "default_candidate_pool")]
    pub candidate_pool: usize,
    /// Weights for descriptive questions (default: 1.0 / 1.0).
    #[serde(default = "default_free_form_weights")]
    pub free_form: FusionWeights,
    /// Weights for bare procedure or CID codes (default: 1.0 / 0.3).
    #[serde(default = "default_code_weights")]
    pub procedure_code: FusionWeights,
    /// Weights for section-number lookups that found no exact match (default: 1.0 / 0.5).
    #[serde(default = "default_section_weights")]
    pub section_number: FusionWeights,
}

fn default_rrf_k() -> f64 {
    60.0
}

fn default_candidate_pool() -> usize {
    20
}

fn default_free_form_weights() -> FusionWeights {
    FusionWeights::new(1.0, 1.0)
}

fn default_code_weights() -> FusionWeights {
    FusionWeights::new(1.0, 0.3)
}

fn default_section_weights() -> FusionWeights {
    FusionWeights::new(1.0, 0.5)
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            candidate_pool: default_candidate_pool(),
            free_form: default_free_form_weights(),
            procedure_code: default_code_weights(),
            section_number: default_section_weights(),
        }
    }
}

impl FusionConfig {
    /// Weight profile for a query kind. `Unspecified` uses the free-form profile.
    pub fn weights_for(&self, hint: QueryHint) -> FusionWeights {
        match hint {
            QueryHint::SectionNumber => self.section_number,
            QueryHint::ProcedureCode => self.procedure_code,
            QueryHint::FreeForm | QueryHint::Unspecified => self.free_form,
        }
    }
}

/// Query-time behavior of the hybrid engine.
///
/// # Examples
///
/// ```
/// use sihrag_core::SearchConfig;
///
/// let config = SearchConfig::default();
/// assert_eq!(config.default_top_k, 5);
/// assert!(config.resolve_parents);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Results returned when the caller does not ask for a count (default: 5).
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    /// Split compound questions into sub-queries (default: true).
    #[serde(default = "default_true")]
    pub decompose_queries: bool,
    /// Collapse child hits onto their parent chunk (default: true).
    #[serde(default = "default_true")]
    pub resolve_parents: bool,
    /// Derive year / document-type filters from the query text (default: true).
    #[serde(default = "default_true")]
    pub auto_filters: bool,
}

fn default_top_k() -> usize {
    5
}

fn default_true() -> bool {
    true
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
            decompose_queries: true,
            resolve_parents: true,
            auto_filters: true,
        }
    }
}

/// Configuration for the embedding capability.
///
/// # Examples
///
/// ```
/// use sihrag_core::EmbeddingConfig;
///
/// let config = EmbeddingConfig::default();
/// assert_eq!(config.provider, "http");
/// assert_eq!(config.model, "paraphrase-multilingual-MiniLM-L12-v2");
/// assert_eq!(config.dimensions, 384);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// `"http"` (OpenAI-compatible endpoint) or `"hash"` (offline).
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    /// Model name sent to the endpoint.
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Base URL of the embeddings endpoint.
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,
    /// API key; falls back to `SIHRAG_EMBEDDING_API_KEY`.
    pub api_key: Option<String>,
    /// Vector dimensionality (default: 384).
    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,
    /// Texts per request (default: 32).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Requests in flight while indexing (default: 4).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_embedding_provider() -> String {
    "http".into()
}

fn default_embedding_model() -> String {
    "paraphrase-multilingual-MiniLM-L12-v2".into()
}

fn default_embedding_base_url() -> String {
    "http://localhost:8080/v1".into()
}

fn default_embedding_dimensions() -> usize {
    384
}

fn default_batch_size() -> usize {
    32
}

fn default_concurrency() -> usize {
    4
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            base_url: default_embedding_base_url(),
            api_key: None,
            dimensions: default_embedding_dimensions(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
        }
    }
}

/// Second-stage reranking of fused candidates.
///
/// The reranker rescores the head of the fused list as `(query, chunk)`
/// pairs. Queries of two words or fewer and purely numeric queries skip it.
///
/// # Examples
///
/// ```
/// use sihrag_core::RerankConfig;
///
/// let config = RerankConfig::default();
/// assert_eq!(config.provider, "none");
/// assert_eq!(config.pool(5), 20);
/// assert_eq!(config.pool(10), 30);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    /// `"none"`, `"http"` (a `/rerank` endpoint) or `"overlap"` (offline).
    #[serde(default = "default_rerank_provider")]
    pub provider: String,
    /// Cross-encoder model name sent to the endpoint.
    #[serde(default = "default_rerank_model")]
    pub model: String,
    /// Base URL of the rerank endpoint.
    #[serde(default = "default_rerank_base_url")]
    pub base_url: String,
    /// API key; falls back to `SIHRAG_RERANK_API_KEY`.
    pub api_key: Option<String>,
    /// Minimum number of fused candidates rescored (default: 20).
    #[serde(default = "default_rerank_pool_size")]
    pub pool_size: usize,
    /// Candidates rescored per requested result (default: 3).
    #[serde(default = "default_rerank_pool_factor")]
    pub pool_factor: usize,
}

impl RerankConfig {
    /// Number of fused candidates rescored for a request of `top_k`.
    pub fn pool(&self, top_k: usize) -> usize {
        self.pool_size.max(top_k.saturating_mul(self.pool_factor))
    }
}

fn default_rerank_provider() -> String {
    "none".into()
}

fn default_rerank_model() -> String {
    "cross-encoder/ms-marco-MiniLM-L-6-v2".into()
}

fn default_rerank_base_url() -> String {
    "http://localhost:8081".into()
}

fn default_rerank_pool_size() -> usize {
    20
}

fn default_rerank_pool_factor() -> usize {
    3
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: default_rerank_provider(),
            model: default_rerank_model(),
            base_url: default_rerank_base_url(),
            api_key: None,
            pool_size: default_rerank_pool_size(),
            pool_factor: default_rerank_pool_factor(),
        }
    }
}

/// On-disk locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Chunk store JSON (default: `data/chunks.json`).
    #[serde(default = "default_chunks_path")]
    pub chunks: PathBuf,
    /// Persisted index snapshot (default: `data/index.db`).
    #[serde(default = "default_index_path")]
    pub index: PathBuf,
}

fn default_chunks_path() -> PathBuf {
    PathBuf::from("data/chunks.json")
}

fn default_index_path() -> PathBuf {
    PathBuf::from("data/index.db")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            chunks: default_chunks_path(),
            index: default_index_path(),
        }
    }
}
