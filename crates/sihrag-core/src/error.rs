use std::path::PathBuf;

/// Errors that can occur across the sihrag workspace.
///
/// Library crates use this type directly; the binary converts to
/// `miette::Report` at the boundary. Ingestion problems are not errors:
/// they are reported through the chunking pipeline's ingestion report.
///
/// # Examples
///
/// ```
/// use sihrag_core::SihragError;
///
/// let err = SihragError::Config("missing API key".into());
/// assert!(err.to_string().contains("missing API key"));
/// ```
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum SihragError {
    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// SQLite failure while reading or writing a persisted index.
    #[error("database error: {0}")]
    Database(String),

    /// The embedding capability (or its backing service) failed.
    #[error("embedding unavailable: {0}")]
    #[diagnostic(help("check the [embedding] section of .sihrag.toml and that the service is reachable"))]
    EmbeddingUnavailable(String),

    /// The reranking service failed or answered with the wrong shape.
    #[error("reranker unavailable: {0}")]
    #[diagnostic(help("check the [rerank] section of .sihrag.toml, or set provider = \"none\""))]
    RerankUnavailable(String),

    /// An embedding vector did not have the configured dimensionality.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimensionality recorded for the index.
        expected: usize,
        /// Dimensionality that was produced.
        actual: usize,
    },

    /// A query was issued before any index build succeeded.
    #[error("index not ready: no successful index build is available")]
    #[diagnostic(help("run `sihrag index` after `sihrag chunk`"))]
    IndexNotReady,

    /// The indexing job was given a chunk store with no chunks.
    #[error("empty corpus: the chunk store has no chunks to index")]
    #[diagnostic(help("run `sihrag chunk` over at least one non-empty document"))]
    EmptyCorpus,

    /// The chunk store violates an invariant (duplicate id, dangling parent).
    #[error("invalid chunk store: {0}")]
    InvalidChunkStore(String),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization failure.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A required file was not found.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
}

impl SihragError {
    /// Returns `true` for failures a caller can recover from by re-running
    /// the indexing job.
    ///
    /// # Examples
    ///
    /// ```
    /// use sihrag_core::SihragError;
    ///
    /// assert!(SihragError::IndexNotReady.is_retryable_after_build());
    /// assert!(!SihragError::Config("x".into()).is_retryable_after_build());
    /// ```
    pub fn is_retryable_after_build(&self) -> bool {
        matches!(self, SihragError::IndexNotReady | SihragError::EmptyCorpus)
    }
}
