//! The indexing job: chunk store in, published snapshot out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use sihrag_core::{LexicalConfig, SihragConfig, SihragError};

use crate::embedding::Embedder;
use crate::lexical::LexicalIndex;
use crate::semantic::SemanticIndex;
use crate::snapshot::{self, IndexHandle, IndexSnapshot};
use crate::store::ChunkStore;

/// Summary of a successful rebuild.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    /// Version of the published snapshot.
    pub version: u64,
    /// Chunks in the store, parents included.
    pub chunks: usize,
    /// Leaf chunks indexed by both indexes.
    pub indexed: usize,
    /// Distinct source documents.
    pub documents: usize,
    /// Model behind the semantic index.
    pub embedding_model: String,
    /// Where the snapshot was persisted, if anywhere.
    pub persisted_to: Option<PathBuf>,
    /// Wall-clock build time.
    pub elapsed_ms: u64,
}

/// Builds both indexes from a chunk store.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use sihrag_core::SihragConfig;
/// use sihrag_retrieval::embedding::{Embedder, HashEmbedder};
/// use sihrag_retrieval::indexing::IndexingJob;
///
/// let job = IndexingJob::from_config(&SihragConfig::default(), Arc::new(HashEmbedder::new(64)));
/// assert_eq!(job.embedder().dimensions(), 64);
/// ```
pub struct IndexingJob {
    embedder: Arc<dyn Embedder>,
    lexical: LexicalConfig,
    batch_size: usize,
    concurrency: usize,
}

impl IndexingJob {
    /// Create a job with explicit settings.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        lexical: LexicalConfig,
        batch_size: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            embedder,
            lexical,
            batch_size,
            concurrency,
        }
    }

    /// Create a job from the `[lexical]` and `[embedding]` sections.
    pub fn from_config(config: &SihragConfig, embedder: Arc<dyn Embedder>) -> Self {
        Self::new(
            embedder,
            config.lexical,
            config.embedding.batch_size,
            config.embedding.concurrency,
        )
    }

    /// The embedder this job uses.
    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Build a snapshot (version 1) without publishing it.
    ///
    /// # Errors
    ///
    /// Returns [`SihragError::EmptyCorpus`] for an empty store and
    /// propagates embedding failures.
    pub async fn run(&self, store: ChunkStore) -> Result<IndexSnapshot, SihragError> {
        if store.is_empty() {
            return Err(SihragError::EmptyCorpus);
        }
        let entries = store.index_entries();
        tracing::info!(
            chunks = store.len(),
            leaves = entries.len(),
            model = self.embedder.name(),
            "building indexes"
        );

        let lexical = LexicalIndex::build(&entries, self.lexical);
        let semantic = SemanticIndex::build(
            &entries,
            self.embedder.as_ref(),
            self.batch_size,
            self.concurrency,
        )
        .await?;

        Ok(IndexSnapshot::new(1, store, lexical, semantic))
    }

    /// Build, persist, and publish a new snapshot.
    ///
    /// The new version is one past the handle's current version (or the
    /// version stored at `persist_to`). A file at `persist_to` that is not a
    /// readable snapshot counts as version 0 and is overwritten. Nothing is
    /// published and the file at `persist_to` is left alone unless every
    /// step succeeds.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run), plus persistence failures.
    pub async fn rebuild(
        &self,
        handle: &IndexHandle,
        store: ChunkStore,
        persist_to: Option<&Path>,
    ) -> Result<BuildReport, SihragError> {
        let started = Instant::now();
        let previous = match (handle.version(), persist_to) {
            (Some(version), _) => version,
            (None, Some(path)) => match snapshot::stored_version(path) {
                Ok(version) => version.unwrap_or(0),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %path.display(),
                        "unreadable index file; numbering from version 0"
                    );
                    0
                }
            },
            (None, None) => 0,
        };

        let mut built = match self.run(store).await {
            Ok(built) => built,
            Err(e) => {
                tracing::warn!(error = %e, previous, "index build failed; keeping previous snapshot");
                return Err(e);
            }
        };
        built.version = previous + 1;

        if let Some(path) = persist_to {
            snapshot::save(&built, path)?;
        }

        let report = BuildReport {
            version: built.version,
            chunks: built.store.len(),
            indexed: built.lexical.len(),
            documents: built.store.documents().len(),
            embedding_model: built.embedding_model.clone(),
            persisted_to: persist_to.map(Path::to_path_buf),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        handle.publish(built);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use async_trait::async_trait;
    use sihrag_core::{Chunk, ChunkKind, SourceMetadata};

    struct Offline;

    #[async_trait]
    impl Embedder for Offline {
        fn name(&self) -> &str {
            "offline"
        }

        fn dimensions(&self) -> usize {
            64
        }

        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, SihragError> {
            Err(SihragError::EmbeddingUnavailable("connection refused".into()))
        }
    }

    fn store() -> ChunkStore {
        let chunk = |id: &str, text: &str| Chunk {
            id: id.into(),
            text: text.into(),
            parent_id: None,
            kind: ChunkKind::GenericPage,
            source_metadata: SourceMetadata::new("Portaria"),
        };
        ChunkStore::from_chunks(vec![
            chunk("a", "procedimento 0301010010 internação clínica"),
            chunk("b", "habilitação de leito UTI adulto"),
        ])
        .unwrap()
    }

    fn job(embedder: Arc<dyn Embedder>) -> IndexingJob {
        IndexingJob::new(embedder, LexicalConfig::default(), 1, 2)
    }

    #[tokio::test]
    async fn empty_store_is_empty_corpus() {
        let err = job(Arc::new(HashEmbedder::new(64)))
            .run(ChunkStore::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SihragError::EmptyCorpus));
    }

    #[tokio::test]
    async fn rebuild_increments_version() {
        let handle = IndexHandle::new();
        let job = job(Arc::new(HashEmbedder::new(64)));
        let first = job.rebuild(&handle, store(), None).await.unwrap();
        let second = job.rebuild(&handle, store(), None).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(second.indexed, 2);
        assert_eq!(second.documents, 1);
        assert_eq!(handle.version(), Some(2));
    }

    #[tokio::test]
    async fn failed_build_keeps_previous_snapshot_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        let handle = IndexHandle::new();

        job(Arc::new(HashEmbedder::new(64)))
            .rebuild(&handle, store(), Some(&path))
            .await
            .unwrap();

        let err = job(Arc::new(Offline))
            .rebuild(&handle, store(), Some(&path))
            .await
            .unwrap_err();
        assert!(matches!(err, SihragError::EmbeddingUnavailable(_)));
        assert_eq!(handle.version(), Some(1));
        assert_eq!(snapshot::load(&path).unwrap().version, 1);
    }

    #[tokio::test]
    async fn version_continues_from_persisted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        let job = job(Arc::new(HashEmbedder::new(64)));
        job.rebuild(&IndexHandle::new(), store(), Some(&path))
            .await
            .unwrap();
        let report = job
            .rebuild(&IndexHandle::new(), store(), Some(&path))
            .await
            .unwrap();
        assert_eq!(report.version, 2);
        assert_eq!(report.persisted_to.as_deref(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn garbage_index_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        std::fs::write(&path, b"garbage, not a database").unwrap();

        let report = job(Arc::new(HashEmbedder::new(64)))
            .rebuild(&IndexHandle::new(), store(), Some(&path))
            .await
            .unwrap();
        assert_eq!(report.version, 1);
        assert_eq!(snapshot::load(&path).unwrap().version, 1);
    }

    #[tokio::test]
    async fn foreign_schema_index_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE files (path TEXT PRIMARY KEY);")
            .unwrap();

        let report = job(Arc::new(HashEmbedder::new(64)))
            .rebuild(&IndexHandle::new(), store(), Some(&path))
            .await
            .unwrap();
        assert_eq!(report.version, 1);
        assert_eq!(snapshot::load(&path).unwrap().version, 1);
    }

    #[tokio::test]
    async fn snapshot_records_fingerprint() {
        let built = job(Arc::new(HashEmbedder::new(64)))
            .run(store())
            .await
            .unwrap();
        assert!(built.is_built_from(&store()));
        assert_eq!(built.embedding_model, "feature-hash-64");
    }
}
