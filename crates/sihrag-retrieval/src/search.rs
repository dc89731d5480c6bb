//! Hybrid search: BM25 and vector retrieval fused with weighted Reciprocal
//! Rank Fusion.
//!
//! Each search pins the snapshot current when it starts, so a concurrent
//! rebuild never changes the indexes under a running query.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use sihrag_core::{
    FusionConfig, QueryHint, RerankConfig, ResultEntry, SearchConfig, SihragConfig, SihragError,
};

use crate::embedding::Embedder;
use crate::fusion::{by_score_then_id, fuse, merge_ranked, FusedHit, FusionParams, Hit};
use crate::query::{classify, decompose, extract_filters, section_number, MetadataFilter};
use crate::rerank::{is_short_query, rerank_hits, Reranker};
use crate::snapshot::{IndexHandle, IndexSnapshot};
use crate::store::ChunkStore;

/// Query-time settings: the `[fusion]`, `[search]` and `[rerank]` sections.
#[derive(Debug, Clone, Default)]
pub struct SearchSettings {
    /// Fusion constant, candidate pool, and weight profiles.
    pub fusion: FusionConfig,
    /// Result size, decomposition, parent resolution, auto filters.
    pub search: SearchConfig,
    /// How many fused candidates a reranker rescores.
    pub rerank: RerankConfig,
}

impl SearchSettings {
    /// Take the query-time sections of a full configuration.
    pub fn from_config(config: &SihragConfig) -> Self {
        Self {
            fusion: config.fusion.clone(),
            search: config.search.clone(),
            rerank: config.rerank.clone(),
        }
    }
}

/// A fully specified query.
///
/// # Examples
///
/// ```
/// use sihrag_core::QueryHint;
/// use sihrag_retrieval::search::SearchRequest;
///
/// let request = SearchRequest::new("regras de OPM")
///     .with_top_k(3)
///     .with_hint(QueryHint::FreeForm);
/// assert_eq!(request.top_k, Some(3));
/// assert!(request.section.is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    /// Raw query text.
    pub text: String,
    /// Result count; `None` uses `search.default_top_k`.
    pub top_k: Option<usize>,
    /// Query shape; `Unspecified` classifies the text.
    pub hint: QueryHint,
    /// Section number whose chunks are pinned to the top.
    pub section: Option<String>,
    /// Metadata restriction; `None` derives one from the text when
    /// `search.auto_filters` is on.
    pub filter: Option<MetadataFilter>,
}

impl SearchRequest {
    /// A request with default settings.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Set the result count.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    /// Set the query shape.
    pub fn with_hint(mut self, hint: QueryHint) -> Self {
        self.hint = hint;
        self
    }

    /// Pin chunks of section `section`.
    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    /// Restrict results by metadata.
    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// One result of [`HybridSearch::search_batch`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchEntry {
    /// The best-scoring occurrence of this chunk.
    #[serde(flatten)]
    pub entry: ResultEntry,
    /// The query that produced it.
    pub query_origin: String,
}

/// Candidate lists from both indexes for one query.
struct Candidates {
    lexical: Vec<Hit>,
    semantic: Vec<Hit>,
}

impl Candidates {
    fn is_empty(&self) -> bool {
        self.lexical.is_empty() && self.semantic.is_empty()
    }
}

/// The hybrid retrieval engine.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use sihrag_core::SihragError;
/// use sihrag_retrieval::embedding::HashEmbedder;
/// use sihrag_retrieval::search::{HybridSearch, SearchSettings};
/// use sihrag_retrieval::snapshot::IndexHandle;
///
/// # async fn example() {
/// let search = HybridSearch::new(
///     Arc::new(IndexHandle::new()),
///     Arc::new(HashEmbedder::new(64)),
///     SearchSettings::default(),
/// );
/// let err = search.search("internação", None, None).await.unwrap_err();
/// assert!(matches!(err, SihragError::IndexNotReady));
/// # }
/// ```
pub struct HybridSearch {
    handle: Arc<IndexHandle>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    settings: SearchSettings,
}

impl HybridSearch {
    /// Create an engine reading snapshots from `handle`.
    pub fn new(
        handle: Arc<IndexHandle>,
        embedder: Arc<dyn Embedder>,
        settings: SearchSettings,
    ) -> Self {
        Self {
            handle,
            embedder,
            reranker: None,
            settings,
        }
    }

    /// Rescore fused candidates with `reranker` before parent resolution.
    ///
    /// Queries of one or two words, and bare numbers, skip reranking.
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// The handle this engine reads from.
    pub fn handle(&self) -> &Arc<IndexHandle> {
        &self.handle
    }

    /// Search with the caller-facing defaults.
    ///
    /// `top_k` defaults to `search.default_top_k`; `hint` defaults to
    /// classifying the query.
    ///
    /// # Errors
    ///
    /// Returns [`SihragError::IndexNotReady`] before the first build, and
    /// propagates embedding failures.
    pub async fn search(
        &self,
        query: &str,
        top_k: Option<usize>,
        hint: Option<QueryHint>,
    ) -> Result<Vec<ResultEntry>, SihragError> {
        let request = SearchRequest {
            text: query.to_string(),
            top_k,
            hint: hint.unwrap_or_default(),
            ..SearchRequest::default()
        };
        self.search_request(&request).await
    }

    /// Search with every option spelled out.
    ///
    /// # Errors
    ///
    /// Same as [`search`](Self::search).
    pub async fn search_request(
        &self,
        request: &SearchRequest,
    ) -> Result<Vec<ResultEntry>, SihragError> {
        let snapshot = self.handle.current()?;
        self.run(&snapshot, request, self.settings.search.decompose_queries)
            .await
    }

    /// Run several queries and merge their results.
    ///
    /// Each query is searched on its own, without decomposition, for
    /// `per_query` results. A chunk found by more than one query keeps its
    /// best score and the query that produced it.
    ///
    /// # Errors
    ///
    /// Same as [`search`](Self::search).
    pub async fn search_batch(
        &self,
        queries: &[String],
        per_query: usize,
    ) -> Result<Vec<BatchEntry>, SihragError> {
        let snapshot = self.handle.current()?;
        let mut best: HashMap<String, BatchEntry> = HashMap::new();

        for query in queries {
            let request = SearchRequest::new(query.as_str()).with_top_k(per_query);
            for entry in self.run(&snapshot, &request, false).await? {
                match best.get(&entry.chunk_id) {
                    Some(existing) if existing.entry.fused_score >= entry.fused_score => {}
                    _ => {
                        best.insert(
                            entry.chunk_id.clone(),
                            BatchEntry {
                                entry,
                                query_origin: query.clone(),
                            },
                        );
                    }
                }
            }
        }

        let mut merged: Vec<BatchEntry> = best.into_values().collect();
        merged.sort_by(|a, b| {
            by_score_then_id(
                a.entry.fused_score,
                &a.entry.chunk_id,
                b.entry.fused_score,
                &b.entry.chunk_id,
            )
        });
        Ok(merged)
    }

    async fn run(
        &self,
        snapshot: &IndexSnapshot,
        request: &SearchRequest,
        allow_decompose: bool,
    ) -> Result<Vec<ResultEntry>, SihragError> {
        let top_k = request
            .top_k
            .unwrap_or(self.settings.search.default_top_k);
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let hint = match request.hint {
            QueryHint::Unspecified => classify(&request.text),
            explicit => explicit,
        };
        let target_section = request.section.clone().or_else(|| {
            (hint == QueryHint::SectionNumber)
                .then(|| section_number(&request.text))
                .flatten()
        });

        let (filter, auto_filter) = match request.filter {
            Some(filter) => (Some(filter), false),
            None if self.settings.search.auto_filters => (extract_filters(&request.text), true),
            None => (None, false),
        };

        let queries = if allow_decompose && hint == QueryHint::FreeForm {
            decompose(&request.text)
        } else {
            vec![request.text.clone()]
        };
        let pool = self.settings.fusion.candidate_pool.max(top_k);

        let mut effective_filter = filter;
        let mut candidates = self.retrieve(snapshot, &queries, pool, filter).await?;
        if candidates.is_empty() && auto_filter && filter.is_some() {
            tracing::debug!(
                filter = ?filter,
                "derived filter matched nothing; retrying unfiltered"
            );
            effective_filter = None;
            candidates = self.retrieve(snapshot, &queries, pool, None).await?;
        }

        let params = FusionParams {
            k: self.settings.fusion.rrf_k,
            weights: self.settings.fusion.weights_for(hint),
        };
        let mut fused = fuse(&candidates.lexical, &candidates.semantic, params);
        tracing::debug!(
            %hint,
            sub_queries = queries.len(),
            lexical = candidates.lexical.len(),
            semantic = candidates.semantic.len(),
            fused = fused.len(),
            "fused candidates"
        );

        if let Some(reranker) = &self.reranker {
            if !is_short_query(&request.text) {
                let pool = self.settings.rerank.pool(top_k);
                match rerank_hits(
                    reranker.as_ref(),
                    &request.text,
                    &snapshot.store,
                    fused.clone(),
                    pool,
                )
                .await
                {
                    Ok(reranked) => fused = reranked,
                    Err(e) => {
                        tracing::warn!(
                            reranker = reranker.name(),
                            error = %e,
                            "reranking failed; keeping fused order"
                        );
                    }
                }
            }
        }

        let resolve = self.settings.search.resolve_parents;
        let mut ranked = collapse(&snapshot.store, fused, resolve);

        if let Some(section) = target_section.as_deref() {
            let mut pinned = pin_section(
                &snapshot.store,
                section,
                effective_filter.as_ref(),
                resolve,
                params.max_score(),
                &mut ranked,
            );
            if pinned.is_empty() {
                tracing::debug!(section, "no exact section match; using fused ranking");
            }
            pinned.append(&mut ranked);
            ranked = pinned;
        }

        Ok(ranked
            .into_iter()
            .take(top_k)
            .filter_map(|hit| {
                snapshot.store.get(&hit.id).map(|chunk| ResultEntry {
                    rerank_score: hit.rerank_score,
                    ..ResultEntry::from_chunk(chunk, hit.score, hit.lexical_rank, hit.semantic_rank)
                })
            })
            .collect())
    }

    /// Per-index candidate lists, each merged across sub-queries.
    async fn retrieve(
        &self,
        snapshot: &IndexSnapshot,
        queries: &[String],
        pool: usize,
        filter: Option<MetadataFilter>,
    ) -> Result<Candidates, SihragError> {
        let store = &snapshot.store;
        let keep = filter.map(|f| {
            move |id: &str| {
                store
                    .get(id)
                    .is_some_and(|chunk| f.matches(&chunk.source_metadata))
            }
        });

        // Embedding requests run on the runtime while BM25 scores here.
        let pending: Vec<_> = queries
            .iter()
            .map(|query| {
                let embedder = Arc::clone(&self.embedder);
                let query = query.clone();
                tokio::spawn(async move { embedder.embed_query(&query).await })
            })
            .collect();

        let lexical_lists: Vec<Vec<Hit>> = queries
            .iter()
            .map(|query| {
                snapshot.lexical.search(
                    query,
                    pool,
                    keep.as_ref().map(|k| k as &dyn Fn(&str) -> bool),
                )
            })
            .collect();

        let mut semantic_lists = Vec::with_capacity(queries.len());
        for task in pending {
            let vector = task.await.map_err(|e| {
                SihragError::EmbeddingUnavailable(format!("embedding task failed: {e}"))
            })??;
            semantic_lists.push(snapshot.semantic.search_vector(
                &vector,
                pool,
                keep.as_ref().map(|k| k as &dyn Fn(&str) -> bool),
            )?);
        }

        let k = self.settings.fusion.rrf_k;
        Ok(Candidates {
            lexical: merge_ranked(&lexical_lists, k),
            semantic: merge_ranked(&semantic_lists, k),
        })
    }
}

/// Map fused leaf hits onto the chunks to report, keeping order.
///
/// With `resolve_parents`, every child is replaced by its parent; a parent
/// reached more than once keeps its first (best) score and the best rank
/// seen in each list.
fn collapse(store: &ChunkStore, fused: Vec<FusedHit>, resolve_parents: bool) -> Vec<FusedHit> {
    if !resolve_parents {
        return fused;
    }
    let mut order: Vec<FusedHit> = Vec::with_capacity(fused.len());
    let mut position: HashMap<String, usize> = HashMap::new();
    for hit in fused {
        let id = store
            .parent_of(&hit.id)
            .map_or_else(|| hit.id.clone(), |parent| parent.id.clone());
        match position.get(&id) {
            Some(&idx) => {
                let kept = &mut order[idx];
                kept.lexical_rank = best_rank(kept.lexical_rank, hit.lexical_rank);
                kept.semantic_rank = best_rank(kept.semantic_rank, hit.semantic_rank);
            }
            None => {
                position.insert(id.clone(), order.len());
                order.push(FusedHit { id, ..hit });
            }
        }
    }
    order
}

fn best_rank(a: Option<usize>, b: Option<usize>) -> Option<usize> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn same_section(candidate: &str, wanted: &str) -> bool {
    candidate.trim().trim_end_matches('.') == wanted.trim().trim_end_matches('.')
}

/// Pull the chunks of `section` out of `ranked` and return them, best
/// possible score, ordered by id.
///
/// Chunks matching the section but absent from `ranked` are included too:
/// an exact metadata match does not depend on either index finding it.
fn pin_section(
    store: &ChunkStore,
    section: &str,
    filter: Option<&MetadataFilter>,
    resolve_parents: bool,
    score: f64,
    ranked: &mut Vec<FusedHit>,
) -> Vec<FusedHit> {
    let mut ids: Vec<&str> = store
        .iter()
        .filter(|chunk| {
            let reportable = if resolve_parents {
                !chunk.is_child()
            } else {
                store.children_of(&chunk.id).is_empty()
            };
            reportable
                && chunk
                    .source_metadata
                    .section
                    .as_deref()
                    .is_some_and(|s| same_section(s, section))
                && filter.map_or(true, |f| f.matches(&chunk.source_metadata))
        })
        .map(|chunk| chunk.id.as_str())
        .collect();
    ids.sort_unstable();

    let wanted: HashSet<&str> = ids.iter().copied().collect();
    let mut found: HashMap<String, FusedHit> = HashMap::new();
    ranked.retain(|hit| {
        if wanted.contains(hit.id.as_str()) {
            found.insert(hit.id.clone(), hit.clone());
            false
        } else {
            true
        }
    });

    ids.into_iter()
        .map(|id| match found.remove(id) {
            Some(hit) => FusedHit { score, ..hit },
            None => FusedHit {
                id: id.to_string(),
                score,
                lexical_rank: None,
                semantic_rank: None,
                rerank_score: None,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::indexing::IndexingJob;
    use sihrag_core::{Chunk, ChunkKind, DocumentType, LexicalConfig, SourceMetadata};

    fn chunk(id: &str, parent: Option<&str>, section: Option<&str>, text: &str) -> Chunk {
        Chunk {
            id: id.into(),
            text: text.into(),
            parent_id: parent.map(String::from),
            kind: ChunkKind::Section,
            source_metadata: SourceMetadata {
                section: section.map(String::from),
                document_type: Some(DocumentType::Manual),
                year: Some(2017),
                ..SourceMetadata::new("Manual SIH")
            },
        }
    }

    fn corpus() -> ChunkStore {
        ChunkStore::from_chunks(vec![
            chunk("s1", None, Some("1"), "Introdução ao sistema de informações hospitalares"),
            chunk("s1_c0", Some("s1"), Some("1"), "Introdução ao sistema"),
            chunk("s1_c1", Some("s1"), Some("1"), "informações hospitalares do SUS"),
            chunk("s4", None, Some("4.2"), "Diárias de UTI e acompanhante"),
            chunk("s4_c0", Some("s4"), Some("4.2"), "Diárias de UTI adulto exigem laudo"),
            chunk("s5", None, Some("5"), "Órteses próteses e materiais especiais OPM"),
            chunk("s5_c0", Some("s5"), Some("5"), "OPM compatível com o procedimento principal"),
        ])
        .unwrap()
    }

    async fn engine(settings: SearchSettings) -> HybridSearch {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(256));
        let handle = Arc::new(IndexHandle::new());
        IndexingJob::new(embedder.clone(), LexicalConfig::default(), 4, 2)
            .rebuild(&handle, corpus(), None)
            .await
            .unwrap();
        HybridSearch::new(handle, embedder, settings)
    }

    fn ids(entries: &[ResultEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.chunk_id.as_str()).collect()
    }

    #[tokio::test]
    async fn not_ready_before_build() {
        let search = HybridSearch::new(
            Arc::new(IndexHandle::new()),
            Arc::new(HashEmbedder::new(8)),
            SearchSettings::default(),
        );
        let err = search.search("uti", None, None).await.unwrap_err();
        assert!(matches!(err, SihragError::IndexNotReady));
        let err = search.search_batch(&["uti".to_string()], 3).await.unwrap_err();
        assert!(matches!(err, SihragError::IndexNotReady));
    }

    #[tokio::test]
    async fn children_resolve_to_parents() {
        let search = engine(SearchSettings::default()).await;
        let results = search.search("diárias de UTI laudo", Some(3), None).await.unwrap();
        assert_eq!(results[0].chunk_id, "s4");
        assert!(results.iter().all(|r| !r.chunk_id.contains("_c")));
        assert_eq!(results[0].section.as_deref(), Some("4.2"));
        assert_eq!(results[0].source_document, "Manual SIH");
    }

    #[tokio::test]
    async fn leaves_returned_without_parent_resolution() {
        let mut settings = SearchSettings::default();
        settings.search.resolve_parents = false;
        let search = engine(settings).await;
        let results = search.search("diárias de UTI laudo", Some(1), None).await.unwrap();
        assert_eq!(ids(&results), vec!["s4_c0"]);
        assert_eq!(results[0].lexical_rank, Some(1));
    }

    #[tokio::test]
    async fn section_hint_pins_exact_match() {
        let search = engine(SearchSettings::default()).await;
        let results = search.search("4.2", Some(3), None).await.unwrap();
        assert_eq!(results[0].chunk_id, "s4");
        let max = search.settings.fusion.section_number.lexical
            + search.settings.fusion.section_number.semantic;
        assert!((results[0].fused_score - max / 61.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn explicit_section_pins_even_for_free_text() {
        let search = engine(SearchSettings::default()).await;
        let request = SearchRequest::new("órteses e próteses OPM")
            .with_section("1")
            .with_top_k(2);
        let results = search.search_request(&request).await.unwrap();
        assert_eq!(ids(&results), vec!["s1", "s5"]);
    }

    #[tokio::test]
    async fn explicit_filter_never_falls_back() {
        let search = engine(SearchSettings::default()).await;
        let request = SearchRequest::new("diárias de UTI").with_filter(MetadataFilter {
            year: Some(2020),
            document_type: None,
        });
        assert!(search.search_request(&request).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn derived_filter_falls_back_when_it_matches_nothing() {
        let search = engine(SearchSettings::default()).await;
        let results = search
            .search("diárias de UTI na portaria de 2020", Some(2), None)
            .await
            .unwrap();
        assert_eq!(results[0].chunk_id, "s4");
    }

    #[tokio::test]
    async fn zero_top_k_is_empty() {
        let search = engine(SearchSettings::default()).await;
        assert!(search.search("uti", Some(0), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_keeps_best_score_and_origin() {
        let search = engine(SearchSettings::default()).await;
        let queries = vec!["OPM procedimento principal".to_string(), "UTI laudo".to_string()];
        let merged = search.search_batch(&queries, 2).await.unwrap();
        let opm = merged.iter().find(|e| e.entry.chunk_id == "s5").unwrap();
        assert_eq!(opm.query_origin, "OPM procedimento principal");
        let uti = merged.iter().find(|e| e.entry.chunk_id == "s4").unwrap();
        assert_eq!(uti.query_origin, "UTI laudo");
        let mut seen = std::collections::HashSet::new();
        assert!(merged.iter().all(|e| seen.insert(e.entry.chunk_id.clone())));
        assert!(merged
            .windows(2)
            .all(|w| w[0].entry.fused_score >= w[1].entry.fused_score));
    }

    /// Scores 1 for passages containing a marker, 0 otherwise.
    struct Marker(&'static str);

    #[async_trait::async_trait]
    impl Reranker for Marker {
        fn name(&self) -> &str {
            "marker"
        }

        async fn score(&self, _query: &str, passages: &[String]) -> Result<Vec<f32>, SihragError> {
            Ok(passages
                .iter()
                .map(|p| if p.contains(self.0) { 1.0 } else { 0.0 })
                .collect())
        }
    }

    struct Broken;

    #[async_trait::async_trait]
    impl Reranker for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn score(&self, _query: &str, _passages: &[String]) -> Result<Vec<f32>, SihragError> {
            Err(SihragError::RerankUnavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn reranker_reorders_long_queries() {
        let query = "diárias de UTI laudo procedimento";
        let plain = engine(SearchSettings::default()).await;
        let before = plain.search(query, Some(3), None).await.unwrap();
        assert_eq!(before[0].chunk_id, "s4");
        assert!(before.iter().all(|e| e.rerank_score.is_none()));

        let reranked = engine(SearchSettings::default())
            .await
            .with_reranker(Arc::new(Marker("OPM")));
        let after = reranked.search(query, Some(3), None).await.unwrap();
        assert_eq!(after[0].chunk_id, "s5");
        assert_eq!(after[0].rerank_score, Some(1.0));
    }

    #[tokio::test]
    async fn short_queries_skip_the_reranker() {
        let search = engine(SearchSettings::default())
            .await
            .with_reranker(Arc::new(Marker("OPM")));
        let results = search.search("UTI laudo", Some(3), None).await.unwrap();
        assert_eq!(results[0].chunk_id, "s4");
        assert!(results.iter().all(|e| e.rerank_score.is_none()));
    }

    #[tokio::test]
    async fn failing_reranker_keeps_fused_order() {
        let query = "diárias de UTI laudo procedimento";
        let plain = engine(SearchSettings::default()).await;
        let broken = engine(SearchSettings::default())
            .await
            .with_reranker(Arc::new(Broken));
        let expected = plain.search(query, Some(3), None).await.unwrap();
        let actual = broken.search(query, Some(3), None).await.unwrap();
        assert_eq!(ids(&actual), ids(&expected));
    }

    /// Holds every query embedding until `barrier` has that many waiters.
    struct Gated {
        inner: HashEmbedder,
        barrier: tokio::sync::Barrier,
    }

    #[async_trait::async_trait]
    impl Embedder for Gated {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SihragError> {
            self.inner.embed_batch(texts).await
        }

        async fn embed_query(&self, query: &str) -> Result<Vec<f32>, SihragError> {
            self.barrier.wait().await;
            self.inner.embed_query(query).await
        }
    }

    #[tokio::test]
    async fn sub_query_embeddings_are_in_flight_together() {
        let query = "regras de OPM e diárias de UTI";
        let sub_queries = decompose(query).len();
        assert!(sub_queries > 1);

        let handle = engine(SearchSettings::default()).await.handle().clone();
        let gated: Arc<dyn Embedder> = Arc::new(Gated {
            inner: HashEmbedder::new(256),
            barrier: tokio::sync::Barrier::new(sub_queries),
        });
        let search = HybridSearch::new(handle, gated, SearchSettings::default());
        let results = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            search.search(query, Some(3), Some(QueryHint::FreeForm)),
        )
        .await
        .expect("embeddings ran one after another")
        .unwrap();
        assert!(!results.is_empty());
    }

    #[test]
    fn pinning_moves_section_hits_to_the_front() {
        let store = corpus();
        let hit = |id: &str, score: f64, rank: usize| FusedHit {
            id: id.into(),
            score,
            lexical_rank: Some(rank),
            semantic_rank: None,
            rerank_score: Some(0.5),
        };
        let mut ranked = vec![hit("s5", 0.03, 1), hit("s4", 0.02, 2), hit("s1", 0.01, 3)];
        let pinned = pin_section(&store, "4.2", None, true, 0.5, &mut ranked);
        assert_eq!(pinned.len(), 1);
        assert_eq!(pinned[0].id, "s4");
        assert_eq!(pinned[0].score, 0.5);
        assert_eq!(pinned[0].lexical_rank, Some(2));
        assert_eq!(pinned[0].rerank_score, Some(0.5));
        let rest: Vec<_> = ranked.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(rest, vec!["s5", "s1"]);

        let mut none = Vec::new();
        let unseen = pin_section(&store, "5", None, true, 0.5, &mut none);
        assert_eq!(unseen[0].id, "s5");
        assert_eq!(unseen[0].lexical_rank, None);
    }

    #[test]
    fn collapse_keeps_best_ranks() {
        let store = corpus();
        let fused = vec![
            FusedHit {
                id: "s1_c1".into(),
                score: 0.03,
                lexical_rank: Some(2),
                semantic_rank: Some(1),
                rerank_score: None,
            },
            FusedHit {
                id: "s4_c0".into(),
                score: 0.02,
                lexical_rank: Some(3),
                semantic_rank: None,
                rerank_score: None,
            },
            FusedHit {
                id: "s1_c0".into(),
                score: 0.01,
                lexical_rank: Some(1),
                semantic_rank: None,
                rerank_score: None,
            },
        ];
        let collapsed = collapse(&store, fused, true);
        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[0].id, "s1");
        assert_eq!(collapsed[0].score, 0.03);
        assert_eq!(collapsed[0].lexical_rank, Some(1));
        assert_eq!(collapsed[0].semantic_rank, Some(1));
        assert_eq!(collapsed[1].id, "s4");
    }

    #[test]
    fn section_comparison_ignores_trailing_dot() {
        assert!(same_section("4.2.", "4.2"));
        assert!(!same_section("4.2.1", "4.2"));
    }
}
