use std::sync::Arc;

use sihrag_core::{
    Chunk, ChunkKind, ChunkingConfig, FusionWeights, QueryHint, SihragConfig, SihragError,
    SourceMetadata,
};
use sihrag_retrieval::chunker::{Chunker, DocumentMetadata, SourceDocument};
use sihrag_retrieval::embedding::{Embedder, HashEmbedder};
use sihrag_retrieval::indexing::IndexingJob;
use sihrag_retrieval::search::{HybridSearch, SearchRequest, SearchSettings};
use sihrag_retrieval::snapshot::{self, IndexHandle};
use sihrag_retrieval::store::ChunkStore;

const MANUAL: &str = "1 REGRAS GERAIS
A AIH é o instrumento de registro das internações hospitalares no SUS.

4.2 DIÁRIAS DE UTI
As diárias de UTI adulto exigem laudo e habilitação do leito.

5 ÓRTESES E PRÓTESES
A cobrança de OPM deve ser compatível com o procedimento principal.";

const ORDINANCE: &str = "Art. 1º Fica habilitado o hospital para leitos de UTI adulto tipo II.\n\nArt. 2º Esta portaria entra em vigor na data de sua publicação.";

fn document(id: &str, name: &str, text: &str) -> SourceDocument {
    SourceDocument {
        id: id.into(),
        text: text.into(),
        metadata: DocumentMetadata {
            name: name.into(),
            ..Default::default()
        },
    }
}

fn corpus() -> ChunkStore {
    Chunker::new(ChunkingConfig::default())
        .chunk_corpus(vec![
            document("manual", "Manual SIH/SUS 2017", MANUAL),
            document("p1", "Portaria SAS 1", ORDINANCE),
            document("vazio", "Documento vazio", "   "),
        ])
        .unwrap()
        .store
}

fn embedder() -> Arc<dyn Embedder> {
    Arc::new(HashEmbedder::new(512))
}

async fn engine(store: ChunkStore, settings: SearchSettings) -> HybridSearch {
    let embedder = embedder();
    let handle = Arc::new(IndexHandle::new());
    IndexingJob::from_config(&SihragConfig::default(), embedder.clone())
        .rebuild(&handle, store, None)
        .await
        .unwrap();
    HybridSearch::new(handle, embedder, settings)
}

fn single_profile(weights: FusionWeights) -> SearchSettings {
    let mut settings = SearchSettings::default();
    settings.fusion.free_form = weights;
    settings.fusion.procedure_code = weights;
    settings.fusion.section_number = weights;
    settings.search.resolve_parents = false;
    settings.search.decompose_queries = false;
    settings.search.auto_filters = false;
    settings
}

fn leaf(id: &str, text: &str) -> Chunk {
    Chunk {
        id: id.into(),
        text: text.into(),
        parent_id: None,
        kind: ChunkKind::GenericPage,
        source_metadata: SourceMetadata::new("Corpus"),
    }
}

#[test]
fn chunked_corpus_has_no_dangling_parents() {
    let store = corpus();
    assert!(store.len() >= 8);
    for chunk in store.iter() {
        if let Some(parent_id) = &chunk.parent_id {
            let parent = store.get(parent_id).expect("parent must exist");
            assert!(parent.parent_id.is_none());
        } else {
            assert!(!store.children_of(&chunk.id).is_empty());
        }
    }
}

#[test]
fn chunk_store_persists_field_for_field() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chunks.json");
    let store = corpus();
    store.save(&path).unwrap();
    let loaded = ChunkStore::load(&path).unwrap();
    assert_eq!(
        loaded.into_chunks(),
        store.iter().cloned().collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn rebuilding_unchanged_store_is_idempotent() {
    let first = engine(corpus(), SearchSettings::default()).await;
    let second = engine(corpus(), SearchSettings::default()).await;
    for query in ["diárias de UTI", "OPM", "4.2", "habilitação de leitos", "0301010010"] {
        assert_eq!(
            first.search(query, Some(5), None).await.unwrap(),
            second.search(query, Some(5), None).await.unwrap(),
            "query {query:?}"
        );
    }
}

#[tokio::test]
async fn literal_query_over_single_chunk_ranks_it_first() {
    let store = ChunkStore::from_chunks(vec![leaf(
        "only",
        "A AIH de cirurgia eletiva exige laudo médico",
    )])
    .unwrap();
    let search = engine(store, SearchSettings::default()).await;
    let results = search
        .search("A AIH de cirurgia eletiva exige laudo médico", None, None)
        .await
        .unwrap();
    assert_eq!(results[0].chunk_id, "only");
    assert!(results[0].fused_score > 0.0);
}

#[tokio::test]
async fn section_hint_returns_exact_section_first() {
    let search = engine(corpus(), SearchSettings::default()).await;

    let results = search
        .search("4.2", Some(3), Some(QueryHint::SectionNumber))
        .await
        .unwrap();
    assert_eq!(results[0].section.as_deref(), Some("4.2"));
    assert_eq!(results[0].title.as_deref(), Some("DIÁRIAS DE UTI"));

    let request = SearchRequest::new("OPM compatível com o procedimento principal")
        .with_section("4.2")
        .with_top_k(3);
    let results = search.search_request(&request).await.unwrap();
    assert_eq!(results[0].section.as_deref(), Some("4.2"));
    assert_eq!(results[1].section.as_deref(), Some("5"));
}

#[tokio::test]
async fn lexical_only_weights_reproduce_bm25_ranking() {
    let search = engine(corpus(), single_profile(FusionWeights::new(1.0, 0.0))).await;
    let snapshot = search.handle().current().unwrap();
    for query in ["UTI adulto", "laudo e habilitação", "procedimento principal"] {
        let fused: Vec<_> = search
            .search(query, Some(3), None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.chunk_id)
            .collect();
        let lexical: Vec<_> = snapshot
            .lexical
            .search(query, 3, None)
            .into_iter()
            .map(|h| h.id)
            .collect();
        assert_eq!(fused, lexical, "query {query:?}");
    }
}

#[tokio::test]
async fn semantic_only_weights_reproduce_vector_ranking() {
    let embedder = embedder();
    let search = engine(corpus(), single_profile(FusionWeights::new(0.0, 1.0))).await;
    let snapshot = search.handle().current().unwrap();
    for query in ["UTI adulto", "laudo e habilitação", "procedimento principal"] {
        let fused: Vec<_> = search
            .search(query, Some(3), None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.chunk_id)
            .collect();
        let semantic: Vec<_> = snapshot
            .semantic
            .search(query, embedder.as_ref(), 3, None)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.id)
            .collect();
        assert_eq!(fused, semantic, "query {query:?}");
    }
}

#[tokio::test]
async fn procedure_chunk_outranks_unrelated_chunk() {
    let store = ChunkStore::from_chunks(vec![
        leaf("a", "procedimento 0301010010 internação clínica"),
        leaf("b", "habilitação de leito UTI adulto"),
    ])
    .unwrap();
    let search = engine(store, SearchSettings::default()).await;
    let results = search.search("internação clínica", None, None).await.unwrap();

    assert_eq!(results[0].chunk_id, "a");
    assert!(results[0].fused_score > 0.0);
    if let Some(b) = results.iter().position(|r| r.chunk_id == "b") {
        assert!(b > 0);
        assert!(results[b].fused_score < results[0].fused_score);
    }
}

#[tokio::test]
async fn querying_before_any_build_is_not_ready() {
    let search = HybridSearch::new(
        Arc::new(IndexHandle::new()),
        embedder(),
        SearchSettings::default(),
    );
    let err = search.search("internação", None, None).await.unwrap_err();
    assert!(matches!(err, SihragError::IndexNotReady));

    let dir = tempfile::tempdir().unwrap();
    let err = snapshot::load(&dir.path().join("index.db")).unwrap_err();
    assert!(matches!(err, SihragError::IndexNotReady));
}

#[tokio::test]
async fn empty_corpus_is_fatal_at_indexing() {
    let output = Chunker::new(ChunkingConfig::default())
        .chunk_corpus(vec![document("vazio", "Documento vazio", "")])
        .unwrap();
    assert_eq!(output.report.events.len(), 1);

    let handle = IndexHandle::new();
    let err = IndexingJob::from_config(&SihragConfig::default(), embedder())
        .rebuild(&handle, output.store, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SihragError::EmptyCorpus));
    assert!(!handle.is_ready());
}

#[tokio::test]
async fn readers_keep_their_snapshot_across_rebuilds() {
    let embedder = embedder();
    let handle = Arc::new(IndexHandle::new());
    let job = IndexingJob::from_config(&SihragConfig::default(), embedder.clone());
    job.rebuild(&handle, corpus(), None).await.unwrap();
    let pinned = handle.current().unwrap();

    let search = HybridSearch::new(handle.clone(), embedder, SearchSettings::default());
    let replacement = ChunkStore::from_chunks(vec![leaf("novo", "tabela de procedimentos SIGTAP")])
        .unwrap();
    let (results, report) = tokio::join!(
        search.search("diárias de UTI", Some(3), None),
        job.rebuild(&handle, replacement, None),
    );
    assert!(!results.unwrap().is_empty());
    assert_eq!(report.unwrap().version, 2);

    assert_eq!(pinned.version, 1);
    assert!(pinned.store.len() > 1);
    assert_eq!(handle.current().unwrap().store.len(), 1);
}

#[tokio::test]
async fn persisted_snapshot_answers_like_the_live_one() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.db");
    let embedder = embedder();
    let live = Arc::new(IndexHandle::new());
    IndexingJob::from_config(&SihragConfig::default(), embedder.clone())
        .rebuild(&live, corpus(), Some(&path))
        .await
        .unwrap();

    let restored = Arc::new(IndexHandle::with_snapshot(snapshot::load(&path).unwrap()));
    let a = HybridSearch::new(live, embedder.clone(), SearchSettings::default());
    let b = HybridSearch::new(restored, embedder, SearchSettings::default());
    for query in ["diárias de UTI", "OPM", "5"] {
        assert_eq!(
            a.search(query, None, None).await.unwrap(),
            b.search(query, None, None).await.unwrap()
        );
    }
}
