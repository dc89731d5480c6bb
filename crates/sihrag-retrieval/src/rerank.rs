//! Second-stage reranking of fused candidates.
//!
//! A [`Reranker`] scores `(query, passage)` pairs jointly, the way a
//! cross-encoder does, and reorders the head of the fused list.
//! [`HttpReranker`] talks to a `/rerank` endpoint serving a cross-encoder;
//! [`OverlapReranker`] is a deterministic offline stand-in.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sihrag_core::{RerankConfig, SihragError};

use crate::fusion::FusedHit;
use crate::normalize::analyze;
use crate::store::ChunkStore;

/// Environment variable consulted when `rerank.api_key` is unset.
pub const API_KEY_ENV: &str = "SIHRAG_RERANK_API_KEY";

/// Queries with at most this many words are not reranked.
pub const SHORT_QUERY_WORDS: usize = 2;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Something that scores passages against a query.
///
/// Higher scores mean more relevant. Failures surface as
/// [`SihragError::RerankUnavailable`].
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Model identifier, for logs.
    fn name(&self) -> &str;

    /// One score per passage, in input order.
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, SihragError>;
}

/// Build the reranker selected by `config.provider`; `"none"` gives `None`.
///
/// # Errors
///
/// Returns [`SihragError::Config`] for an unknown provider or a client that
/// cannot be constructed.
///
/// # Examples
///
/// ```
/// use sihrag_core::RerankConfig;
/// use sihrag_retrieval::rerank::from_config;
///
/// assert!(from_config(&RerankConfig::default()).unwrap().is_none());
/// let config = RerankConfig { provider: "overlap".into(), ..Default::default() };
/// assert_eq!(from_config(&config).unwrap().unwrap().name(), "term-overlap");
/// ```
pub fn from_config(config: &RerankConfig) -> Result<Option<Arc<dyn Reranker>>, SihragError> {
    match config.provider.as_str() {
        "none" | "" => Ok(None),
        "http" => Ok(Some(Arc::new(HttpReranker::with_config(config)?))),
        "overlap" => Ok(Some(Arc::new(OverlapReranker))),
        other => Err(SihragError::Config(format!(
            "unknown rerank provider `{other}` (expected \"none\", \"http\" or \"overlap\")"
        ))),
    }
}

/// Returns `true` for queries the reranker should not touch: two words or
/// fewer, or nothing but digits. Lexical matching is more reliable there.
///
/// # Examples
///
/// ```
/// use sihrag_retrieval::rerank::is_short_query;
///
/// assert!(is_short_query("diárias UTI"));
/// assert!(is_short_query(" 0301010010 "));
/// assert!(!is_short_query("diárias de UTI adulto"));
/// ```
pub fn is_short_query(query: &str) -> bool {
    let trimmed = query.trim();
    trimmed.split_whitespace().count() <= SHORT_QUERY_WORDS
        || (!trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()))
}

/// Rescore the first `pool` hits and move them into reranker order.
///
/// Hits whose chunk is missing from `store` are dropped from the head.
/// Hits past the pool keep their fused order after the rescored ones.
/// Ties on the reranker score keep fused order.
///
/// # Errors
///
/// Propagates reranker failures, and returns
/// [`SihragError::RerankUnavailable`] if the score count is wrong.
pub async fn rerank_hits(
    reranker: &dyn Reranker,
    query: &str,
    store: &ChunkStore,
    mut hits: Vec<FusedHit>,
    pool: usize,
) -> Result<Vec<FusedHit>, SihragError> {
    let tail = hits.split_off(pool.min(hits.len()));
    let (head, passages): (Vec<FusedHit>, Vec<String>) = hits
        .into_iter()
        .filter_map(|hit| {
            let text = store.get(&hit.id)?.text.clone();
            Some((hit, text))
        })
        .unzip();
    if head.is_empty() {
        return Ok(tail);
    }

    let scores = reranker.score(query, &passages).await?;
    if scores.len() != head.len() {
        return Err(SihragError::RerankUnavailable(format!(
            "expected {} scores, got {}",
            head.len(),
            scores.len()
        )));
    }

    let mut rescored: Vec<FusedHit> = head
        .into_iter()
        .zip(scores)
        .map(|(hit, score)| FusedHit {
            rerank_score: Some(f64::from(score)),
            ..hit
        })
        .collect();
    // Stable sort keeps fused order among equal scores.
    rescored.sort_by(|a, b| {
        b.rerank_score
            .unwrap_or(f64::NEG_INFINITY)
            .total_cmp(&a.rerank_score.unwrap_or(f64::NEG_INFINITY))
    });
    tracing::debug!(
        model = reranker.name(),
        rescored = rescored.len(),
        "reranked fused candidates"
    );
    rescored.extend(tail);
    Ok(rescored)
}

/// Client for a cross-encoder `/rerank` endpoint.
///
/// Speaks the request/response shape of text-embeddings-inference:
/// `{"query", "texts"}` in, `[{"index", "score"}]` out.
///
/// # Examples
///
/// ```
/// use sihrag_retrieval::rerank::{HttpReranker, Reranker};
///
/// let reranker = HttpReranker::new("http://localhost:8081/", "cross-encoder/ms-marco-MiniLM-L-6-v2");
/// assert_eq!(reranker.name(), "cross-encoder/ms-marco-MiniLM-L-6-v2");
/// ```
pub struct HttpReranker {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl std::fmt::Debug for HttpReranker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpReranker")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    texts: &'a [String],
    truncate: bool,
}

#[derive(Debug, Deserialize)]
struct RerankItem {
    index: usize,
    score: f32,
}

impl HttpReranker {
    /// Create a client without an API key.
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: None,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    /// Create a client from a [`RerankConfig`], falling back to
    /// `SIHRAG_RERANK_API_KEY` for the key.
    ///
    /// # Errors
    ///
    /// Returns [`SihragError::Config`] if the HTTP client cannot be built.
    pub fn with_config(config: &RerankConfig) -> Result<Self, SihragError> {
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
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    fn name(&self) -> &str {
        &self.model
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, SihragError> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .json(&RerankRequest {
                query,
                texts: passages,
                truncate: true,
            });
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SihragError::RerankUnavailable(format!("HTTP request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read response body".into());
            return Err(SihragError::RerankUnavailable(format!(
                "rerank endpoint returned {status}: {body}"
            )));
        }

        let items: Vec<RerankItem> = response.json().await.map_err(|e| {
            SihragError::RerankUnavailable(format!("failed to parse response: {e}"))
        })?;
        scores_in_order(items, passages.len())
    }
}

/// Scatter `{index, score}` items back into input order.
fn scores_in_order(items: Vec<RerankItem>, expected: usize) -> Result<Vec<f32>, SihragError> {
    let mut scores = vec![None; expected];
    for item in items {
        match scores.get_mut(item.index) {
            Some(slot) => *slot = Some(item.score),
            None => {
                return Err(SihragError::RerankUnavailable(format!(
                    "score index {} out of range for {expected} passages",
                    item.index
                )))
            }
        }
    }
    scores
        .into_iter()
        .enumerate()
        .map(|(i, s)| {
            s.ok_or_else(|| SihragError::RerankUnavailable(format!("no score for passage {i}")))
        })
        .collect()
}

/// Offline reranker scoring the share of query terms a passage contains.
///
/// Each distinct analyzed query term found in the passage counts 1, and
/// each adjacent query-term pair found adjacent in the passage counts 1
/// more; the total is divided by the maximum possible.
///
/// # Examples
///
/// ```
/// use sihrag_retrieval::rerank::OverlapReranker;
///
/// let full = OverlapReranker::overlap("diárias de UTI adulto", "As diárias de UTI adulto exigem laudo");
/// let partial = OverlapReranker::overlap("diárias de UTI adulto", "Leitos de UTI");
/// assert_eq!(full, 1.0);
/// assert!(partial > 0.0 && partial < full);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlapReranker;

impl OverlapReranker {
    /// Score one passage against `query`, in `[0, 1]`.
    pub fn overlap(query: &str, passage: &str) -> f32 {
        let mut terms = analyze(query);
        let mut seen = HashSet::new();
        terms.retain(|t| seen.insert(t.clone()));
        if terms.is_empty() {
            return 0.0;
        }

        let passage_terms = analyze(passage);
        let words: HashSet<&str> = passage_terms.iter().map(String::as_str).collect();
        let pairs: HashSet<(&str, &str)> = passage_terms
            .windows(2)
            .map(|w| (w[0].as_str(), w[1].as_str()))
            .collect();

        let hits = terms.iter().filter(|t| words.contains(t.as_str())).count();
        let pair_hits = terms
            .windows(2)
            .filter(|w| pairs.contains(&(w[0].as_str(), w[1].as_str())))
            .count();
        let possible = terms.len() + terms.len().saturating_sub(1);
        (hits + pair_hits) as f32 / possible as f32
    }
}

#[async_trait]
impl Reranker for OverlapReranker {
    fn name(&self) -> &str {
        "term-overlap"
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, SihragError> {
        Ok(passages.iter().map(|p| Self::overlap(query, p)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sihrag_core::{Chunk, ChunkKind, SourceMetadata};

    fn hit(id: &str, score: f64) -> FusedHit {
        FusedHit {
            id: id.into(),
            score,
            lexical_rank: None,
            semantic_rank: None,
            rerank_score: None,
        }
    }

    fn store() -> ChunkStore {
        let chunk = |id: &str, text: &str| Chunk {
            id: id.into(),
            text: text.into(),
            parent_id: None,
            kind: ChunkKind::GenericPage,
            source_metadata: SourceMetadata::new("Manual"),
        };
        ChunkStore::from_chunks(vec![
            chunk("a", "tabela de procedimentos"),
            chunk("b", "diárias de UTI adulto exigem laudo"),
            chunk("c", "UTI neonatal"),
        ])
        .unwrap()
    }

    struct Fixed(Vec<f32>);

    #[async_trait]
    impl Reranker for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn score(&self, _query: &str, passages: &[String]) -> Result<Vec<f32>, SihragError> {
            Ok(self.0.iter().copied().take(passages.len()).collect())
        }
    }

    #[test]
    fn short_queries() {
        assert!(is_short_query("UTI"));
        assert!(is_short_query("4.2"));
        assert!(is_short_query(""));
        assert!(!is_short_query("como cobrar diárias de UTI"));
    }

    #[tokio::test]
    async fn head_is_reordered_and_tail_kept() {
        let hits = vec![hit("a", 0.3), hit("c", 0.2), hit("b", 0.1)];
        let out = rerank_hits(&OverlapReranker, "diárias de UTI adulto", &store(), hits, 2)
            .await
            .unwrap();
        let ids: Vec<_> = out.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert!(out[0].rerank_score.unwrap() > out[1].rerank_score.unwrap());
        assert!(out[2].rerank_score.is_none());
        assert_eq!(out[0].score, 0.2);
    }

    #[tokio::test]
    async fn equal_scores_keep_fused_order() {
        let hits = vec![hit("b", 0.3), hit("a", 0.2), hit("c", 0.1)];
        let out = rerank_hits(&Fixed(vec![0.5, 0.5, 0.9]), "q w e", &store(), hits, 10)
            .await
            .unwrap();
        let ids: Vec<_> = out.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn unknown_ids_are_dropped_from_the_head() {
        let hits = vec![hit("ghost", 0.3), hit("b", 0.2)];
        let out = rerank_hits(&OverlapReranker, "diárias de UTI", &store(), hits, 5)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "b");
    }

    #[tokio::test]
    async fn wrong_score_count_is_an_error() {
        let hits = vec![hit("a", 0.3), hit("b", 0.2)];
        let err = rerank_hits(&Fixed(vec![1.0]), "q w e", &store(), hits, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, SihragError::RerankUnavailable(_)));
    }

    #[test]
    fn response_items_are_scattered_by_index() {
        let items = vec![
            RerankItem { index: 1, score: 0.2 },
            RerankItem { index: 0, score: 0.9 },
        ];
        assert_eq!(scores_in_order(items, 2).unwrap(), vec![0.9, 0.2]);
        let missing = vec![RerankItem { index: 0, score: 0.9 }];
        assert!(scores_in_order(missing, 2).is_err());
        let stray = vec![RerankItem { index: 5, score: 0.9 }];
        assert!(scores_in_order(stray, 1).is_err());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let config = RerankConfig {
            provider: "bogus".into(),
            ..Default::default()
        };
        assert!(matches!(from_config(&config), Err(SihragError::Config(_))));
    }
}
