//! Weighted Reciprocal Rank Fusion.
//!
//! Both indexes rank candidates on incomparable scales (BM25 vs. cosine),
//! so fusion only looks at ranks: `score = Σ w / (k + rank)`.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sihrag_core::FusionWeights;

/// A scored chunk id returned by one index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    /// Chunk id.
    pub id: String,
    /// Index-specific relevance score.
    pub score: f64,
}

impl Hit {
    /// Create a hit.
    pub fn new(id: impl Into<String>, score: f64) -> Self {
        Self {
            id: id.into(),
            score,
        }
    }
}

/// A fused candidate with the 1-based ranks it had in each list.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    /// Chunk id.
    pub id: String,
    /// Weighted RRF score.
    pub score: f64,
    /// Rank in the lexical list, if present there.
    pub lexical_rank: Option<usize>,
    /// Rank in the semantic list, if present there.
    pub semantic_rank: Option<usize>,
    /// Reranker relevance, once a reranker has rescored this hit.
    pub rerank_score: Option<f64>,
}

/// Parameters of one fusion call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionParams {
    /// RRF smoothing constant.
    pub k: f64,
    /// Signal weights.
    pub weights: FusionWeights,
}

impl FusionParams {
    /// Highest score any candidate can reach: rank 1 in both lists.
    pub fn max_score(&self) -> f64 {
        (self.weights.lexical + self.weights.semantic) / (self.k + 1.0)
    }
}

/// Order by score descending, then id ascending.
pub(crate) fn by_score_then_id(a_score: f64, a_id: &str, b_score: f64, b_id: &str) -> Ordering {
    b_score
        .partial_cmp(&a_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a_id.cmp(b_id))
}

fn rank_map(list: &[Hit]) -> HashMap<&str, usize> {
    let mut ranks = HashMap::with_capacity(list.len());
    for (i, hit) in list.iter().enumerate() {
        ranks.entry(hit.id.as_str()).or_insert(i + 1);
    }
    ranks
}

/// Fuse a lexical and a semantic ranking.
///
/// A candidate missing from one list takes rank `len + 1` there. A list
/// with weight 0 (or no hits) contributes neither score nor candidates, so
/// weights `(1, 0)` reproduce the lexical order exactly. Ties are broken
/// by id ascending.
///
/// # Examples
///
/// ```
/// use sihrag_core::FusionWeights;
/// use sihrag_retrieval::fusion::{fuse, FusionParams, Hit};
///
/// let lexical = vec![Hit::new("a", 7.1), Hit::new("b", 3.0)];
/// let semantic = vec![Hit::new("b", 0.9), Hit::new("c", 0.5)];
/// let params = FusionParams { k: 60.0, weights: FusionWeights::new(1.0, 1.0) };
///
/// let fused = fuse(&lexical, &semantic, params);
/// assert_eq!(fused[0].id, "b");
/// assert_eq!(fused[0].lexical_rank, Some(2));
/// assert_eq!(fused[0].semantic_rank, Some(1));
/// ```
pub fn fuse(lexical: &[Hit], semantic: &[Hit], params: FusionParams) -> Vec<FusedHit> {
    let lexical_ranks = rank_map(lexical);
    let semantic_ranks = rank_map(semantic);
    let use_lexical = params.weights.lexical > 0.0 && !lexical.is_empty();
    let use_semantic = params.weights.semantic > 0.0 && !semantic.is_empty();

    let mut candidates: Vec<&str> = Vec::new();
    if use_lexical {
        candidates.extend(lexical.iter().map(|h| h.id.as_str()));
    }
    if use_semantic {
        candidates.extend(semantic.iter().map(|h| h.id.as_str()));
    }

    let mut fused: HashMap<&str, FusedHit> = HashMap::new();
    for id in candidates {
        if fused.contains_key(id) {
            continue;
        }
        let lexical_rank = lexical_ranks.get(id).copied();
        let semantic_rank = semantic_ranks.get(id).copied();
        let mut score = 0.0;
        if use_lexical {
            let rank = lexical_rank.unwrap_or(lexical.len() + 1);
            score += params.weights.lexical / (params.k + rank as f64);
        }
        if use_semantic {
            let rank = semantic_rank.unwrap_or(semantic.len() + 1);
            score += params.weights.semantic / (params.k + rank as f64);
        }
        fused.insert(
            id,
            FusedHit {
                id: id.to_string(),
                score,
                lexical_rank,
                semantic_rank,
                rerank_score: None,
            },
        );
    }

    let mut results: Vec<FusedHit> = fused.into_values().collect();
    results.sort_by(|a, b| by_score_then_id(a.score, &a.id, b.score, &b.id));
    results
}

/// Collapse several rankings from the same index into one.
///
/// Used for the sub-queries of a decomposed question: each list adds
/// `1 / (k + rank)` per id. A single list is returned unchanged.
///
/// # Examples
///
/// ```
/// use sihrag_retrieval::fusion::{merge_ranked, Hit};
///
/// let first = vec![Hit::new("a", 2.0), Hit::new("b", 1.0)];
/// let second = vec![Hit::new("b", 5.0)];
/// let merged = merge_ranked(&[first, second], 60.0);
/// assert_eq!(merged[0].id, "b");
/// assert_eq!(merged.len(), 2);
/// ```
pub fn merge_ranked(lists: &[Vec<Hit>], k: f64) -> Vec<Hit> {
    match lists {
        [] => Vec::new(),
        [only] => only.clone(),
        _ => {
            let mut scores: HashMap<&str, f64> = HashMap::new();
            for list in lists {
                for (id, rank) in rank_map(list) {
                    *scores.entry(id).or_default() += 1.0 / (k + rank as f64);
                }
            }
            let mut merged: Vec<Hit> = scores
                .into_iter()
                .map(|(id, score)| Hit::new(id, score))
                .collect();
            merged.sort_by(|a, b| by_score_then_id(a.score, &a.id, b.score, &b.id));
            merged
        }
    }
}
