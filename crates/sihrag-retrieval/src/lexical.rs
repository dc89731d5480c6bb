//! Okapi BM25 over the leaf chunks of a store.
//!
//! Documents and queries go through the same [`analyze`] routine, so a
//! formatted procedure code in a question matches the bare digits in the
//! text and vice versa.

use std::collections::HashMap;

use sihrag_core::LexicalConfig;

use crate::fusion::{by_score_then_id, Hit};
use crate::normalize::analyze;
use crate::store::IndexEntry;

/// One occurrence list entry: `tf` occurrences of a term in document `doc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting {
    /// Position of the document in [`LexicalIndex::ids`].
    pub doc: u32,
    /// Term frequency in that document.
    pub tf: u32,
}

/// An inverted index scored with BM25.
///
/// # Examples
///
/// ```
/// use sihrag_core::LexicalConfig;
/// use sihrag_retrieval::lexical::LexicalIndex;
/// use sihrag_retrieval::store::IndexEntry;
///
/// let entries = vec![
///     IndexEntry { id: "a".into(), text: "procedimento 0301010010 internação clínica".into() },
///     IndexEntry { id: "b".into(), text: "habilitação de leito de UTI adulto".into() },
/// ];
/// let index = LexicalIndex::build(&entries, LexicalConfig::default());
/// let hits = index.search("03.01.01.001-0", 5, None);
/// assert_eq!(hits.len(), 1);
/// assert_eq!(hits[0].id, "a");
/// ```
#[derive(Debug, Clone)]
pub struct LexicalIndex {
    params: LexicalConfig,
    ids: Vec<String>,
    doc_lens: Vec<u32>,
    avg_doc_len: f64,
    postings: HashMap<String, Vec<Posting>>,
}

impl LexicalIndex {
    /// Index `entries` in order.
    pub fn build(entries: &[IndexEntry], params: LexicalConfig) -> Self {
        let mut ids = Vec::with_capacity(entries.len());
        let mut doc_lens = Vec::with_capacity(entries.len());
        let mut postings: HashMap<String, Vec<Posting>> = HashMap::new();

        for (doc, entry) in entries.iter().enumerate() {
            let terms = analyze(&entry.text);
            let mut counts: HashMap<String, u32> = HashMap::new();
            for term in &terms {
                *counts.entry(term.clone()).or_default() += 1;
            }
            for (term, tf) in counts {
                postings.entry(term).or_default().push(Posting {
                    doc: doc as u32,
                    tf,
                });
            }
            ids.push(entry.id.clone());
            doc_lens.push(terms.len() as u32);
        }

        for list in postings.values_mut() {
            list.sort_by_key(|p| p.doc);
        }

        Self::from_parts(params, ids, doc_lens, postings)
    }

    /// Reassemble an index from its persisted parts.
    pub fn from_parts(
        params: LexicalConfig,
        ids: Vec<String>,
        doc_lens: Vec<u32>,
        postings: HashMap<String, Vec<Posting>>,
    ) -> Self {
        let avg_doc_len = if doc_lens.is_empty() {
            0.0
        } else {
            doc_lens.iter().map(|&l| l as f64).sum::<f64>() / doc_lens.len() as f64
        };
        Self {
            params,
            ids,
            doc_lens,
            avg_doc_len,
            postings,
        }
    }

    /// Number of indexed documents.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns `true` if nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// BM25 parameters this index scores with.
    pub fn params(&self) -> LexicalConfig {
        self.params
    }

    /// Document ids in index order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Analyzed length of each document, parallel to [`ids`](Self::ids).
    pub fn doc_lens(&self) -> &[u32] {
        &self.doc_lens
    }

    /// Every term with its postings.
    pub fn postings(&self) -> impl Iterator<Item = (&str, &[Posting])> {
        self.postings
            .iter()
            .map(|(term, list)| (term.as_str(), list.as_slice()))
    }

    /// Number of documents containing `term`.
    pub fn document_frequency(&self, term: &str) -> usize {
        self.postings.get(term).map_or(0, Vec::len)
    }

    fn idf(&self, df: usize) -> f64 {
        let n = self.ids.len() as f64;
        let df = df as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    /// Top `k` documents for `query`, best first.
    ///
    /// Only documents with a positive score are returned, so a query with no
    /// known term yields nothing. `filter` is applied before truncation.
    /// Repeated query terms count once per occurrence.
    pub fn search(&self, query: &str, k: usize, filter: Option<&dyn Fn(&str) -> bool>) -> Vec<Hit> {
        if k == 0 || self.is_empty() {
            return Vec::new();
        }

        let k1 = self.params.k1;
        let b = self.params.b;
        let avg = if self.avg_doc_len > 0.0 {
            self.avg_doc_len
        } else {
            1.0
        };

        let mut scores: HashMap<u32, f64> = HashMap::new();
        for term in analyze(query) {
            let Some(list) = self.postings.get(&term) else {
                continue;
            };
            let idf = self.idf(list.len());
            for posting in list {
                let tf = posting.tf as f64;
                let len = self.doc_lens[posting.doc as usize] as f64;
                let norm = k1 * (1.0 - b + b * len / avg);
                *scores.entry(posting.doc).or_default() += idf * tf * (k1 + 1.0) / (tf + norm);
            }
        }

        let mut hits: Vec<Hit> = scores
            .into_iter()
            .filter(|(_, score)| *score > 0.0)
            .map(|(doc, score)| Hit::new(self.ids[doc as usize].clone(), score))
            .filter(|hit| filter.map_or(true, |keep| keep(&hit.id)))
            .collect();
        hits.sort_by(|a, b| by_score_then_id(a.score, &a.id, b.score, &b.id));
        hits.truncate(k);
        hits
    }
}
