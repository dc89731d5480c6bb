//! Dense-vector index: exact cosine similarity over normalized embeddings.

use futures::{StreamExt, TryStreamExt};
use sihrag_core::SihragError;

use crate::embedding::Embedder;
use crate::fusion::{by_score_then_id, Hit};
use crate::store::IndexEntry;

/// Scale `v` to unit length in place. A zero vector is left untouched.
///
/// # Examples
///
/// ```
/// use sihrag_retrieval::semantic::l2_normalize;
///
/// let mut v = vec![3.0, 4.0];
/// l2_normalize(&mut v);
/// assert!((v[0] - 0.6).abs() < 1e-6);
/// assert!((v[1] - 0.8).abs() < 1e-6);
/// ```
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum()
}

/// One embedding per leaf chunk, searched by brute-force cosine.
///
/// Vectors are stored normalized, so cosine similarity is a dot product.
#[derive(Debug, Clone)]
pub struct SemanticIndex {
    model: String,
    dimensions: usize,
    ids: Vec<String>,
    vectors: Vec<Vec<f32>>,
}

impl SemanticIndex {
    /// Embed every entry and index the results.
    ///
    /// Batches of `batch_size` texts are sent with up to `concurrency`
    /// requests in flight; results are inserted in entry order.
    ///
    /// # Errors
    ///
    /// Returns [`SihragError::EmbeddingUnavailable`] if any batch fails, or
    /// [`SihragError::DimensionMismatch`] if a vector has the wrong length.
    pub async fn build(
        entries: &[IndexEntry],
        embedder: &dyn Embedder,
        batch_size: usize,
        concurrency: usize,
    ) -> Result<Self, SihragError> {
        let batch_size = batch_size.max(1);
        let batches: Vec<Vec<String>> = entries
            .chunks(batch_size)
            .map(|batch| batch.iter().map(|e| e.text.clone()).collect())
            .collect();
        let total = batches.len();

        let embedded: Vec<Vec<Vec<f32>>> = futures::stream::iter(batches.into_iter().enumerate())
            .map(|(i, texts)| async move {
                let vectors = embedder.embed_batch(&texts).await?;
                tracing::debug!(batch = i + 1, of = total, "embedded batch");
                if vectors.len() != texts.len() {
                    return Err(SihragError::EmbeddingUnavailable(format!(
                        "batch {} returned {} vectors for {} texts",
                        i + 1,
                        vectors.len(),
                        texts.len()
                    )));
                }
                Ok(vectors)
            })
            .buffered(concurrency.max(1))
            .try_collect()
            .await?;

        let mut index = Self::empty(embedder.name(), embedder.dimensions());
        for (entry, mut vector) in entries.iter().zip(embedded.into_iter().flatten()) {
            l2_normalize(&mut vector);
            index.insert(entry.id.clone(), vector)?;
        }
        Ok(index)
    }

    /// An index with no vectors.
    pub fn empty(model: &str, dimensions: usize) -> Self {
        Self {
            model: model.to_string(),
            dimensions,
            ids: Vec::new(),
            vectors: Vec::new(),
        }
    }

    /// Reassemble an index from persisted ids and vectors.
    ///
    /// Vectors are taken as stored; they are expected to be normalized
    /// already, as [`build`](Self::build) leaves them.
    ///
    /// # Errors
    ///
    /// Returns [`SihragError::DimensionMismatch`] if any vector has the
    /// wrong length, or [`SihragError::InvalidChunkStore`] if the two lists
    /// differ in length.
    pub fn from_parts(
        model: &str,
        dimensions: usize,
        ids: Vec<String>,
        vectors: Vec<Vec<f32>>,
    ) -> Result<Self, SihragError> {
        if ids.len() != vectors.len() {
            return Err(SihragError::InvalidChunkStore(format!(
                "{} ids but {} vectors",
                ids.len(),
                vectors.len()
            )));
        }
        let mut index = Self::empty(model, dimensions);
        for (id, vector) in ids.into_iter().zip(vectors) {
            index.insert(id, vector)?;
        }
        Ok(index)
    }

    fn insert(&mut self, id: String, vector: Vec<f32>) -> Result<(), SihragError> {
        if vector.len() != self.dimensions {
            return Err(SihragError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        self.ids.push(id);
        self.vectors.push(vector);
        Ok(())
    }

    /// Embedding model the vectors came from.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Vector length.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns `true` if nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// `(id, vector)` pairs in index order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &[f32])> {
        self.ids
            .iter()
            .zip(&self.vectors)
            .map(|(id, v)| (id.as_str(), v.as_slice()))
    }

    /// Top `k` entries by cosine similarity to `query`.
    ///
    /// Entries with similarity `<= 0` are not returned. `filter` is applied
    /// before truncation.
    ///
    /// # Errors
    ///
    /// Returns [`SihragError::DimensionMismatch`] if `query` has the wrong length.
    ///
    /// # Examples
    ///
    /// ```
    /// use sihrag_retrieval::semantic::SemanticIndex;
    ///
    /// let index = SemanticIndex::from_parts(
    ///     "toy",
    ///     2,
    ///     vec!["x".into(), "y".into()],
    ///     vec![vec![1.0, 0.0], vec![0.0, 1.0]],
    /// )
    /// .unwrap();
    /// let hits = index.search_vector(&[0.9, 0.1], 5, None).unwrap();
    /// assert_eq!(hits[0].id, "x");
    /// assert!(index.search_vector(&[1.0], 5, None).is_err());
    /// ```
    pub fn search_vector(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&dyn Fn(&str) -> bool>,
    ) -> Result<Vec<Hit>, SihragError> {
        if query.len() != self.dimensions {
            return Err(SihragError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }
        let mut query = query.to_vec();
        l2_normalize(&mut query);

        let mut hits: Vec<Hit> = self
            .entries()
            .filter(|(id, _)| filter.map_or(true, |keep| keep(id)))
            .map(|(id, v)| Hit::new(id, dot(&query, v)))
            .filter(|hit| hit.score > 0.0)
            .collect();
        hits.sort_by(|a, b| by_score_then_id(a.score, &a.id, b.score, &b.id));
        hits.truncate(k);
        Ok(hits)
    }

    /// Embed `query` with `embedder` and search.
    ///
    /// # Errors
    ///
    /// Propagates embedding failures and dimension mismatches.
    pub async fn search(
        &self,
        query: &str,
        embedder: &dyn Embedder,
        k: usize,
        filter: Option<&dyn Fn(&str) -> bool>,
    ) -> Result<Vec<Hit>, SihragError> {
        let vector = embedder.embed_query(query).await?;
        self.search_vector(&vector, k, filter)
    }
}
