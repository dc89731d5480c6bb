//! The chunk store: the parent/child chunk hierarchy of one corpus snapshot.
//!
//! A store is validated on construction, so every lookup can assume ids
//! are unique and every `parent_id` resolves.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use sha2::{Digest, Sha256};
use sihrag_core::{Chunk, SihragError};

/// A chunk as seen by an index: its id and the text to index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Chunk id.
    pub id: String,
    /// Context header plus chunk text.
    pub text: String,
}

/// An immutable, validated set of chunks in insertion order.
///
/// # Examples
///
/// ```
/// use sihrag_core::{Chunk, ChunkKind, SourceMetadata};
/// use sihrag_retrieval::store::ChunkStore;
///
/// let parent = Chunk {
///     id: "doc_p1".into(),
///     text: "Texto completo da página.".into(),
///     parent_id: None,
///     kind: ChunkKind::GenericPage,
///     source_metadata: SourceMetadata::new("Doc"),
/// };
/// let child = Chunk {
///     id: "doc_p1_c0".into(),
///     parent_id: Some("doc_p1".into()),
///     ..parent.clone()
/// };
/// let store = ChunkStore::from_chunks(vec![parent, child]).unwrap();
/// assert_eq!(store.len(), 2);
/// assert_eq!(store.parent_of("doc_p1_c0").unwrap().id, "doc_p1");
/// assert_eq!(store.leaves().count(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ChunkStore {
    chunks: Vec<Chunk>,
    by_id: HashMap<String, usize>,
    children: HashMap<String, Vec<usize>>,
}

impl ChunkStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store, checking that ids are unique and parents resolve.
    ///
    /// # Errors
    ///
    /// Returns [`SihragError::InvalidChunkStore`] naming the first offending
    /// chunk.
    pub fn from_chunks(chunks: Vec<Chunk>) -> Result<Self, SihragError> {
        let mut by_id = HashMap::with_capacity(chunks.len());
        for (idx, chunk) in chunks.iter().enumerate() {
            if by_id.insert(chunk.id.clone(), idx).is_some() {
                return Err(SihragError::InvalidChunkStore(format!(
                    "duplicate chunk id `{}`",
                    chunk.id
                )));
            }
        }

        let mut children: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, chunk) in chunks.iter().enumerate() {
            if let Some(parent_id) = &chunk.parent_id {
                if parent_id == &chunk.id {
                    return Err(SihragError::InvalidChunkStore(format!(
                        "chunk `{}` is its own parent",
                        chunk.id
                    )));
                }
                if !by_id.contains_key(parent_id) {
                    return Err(SihragError::InvalidChunkStore(format!(
                        "chunk `{}` refers to missing parent `{parent_id}`",
                        chunk.id
                    )));
                }
                children.entry(parent_id.clone()).or_default().push(idx);
            }
        }

        Ok(Self {
            chunks,
            by_id,
            children,
        })
    }

    /// Number of chunks, parents and children together.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Returns `true` if the store holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Look up a chunk by id.
    pub fn get(&self, id: &str) -> Option<&Chunk> {
        self.by_id.get(id).map(|&idx| &self.chunks[idx])
    }

    /// The parent of chunk `id`, if it is a child.
    pub fn parent_of(&self, id: &str) -> Option<&Chunk> {
        self.get(id)
            .and_then(|c| c.parent_id.as_deref())
            .and_then(|pid| self.get(pid))
    }

    /// Children of chunk `id`, in insertion order.
    pub fn children_of(&self, id: &str) -> Vec<&Chunk> {
        self.children
            .get(id)
            .map(|idxs| idxs.iter().map(|&i| &self.chunks[i]).collect())
            .unwrap_or_default()
    }

    /// All chunks in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    /// Chunks without children: the units both indexes are built over.
    pub fn leaves(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks
            .iter()
            .filter(|c| !self.children.contains_key(&c.id))
    }

    /// What the indexes see: every leaf's id and context-prefixed text.
    pub fn index_entries(&self) -> Vec<IndexEntry> {
        self.leaves()
            .map(|c| IndexEntry {
                id: c.id.clone(),
                text: c.indexed_text(),
            })
            .collect()
    }

    /// Distinct document names in order of first appearance.
    pub fn documents(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.chunks
            .iter()
            .map(|c| c.source_metadata.document.as_str())
            .filter(|d| seen.insert(*d))
            .collect()
    }

    /// Consume the store and return its chunks.
    pub fn into_chunks(self) -> Vec<Chunk> {
        self.chunks
    }

    /// Merge `other` into this store. Every document present in `other`
    /// replaces that document's chunks here; other documents are kept.
    ///
    /// # Errors
    ///
    /// Returns [`SihragError::InvalidChunkStore`] if the merged set would
    /// contain duplicate ids. The store is left as it was.
    pub fn append(&mut self, other: ChunkStore) -> Result<(), SihragError> {
        let replaced: HashSet<String> = other.documents().into_iter().map(String::from).collect();
        let mut merged: Vec<Chunk> = self
            .chunks
            .iter()
            .filter(|c| !replaced.contains(&c.source_metadata.document))
            .cloned()
            .collect();
        let replaced_count = self.chunks.len() - merged.len();
        merged.extend(other.chunks);
        *self = Self::from_chunks(merged)?;
        if replaced_count > 0 {
            tracing::info!(
                documents = replaced.len(),
                chunks = replaced_count,
                "replaced chunks of re-chunked documents"
            );
        }
        Ok(())
    }

    /// SHA-256 over every chunk id and text, in order.
    ///
    /// Recorded in index snapshots so a caller can tell whether an index
    /// was built from this store.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for chunk in &self.chunks {
            hasher.update(chunk.id.as_bytes());
            hasher.update([0u8]);
            hasher.update(chunk.text.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    /// Load a store saved with [`ChunkStore::save`].
    ///
    /// # Errors
    ///
    /// Returns [`SihragError::FileNotFound`] if `path` does not exist,
    /// [`SihragError::Serialization`] for malformed JSON, or
    /// [`SihragError::InvalidChunkStore`] if the content violates an invariant.
    pub fn load(path: &Path) -> Result<Self, SihragError> {
        if !path.exists() {
            return Err(SihragError::FileNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let chunks: Vec<Chunk> = serde_json::from_str(&content)?;
        Self::from_chunks(chunks)
    }

    /// Write the store as a JSON array, replacing `path` atomically.
    ///
    /// # Errors
    ///
    /// Returns [`SihragError::Io`] if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), SihragError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&self.chunks)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), chunks = self.len(), "saved chunk store");
        Ok(())
    }
}
