//! Hybrid retrieval over SIH/SUS regulatory documents.
//!
//! Source documents are split into parent/child chunks, indexed twice (BM25
//! over normalized tokens and dense embeddings), and queried through a
//! weighted Reciprocal Rank Fusion of both rankings. Index builds publish
//! immutable snapshots, so queries never observe a half-built index.

pub mod chunker;
pub mod embedding;
pub mod fusion;
pub mod indexing;
pub mod lexical;
pub mod normalize;
pub mod query;
pub mod rerank;
pub mod search;
pub mod semantic;
pub mod snapshot;
pub mod store;

pub use chunker::{Chunker, ChunkingOutput, IngestionEvent, IngestionReport, SourceDocument};
pub use embedding::{Embedder, HashEmbedder, HttpEmbedder};
pub use indexing::{BuildReport, IndexingJob};
pub use rerank::{HttpReranker, OverlapReranker, Reranker};
pub use search::{BatchEntry, HybridSearch, SearchRequest, SearchSettings};
pub use snapshot::{IndexHandle, IndexSnapshot};
pub use store::ChunkStore;
