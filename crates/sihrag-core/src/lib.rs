//! Core types, configuration, and error handling for sihrag.
//!
//! This crate provides the shared foundation used by the retrieval engine
//! and the CLI:
//! - [`SihragError`]: unified error type using `thiserror`
//! - [`SihragConfig`]: configuration loaded from `.sihrag.toml`
//! - Shared types: [`Chunk`], [`ChunkKind`], [`SourceMetadata`],
//!   [`DocumentType`], [`QueryHint`], [`ResultEntry`], [`OutputFormat`]

mod config;
mod error;
mod types;

pub use config::{
    ChunkingConfig, EmbeddingConfig, FusionConfig, FusionWeights, LexicalConfig, PathsConfig,
    RerankConfig, SearchConfig, SihragConfig,
};
pub use error::SihragError;
pub use types::{
    Chunk, ChunkKind, DocumentType, OutputFormat, QueryHint, ResultEntry, SourceMetadata,
};

/// A convenience `Result` type for sihrag operations.
pub type Result<T> = std::result::Result<T, SihragError>;
