//! Immutable index snapshots, the handle that publishes them, and their
//! SQLite persistence.
//!
//! A snapshot bundles the chunk store with both indexes built from it.
//! Readers clone an `Arc` to the snapshot current when they start; a rebuild
//! publishes a new snapshot without disturbing them.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sihrag_core::{Chunk, LexicalConfig, Result, SihragError};

use crate::lexical::{LexicalIndex, Posting};
use crate::semantic::SemanticIndex;
use crate::store::ChunkStore;

/// On-disk layout version. Bumped whenever a table changes shape.
pub const SCHEMA_VERSION: u32 = 1;

/// A chunk store together with the lexical and semantic indexes built
/// from it.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    /// Build generation, starting at 1.
    pub version: u64,
    /// When the build finished.
    pub built_at: DateTime<Utc>,
    /// [`ChunkStore::fingerprint`] of the store the indexes were built from.
    pub source_fingerprint: String,
    /// Embedding model behind the semantic index.
    pub embedding_model: String,
    /// The chunks, parents included.
    pub store: ChunkStore,
    /// BM25 index over the leaves.
    pub lexical: LexicalIndex,
    /// Vector index over the leaves.
    pub semantic: SemanticIndex,
}

impl IndexSnapshot {
    /// Assemble a snapshot stamped with the current time.
    pub fn new(
        version: u64,
        store: ChunkStore,
        lexical: LexicalIndex,
        semantic: SemanticIndex,
    ) -> Self {
        Self {
            version,
            built_at: Utc::now(),
            source_fingerprint: store.fingerprint(),
            embedding_model: semantic.model().to_string(),
            store,
            lexical,
            semantic,
        }
    }

    /// Returns `true` if this snapshot was built from `store`.
    ///
    /// Staleness is never checked automatically; callers decide when to
    /// rebuild.
    pub fn is_built_from(&self, store: &ChunkStore) -> bool {
        self.source_fingerprint == store.fingerprint()
    }
}

/// The shared reference to the active snapshot.
///
/// Passed explicitly to every search session. `publish` swaps the snapshot
/// atomically; sessions that already hold the previous one keep it alive
/// until they finish.
///
/// # Examples
///
/// ```
/// use sihrag_core::SihragError;
/// use sihrag_retrieval::snapshot::IndexHandle;
///
/// let handle = IndexHandle::new();
/// assert!(!handle.is_ready());
/// assert!(matches!(handle.current(), Err(SihragError::IndexNotReady)));
/// ```
#[derive(Debug, Default)]
pub struct IndexHandle {
    current: ArcSwapOption<IndexSnapshot>,
}

impl IndexHandle {
    /// A handle with nothing published.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle already holding `snapshot`.
    pub fn with_snapshot(snapshot: IndexSnapshot) -> Self {
        Self {
            current: ArcSwapOption::from_pointee(snapshot),
        }
    }

    /// The active snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`SihragError::IndexNotReady`] if no build has been published.
    pub fn current(&self) -> Result<Arc<IndexSnapshot>> {
        self.current.load_full().ok_or(SihragError::IndexNotReady)
    }

    /// Make `snapshot` active, returning the one it replaces.
    pub fn publish(&self, snapshot: IndexSnapshot) -> Option<Arc<IndexSnapshot>> {
        let version = snapshot.version;
        let previous = self.current.swap(Some(Arc::new(snapshot)));
        tracing::info!(version, "published index snapshot");
        previous
    }

    /// Returns `true` once a snapshot has been published.
    pub fn is_ready(&self) -> bool {
        self.current.load().is_some()
    }

    /// Version of the active snapshot, if any.
    pub fn version(&self) -> Option<u64> {
        self.current.load().as_ref().map(|s| s.version)
    }
}

fn db_err(context: &str, e: rusqlite::Error) -> SihragError {
    SihragError::Database(format!("{context}: {e}"))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

fn floats_to_bytes(floats: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(floats.len() * 4);
    for f in floats {
        bytes.extend_from_slice(&f.to_le_bytes());
    }
    bytes
}

fn bytes_to_floats(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

const SCHEMA: &str = "
    CREATE TABLE metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE chunks (
        position INTEGER PRIMARY KEY,
        id TEXT NOT NULL UNIQUE,
        body TEXT NOT NULL
    );

    CREATE TABLE lexical_docs (
        position INTEGER PRIMARY KEY,
        id TEXT NOT NULL,
        length INTEGER NOT NULL
    );

    CREATE TABLE lexical_postings (
        term TEXT NOT NULL,
        doc INTEGER NOT NULL,
        tf INTEGER NOT NULL,
        PRIMARY KEY (term, doc)
    );

    CREATE TABLE vectors (
        position INTEGER PRIMARY KEY,
        id TEXT NOT NULL,
        embedding BLOB NOT NULL
    );
";

/// Persist `snapshot` to `path` as a SQLite database.
///
/// The database is written next to `path` and renamed over it once
/// complete, so a failed save leaves any previous file untouched.
///
/// # Errors
///
/// Returns [`SihragError::Database`] on any SQLite failure and
/// [`SihragError::Io`] if the file cannot be moved into place.
pub fn save(snapshot: &IndexSnapshot, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = tmp_path(path);
    if tmp.exists() {
        std::fs::remove_file(&tmp)?;
    }

    let mut conn = Connection::open(&tmp).map_err(|e| db_err("failed to create snapshot", e))?;
    conn.execute_batch(SCHEMA)
        .map_err(|e| db_err("failed to create schema", e))?;

    let tx = conn
        .transaction()
        .map_err(|e| db_err("failed to begin transaction", e))?;
    {
        let mut meta = tx
            .prepare("INSERT INTO metadata (key, value) VALUES (?1, ?2)")
            .map_err(|e| db_err("failed to prepare metadata insert", e))?;
        let bm25 = snapshot.lexical.params();
        let entries = [
            ("schema_version", SCHEMA_VERSION.to_string()),
            ("version", snapshot.version.to_string()),
            ("built_at", snapshot.built_at.to_rfc3339()),
            ("source_fingerprint", snapshot.source_fingerprint.clone()),
            ("embedding_model", snapshot.embedding_model.clone()),
            ("dimensions", snapshot.semantic.dimensions().to_string()),
            ("bm25_k1", bm25.k1.to_string()),
            ("bm25_b", bm25.b.to_string()),
        ];
        for (key, value) in &entries {
            meta.execute(params![key, value])
                .map_err(|e| db_err("failed to write metadata", e))?;
        }

        let mut chunks = tx
            .prepare("INSERT INTO chunks (position, id, body) VALUES (?1, ?2, ?3)")
            .map_err(|e| db_err("failed to prepare chunk insert", e))?;
        for (position, chunk) in snapshot.store.iter().enumerate() {
            let body = serde_json::to_string(chunk)?;
            chunks
                .execute(params![position as i64, chunk.id, body])
                .map_err(|e| db_err("failed to write chunk", e))?;
        }

        let mut docs = tx
            .prepare("INSERT INTO lexical_docs (position, id, length) VALUES (?1, ?2, ?3)")
            .map_err(|e| db_err("failed to prepare lexical insert", e))?;
        for (position, (id, length)) in snapshot
            .lexical
            .ids()
            .iter()
            .zip(snapshot.lexical.doc_lens())
            .enumerate()
        {
            docs.execute(params![position as i64, id, length])
                .map_err(|e| db_err("failed to write lexical document", e))?;
        }

        let mut postings = tx
            .prepare("INSERT INTO lexical_postings (term, doc, tf) VALUES (?1, ?2, ?3)")
            .map_err(|e| db_err("failed to prepare posting insert", e))?;
        for (term, list) in snapshot.lexical.postings() {
            for posting in list {
                postings
                    .execute(params![term, posting.doc, posting.tf])
                    .map_err(|e| db_err("failed to write posting", e))?;
            }
        }

        let mut vectors = tx
            .prepare("INSERT INTO vectors (position, id, embedding) VALUES (?1, ?2, ?3)")
            .map_err(|e| db_err("failed to prepare vector insert", e))?;
        for (position, (id, vector)) in snapshot.semantic.entries().enumerate() {
            vectors
                .execute(params![position as i64, id, floats_to_bytes(vector)])
                .map_err(|e| db_err("failed to write vector", e))?;
        }
    }
    tx.commit()
        .map_err(|e| db_err("failed to commit snapshot", e))?;
    conn.close()
        .map_err(|(_, e)| db_err("failed to close snapshot", e))?;

    std::fs::rename(&tmp, path)?;
    tracing::debug!(
        path = %path.display(),
        version = snapshot.version,
        chunks = snapshot.store.len(),
        "saved index snapshot"
    );
    Ok(())
}

fn read_metadata(conn: &Connection) -> Result<HashMap<String, String>> {
    let mut stmt = conn
        .prepare("SELECT key, value FROM metadata")
        .map_err(|e| db_err("failed to read metadata", e))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_err(|e| db_err("failed to read metadata", e))?;
    rows.collect::<std::result::Result<HashMap<_, _>, _>>()
        .map_err(|e| db_err("failed to read metadata row", e))
}

fn required<'a>(meta: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    meta.get(key)
        .map(String::as_str)
        .ok_or_else(|| SihragError::Database(format!("snapshot metadata is missing `{key}`")))
}

fn parse_meta<T: std::str::FromStr>(
    meta: &HashMap<String, String>,
    key: &str,
) -> Result<T> {
    let raw = required(meta, key)?;
    raw.parse()
        .map_err(|_| SihragError::Database(format!("corrupted snapshot metadata `{key}`: '{raw}'")))
}

/// Load a snapshot written by [`save`].
///
/// # Errors
///
/// Returns [`SihragError::IndexNotReady`] if `path` does not exist (no
/// build has been persisted yet), and [`SihragError::Database`] for an
/// unreadable or incompatible file.
pub fn load(path: &Path) -> Result<IndexSnapshot> {
    if !path.exists() {
        return Err(SihragError::IndexNotReady);
    }
    let conn = Connection::open(path).map_err(|e| db_err("failed to open snapshot", e))?;

    let meta = read_metadata(&conn)?;
    let schema: u32 = parse_meta(&meta, "schema_version")?;
    if schema != SCHEMA_VERSION {
        return Err(SihragError::Database(format!(
            "snapshot schema version {schema} is not supported (expected {SCHEMA_VERSION}); run `sihrag index` again"
        )));
    }
    let version: u64 = parse_meta(&meta, "version")?;
    let built_at = DateTime::parse_from_rfc3339(required(&meta, "built_at")?)
        .map_err(|e| SihragError::Database(format!("corrupted snapshot timestamp: {e}")))?
        .with_timezone(&Utc);
    let source_fingerprint = required(&meta, "source_fingerprint")?.to_string();
    let embedding_model = required(&meta, "embedding_model")?.to_string();
    let dimensions: usize = parse_meta(&meta, "dimensions")?;
    let lexical_params = LexicalConfig {
        k1: parse_meta(&meta, "bm25_k1")?,
        b: parse_meta(&meta, "bm25_b")?,
    };

    let mut stmt = conn
        .prepare("SELECT body FROM chunks ORDER BY position")
        .map_err(|e| db_err("failed to read chunks", e))?;
    let bodies = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| db_err("failed to read chunks", e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| db_err("failed to read chunk row", e))?;
    let chunks = bodies
        .iter()
        .map(|body| serde_json::from_str::<Chunk>(body))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let store = ChunkStore::from_chunks(chunks)?;

    let mut stmt = conn
        .prepare("SELECT id, length FROM lexical_docs ORDER BY position")
        .map_err(|e| db_err("failed to read lexical documents", e))?;
    let (ids, doc_lens): (Vec<String>, Vec<u32>) = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))
        .map_err(|e| db_err("failed to read lexical documents", e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| db_err("failed to read lexical document row", e))?
        .into_iter()
        .unzip();

    let mut stmt = conn
        .prepare("SELECT term, doc, tf FROM lexical_postings ORDER BY term, doc")
        .map_err(|e| db_err("failed to read postings", e))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                Posting {
                    doc: row.get(1)?,
                    tf: row.get(2)?,
                },
            ))
        })
        .map_err(|e| db_err("failed to read postings", e))?;
    let mut postings: HashMap<String, Vec<Posting>> = HashMap::new();
    for row in rows {
        let (term, posting) = row.map_err(|e| db_err("failed to read posting row", e))?;
        if posting.doc as usize >= ids.len() {
            return Err(SihragError::Database(format!(
                "posting for `{term}` points past the last document"
            )));
        }
        postings.entry(term).or_default().push(posting);
    }
    let lexical = LexicalIndex::from_parts(lexical_params, ids, doc_lens, postings);

    let mut stmt = conn
        .prepare("SELECT id, embedding FROM vectors ORDER BY position")
        .map_err(|e| db_err("failed to read vectors", e))?;
    let (vector_ids, vectors): (Vec<String>, Vec<Vec<f32>>) = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                bytes_to_floats(&row.get::<_, Vec<u8>>(1)?),
            ))
        })
        .map_err(|e| db_err("failed to read vectors", e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| db_err("failed to read vector row", e))?
        .into_iter()
        .unzip();
    let semantic = SemanticIndex::from_parts(&embedding_model, dimensions, vector_ids, vectors)?;

    tracing::debug!(path = %path.display(), version, "loaded index snapshot");
    Ok(IndexSnapshot {
        version,
        built_at,
        source_fingerprint,
        embedding_model,
        store,
        lexical,
        semantic,
    })
}

/// Version recorded in the snapshot at `path`, without loading it.
///
/// Returns `Ok(None)` if no snapshot has been persisted.
///
/// # Errors
///
/// Returns [`SihragError::Database`] if the file exists but cannot be read.
pub fn stored_version(path: &Path) -> Result<Option<u64>> {
    if !path.exists() {
        return Ok(None);
    }
    let conn = Connection::open(path).map_err(|e| db_err("failed to open snapshot", e))?;
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = 'version'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| db_err("failed to read snapshot version", e))?;
    value
        .map(|v| {
            v.parse()
                .map_err(|_| SihragError::Database(format!("corrupted snapshot version: '{v}'")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use sihrag_core::{ChunkKind, SourceMetadata};

    fn chunk(id: &str, parent: Option<&str>, text: &str) -> Chunk {
        Chunk {
            id: id.into(),
            text: text.into(),
            parent_id: parent.map(String::from),
            kind: ChunkKind::Section,
            source_metadata: SourceMetadata {
                section: Some("4.2".into()),
                page: Some(12),
                ..SourceMetadata::new("Manual SIH")
            },
        }
    }

    async fn build(version: u64) -> IndexSnapshot {
        let store = ChunkStore::from_chunks(vec![
            chunk("p", None, "internação clínica e cirúrgica"),
            chunk("p_c0", Some("p"), "procedimento 0301010010 internação clínica"),
            chunk("q", None, "habilitação de leito UTI adulto"),
        ])
        .unwrap();
        let entries = store.index_entries();
        let lexical = LexicalIndex::build(&entries, LexicalConfig::default());
        let semantic = SemanticIndex::build(&entries, &HashEmbedder::new(64), 8, 1)
            .await
            .unwrap();
        IndexSnapshot::new(version, store, lexical, semantic)
    }

    #[tokio::test]
    async fn handle_publishes_and_keeps_old_readers_alive() {
        let handle = IndexHandle::new();
        handle.publish(build(1).await);
        let reader = handle.current().unwrap();
        let previous = handle.publish(build(2).await).unwrap();
        assert_eq!(previous.version, 1);
        assert_eq!(reader.version, 1);
        assert_eq!(handle.current().unwrap().version, 2);
        assert_eq!(handle.version(), Some(2));
    }

    #[tokio::test]
    async fn concurrent_readers_never_block_publishing() {
        let mut builds = Vec::new();
        for version in 1..=8 {
            builds.push(build(version).await);
        }
        let handle = IndexHandle::with_snapshot(build(0).await);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let mut last = 0;
                    for _ in 0..200 {
                        let snapshot = handle.current().unwrap();
                        assert!(snapshot.version >= last);
                        assert_eq!(snapshot.store.len(), 3);
                        last = snapshot.version;
                    }
                });
            }
            scope.spawn(|| {
                for snapshot in builds {
                    handle.publish(snapshot);
                }
            });
        });
        assert_eq!(handle.version(), Some(8));
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index").join("index.db");
        let snapshot = build(3).await;
        save(&snapshot, &path).unwrap();
        assert!(!tmp_path(&path).exists());

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.version, 3);
        assert_eq!(loaded.built_at, snapshot.built_at);
        assert_eq!(loaded.source_fingerprint, snapshot.source_fingerprint);
        assert_eq!(loaded.embedding_model, "feature-hash-64");
        assert_eq!(
            loaded.store.iter().cloned().collect::<Vec<_>>(),
            snapshot.store.iter().cloned().collect::<Vec<_>>()
        );
        assert_eq!(
            loaded.lexical.search("internação clínica", 5, None),
            snapshot.lexical.search("internação clínica", 5, None)
        );
        let query = HashEmbedder::new(64).embed("leito UTI");
        assert_eq!(
            loaded.semantic.search_vector(&query, 5, None).unwrap(),
            snapshot.semantic.search_vector(&query, 5, None).unwrap()
        );
        assert_eq!(stored_version(&path).unwrap(), Some(3));
    }

    #[tokio::test]
    async fn save_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        save(&build(1).await, &path).unwrap();
        save(&build(2).await, &path).unwrap();
        assert_eq!(load(&path).unwrap().version, 2);
    }

    #[test]
    fn missing_file_is_index_not_ready() {
        let err = load(Path::new("/nonexistent/index.db")).unwrap_err();
        assert!(matches!(err, SihragError::IndexNotReady));
        assert_eq!(stored_version(Path::new("/nonexistent/index.db")).unwrap(), None);
    }

    #[test]
    fn floats_bytes_roundtrip() {
        let floats = vec![0.5f32, -1.25, 3.0];
        assert_eq!(bytes_to_floats(&floats_to_bytes(&floats)), floats);
    }

    #[test]
    fn tmp_path_appends_suffix() {
        assert_eq!(
            tmp_path(Path::new("data/index.db")),
            PathBuf::from("data/index.db.tmp")
        );
    }
}
