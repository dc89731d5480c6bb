use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Structural origin of a chunk.
///
/// # Examples
///
/// ```
/// use sihrag_core::ChunkKind;
///
/// let kind = ChunkKind::ProcedureTableAnnex;
/// assert_eq!(kind.to_string(), "procedure_table_annex");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    /// A numbered section of a manual.
    Section,
    /// A page block from a procedure reference-table annex.
    ProcedureTableAnnex,
    /// A page block from a document without detectable sections.
    GenericPage,
    /// A page block from an ordinance.
    OrdinanceFragment,
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkKind::Section => write!(f, "section"),
            ChunkKind::ProcedureTableAnnex => write!(f, "procedure_table_annex"),
            ChunkKind::GenericPage => write!(f, "generic_page"),
            ChunkKind::OrdinanceFragment => write!(f, "ordinance_fragment"),
        }
    }
}

/// Declared type of a source document, in the corpus' own vocabulary.
///
/// # Examples
///
/// ```
/// use sihrag_core::DocumentType;
///
/// let t: DocumentType = "portaria".parse().unwrap();
/// assert_eq!(t, DocumentType::Ordinance);
/// assert_eq!(DocumentType::ProcedureTableAnnex.to_string(), "anexo_sigtap");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentType {
    /// Billing or operations manual.
    #[serde(rename = "manual")]
    Manual,
    /// Ministerial ordinance.
    #[serde(rename = "portaria")]
    Ordinance,
    /// SIGTAP procedure-table annex or report.
    #[serde(rename = "anexo_sigtap")]
    ProcedureTableAnnex,
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentType::Manual => write!(f, "manual"),
            DocumentType::Ordinance => write!(f, "portaria"),
            DocumentType::ProcedureTableAnnex => write!(f, "anexo_sigtap"),
        }
    }
}

impl FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(DocumentType::Manual),
            "portaria" => Ok(DocumentType::Ordinance),
            "anexo_sigtap" | "anexo" => Ok(DocumentType::ProcedureTableAnnex),
            other => Err(format!("unknown document type: {other}")),
        }
    }
}

/// Provenance of a chunk. Only `document` is required.
///
/// # Examples
///
/// ```
/// use sihrag_core::SourceMetadata;
///
/// let meta = SourceMetadata::new("Manual SIH 2017");
/// assert!(meta.section.is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Human-readable document name.
    pub document: String,
    /// Declared document type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_type: Option<DocumentType>,
    /// Publication year.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    /// Section number such as `"4.2"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    /// Section title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// 1-based page number where the chunk starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
}

impl SourceMetadata {
    /// Metadata carrying only the document name.
    pub fn new(document: impl Into<String>) -> Self {
        Self {
            document: document.into(),
            ..Self::default()
        }
    }
}

/// The atomic retrievable unit.
///
/// A chunk with a `parent_id` is a child; its parent lives in the same
/// chunk store.
///
/// # Examples
///
/// ```
/// use sihrag_core::{Chunk, ChunkKind, SourceMetadata};
///
/// let mut meta = SourceMetadata::new("Manual SIH");
/// meta.section = Some("4.2".into());
/// meta.title = Some("OPM".into());
/// meta.page = Some(31);
///
/// let chunk = Chunk {
///     id: "manual_sih_abc123_secao_4.2_p1_c1".into(),
///     text: "Órteses, próteses e materiais especiais.".into(),
///     parent_id: Some("manual_sih_abc123_secao_4.2_parent1".into()),
///     kind: ChunkKind::Section,
///     source_metadata: meta,
/// };
/// assert!(chunk.is_child());
/// assert_eq!(chunk.context_header(), "[Manual SIH | Seção 4.2. OPM | Página 31]");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable identifier, unique within a corpus snapshot.
    pub id: String,
    /// Normalized content.
    pub text: String,
    /// Parent chunk id for children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Structural origin.
    pub kind: ChunkKind,
    /// Provenance.
    pub source_metadata: SourceMetadata,
}

impl Chunk {
    /// Returns `true` if this chunk refers to a parent.
    pub fn is_child(&self) -> bool {
        self.parent_id.is_some()
    }

    /// Provenance prefix used when indexing, e.g.
    /// `[Manual SIH | Seção 4.2. OPM | Página 31 | Tipo: manual]`.
    pub fn context_header(&self) -> String {
        let meta = &self.source_metadata;
        let mut parts = vec![meta.document.clone()];
        match (&meta.section, &meta.title) {
            (Some(section), Some(title)) => parts.push(format!("Seção {section}. {title}")),
            (Some(section), None) => parts.push(format!("Seção {section}")),
            _ => {}
        }
        if let Some(page) = meta.page {
            parts.push(format!("Página {page}"));
        }
        if let Some(doc_type) = meta.document_type {
            parts.push(format!("Tipo: {doc_type}"));
        }
        format!("[{}]", parts.join(" | "))
    }

    /// Text fed to both indexes: the context header followed by the content.
    pub fn indexed_text(&self) -> String {
        format!("{}\n\n{}", self.context_header(), self.text)
    }
}

/// Shape of a query, used to pick a fusion weight profile.
///
/// `Unspecified` means "classify it for me" and takes the fused default path.
///
/// # Examples
///
/// ```
/// use sihrag_core::QueryHint;
///
/// let hint: QueryHint = "code".parse().unwrap();
/// assert_eq!(hint, QueryHint::ProcedureCode);
/// assert_eq!(QueryHint::default(), QueryHint::Unspecified);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryHint {
    /// No hint given.
    #[default]
    Unspecified,
    /// Looks like a section number (`"4.2"`).
    SectionNumber,
    /// Looks like a procedure or CID code.
    ProcedureCode,
    /// A descriptive question.
    FreeForm,
}

impl fmt::Display for QueryHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryHint::Unspecified => write!(f, "unspecified"),
            QueryHint::SectionNumber => write!(f, "section"),
            QueryHint::ProcedureCode => write!(f, "code"),
            QueryHint::FreeForm => write!(f, "free"),
        }
    }
}

impl FromStr for QueryHint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unspecified" | "auto" => Ok(QueryHint::Unspecified),
            "section" | "secao" | "section_number" => Ok(QueryHint::SectionNumber),
            "code" | "procedure" | "procedure_code" => Ok(QueryHint::ProcedureCode),
            "free" | "free_form" | "text" => Ok(QueryHint::FreeForm),
            other => Err(format!("unknown query hint: {other}")),
        }
    }
}

/// One ranked answer from the hybrid engine, with enough provenance to be
/// verified without re-querying.
///
/// Ranks are 1-based positions in the respective sub-index result list;
/// `None` means the chunk was not retrieved by that index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    /// Chunk identifier.
    pub chunk_id: String,
    /// Chunk content.
    pub text: String,
    /// Weighted reciprocal-rank score.
    pub fused_score: f64,
    /// Source document name.
    pub source_document: String,
    /// Section number, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    /// Page number, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    /// Section title, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Structural origin of the chunk.
    pub kind: ChunkKind,
    /// Position in the lexical result list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical_rank: Option<usize>,
    /// Position in the semantic result list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_rank: Option<usize>,
    /// Relevance assigned by the reranker, when one rescored this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f64>,
}

impl ResultEntry {
    /// Build an entry from a chunk and its scores.
    pub fn from_chunk(
        chunk: &Chunk,
        fused_score: f64,
        lexical_rank: Option<usize>,
        semantic_rank: Option<usize>,
    ) -> Self {
        let meta = &chunk.source_metadata;
        Self {
            chunk_id: chunk.id.clone(),
            text: chunk.text.clone(),
            fused_score,
            source_document: meta.document.clone(),
            section: meta.section.clone(),
            page: meta.page,
            title: meta.title.clone(),
            kind: chunk.kind,
            lexical_rank,
            semantic_rank,
            rerank_score: None,
        }
    }
}

/// Output format for CLI results.
///
/// # Examples
///
/// ```
/// use sihrag_core::OutputFormat;
///
/// let fmt: OutputFormat = "json".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Json);
///
/// let fmt: OutputFormat = "md".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Markdown);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable listing.
    #[default]
    Text,
    /// Machine-readable JSON.
    Json,
    /// Markdown-formatted output.
    Markdown,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Markdown => write!(f, "markdown"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section_chunk() -> Chunk {
        Chunk {
            id: "manual_x_secao_2_p1_c1".into(),
            text: "Conteúdo da seção.".into(),
            parent_id: Some("manual_x_secao_2_parent1".into()),
            kind: ChunkKind::Section,
            source_metadata: SourceMetadata {
                document: "Manual X".into(),
                document_type: Some(DocumentType::Manual),
                year: Some(2017),
                section: Some("2".into()),
                title: Some("REGRAS GERAIS".into()),
                page: Some(12),
            },
        }
    }

    #[test]
    fn output_format_from_str() {
        assert_eq!("text".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!(
            "markdown".parse::<OutputFormat>().unwrap(),
            OutputFormat::Markdown
        );
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn query_hint_round_trips_through_display() {
        for hint in [
            QueryHint::Unspecified,
            QueryHint::SectionNumber,
            QueryHint::ProcedureCode,
            QueryHint::FreeForm,
        ] {
            assert_eq!(hint.to_string().parse::<QueryHint>().unwrap(), hint);
        }
        assert!("nonsense".parse::<QueryHint>().is_err());
    }

    #[test]
    fn document_type_uses_corpus_vocabulary() {
        let json = serde_json::to_string(&DocumentType::ProcedureTableAnnex).unwrap();
        assert_eq!(json, "\"anexo_sigtap\"");
        let parsed: DocumentType = serde_json::from_str("\"portaria\"").unwrap();
        assert_eq!(parsed, DocumentType::Ordinance);
    }

    #[test]
    fn chunk_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ChunkKind::OrdinanceFragment).unwrap();
        assert_eq!(json, "\"ordinance_fragment\"");
    }

    #[test]
    fn chunk_json_uses_documented_field_names() {
        let value = serde_json::to_value(section_chunk()).unwrap();
        assert!(value.get("id").is_some());
        assert!(value.get("parent_id").is_some());
        assert_eq!(value["kind"], "section");
        assert_eq!(value["source_metadata"]["document"], "Manual X");
    }

    #[test]
    fn chunk_json_round_trip_is_exact() {
        let chunk = section_chunk();
        let json = serde_json::to_string(&chunk).unwrap();
        let back: Chunk = serde_json::from_str(&json).unwrap();
        assert_eq!(back, chunk);
    }

    #[test]
    fn parent_without_optional_fields_omits_them() {
        let chunk = Chunk {
            id: "p".into(),
            text: "t".into(),
            parent_id: None,
            kind: ChunkKind::GenericPage,
            source_metadata: SourceMetadata::new("Doc"),
        };
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(!json.contains("parent_id"));
        assert!(!json.contains("year"));
        assert!(!chunk.is_child());
    }

    #[test]
    fn context_header_lists_available_provenance() {
        let chunk = section_chunk();
        assert_eq!(
            chunk.context_header(),
            "[Manual X | Seção 2. REGRAS GERAIS | Página 12 | Tipo: manual]"
        );
        assert!(chunk.indexed_text().ends_with("\n\nConteúdo da seção."));
    }

    #[test]
    fn result_entry_copies_provenance() {
        let chunk = section_chunk();
        let entry = ResultEntry::from_chunk(&chunk, 0.03, Some(1), None);
        assert_eq!(entry.chunk_id, chunk.id);
        assert_eq!(entry.source_document, "Manual X");
        assert_eq!(entry.section.as_deref(), Some("2"));
        assert_eq!(entry.page, Some(12));
        assert_eq!(entry.lexical_rank, Some(1));
        assert!(entry.semantic_rank.is_none());
    }
}
