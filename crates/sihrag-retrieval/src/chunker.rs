//! Chunking pipeline: extracted document text in, parent/child chunks out.
//!
//! Documents arrive as plain text with pages separated by form feeds.
//! Manuals are split at their numbered upper-case section headers; annexes,
//! ordinances, and manuals without detectable headers are split into page
//! blocks. Every parent is further split into children, which are the units
//! the indexes see.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sihrag_core::{Chunk, ChunkKind, ChunkingConfig, DocumentType, SihragError, SourceMetadata};

use crate::store::ChunkStore;

/// Page separator emitted by `pdftotext`.
pub const PAGE_BREAK: char = '\x0c';

const SECTION_HEADER: &str = r"(?m)^(\d{1,2}(?:\.\d{1,2})?(?:\.\d{1,2})?)[ \t]+([A-ZÁÀÂÃÉÈÊÍÏÓÔÕÖÚÇÑ][A-ZÁÀÂÃÉÈÊÍÏÓÔÕÖÚÇÑ \t\-/,\(\)\.]+)";

static SECTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(SECTION_HEADER).expect("invalid regex"));

static NUMBER_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,2}(?:\.\d{1,2})?(?:\.\d{1,2})?)\s*\.?\s*$").expect("invalid regex")
});

static TITLE_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-ZÁÀÂÃÉÈÊÍÏÓÔÕÖÚÇÑ][A-ZÁÀÂÃÉÈÊÍÏÓÔÕÖÚÇÑ\s\-/,\(\)\.]+$")
        .expect("invalid regex")
});

static PAGE_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\d{1,3}\s*$").expect("invalid regex"));

static SIGTAP_CODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d{2}\.\d{2}\.\d{2}\.\d{3}-\d|\d{10})\b").expect("invalid regex")
});

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{4})").expect("invalid regex"));

/// Running headers repeated on every page of the SIH/SUS manual.
const RUNNING_HEADERS: &[&str] = &["MANUAL TÉCNICO OPERACIONAL", "SISTEMA DE INFORMAÇÃO HOSPITALAR"];

const ANNEX_NAME_MARKERS: &[&str] = &["anexo", "relatorio_grupo", "relatorio_analitico"];

/// First-page SIGTAP code count that marks a document as a reference table.
const ANNEX_CODE_THRESHOLD: usize = 5;

/// A table-of-contents page has more leader dots than this.
const TOC_DOT_LEADERS: usize = 5;

/// Text before the first header is kept as a preamble only past the cover
/// and table-of-contents pages.
const PREAMBLE_MIN_PAGE: u32 = 8;

/// Metadata supplied by the extraction step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Human-readable document name, e.g. `"Manual SIH/SUS 2017"`.
    #[serde(default)]
    pub name: String,
    /// Declared type, when the extractor knows it.
    #[serde(default)]
    pub document_type: Option<DocumentType>,
    /// Publication year; derived from `file_name` when absent.
    #[serde(default)]
    pub year: Option<u16>,
    /// Original file name or path.
    #[serde(default)]
    pub file_name: Option<String>,
}

/// One extracted document.
///
/// # Examples
///
/// ```
/// use sihrag_retrieval::chunker::SourceDocument;
///
/// let line = r#"{"id":"p1","text":"Art. 1º ...","metadata":{"name":"Portaria 1","file_name":"portaria2019/p1.pdf"}}"#;
/// let doc: SourceDocument = serde_json::from_str(line).unwrap();
/// assert_eq!(doc.metadata.name, "Portaria 1");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    /// Extractor-assigned identifier.
    pub id: String,
    /// Extracted text, pages separated by [`PAGE_BREAK`].
    pub text: String,
    /// Extraction metadata.
    #[serde(default)]
    pub metadata: DocumentMetadata,
}

impl SourceDocument {
    /// Name used in chunk provenance; falls back to the document id.
    pub fn display_name(&self) -> &str {
        if self.metadata.name.trim().is_empty() {
            &self.id
        } else {
            self.metadata.name.trim()
        }
    }
}

/// A non-fatal problem seen while chunking one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IngestionEvent {
    /// The extracted text was empty; the document produced no chunks.
    EmptyText {
        /// Document name.
        document: String,
    },
    /// A reference-table annex was cut to its first pages.
    AnnexTruncated {
        /// Document name.
        document: String,
        /// Pages kept.
        kept_pages: usize,
        /// Pages in the extracted text.
        total_pages: usize,
    },
    /// A manual had no recognizable section headers and was split by page.
    NoSectionsDetected {
        /// Document name.
        document: String,
    },
    /// The text had content, but nothing long enough to form a chunk.
    NoUsableText {
        /// Document name.
        document: String,
    },
}

impl fmt::Display for IngestionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestionEvent::EmptyText { document } => {
                write!(f, "{document}: empty extracted text, no chunks produced")
            }
            IngestionEvent::AnnexTruncated {
                document,
                kept_pages,
                total_pages,
            } => write!(
                f,
                "{document}: reference-table annex truncated to {kept_pages} of {total_pages} pages"
            ),
            IngestionEvent::NoSectionsDetected { document } => {
                write!(f, "{document}: no section headers found, split by page")
            }
            IngestionEvent::NoUsableText { document } => {
                write!(f, "{document}: no paragraph long enough to index")
            }
        }
    }
}

/// Aggregated outcome of one chunking run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestionReport {
    /// Documents processed.
    pub documents: usize,
    /// Chunks produced, parents and children together.
    pub chunks: usize,
    /// Non-fatal events, in document order.
    pub events: Vec<IngestionEvent>,
}

impl IngestionReport {
    /// Returns `true` if nothing noteworthy happened.
    pub fn is_clean(&self) -> bool {
        self.events.is_empty()
    }

    fn record(&mut self, event: IngestionEvent) {
        tracing::warn!(%event, "ingestion event");
        self.events.push(event);
    }
}

/// Result of [`Chunker::chunk_corpus`].
#[derive(Debug, Clone)]
pub struct ChunkingOutput {
    /// The new corpus snapshot.
    pub store: ChunkStore,
    /// What happened along the way.
    pub report: IngestionReport,
}

/// A detected manual section before it is split into chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Section number such as `"4.2"`; `"0"` for a preamble.
    pub number: String,
    /// Upper-case title.
    pub title: String,
    /// 1-based page where the header appears.
    pub page: u32,
    /// Section body.
    pub text: String,
}

#[derive(Debug, Clone)]
struct Page {
    number: u32,
    text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Annex,
    Ordinance,
    Manual,
}

/// Hands out ids, suffixing `_dup{n}` on collision.
#[derive(Debug, Default)]
struct IdAllocator {
    seen: HashMap<String, usize>,
}

impl IdAllocator {
    fn unique(&mut self, base: String) -> String {
        let Some(&last) = self.seen.get(&base) else {
            self.seen.insert(base.clone(), 0);
            return base;
        };
        // A suffixed id may already exist as a natural id.
        let mut n = last;
        let id = loop {
            n += 1;
            let candidate = format!("{base}_dup{n}");
            if !self.seen.contains_key(&candidate) {
                break candidate;
            }
        };
        self.seen.insert(base, n);
        self.seen.insert(id.clone(), 0);
        id
    }
}

/// Splits extracted documents into a validated [`ChunkStore`].
///
/// # Examples
///
/// ```
/// use sihrag_core::ChunkingConfig;
/// use sihrag_retrieval::chunker::{Chunker, DocumentMetadata, SourceDocument};
///
/// let doc = SourceDocument {
///     id: "m".into(),
///     text: "1 REGRAS GERAIS\nA AIH é o instrumento de registro das internações.".into(),
///     metadata: DocumentMetadata { name: "Manual SIH".into(), ..Default::default() },
/// };
/// let output = Chunker::new(ChunkingConfig::default()).chunk_corpus(vec![doc]).unwrap();
/// assert_eq!(output.store.len(), 2);
/// assert!(output.report.is_clean());
/// ```
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    /// Create a chunker with the given limits.
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    /// Chunk every document into one corpus snapshot.
    ///
    /// Empty or unusable documents are reported, never fatal.
    ///
    /// # Errors
    ///
    /// Returns [`SihragError::InvalidChunkStore`] if the produced chunks
    /// fail validation.
    pub fn chunk_corpus(
        &self,
        documents: impl IntoIterator<Item = SourceDocument>,
    ) -> Result<ChunkingOutput, SihragError> {
        let mut ids = IdAllocator::default();
        let mut report = IngestionReport::default();
        let mut chunks = Vec::new();

        for doc in documents {
            report.documents += 1;
            let produced = self.chunk_document(&doc, &mut ids, &mut report);
            tracing::debug!(
                document = doc.display_name(),
                chunks = produced.len(),
                "chunked document"
            );
            chunks.extend(produced);
        }

        report.chunks = chunks.len();
        let store = ChunkStore::from_chunks(chunks)?;
        tracing::info!(
            documents = report.documents,
            chunks = report.chunks,
            events = report.events.len(),
            "chunking finished"
        );
        Ok(ChunkingOutput { store, report })
    }

    fn chunk_document(
        &self,
        doc: &SourceDocument,
        ids: &mut IdAllocator,
        report: &mut IngestionReport,
    ) -> Vec<Chunk> {
        let name = doc.display_name().to_string();
        if doc.text.trim().is_empty() {
            report.record(IngestionEvent::EmptyText { document: name });
            return Vec::new();
        }

        let mut pages = split_pages(&doc.text);
        let layout = detect_layout(doc, &pages);

        let total_pages = pages.last().map_or(0, |p| p.number as usize);
        if layout == Layout::Annex && total_pages > self.config.annex_max_pages {
            pages.retain(|p| (p.number as usize) <= self.config.annex_max_pages);
            report.record(IngestionEvent::AnnexTruncated {
                document: name.clone(),
                kept_pages: pages.len(),
                total_pages,
            });
        }

        let document_type = match layout {
            Layout::Annex => DocumentType::ProcedureTableAnnex,
            Layout::Ordinance => DocumentType::Ordinance,
            Layout::Manual => doc.metadata.document_type.unwrap_or(DocumentType::Manual),
        };
        let meta = SourceMetadata {
            document: name.clone(),
            document_type: Some(document_type),
            year: doc.metadata.year.or_else(|| {
                doc.metadata
                    .file_name
                    .as_deref()
                    .and_then(year_from_path)
            }),
            ..SourceMetadata::default()
        };
        let prefix = id_prefix(&name);

        let chunks = match layout {
            Layout::Annex => {
                self.page_chunks(&pages, &prefix, &meta, ChunkKind::ProcedureTableAnnex, ids)
            }
            Layout::Ordinance => {
                self.page_chunks(&pages, &prefix, &meta, ChunkKind::OrdinanceFragment, ids)
            }
            Layout::Manual => {
                let sections = detect_page_sections(&pages);
                if sections.is_empty() {
                    report.record(IngestionEvent::NoSectionsDetected {
                        document: name.clone(),
                    });
                    self.page_chunks(&pages, &prefix, &meta, ChunkKind::GenericPage, ids)
                } else {
                    self.section_chunks(&sections, &prefix, &meta, ids)
                }
            }
        };

        if chunks.is_empty() {
            report.record(IngestionEvent::NoUsableText { document: name });
        }
        chunks
    }

    fn section_chunks(
        &self,
        sections: &[Section],
        prefix: &str,
        base: &SourceMetadata,
        ids: &mut IdAllocator,
    ) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for section in sections {
            let meta = SourceMetadata {
                section: Some(section.number.clone()),
                title: Some(section.title.clone()),
                page: Some(section.page),
                ..base.clone()
            };
            let parents = split_with_overlap(
                &section.text,
                self.config.parent_max_chars,
                self.config.overlap_chars,
            );
            for (p, parent_text) in parents.into_iter().enumerate() {
                let parent_id = ids.unique(format!("{prefix}_secao_{}_parent{p}", section.number));
                let children = split_with_overlap(
                    &parent_text,
                    self.config.child_max_chars,
                    self.config.overlap_chars,
                );
                chunks.push(Chunk {
                    id: parent_id.clone(),
                    text: parent_text,
                    parent_id: None,
                    kind: ChunkKind::Section,
                    source_metadata: meta.clone(),
                });
                for (c, child_text) in children.into_iter().enumerate() {
                    chunks.push(Chunk {
                        id: ids.unique(format!("{prefix}_secao_{}_p{p}_c{c}", section.number)),
                        text: child_text,
                        parent_id: Some(parent_id.clone()),
                        kind: ChunkKind::Section,
                        source_metadata: meta.clone(),
                    });
                }
            }
        }
        chunks
    }

    fn page_chunks(
        &self,
        pages: &[Page],
        prefix: &str,
        base: &SourceMetadata,
        kind: ChunkKind,
        ids: &mut IdAllocator,
    ) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for (page, text) in self.page_blocks(pages) {
            let meta = SourceMetadata {
                title: Some(format!("Página {page}")),
                page: Some(page),
                ..base.clone()
            };
            let hash = compute_hash(&text);
            let parent_id = ids.unique(format!("{prefix}_p{page}_{}", &hash[..8]));
            let children =
                split_with_overlap(&text, self.config.child_max_chars, self.config.overlap_chars);
            chunks.push(Chunk {
                id: parent_id.clone(),
                text,
                parent_id: None,
                kind,
                source_metadata: meta.clone(),
            });
            for (c, child_text) in children.into_iter().enumerate() {
                chunks.push(Chunk {
                    id: ids.unique(format!("{parent_id}_c{c}")),
                    text: child_text,
                    parent_id: Some(parent_id.clone()),
                    kind,
                    source_metadata: meta.clone(),
                });
            }
        }
        chunks
    }

    /// Pack paragraphs into blocks of at most `parent_max_chars`, each
    /// tagged with the page it starts on.
    fn page_blocks(&self, pages: &[Page]) -> Vec<(u32, String)> {
        let max = self.config.parent_max_chars;
        let mut blocks = Vec::new();
        let mut buffer: Vec<String> = Vec::new();
        let mut buffer_len = 0;
        let mut buffer_page = 0;

        for page in pages {
            if is_table_of_contents(&page.text) {
                continue;
            }
            for paragraph in page.text.split("\n\n") {
                let paragraph = paragraph.trim();
                if char_len(paragraph) < self.config.min_paragraph_chars {
                    continue;
                }
                for piece in sentence_groups(paragraph, max) {
                    let len = char_len(&piece);
                    if !buffer.is_empty() && buffer_len + 2 + len > max {
                        blocks.push((buffer_page, buffer.join("\n\n")));
                        buffer.clear();
                        buffer_len = 0;
                    }
                    if buffer.is_empty() {
                        buffer_page = page.number;
                    } else {
                        buffer_len += 2;
                    }
                    buffer_len += len;
                    buffer.push(piece);
                }
            }
        }
        if !buffer.is_empty() {
            blocks.push((buffer_page, buffer.join("\n\n")));
        }
        blocks
    }
}

/// Split `text` into pieces of at most `max_chars` characters.
///
/// Paragraphs (separated by blank lines) are packed greedily; each new
/// piece starts with the trailing paragraphs of the previous one, up to
/// `overlap` characters. Paragraphs longer than `max_chars` are first cut
/// into sentence groups. Text that already fits is returned unchanged.
///
/// # Examples
///
/// ```
/// use sihrag_retrieval::chunker::split_with_overlap;
///
/// let text = "primeiro parágrafo\n\nsegundo parágrafo\n\nterceiro parágrafo";
/// let pieces = split_with_overlap(text, 40, 20);
/// assert_eq!(pieces.len(), 2);
/// assert!(pieces[1].starts_with("segundo"));
/// assert!(pieces.iter().all(|p| p.chars().count() <= 40));
/// ```
pub fn split_with_overlap(text: &str, max_chars: usize, overlap: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if char_len(text) <= max_chars {
        return vec![text.to_string()];
    }

    let paragraphs: Vec<String> = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .flat_map(|p| sentence_groups(p, max_chars))
        .collect();

    let mut pieces = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_len = 0;

    for para in paragraphs {
        let len = char_len(&para);
        if !current.is_empty() && current_len + 2 + len > max_chars {
            pieces.push(current.join("\n\n"));

            let mut carried: Vec<String> = Vec::new();
            let mut carried_len = 0;
            for prev in current.iter().rev() {
                let prev_len = char_len(prev);
                if carried_len + prev_len > overlap {
                    break;
                }
                carried.insert(0, prev.clone());
                carried_len += prev_len + 2;
            }
            while !carried.is_empty() && carried_len + len > max_chars {
                let dropped = carried.remove(0);
                carried_len -= char_len(&dropped) + 2;
            }
            current = carried;
            current_len = carried_len;
        } else if !current.is_empty() {
            current_len += 2;
        }
        current_len += len;
        current.push(para);
    }
    if !current.is_empty() {
        pieces.push(current.join("\n\n"));
    }
    pieces
}

/// Detect numbered upper-case section headers across pages.
///
/// Table-of-contents pages, running headers, and bare page-number lines
/// are skipped. A number alone on a line followed by an upper-case title
/// line counts as one header.
///
/// # Examples
///
/// ```
/// use sihrag_retrieval::chunker::detect_sections;
///
/// let sections = detect_sections("4\nÓRTESES E PRÓTESES\nRegras de cobrança de OPM.\n4.1 COMPATIBILIDADE\nTexto.");
/// assert_eq!(sections.len(), 2);
/// assert_eq!(sections[0].number, "4");
/// assert_eq!(sections[0].title, "ÓRTESES E PRÓTESES");
/// assert_eq!(sections[1].number, "4.1");
/// ```
pub fn detect_sections(text: &str) -> Vec<Section> {
    detect_page_sections(&split_pages(text))
}

fn detect_page_sections(pages: &[Page]) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current: Option<Section> = None;
    let mut acc: Vec<String> = Vec::new();

    for page in pages {
        if is_table_of_contents(&page.text) {
            continue;
        }
        let clean = clean_page(&page.text);
        if clean.is_empty() {
            continue;
        }

        let headers: Vec<_> = SECTION_RE.captures_iter(&clean).collect();
        if headers.is_empty() {
            if current.is_some() {
                acc.push(clean);
            }
            continue;
        }

        for (i, caps) in headers.iter().enumerate() {
            let (Some(whole), Some(number), Some(title)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            let before = clean[..whole.start()].trim();
            if let Some(mut finished) = current.take() {
                if i == 0 && !before.is_empty() {
                    acc.push(before.to_string());
                }
                finished.text = acc.join("\n").trim().to_string();
                if !finished.text.is_empty() {
                    sections.push(finished);
                }
                acc.clear();
            } else if i == 0 && !before.is_empty() && page.number > PREAMBLE_MIN_PAGE {
                sections.push(Section {
                    number: "0".into(),
                    title: "PREÂMBULO".into(),
                    page: page.number,
                    text: before.to_string(),
                });
            }

            let end = headers
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map_or(clean.len(), |m| m.start());
            let body = clean[whole.end()..end].trim();
            current = Some(Section {
                number: number.as_str().to_string(),
                title: title.as_str().trim().trim_end_matches('.').trim().to_string(),
                page: page.number,
                text: String::new(),
            });
            if !body.is_empty() {
                acc.push(body.to_string());
            }
        }
    }

    if let Some(mut finished) = current {
        finished.text = acc.join("\n").trim().to_string();
        if !finished.text.is_empty() {
            sections.push(finished);
        }
    }
    sections
}

/// Drop running headers and page numbers; join split headers.
fn clean_page(text: &str) -> String {
    let lines: Vec<&str> = text
        .lines()
        .filter(|line| !RUNNING_HEADERS.iter().any(|h| line.contains(h)))
        .collect();

    let mut kept: Vec<String> = Vec::with_capacity(lines.len());
    let mut i = 0;
    while i < lines.len() {
        let stripped = lines[i].trim();
        if NUMBER_LINE_RE.is_match(stripped) {
            if let Some(next) = lines.get(i + 1).map(|l| l.trim()) {
                if !next.is_empty() && TITLE_LINE_RE.is_match(next) {
                    kept.push(format!("{} {next}", stripped.trim_end_matches('.').trim()));
                    i += 2;
                    continue;
                }
            }
        }
        if PAGE_NUMBER_RE.is_match(stripped) {
            i += 1;
            continue;
        }
        kept.push(lines[i].to_string());
        i += 1;
    }
    kept.join("\n").trim().to_string()
}

fn split_pages(text: &str) -> Vec<Page> {
    text.split(PAGE_BREAK)
        .enumerate()
        .filter_map(|(i, page)| {
            let page = page.trim();
            (!page.is_empty()).then(|| Page {
                number: i as u32 + 1,
                text: page.to_string(),
            })
        })
        .collect()
}

fn detect_layout(doc: &SourceDocument, pages: &[Page]) -> Layout {
    let names = format!(
        "{} {} {}",
        doc.id,
        doc.metadata.name,
        doc.metadata.file_name.as_deref().unwrap_or_default()
    )
    .to_lowercase();

    let declared = doc.metadata.document_type;
    let code_heavy = pages
        .first()
        .is_some_and(|p| SIGTAP_CODE_RE.find_iter(&p.text).count() >= ANNEX_CODE_THRESHOLD);

    if declared == Some(DocumentType::ProcedureTableAnnex)
        || ANNEX_NAME_MARKERS.iter().any(|m| names.contains(m))
        || code_heavy
    {
        Layout::Annex
    } else if declared == Some(DocumentType::Ordinance) || names.contains("portaria") {
        Layout::Ordinance
    } else {
        Layout::Manual
    }
}

fn is_table_of_contents(text: &str) -> bool {
    text.matches("...").count() > TOC_DOT_LEADERS
}

/// Cut a paragraph into groups of sentences of at most `max_chars`.
fn sentence_groups(paragraph: &str, max_chars: usize) -> Vec<String> {
    if char_len(paragraph) <= max_chars {
        return vec![paragraph.to_string()];
    }

    let mut sentences = Vec::new();
    let mut start = 0;
    let mut prev: Option<char> = None;
    for (idx, ch) in paragraph.char_indices() {
        let boundary = ch == '\n'
            || (ch.is_whitespace() && matches!(prev, Some('.' | '!' | '?' | ';' | ':')));
        if boundary {
            let sentence = paragraph[start..idx].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = idx + ch.len_utf8();
        }
        prev = Some(ch);
    }
    let tail = paragraph[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }

    let mut groups = Vec::new();
    let mut current = String::new();
    for sentence in sentences.into_iter().flat_map(|s| hard_wrap(s, max_chars)) {
        if !current.is_empty() && char_len(&current) + 1 + char_len(&sentence) > max_chars {
            groups.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&sentence);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Wrap an overlong sentence at word boundaries, splitting words only when
/// a single word exceeds `max_chars`.
fn hard_wrap(sentence: &str, max_chars: usize) -> Vec<String> {
    if char_len(sentence) <= max_chars {
        return vec![sentence.to_string()];
    }
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in sentence.split_whitespace() {
        let mut word = word.to_string();
        while char_len(&word) > max_chars {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            let split_at = word
                .char_indices()
                .nth(max_chars)
                .map_or(word.len(), |(i, _)| i);
            let rest = word.split_off(split_at);
            lines.push(word);
            word = rest;
        }
        if word.is_empty() {
            continue;
        }
        if !current.is_empty() && char_len(&current) + 1 + char_len(&word) > max_chars {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// `slug(name)[..24]_sha256(name)[..6]`.
fn id_prefix(name: &str) -> String {
    let slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '_'
            }
        })
        .take(24)
        .collect();
    format!("{slug}_{}", &compute_hash(name)[..6])
}

/// First plausible publication year in a path such as `portaria2007/x.pdf`.
fn year_from_path(path: &str) -> Option<u16> {
    YEAR_RE
        .captures_iter(path)
        .filter_map(|caps| caps[1].parse::<u16>().ok())
        .find(|year| (2000..=2030).contains(year))
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
