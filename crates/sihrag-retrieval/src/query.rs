//! Query analysis: shape classification, metadata filters, and
//! decomposition into sub-queries.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sihrag_core::{DocumentType, QueryHint, SourceMetadata};

use crate::normalize::normalize;

static SECTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?:secao|item|capitulo)\s+)?(\d{1,2}(?:\.\d{1,2}){0,2})\.?$")
        .expect("invalid regex")
});

static CODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\d{10}|\d{2}\.\d{2}\.\d{2}\.\d{3}-\d|[a-z]\d{2}(?:\.?\d{1,2})?)$")
        .expect("invalid regex")
});

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(20\d{2})\b").expect("invalid regex"));

static ANNEX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:anexo|tabela)\s+sigtap\b").expect("invalid regex"));

static DIFFERENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)diferen[cç]a\s+entre\s+(.+?)\s+e\s+(.+)").expect("invalid regex")
});

/// Validation-error keywords and the manual vocabulary that explains them.
const CRITICA_HINTS: &[(&str, &str)] = &[
    (
        "critica 7",
        "procedimento principal incompativel com diagnostico principal CID compatibilidade",
    ),
    ("critica 12", "diagnostico principal incompativel com sexo do paciente"),
    ("critica 13", "procedimento principal incompativel com idade do paciente"),
    ("critica 14", "sexo do paciente incompativel com procedimento principal"),
    ("critica 15", "procedimento principal nao permite permanencia"),
    ("050009", "numero da AIH nao informado"),
    ("050046", "procedimento principal incompativel com diagnostico principal"),
    ("050081", "diagnostico principal incompativel com sexo"),
    ("050083", "procedimento incompativel com idade"),
    ("050084", "sexo incompativel com procedimento"),
    ("050097", "procedimento nao permite permanencia"),
];

const ABBREVIATIONS: &[(&str, &str)] = &[
    ("opm", "orteses proteses materiais especiais OPM"),
    ("cid", "classificacao internacional doencas CID diagnostico"),
    ("cbo", "classificacao brasileira ocupacoes CBO profissional"),
    ("cnes", "cadastro nacional estabelecimentos saude CNES"),
    ("uti", "unidade terapia intensiva UTI leito"),
    ("aih", "autorizacao internacao hospitalar AIH"),
];

/// Classify the shape of a query. Never returns [`QueryHint::Unspecified`].
///
/// # Examples
///
/// ```
/// use sihrag_core::QueryHint;
/// use sihrag_retrieval::query::classify;
///
/// assert_eq!(classify("4.2"), QueryHint::SectionNumber);
/// assert_eq!(classify("Seção 12.1.3"), QueryHint::SectionNumber);
/// assert_eq!(classify("03.01.01.001-0"), QueryHint::ProcedureCode);
/// assert_eq!(classify("I10.0"), QueryHint::ProcedureCode);
/// assert_eq!(classify("como lançar diárias de UTI?"), QueryHint::FreeForm);
/// ```
pub fn classify(query: &str) -> QueryHint {
    let normalized = normalize(query);
    if SECTION_RE.is_match(&normalized) {
        QueryHint::SectionNumber
    } else if CODE_RE.is_match(&normalized) {
        QueryHint::ProcedureCode
    } else {
        QueryHint::FreeForm
    }
}

/// Section number carried by a section-shaped query, without a trailing dot.
///
/// # Examples
///
/// ```
/// use sihrag_retrieval::query::section_number;
///
/// assert_eq!(section_number("seção 4.2.").as_deref(), Some("4.2"));
/// assert_eq!(section_number("o que é OPM"), None);
/// ```
pub fn section_number(query: &str) -> Option<String> {
    let normalized = normalize(query);
    SECTION_RE
        .captures(&normalized)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Restriction on chunk metadata. Unset fields match anything; a set field
/// only matches chunks that carry the same value.
///
/// # Examples
///
/// ```
/// use sihrag_core::{DocumentType, SourceMetadata};
/// use sihrag_retrieval::query::MetadataFilter;
///
/// let filter = MetadataFilter { year: Some(2017), document_type: None };
/// let mut meta = SourceMetadata::new("Manual SIH/SUS 2017");
/// assert!(!filter.matches(&meta));
/// meta.year = Some(2017);
/// assert!(filter.matches(&meta));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFilter {
    /// Required publication year.
    pub year: Option<u16>,
    /// Required document type.
    pub document_type: Option<DocumentType>,
}

impl MetadataFilter {
    /// Returns `true` if no field is set.
    pub fn is_empty(&self) -> bool {
        self.year.is_none() && self.document_type.is_none()
    }

    /// Returns `true` if `meta` satisfies every set field.
    pub fn matches(&self, meta: &SourceMetadata) -> bool {
        if let Some(year) = self.year {
            if meta.year != Some(year) {
                return false;
            }
        }
        if let Some(doc_type) = self.document_type {
            if meta.document_type != Some(doc_type) {
                return false;
            }
        }
        true
    }
}

/// Derive a metadata filter from the wording of a question.
///
/// A `20xx` year restricts the year. "anexo sigtap" or "tabela sigtap"
/// restricts to annexes; "portaria" or "manual" alone restrict to that
/// type, but mentioning both leaves the type open.
///
/// # Examples
///
/// ```
/// use sihrag_core::DocumentType;
/// use sihrag_retrieval::query::extract_filters;
///
/// let filter = extract_filters("o que a portaria de 2019 diz sobre OPM?").unwrap();
/// assert_eq!(filter.year, Some(2019));
/// assert_eq!(filter.document_type, Some(DocumentType::Ordinance));
///
/// assert!(extract_filters("como lançar diárias de UTI?").is_none());
/// ```
pub fn extract_filters(query: &str) -> Option<MetadataFilter> {
    let normalized = normalize(query);
    let year = YEAR_RE
        .captures(&normalized)
        .and_then(|caps| caps[1].parse::<u16>().ok());

    let has_word = |word: &str| {
        normalized
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|w| w == word)
    };
    let ordinance = has_word("portaria");
    let manual = has_word("manual");

    let document_type = if ANNEX_RE.is_match(&normalized) {
        Some(DocumentType::ProcedureTableAnnex)
    } else if ordinance && !manual {
        Some(DocumentType::Ordinance)
    } else if manual && !ordinance {
        Some(DocumentType::Manual)
    } else {
        None
    };

    let filter = MetadataFilter {
        year,
        document_type,
    };
    (!filter.is_empty()).then_some(filter)
}

/// Expand a question into sub-queries for broader recall.
///
/// The original question always comes first. Added, in order: the
/// question enriched with the vocabulary of a validation error it mentions,
/// the two halves of an `" e "` conjunction when both have at least two
/// words, both sides of "diferença entre X e Y", and the question with one
/// abbreviation spelled out. Duplicates are removed preserving order.
///
/// # Examples
///
/// ```
/// use sihrag_retrieval::query::decompose;
///
/// let subs = decompose("regras de OPM e diárias de UTI");
/// assert_eq!(subs[0], "regras de OPM e diárias de UTI");
/// assert!(subs.contains(&"regras de OPM".to_string()));
/// assert!(subs.contains(&"diárias de UTI".to_string()));
/// ```
pub fn decompose(query: &str) -> Vec<String> {
    let mut queries = vec![query.to_string()];
    let normalized = normalize(query);

    if let Some((_, hint)) = CRITICA_HINTS
        .iter()
        .find(|(key, _)| normalized.contains(key))
    {
        queries.push(format!("{query} {hint}"));
    }

    if let Some((left, right)) = query.split_once(" e ") {
        if left.split_whitespace().count() >= 2 && right.split_whitespace().count() >= 2 {
            queries.push(left.trim().to_string());
            queries.push(right.trim().to_string());
        }
    }

    if let Some(caps) = DIFFERENCE_RE.captures(query) {
        queries.push(caps[1].trim().to_string());
        queries.push(caps[2].trim().to_string());
    }

    if let Some((_, expansion)) = ABBREVIATIONS.iter().find(|(abbr, _)| {
        normalized
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|w| w == *abbr)
    }) {
        queries.push(format!("{query} {expansion}"));
    }

    let mut seen = std::collections::HashSet::new();
    let deduped: Vec<String> = queries
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty() && seen.insert(q.clone()))
        .collect();

    if deduped.is_empty() {
        vec![query.to_string()]
    } else {
        deduped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_section_numbers() {
        assert_eq!(classify("4"), QueryHint::SectionNumber);
        assert_eq!(classify("12.1.3"), QueryHint::SectionNumber);
        assert_eq!(classify("  seção 3.2 "), QueryHint::SectionNumber);
        assert_eq!(classify("item 7."), QueryHint::SectionNumber);
    }

    #[test]
    fn classify_codes() {
        assert_eq!(classify("0301010010"), QueryHint::ProcedureCode);
        assert_eq!(classify("04.15.01.001-2"), QueryHint::ProcedureCode);
        assert_eq!(classify("J18.9"), QueryHint::ProcedureCode);
        assert_eq!(classify("A00"), QueryHint::ProcedureCode);
    }

    #[test]
    fn classify_free_form_never_unspecified() {
        for q in ["", "diárias de UTI", "4.2 e 4.3", "procedimento 0301010010"] {
            assert_ne!(classify(q), QueryHint::Unspecified, "query {q:?}");
        }
        assert_eq!(classify("procedimento 0301010010"), QueryHint::FreeForm);
    }

    #[test]
    fn section_number_only_for_section_shape() {
        assert_eq!(section_number("12.1.3").as_deref(), Some("12.1.3"));
        assert_eq!(section_number("0301010010"), None);
    }

    #[test]
    fn filters_detect_annex_before_type_words() {
        let f = extract_filters("consultar a tabela SIGTAP da portaria").unwrap();
        assert_eq!(f.document_type, Some(DocumentType::ProcedureTableAnnex));
    }

    #[test]
    fn filters_leave_type_open_when_both_mentioned() {
        assert!(extract_filters("diferença entre o manual e a portaria").is_none());
        let f = extract_filters("manual e portaria de 2012").unwrap();
        assert_eq!(f.year, Some(2012));
        assert!(f.document_type.is_none());
    }

    #[test]
    fn filters_ignore_sigtap_as_concept() {
        assert!(extract_filters("o que é o SIGTAP").is_none());
    }

    #[test]
    fn filter_matches_requires_every_set_field() {
        let filter = MetadataFilter {
            year: Some(2017),
            document_type: Some(DocumentType::Manual),
        };
        let mut meta = SourceMetadata::new("Manual");
        meta.year = Some(2017);
        assert!(!filter.matches(&meta));
        meta.document_type = Some(DocumentType::Manual);
        assert!(filter.matches(&meta));
        assert!(MetadataFilter::default().matches(&SourceMetadata::new("x")));
    }

    #[test]
    fn decompose_adds_critica_hint() {
        let subs = decompose("Crítica 7");
        assert_eq!(subs.len(), 2);
        assert!(subs[1].contains("compatibilidade"));
    }

    #[test]
    fn decompose_skips_short_conjunction_halves() {
        let subs = decompose("OPM e UTI");
        assert!(!subs.contains(&"OPM".to_string()));
    }

    #[test]
    fn decompose_difference_pattern() {
        let subs = decompose("diferença entre alta e óbito");
        assert!(subs.contains(&"alta".to_string()));
        assert!(subs.contains(&"óbito".to_string()));
    }

    #[test]
    fn decompose_expands_one_abbreviation() {
        let subs = decompose("como registrar OPM na AIH");
        let expanded: Vec<_> = subs.iter().filter(|s| s.len() > 30).collect();
        assert_eq!(expanded.len(), 1);
        assert!(expanded[0].contains("orteses proteses"));
    }

    #[test]
    fn decompose_deduplicates() {
        let subs = decompose("tabela de procedimentos");
        assert_eq!(subs, vec!["tabela de procedimentos".to_string()]);
    }
}
