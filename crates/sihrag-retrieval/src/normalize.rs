//! Text normalization and tokenization shared by indexing and querying.
//!
//! [`analyze`] is the one routine both sides of the lexical index call.
//! Any change here changes what the index matches, so it must never be
//! duplicated elsewhere.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// SIGTAP procedure code (`03.01.01.001-0`), CID code (`i10.0`), or a plain
/// alphanumeric run, in that order of preference.
static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{2}\.\d{2}\.\d{2}\.\d{3}-\d)|([a-z]\d{2}\.\d{1,2})|([a-z0-9]+)")
        .expect("invalid regex")
});

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    "a o e de do da dos das em no na nos nas um uma uns umas para por com como \
     que se ou ao aos as os seu sua seus suas este esta esse essa isso isto \
     aquele aquela ser ter estar foi sao nao mais muito bem ja so entre ate \
     sobre quando qual quais cada todo toda todos todas pode deve tambem mesmo \
     ainda pela pelo pelos pelas num numa"
        .split_whitespace()
        .collect()
});

/// Lowercase, strip diacritics, collapse whitespace.
///
/// # Examples
///
/// ```
/// use sihrag_retrieval::normalize::normalize;
///
/// assert_eq!(normalize("  Internação   CLÍNICA\n"), "internacao clinica");
/// ```
pub fn normalize(text: &str) -> String {
    let stripped: String = text.nfd().filter(|c| !is_combining_mark(*c)).collect();
    stripped
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split normalized text into index terms.
///
/// Procedure codes collapse to their ten digits and CID codes lose their
/// dot, so `03.01.01.001-0` and `0301010010` are the same term. Tokens
/// shorter than two characters and Portuguese stopwords are dropped.
///
/// # Examples
///
/// ```
/// use sihrag_retrieval::normalize::tokenize;
///
/// let tokens = tokenize("procedimento 03.01.01.001-0 com cid i10.0");
/// assert_eq!(tokens, vec!["procedimento", "0301010010", "cid", "i100"]);
/// ```
pub fn tokenize(normalized: &str) -> Vec<String> {
    TOKEN_RE
        .find_iter(normalized)
        .map(|m| {
            m.as_str()
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
        })
        .filter(|t| t.len() >= 2 && !STOPWORDS.contains(t.as_str()))
        .collect()
}

/// `tokenize(normalize(text))`.
///
/// # Examples
///
/// ```
/// use sihrag_retrieval::normalize::analyze;
///
/// assert_eq!(analyze("Habilitação de leito UTI"), vec!["habilitacao", "leito", "uti"]);
/// ```
pub fn analyze(text: &str) -> Vec<String> {
    tokenize(&normalize(text))
}

/// Returns `true` if `token` is in the Portuguese stopword list.
pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(token)
}
