//! Text analysis shared by indexing and querying

use unicode_segmentation::UnicodeSegmentation;

use crate::types::Document;

/// Split text into lower-cased word tokens
pub fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words().map(|w| w.to_lowercase()).collect()
}

/// A term generated for a document and its within-document frequency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedTerm {
    pub term: String,
    pub wdf: u32,
}

/// Generate every term a document is indexed under.
///
/// The document id is always present as a zero-frequency boolean term so
/// that exact-id filters find it. Explicit terms are kept verbatim; texts are
/// tokenized and lower-cased. Prefixes are prepended as given.
pub fn document_terms(document: &Document) -> Vec<GeneratedTerm> {
    let mut terms: std::collections::BTreeMap<String, u32> = std::collections::BTreeMap::new();
    terms.insert(document.id.clone(), 0);

    for entry in &document.terms {
        let prefix = entry.prefix.as_deref().unwrap_or("");
        let weight = entry.weight.unwrap_or(1);
        let wdf = terms.entry(format!("{}{}", prefix, entry.term)).or_insert(0);
        *wdf = wdf.saturating_add(weight);
    }

    for entry in &document.texts {
        let prefix = entry.prefix.as_deref().unwrap_or("");
        let weight = entry.weight.unwrap_or(1);
        for token in tokenize(&entry.text) {
            let wdf = terms.entry(format!("{}{}", prefix, token)).or_insert(0);
            *wdf = wdf.saturating_add(weight);
        }
    }

    terms
        .into_iter()
        .map(|(term, wdf)| GeneratedTerm { term, wdf })
        .collect()
}
