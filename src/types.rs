//! Core types for the lindex server

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Unique identifier for a document within an endpoint
pub type DocumentId = String;

/// Facet table: value field name -> counts ordered by frequency
pub type FacetTable = BTreeMap<String, Vec<FacetCount>>;

/// Raw facet counts: value field name -> value -> frequency
pub type FacetCounts = BTreeMap<String, BTreeMap<String, u64>>;

// ============================================================================
// Field values
// ============================================================================

/// Typed scalar stored in a document's `values` map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Key used when counting facets.
    ///
    /// Integral numbers render without a fractional part so that `2` and
    /// `2.0` land in the same bucket.
    pub fn facet_key(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.clone(),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::Number(_) => 1,
            Self::Text(_) => 2,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.facet_key())
    }
}

/// Total order over optional field values used for ORDER BY.
///
/// Missing < Bool < Number < Text; numbers compare numerically.
pub fn compare_values(a: Option<&FieldValue>, b: Option<&FieldValue>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a, b) {
            (FieldValue::Bool(x), FieldValue::Bool(y)) => x.cmp(y),
            (FieldValue::Number(x), FieldValue::Number(y)) => x.total_cmp(y),
            (FieldValue::Text(x), FieldValue::Text(y)) => x.cmp(y),
            _ => a.type_rank().cmp(&b.type_rank()),
        },
    }
}

/// Returns true when `name` is usable as a value field name
/// (`[_a-zA-Z][_a-zA-Z0-9]*`).
pub fn is_valid_field_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

// ============================================================================
// Documents
// ============================================================================

/// Exact term attached to a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermEntry {
    pub term: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
}

impl TermEntry {
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            weight: None,
            prefix: None,
            position: None,
        }
    }
}

/// Free text to be tokenized into terms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextEntry {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spelling: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positions: Option<bool>,
}

impl TextEntry {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            weight: None,
            prefix: None,
            language: None,
            spelling: None,
            positions: None,
        }
    }
}

/// A document submitted for indexing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    /// Opaque payload returned verbatim in search hits
    pub data: serde_json::Value,
    #[serde(default)]
    pub values: BTreeMap<String, FieldValue>,
    #[serde(default)]
    pub terms: Vec<TermEntry>,
    #[serde(default)]
    pub texts: Vec<TextEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub spelling: bool,
    #[serde(default)]
    pub positions: bool,
}

impl Document {
    /// Create a document with the given id and data
    pub fn new(id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            data,
            values: BTreeMap::new(),
            terms: Vec::new(),
            texts: Vec::new(),
            language: None,
            spelling: false,
            positions: false,
        }
    }

    /// Builder: add a value field
    pub fn with_value(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    /// Builder: add an exact term
    pub fn with_term(mut self, term: impl Into<String>) -> Self {
        self.terms.push(TermEntry::new(term));
        self
    }

    /// Builder: add free text
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.texts.push(TextEntry::new(text));
        self
    }
}

// ============================================================================
// Search results
// ============================================================================

/// One matching document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub id: DocumentId,
    /// Position in the merged result sequence (0-based, includes offset)
    #[serde(default)]
    pub rank: usize,
    /// Relevance score as computed by the originating endpoint
    pub weight: f64,
    /// Endpoint the hit came from
    #[serde(default)]
    pub endpoint: String,
    /// Omitted by FIND
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    #[serde(default)]
    pub values: BTreeMap<String, FieldValue>,
    /// Indexed terms, filled in only when the query asks for them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms: Option<Vec<String>>,
}

/// Frequency of one distinct value of a faceted field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetCount {
    pub term: String,
    pub count: u64,
}

/// Result page produced by a single backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendResults {
    /// Ranked hits, at most the requested window
    pub hits: Vec<Hit>,
    /// Number of matching documents in this backend
    pub total: u64,
    /// Unfiltered facet counts over every matching document
    pub facets: FacetCounts,
    /// The backend itself answered with incomplete data (e.g. a peer whose
    /// own endpoints partially failed)
    pub partial: bool,
}

/// Per-endpoint failure recorded during a fan-out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointFailure {
    pub endpoint: String,
    pub error: String,
}

impl EndpointFailure {
    pub fn new(endpoint: impl Into<String>, error: impl ToString) -> Self {
        Self {
            endpoint: endpoint.into(),
            error: error.to_string(),
        }
    }
}

impl fmt::Display for EndpointFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.endpoint, self.error)
    }
}

/// Merged, paginated, faceted response across every bound endpoint
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResults {
    pub hits: Vec<Hit>,
    /// Sum of per-endpoint match counts (approximate across endpoints)
    pub estimated: u64,
    pub facets: FacetTable,
    /// At least one endpoint failed, timed out or reported partial data
    pub partial: bool,
    pub failures: Vec<EndpointFailure>,
    /// Non-fatal notes for the client (clamped limits and the like)
    pub warnings: Vec<String>,
}

/// Outcome of indexing one document across the bound endpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexOutcome {
    pub id: DocumentId,
    pub indexed: Vec<String>,
    pub failures: Vec<EndpointFailure>,
}

impl IndexOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_value_untagged_deserialization() {
        let values: BTreeMap<String, FieldValue> =
            serde_json::from_str(r#"{"a": 2, "b": 1.4, "c": "red", "d": true}"#).unwrap();
        assert_eq!(values["a"], FieldValue::Number(2.0));
        assert_eq!(values["b"], FieldValue::Number(1.4));
        assert_eq!(values["c"], FieldValue::Text("red".to_string()));
        assert_eq!(values["d"], FieldValue::Bool(true));
    }

    #[test]
    fn test_facet_key_integral_numbers() {
        assert_eq!(FieldValue::Number(2.0).facet_key(), "2");
        assert_eq!(FieldValue::Number(1.4).facet_key(), "1.4");
        assert_eq!(FieldValue::Bool(false).facet_key(), "false");
    }

    #[test]
    fn test_compare_values_orders_missing_first() {
        let two = FieldValue::Number(2.0);
        let small = FieldValue::Number(1.4);
        assert_eq!(compare_values(Some(&two), Some(&small)), Ordering::Greater);
        assert_eq!(compare_values(None, Some(&small)), Ordering::Less);
        assert_eq!(
            compare_values(Some(&FieldValue::Text("a".into())), Some(&two)),
            Ordering::Greater
        );
    }

    #[test]
    fn test_field_name_validation() {
        assert!(is_valid_field_name("color"));
        assert!(is_valid_field_name("_size2"));
        assert!(!is_valid_field_name("2size"));
        assert!(!is_valid_field_name("col-or"));
        assert!(!is_valid_field_name(""));
    }
}
