//! Structured queries, the SEARCH sub-language, and multi-endpoint
//! orchestration (fan-out and merge)

mod coordinator;
mod merge;
mod parser;

pub use coordinator::*;
pub use merge::*;
pub use parser::*;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::types::{is_valid_field_name, FieldValue};

/// FACETS clause: minimum frequency plus the value fields to aggregate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetRequest {
    #[serde(default)]
    pub min: u64,
    pub fields: Vec<String>,
}

/// ORDER BY clause with a single direction for every field
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub fields: Vec<String>,
    #[serde(default)]
    pub descending: bool,
}

/// DISTINCT clause: keep only the best hit per key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distinct {
    /// Bare `DISTINCT`: one hit per document id across endpoints
    Id,
    /// `DISTINCT <field>`: one hit per value of a value field
    Field(String),
}

impl Distinct {
    /// Collapse key of a hit. Hits without the field are never collapsed.
    pub fn key(&self, id: &str, values: &BTreeMap<String, FieldValue>) -> Option<String> {
        match self {
            Self::Id => Some(id.to_string()),
            Self::Field(field) => values.get(field).map(FieldValue::facet_key),
        }
    }
}

/// Parsed SEARCH request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Query {
    /// Free text; `*` or empty matches every document
    pub search: String,
    /// PARTIAL groups. The first is required, the rest only boost.
    pub partials: Vec<Vec<String>>,
    /// Exact terms every hit must contain
    pub terms: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facets: Option<FacetRequest>,
    pub offset: usize,
    /// `None` means the server's default page size
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_by: Option<OrderBy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distinct: Option<Distinct>,
    /// Return each hit's indexed terms (the TERMS command)
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub include_terms: bool,
}

impl Query {
    /// Create a free-text query
    pub fn new(search: impl Into<String>) -> Self {
        Self {
            search: search.into(),
            ..Default::default()
        }
    }

    /// True when neither free text, PARTIAL nor TERMS restricts the match set
    pub fn matches_all(&self) -> bool {
        let search = self.search.trim();
        (search.is_empty() || search == "*")
            && self.partials.iter().all(|group| group.is_empty())
            && self.terms.is_empty()
    }

    /// Check field names and ranges. Runs before any backend is contacted.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.partials.iter().any(|group| group.is_empty()) {
            return Err(ValidationError::InvalidRange(
                "PARTIAL requires at least one word".to_string(),
            ));
        }
        if let Some(Distinct::Field(field)) = &self.distinct {
            if !is_valid_field_name(field) {
                return Err(ValidationError::InvalidFieldName(field.clone()));
            }
        }
        if let Some(order_by) = &self.order_by {
            if order_by.fields.is_empty() {
                return Err(ValidationError::InvalidRange(
                    "ORDER BY requires at least one field".to_string(),
                ));
            }
            for field in &order_by.fields {
                if !is_valid_field_name(field) {
                    return Err(ValidationError::InvalidFieldName(field.clone()));
                }
            }
        }
        if let Some(facets) = &self.facets {
            if facets.fields.is_empty() {
                return Err(ValidationError::InvalidRange(
                    "FACETS requires at least one field".to_string(),
                ));
            }
            for field in &facets.fields {
                if !is_valid_field_name(field) {
                    return Err(ValidationError::InvalidFieldName(field.clone()));
                }
            }
        }
        if self.offset.checked_add(self.limit.unwrap_or(0)).is_none() {
            return Err(ValidationError::InvalidRange(format!(
                "OFFSET {} + LIMIT {} overflows",
                self.offset,
                self.limit.unwrap_or(0)
            )));
        }
        Ok(())
    }

    /// Query sent to each backend so the merge has `offset + limit`
    /// candidates from every endpoint.
    ///
    /// Facet minimums are applied after summation, so backends are asked
    /// for unfiltered counts.
    pub fn backend_window(&self, limit: usize) -> Query {
        let mut window = self.clone();
        window.offset = 0;
        window.limit = Some(self.offset.saturating_add(limit));
        if let Some(facets) = window.facets.as_mut() {
            facets.min = 0;
        }
        window
    }
}
