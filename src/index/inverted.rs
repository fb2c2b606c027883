//! In-memory inverted index used by the local backend
//!
//! Rebuilt from [`super::DocumentStore`] when a database is opened and kept
//! in step with every write afterwards.

use std::collections::{BTreeMap, HashMap, HashSet};

use super::analyzer::{document_terms, tokenize, GeneratedTerm};
use crate::query::Query;
use crate::types::{compare_values, BackendResults, Document, FacetCounts, FieldValue, Hit};

/// Indexed form of a document
#[derive(Debug, Clone)]
struct IndexedDocument {
    data: serde_json::Value,
    values: BTreeMap<String, FieldValue>,
    terms: Vec<String>,
}

/// Term postings plus the documents they point into
#[derive(Debug, Default)]
pub struct InvertedIndex {
    documents: HashMap<String, IndexedDocument>,
    /// term -> document id -> within-document frequency
    postings: HashMap<String, HashMap<String, u32>>,
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Add or replace a document
    pub fn insert(&mut self, document: &Document) {
        self.insert_terms(document, document_terms(document));
    }

    /// Add or replace a document whose terms were already generated
    pub fn insert_terms(&mut self, document: &Document, generated: Vec<GeneratedTerm>) {
        self.remove(&document.id);

        let mut terms = Vec::with_capacity(generated.len());
        for g in generated {
            self.postings
                .entry(g.term.clone())
                .or_default()
                .insert(document.id.clone(), g.wdf);
            terms.push(g.term);
        }

        self.documents.insert(
            document.id.clone(),
            IndexedDocument {
                data: document.data.clone(),
                values: document
                    .values
                    .iter()
                    .map(|(k, v)| (k.to_lowercase(), v.clone()))
                    .collect(),
                terms,
            },
        );
    }

    /// Remove a document, returning whether it existed
    pub fn remove(&mut self, id: &str) -> bool {
        let Some(existing) = self.documents.remove(id) else {
            return false;
        };
        for term in existing.terms {
            if let Some(posting) = self.postings.get_mut(&term) {
                posting.remove(id);
                if posting.is_empty() {
                    self.postings.remove(&term);
                }
            }
        }
        true
    }

    /// Evaluate a query and return up to `limit` hits plus totals and
    /// unfiltered facet counts over the whole match set
    pub fn search(&self, query: &Query, limit: usize) -> BackendResults {
        let scored = self.matching(query);

        let mut facets: FacetCounts = BTreeMap::new();
        if let Some(request) = &query.facets {
            for field in &request.fields {
                let counts = facets.entry(field.clone()).or_default();
                for id in scored.keys() {
                    if let Some(value) = self.documents.get(*id).and_then(|d| d.values.get(field)) {
                        *counts.entry(value.facet_key()).or_insert(0) += 1;
                    }
                }
            }
        }

        let mut ranked: Vec<(&String, f64)> = scored.iter().map(|(id, s)| (*id, *s)).collect();
        ranked.sort_by(|(a_id, a_score), (b_id, b_score)| {
            let by_key = match &query.order_by {
                Some(order) => {
                    let a_doc = self.documents.get(*a_id);
                    let b_doc = self.documents.get(*b_id);
                    let key = order.fields.iter().fold(std::cmp::Ordering::Equal, |acc, f| {
                        acc.then_with(|| {
                            compare_values(
                                a_doc.and_then(|d| d.values.get(f)),
                                b_doc.and_then(|d| d.values.get(f)),
                            )
                        })
                    });
                    if order.descending {
                        key.reverse()
                    } else {
                        key
                    }
                }
                None => std::cmp::Ordering::Equal,
            };
            by_key
                .then_with(|| b_score.total_cmp(a_score))
                .then_with(|| a_id.cmp(b_id))
        });

        let mut seen = HashSet::new();
        let hits = ranked
            .into_iter()
            .filter_map(|(id, weight)| self.documents.get(id).map(|doc| (id, weight, doc)))
            .filter(|(id, _, doc)| match &query.distinct {
                Some(distinct) => distinct
                    .key(id, &doc.values)
                    .map_or(true, |key| seen.insert(key)),
                None => true,
            })
            .take(limit)
            .map(|(id, weight, doc)| Hit {
                id: id.clone(),
                rank: 0,
                weight,
                endpoint: String::new(),
                data: doc.data.clone(),
                values: doc.values.clone(),
                terms: query.include_terms.then(|| doc.terms.clone()),
            })
            .collect();

        BackendResults {
            hits,
            total: scored.len() as u64,
            facets,
            partial: false,
        }
    }

    /// Number of documents matching a query
    pub fn count(&self, query: &Query) -> u64 {
        self.matching(query).len() as u64
    }

    /// Match set with relevance scores
    fn matching(&self, query: &Query) -> HashMap<&String, f64> {
        if query.matches_all() {
            return self.documents.keys().map(|id| (id, 0.0)).collect();
        }

        let mut candidates: Option<HashMap<&String, f64>> = None;

        // Free text: any term may match, scores accumulate
        let search = query.search.trim();
        if !search.is_empty() && search != "*" {
            let mut scored: HashMap<&String, f64> = HashMap::new();
            for token in tokenize(search) {
                self.score_term(&token, &mut scored);
            }
            candidates = Some(scored);
        }

        // First PARTIAL group is required, later ones only boost
        let mut groups = query.partials.iter();
        if let Some(first) = groups.next() {
            let matched = self.partial_group(first);
            candidates = Some(match candidates {
                Some(current) => current
                    .into_iter()
                    .filter_map(|(id, score)| matched.get(id).map(|boost| (id, score + boost)))
                    .collect(),
                None => matched,
            });
            for group in groups {
                let boost = self.partial_group(group);
                if let Some(current) = candidates.as_mut() {
                    for (id, score) in current.iter_mut() {
                        if let Some(extra) = boost.get(id) {
                            *score += extra;
                        }
                    }
                }
            }
        }

        // Exact TERMS filter every candidate without scoring
        if !query.terms.is_empty() {
            let mut filtered = match candidates {
                Some(current) => current,
                None => self.documents.keys().map(|id| (id, 0.0)).collect(),
            };
            for term in &query.terms {
                let posting = self.postings.get(term);
                filtered.retain(|id, _| posting.is_some_and(|p| p.contains_key(*id)));
            }
            candidates = Some(filtered);
        }

        candidates.unwrap_or_default()
    }

    fn idf(&self, document_frequency: usize) -> f64 {
        let n = self.documents.len().max(1) as f64;
        (1.0 + n / document_frequency.max(1) as f64).ln()
    }

    fn score_term<'a>(&'a self, term: &str, scored: &mut HashMap<&'a String, f64>) {
        if let Some(posting) = self.postings.get(term) {
            let idf = self.idf(posting.len());
            for (id, wdf) in posting {
                *scored.entry(id).or_insert(0.0) += *wdf as f64 * idf;
            }
        }
    }

    /// Documents containing every word of the group, the last word matched
    /// as a prefix
    fn partial_group(&self, words: &[String]) -> HashMap<&String, f64> {
        let tokens: Vec<String> = words.iter().flat_map(|w| tokenize(w)).collect();
        let Some((last, exact)) = tokens.split_last() else {
            return HashMap::new();
        };

        let mut required: Vec<HashMap<&String, f64>> = Vec::with_capacity(tokens.len());
        for token in exact {
            let mut scored = HashMap::new();
            self.score_term(token, &mut scored);
            required.push(scored);
        }

        let mut prefixed: HashMap<&String, f64> = HashMap::new();
        for term in self.postings.keys().filter(|t| t.starts_with(last.as_str())) {
            self.score_term(term, &mut prefixed);
        }
        required.push(prefixed);

        let mut iter = required.into_iter();
        let mut result = iter.next().unwrap_or_default();
        for next in iter {
            let keep: HashSet<&String> = next.keys().copied().collect();
            result.retain(|id, _| keep.contains(id));
            for (id, score) in result.iter_mut() {
                if let Some(extra) = next.get(id) {
                    *score += extra;
                }
            }
        }
        result
    }
}
