//! Merging per-endpoint result pages into one response
//!
//! Relevance scores from different endpoints are compared directly even
//! though each endpoint scores against its own statistics. The combined
//! relevance order is therefore approximate when several endpoints are
//! bound; ORDER BY keys are exact.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use super::{Distinct, OrderBy};
use crate::types::{compare_values, BackendResults, FacetCount, FacetCounts, FacetTable, Hit};

/// Result page returned by one endpoint, tagged with its binding position
#[derive(Debug, Clone)]
pub struct EndpointPage {
    /// Position of the endpoint in the session binding, used to break ties
    pub position: usize,
    pub endpoint: String,
    pub results: BackendResults,
}

/// Output of [`merge_pages`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedPage {
    pub hits: Vec<Hit>,
    pub estimated: u64,
    pub facets: FacetTable,
    pub partial: bool,
}

/// Combine pages into a single globally ordered, paginated sequence.
///
/// The output depends only on the pages' contents and positions, never on
/// the order the pages are supplied in.
pub fn merge_pages(
    pages: Vec<EndpointPage>,
    order_by: Option<&OrderBy>,
    distinct: Option<&Distinct>,
    offset: usize,
    limit: usize,
    facet_min: u64,
) -> MergedPage {
    let mut estimated = 0u64;
    let mut partial = false;
    let mut facet_sums: FacetCounts = BTreeMap::new();
    let mut candidates: Vec<(usize, Hit)> = Vec::new();

    for page in pages {
        estimated = estimated.saturating_add(page.results.total);
        partial |= page.results.partial;
        sum_facets(&mut facet_sums, page.results.facets);
        candidates.extend(page.results.hits.into_iter().map(|mut hit| {
            hit.endpoint = page.endpoint.clone();
            (page.position, hit)
        }));
    }

    candidates.sort_by(|a, b| compare_candidates(a, b, order_by));

    if let Some(distinct) = distinct {
        let mut seen = HashSet::new();
        candidates.retain(|(_, hit)| {
            distinct
                .key(&hit.id, &hit.values)
                .map_or(true, |key| seen.insert(key))
        });
    }

    let hits = candidates
        .into_iter()
        .skip(offset)
        .take(limit)
        .enumerate()
        .map(|(i, (_, mut hit))| {
            hit.rank = offset + i;
            hit
        })
        .collect();

    MergedPage {
        hits,
        estimated,
        facets: filter_facets(facet_sums, facet_min),
        partial,
    }
}

fn compare_candidates(a: &(usize, Hit), b: &(usize, Hit), order_by: Option<&OrderBy>) -> Ordering {
    let (a_pos, a_hit) = a;
    let (b_pos, b_hit) = b;

    let by_key = match order_by {
        Some(order) => {
            let key = order.fields.iter().fold(Ordering::Equal, |acc, field| {
                acc.then_with(|| compare_values(a_hit.values.get(field), b_hit.values.get(field)))
            });
            if order.descending {
                key.reverse()
            } else {
                key
            }
        }
        None => Ordering::Equal,
    };

    by_key
        .then_with(|| b_hit.weight.total_cmp(&a_hit.weight))
        .then_with(|| a_pos.cmp(b_pos))
        .then_with(|| a_hit.id.cmp(&b_hit.id))
}

/// Add one endpoint's facet counts into the running totals
pub fn sum_facets(into: &mut FacetCounts, from: FacetCounts) {
    for (field, counts) in from {
        let slot = into.entry(field).or_default();
        for (term, count) in counts {
            *slot.entry(term).or_insert(0) += count;
        }
    }
}

/// Drop values below `min` and order the rest by count, then value
pub fn filter_facets(sums: FacetCounts, min: u64) -> FacetTable {
    sums.into_iter()
        .map(|(field, counts)| {
            let mut entries: Vec<FacetCount> = counts
                .into_iter()
                .filter(|(_, count)| *count >= min.max(1))
                .map(|(term, count)| FacetCount { term, count })
                .collect();
            entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.term.cmp(&b.term)));
            (field, entries)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldValue;

    fn hit(id: &str, weight: f64, size: Option<f64>) -> Hit {
        let mut values = BTreeMap::new();
        if let Some(size) = size {
            values.insert("size".to_string(), FieldValue::Number(size));
        }
        Hit {
            id: id.to_string(),
            rank: 0,
            weight,
            endpoint: String::new(),
            data: serde_json::json!({ "id": id }),
            values,
            terms: None,
        }
    }

    fn page(position: usize, endpoint: &str, hits: Vec<Hit>, total: u64) -> EndpointPage {
        EndpointPage {
            position,
            endpoint: endpoint.to_string(),
            results: BackendResults {
                hits,
                total,
                facets: BTreeMap::new(),
                partial: false,
            },
        }
    }

    #[test]
    fn test_merge_by_relevance() {
        let pages = vec![
            page(0, "a", vec![hit("a1", 3.0, None), hit("a2", 1.0, None)], 2),
            page(1, "b", vec![hit("b1", 2.0, None)], 7),
        ];
        let merged = merge_pages(pages, None, None, 0, 10, 0);

        let ids: Vec<&str> = merged.hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "b1", "a2"]);
        assert_eq!(merged.estimated, 9);
        assert_eq!(merged.hits[1].endpoint, "b");
        assert_eq!(merged.hits[2].rank, 2);
    }

    #[test]
    fn test_merge_order_by_desc() {
        let order = OrderBy {
            fields: vec!["size".into()],
            descending: true,
        };
        let pages = vec![
            page(0, "a", vec![hit("small", 9.0, Some(1.4))], 1),
            page(1, "b", vec![hit("big", 0.1, Some(2.0))], 1),
        ];
        let merged = merge_pages(pages, Some(&order), None, 0, 10, 0);
        assert_eq!(merged.hits[0].id, "big");
        assert_eq!(merged.hits[1].id, "small");
    }

    #[test]
    fn test_merge_is_independent_of_input_order() {
        let order = OrderBy {
            fields: vec!["size".into()],
            descending: false,
        };
        let make = || {
            vec![
                page(0, "a", vec![hit("x", 1.0, Some(1.0)), hit("y", 1.0, Some(2.0))], 2),
                page(1, "b", vec![hit("x", 1.0, Some(1.0)), hit("z", 5.0, None)], 2),
                page(2, "c", vec![hit("w", 1.0, Some(2.0))], 1),
            ]
        };
        let forward = merge_pages(make(), Some(&order), None, 0, 10, 0);

        let mut reversed_pages = make();
        reversed_pages.reverse();
        let reversed = merge_pages(reversed_pages, Some(&order), None, 0, 10, 0);

        let mut rotated_pages = make();
        rotated_pages.rotate_left(1);
        let rotated = merge_pages(rotated_pages, Some(&order), None, 0, 10, 0);

        assert_eq!(forward, reversed);
        assert_eq!(forward, rotated);
        let ids: Vec<(&str, &str)> = forward
            .hits
            .iter()
            .map(|h| (h.id.as_str(), h.endpoint.as_str()))
            .collect();
        assert_eq!(
            ids,
            vec![("z", "b"), ("x", "a"), ("x", "b"), ("y", "a"), ("w", "c")]
        );
    }

    #[test]
    fn test_global_pagination() {
        let pages = vec![
            page(0, "a", vec![hit("a1", 6.0, None), hit("a2", 4.0, None), hit("a3", 2.0, None)], 3),
            page(1, "b", vec![hit("b1", 5.0, None), hit("b2", 3.0, None), hit("b3", 1.0, None)], 3),
        ];
        let merged = merge_pages(pages, None, None, 2, 2, 0);
        let ids: Vec<&str> = merged.hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a2", "b2"]);
        assert_eq!(merged.hits[0].rank, 2);
        assert_eq!(merged.estimated, 6);
    }

    #[test]
    fn test_distinct_id_across_endpoints() {
        let pages = vec![
            page(0, "a", vec![hit("x", 1.0, None), hit("y", 0.5, None)], 2),
            page(1, "b", vec![hit("x", 2.0, None), hit("z", 0.1, None)], 2),
        ];
        let merged = merge_pages(pages, None, Some(&Distinct::Id), 0, 10, 0);
        let ids: Vec<(&str, &str)> = merged
            .hits
            .iter()
            .map(|h| (h.id.as_str(), h.endpoint.as_str()))
            .collect();
        assert_eq!(ids, vec![("x", "b"), ("y", "a"), ("z", "b")]);
        assert_eq!(merged.hits[2].rank, 2);
    }

    #[test]
    fn test_distinct_field_across_endpoints() {
        let pages = vec![
            page(0, "a", vec![hit("a1", 3.0, Some(1.0)), hit("a2", 1.0, None)], 2),
            page(1, "b", vec![hit("b1", 2.0, Some(1.0)), hit("b2", 0.5, Some(2.0))], 2),
        ];
        let distinct = Distinct::Field("size".into());
        let merged = merge_pages(pages, None, Some(&distinct), 0, 10, 0);
        let ids: Vec<&str> = merged.hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2", "b2"]);
    }

    #[test]
    fn test_zero_limit_keeps_estimate() {
        let pages = vec![page(0, "a", vec![], 42)];
        let merged = merge_pages(pages, None, None, 0, 0, 0);
        assert!(merged.hits.is_empty());
        assert_eq!(merged.estimated, 42);
    }

    #[test]
    fn test_facets_summed_then_filtered() {
        let mut a = BTreeMap::new();
        a.insert(
            "color".to_string(),
            BTreeMap::from([("red".to_string(), 1), ("blue".to_string(), 1)]),
        );
        let mut b = BTreeMap::new();
        b.insert("color".to_string(), BTreeMap::from([("red".to_string(), 1)]));

        let mut sums = BTreeMap::new();
        sum_facets(&mut sums, a);
        sum_facets(&mut sums, b);

        let all = filter_facets(sums.clone(), 1);
        assert_eq!(
            all["color"],
            vec![
                FacetCount { term: "red".into(), count: 2 },
                FacetCount { term: "blue".into(), count: 1 },
            ]
        );

        let frequent = filter_facets(sums, 2);
        assert_eq!(
            frequent["color"],
            vec![FacetCount { term: "red".into(), count: 2 }]
        );
    }
}
