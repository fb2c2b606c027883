//! SEARCH sub-language parser
//!
//! ```text
//! SEARCH [free text] [PARTIAL <word ...>]... [TERMS <term ...>]
//!        [FACETS <min> <field ...>] [OFFSET <n>] [LIMIT <n>]
//!        [ORDER BY <field ...> [ASC|DESC]] [DISTINCT [field]]
//! ```
//!
//! Clauses may appear in any order. Field and term lists accept spaces or
//! commas as separators. A payload that is a JSON object is taken as an
//! already-structured query.

use super::{Distinct, FacetRequest, OrderBy, Query};
use crate::error::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clause {
    Text,
    Partial,
    Terms,
    Facets,
    Offset,
    Limit,
    OrderBy,
    Distinct,
}

impl Clause {
    fn name(self) -> &'static str {
        match self {
            Self::Text => "SEARCH",
            Self::Partial => "PARTIAL",
            Self::Terms => "TERMS",
            Self::Facets => "FACETS",
            Self::Offset => "OFFSET",
            Self::Limit => "LIMIT",
            Self::OrderBy => "ORDER BY",
            Self::Distinct => "DISTINCT",
        }
    }
}

/// Parse the text following the SEARCH keyword
pub fn parse_query(input: &str) -> Result<Query, ParseError> {
    let input = input.trim();
    if input.starts_with('{') {
        return serde_json::from_str::<Query>(input)
            .map(normalize_fields)
            .map_err(|e| ParseError::InvalidQuery(e.to_string()));
    }

    let tokens: Vec<&str> = input.split_whitespace().collect();
    let mut query = Query::default();
    let mut text: Vec<&str> = Vec::new();

    let mut i = 0;
    let mut clause = Clause::Text;
    while i < tokens.len() {
        // A keyword closes the running clause and opens a new one
        if let Some((next, consumed)) = keyword_at(&tokens, i) {
            clause = next;
            i += consumed;
            match clause {
                Clause::Partial => query.partials.push(Vec::new()),
                Clause::Facets => {
                    let min = take_number(&tokens, i, clause)?;
                    query.facets = Some(FacetRequest {
                        min,
                        fields: Vec::new(),
                    });
                    i += 1;
                }
                Clause::Offset => {
                    query.offset = take_usize(&tokens, i, clause)?;
                    i += 1;
                }
                Clause::Limit => {
                    query.limit = Some(take_usize(&tokens, i, clause)?);
                    i += 1;
                }
                Clause::OrderBy => {
                    query.order_by = Some(OrderBy::default());
                }
                Clause::Distinct => {
                    query.distinct = Some(Distinct::Id);
                }
                Clause::Text | Clause::Terms => {}
            }
            continue;
        }

        let token = tokens[i];
        match clause {
            Clause::Text => text.push(token),
            Clause::Partial => {
                if let Some(group) = query.partials.last_mut() {
                    group.push(token.to_string());
                }
            }
            Clause::Terms => query.terms.extend(split_list(token)),
            Clause::Facets => {
                if let Some(facets) = query.facets.as_mut() {
                    facets.fields.extend(split_list(token).map(|f| f.to_lowercase()));
                }
            }
            Clause::OrderBy => {
                if let Some(order_by) = query.order_by.as_mut() {
                    if token.eq_ignore_ascii_case("ASC") {
                        order_by.descending = false;
                    } else if token.eq_ignore_ascii_case("DESC") {
                        order_by.descending = true;
                    } else {
                        order_by.fields.extend(split_list(token).map(|f| f.to_lowercase()));
                    }
                }
            }
            Clause::Distinct if query.distinct == Some(Distinct::Id) => {
                query.distinct = Some(Distinct::Field(token.to_lowercase()));
            }
            Clause::Offset | Clause::Limit | Clause::Distinct => {
                return Err(ParseError::InvalidQuery(format!(
                    "unexpected {:?} after {}",
                    token,
                    clause.name()
                )));
            }
        }
        i += 1;
    }

    // An empty first group would silently promote the next one to required
    if query.partials.iter().any(|group| group.is_empty()) {
        return Err(ParseError::InvalidQuery(
            "PARTIAL requires at least one word".to_string(),
        ));
    }

    if let Some(facets) = &query.facets {
        if facets.fields.is_empty() {
            return Err(ParseError::InvalidQuery(
                "FACETS requires at least one field".to_string(),
            ));
        }
    }
    if let Some(order_by) = &query.order_by {
        if order_by.fields.is_empty() {
            return Err(ParseError::InvalidQuery(
                "ORDER BY requires at least one field".to_string(),
            ));
        }
    }

    query.search = text.join(" ");
    Ok(query)
}

/// Recognize a clause keyword at `tokens[i]`, returning it with the number
/// of tokens it spans
fn keyword_at(tokens: &[&str], i: usize) -> Option<(Clause, usize)> {
    let token = tokens[i];
    let clause = if token.eq_ignore_ascii_case("PARTIAL") {
        Clause::Partial
    } else if token.eq_ignore_ascii_case("TERMS") {
        Clause::Terms
    } else if token.eq_ignore_ascii_case("FACETS") {
        Clause::Facets
    } else if token.eq_ignore_ascii_case("OFFSET") {
        Clause::Offset
    } else if token.eq_ignore_ascii_case("LIMIT") {
        Clause::Limit
    } else if token.eq_ignore_ascii_case("DISTINCT") {
        Clause::Distinct
    } else if token.eq_ignore_ascii_case("ORDER")
        && tokens.get(i + 1).is_some_and(|t| t.eq_ignore_ascii_case("BY"))
    {
        return Some((Clause::OrderBy, 2));
    } else {
        return None;
    };
    Some((clause, 1))
}

fn take_number(tokens: &[&str], i: usize, clause: Clause) -> Result<u64, ParseError> {
    let token = tokens.get(i).copied().unwrap_or("");
    token.parse::<u64>().map_err(|_| ParseError::InvalidNumber {
        clause: clause.name().to_string(),
        token: token.to_string(),
    })
}

fn take_usize(tokens: &[&str], i: usize, clause: Clause) -> Result<usize, ParseError> {
    let number = take_number(tokens, i, clause)?;
    usize::try_from(number).map_err(|_| ParseError::InvalidNumber {
        clause: clause.name().to_string(),
        token: number.to_string(),
    })
}

fn split_list(token: &str) -> impl Iterator<Item = String> + '_ {
    token
        .split([',', ';'])
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn normalize_fields(mut query: Query) -> Query {
    if let Some(facets) = query.facets.as_mut() {
        for field in facets.fields.iter_mut() {
            *field = field.to_lowercase();
        }
    }
    if let Some(order_by) = query.order_by.as_mut() {
        for field in order_by.fields.iter_mut() {
            *field = field.to_lowercase();
        }
    }
    if let Some(Distinct::Field(field)) = query.distinct.as_mut() {
        *field = field.to_lowercase();
    }
    query
}
