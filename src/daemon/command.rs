//! Command Parser
//!
//! Turns one request line into a typed [`Command`]. Keywords are
//! case-insensitive. A line that starts with `{` is an implicit INDEX.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::ParseError;
use crate::query::{parse_query, FacetRequest, Query};
use crate::types::{is_valid_field_name, Document, FieldValue, TermEntry, TextEntry};

/// One parsed request
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Bind to existing endpoints (USING or OPEN)
    Using(Vec<String>),
    /// Bind to endpoints, creating local databases as needed
    Create(Vec<String>),
    Index {
        document: Document,
        /// Per-document override of the session binding
        endpoints: Option<Vec<String>>,
        /// Commit after indexing (CINDEX)
        commit: bool,
    },
    Search(Query),
    /// SEARCH without document data
    Find(Query),
    /// Facet counts only, no hits
    Facets(Query),
    /// Hits with their indexed terms instead of data
    Terms(Query),
    Count(Query),
    Delete {
        id: String,
        /// Commit after deleting (CDELETE)
        commit: bool,
    },
    Commit,
    /// Re-read the bound endpoints' latest state
    Reopen,
    Endpoints,
    Databases,
    Version,
    Help(Option<String>),
    Quit,
}

impl Command {
    /// Keyword used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Using(_) => "USING",
            Self::Create(_) => "CREATE",
            Self::Index { commit: false, .. } => "INDEX",
            Self::Index { commit: true, .. } => "CINDEX",
            Self::Search(_) => "SEARCH",
            Self::Find(_) => "FIND",
            Self::Facets(_) => "FACETS",
            Self::Terms(_) => "TERMS",
            Self::Count(_) => "COUNT",
            Self::Delete { commit: false, .. } => "DELETE",
            Self::Delete { commit: true, .. } => "CDELETE",
            Self::Commit => "COMMIT",
            Self::Reopen => "REOPEN",
            Self::Endpoints => "ENDPOINTS",
            Self::Databases => "DATABASES",
            Self::Version => "VERSION",
            Self::Help(_) => "HELP",
            Self::Quit => "QUIT",
        }
    }
}

/// Help entry for one command
#[derive(Debug, Clone, Copy)]
pub struct CommandHelp {
    pub name: &'static str,
    pub summary: &'static str,
    pub usage: &'static [&'static str],
}

/// Every command, in the order HELP lists them
pub const COMMANDS: &[CommandHelp] = &[
    CommandHelp {
        name: "USING",
        summary: "Select existing databases for this connection",
        usage: &[
            "USING <endpoint> [<endpoint> ...]",
            "Endpoints: name | file:///path | [scheme://]host[:port][/db]",
            "Several endpoints fan every command out to all of them.",
        ],
    },
    CommandHelp {
        name: "OPEN",
        summary: "Same as USING",
        usage: &["OPEN <endpoint> [<endpoint> ...]"],
    },
    CommandHelp {
        name: "CREATE",
        summary: "Select databases, creating them if needed",
        usage: &["CREATE <endpoint> [<endpoint> ...]"],
    },
    CommandHelp {
        name: "INDEX",
        summary: "Index one JSON document",
        usage: &[
            "INDEX {\"id\": ..., \"data\": ..., \"values\": {...}, \"terms\": [...], \"texts\": [...]}",
            "A line starting with '{' is an implicit INDEX.",
            "Optional \"endpoints\": [...] overrides the selected databases.",
        ],
    },
    CommandHelp {
        name: "CINDEX",
        summary: "Index one JSON document and commit",
        usage: &["CINDEX <json-document>"],
    },
    CommandHelp {
        name: "SEARCH",
        summary: "Search the selected databases",
        usage: &[
            "SEARCH [text] [PARTIAL <word> ...]... [TERMS <term> ...]",
            "       [FACETS <min> <field> ...] [OFFSET <n>] [LIMIT <n>]",
            "       [ORDER BY <field> ... [ASC|DESC]] [DISTINCT [field]]",
            "SEARCH <json-query>",
        ],
    },
    CommandHelp {
        name: "FIND",
        summary: "Search without returning document data",
        usage: &["FIND <query>", "Takes the same query as SEARCH."],
    },
    CommandHelp {
        name: "FACETS",
        summary: "Count the values of fields over the matching documents",
        usage: &[
            "FACETS [min] <field> ...",
            "FACETS <query> FACETS <min> <field> ...",
        ],
    },
    CommandHelp {
        name: "TERMS",
        summary: "List the indexed terms of matching documents",
        usage: &["TERMS <query>", "Takes the same query as SEARCH."],
    },
    CommandHelp {
        name: "COUNT",
        summary: "Count matching documents",
        usage: &["COUNT [query]"],
    },
    CommandHelp {
        name: "DELETE",
        summary: "Delete a document by id",
        usage: &["DELETE <id>"],
    },
    CommandHelp {
        name: "CDELETE",
        summary: "Delete a document by id and commit",
        usage: &["CDELETE <id>"],
    },
    CommandHelp {
        name: "COMMIT",
        summary: "Flush pending writes to disk",
        usage: &["COMMIT"],
    },
    CommandHelp {
        name: "REOPEN",
        summary: "Re-open the selected databases at their latest state",
        usage: &["REOPEN"],
    },
    CommandHelp {
        name: "ENDPOINTS",
        summary: "List the databases selected on this connection",
        usage: &["ENDPOINTS"],
    },
    CommandHelp {
        name: "DATABASES",
        summary: "List every database open in the server",
        usage: &["DATABASES"],
    },
    CommandHelp {
        name: "VERSION",
        summary: "Show the server version",
        usage: &["VERSION"],
    },
    CommandHelp {
        name: "HELP",
        summary: "List commands or show one command's usage",
        usage: &["HELP [command]"],
    },
    CommandHelp {
        name: "QUIT",
        summary: "Close the connection (also EXIT)",
        usage: &["QUIT"],
    },
];

/// Text for `HELP` or `HELP <command>`
pub fn help_lines(topic: Option<&str>) -> Result<Vec<String>, ParseError> {
    match topic {
        None => Ok(COMMANDS
            .iter()
            .map(|c| format!("{:<10} {}", c.name, c.summary))
            .collect()),
        Some(topic) => {
            let wanted = if topic.eq_ignore_ascii_case("EXIT") {
                "QUIT"
            } else {
                topic
            };
            COMMANDS
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(wanted))
                .map(|c| c.usage.iter().map(|line| line.to_string()).collect())
                .ok_or_else(|| ParseError::UnknownCommand(topic.to_string()))
        }
    }
}

/// Parse one request line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    if line.starts_with('{') {
        return parse_index(line, false).map(Some);
    }

    let (keyword, rest) = match line.split_once(char::is_whitespace) {
        Some((keyword, rest)) => (keyword, rest.trim()),
        None => (line, ""),
    };
    let keyword = keyword.to_ascii_uppercase();

    let command = match keyword.as_str() {
        "USING" | "OPEN" => Command::Using(endpoint_tokens(&keyword, rest)?),
        "CREATE" => Command::Create(endpoint_tokens(&keyword, rest)?),
        "INDEX" | "CINDEX" => {
            if rest.is_empty() {
                return Err(ParseError::bad_arguments(&keyword, "expected a JSON document"));
            }
            parse_index(rest, keyword == "CINDEX")?
        }
        "SEARCH" => Command::Search(parse_query(rest)?),
        "FIND" => Command::Find(parse_query(rest)?),
        "FACETS" => Command::Facets(facets_query(&keyword, rest)?),
        "TERMS" => {
            let mut query = parse_query(rest)?;
            query.facets = None;
            query.include_terms = true;
            Command::Terms(query)
        }
        "COUNT" => Command::Count(parse_query(rest)?),
        "DELETE" | "CDELETE" => {
            let mut tokens = rest.split_whitespace();
            match (tokens.next(), tokens.next()) {
                (Some(id), None) => Command::Delete {
                    id: id.to_string(),
                    commit: keyword == "CDELETE",
                },
                _ => return Err(ParseError::bad_arguments(&keyword, "expected exactly one id")),
            }
        }
        "HELP" => {
            let mut tokens = rest.split_whitespace();
            match (tokens.next(), tokens.next()) {
                (topic, None) => Command::Help(topic.map(str::to_string)),
                _ => return Err(ParseError::bad_arguments(&keyword, "expected at most one command")),
            }
        }
        "COMMIT" => no_arguments(&keyword, rest, Command::Commit)?,
        "REOPEN" => no_arguments(&keyword, rest, Command::Reopen)?,
        "ENDPOINTS" => no_arguments(&keyword, rest, Command::Endpoints)?,
        "DATABASES" => no_arguments(&keyword, rest, Command::Databases)?,
        "VERSION" => no_arguments(&keyword, rest, Command::Version)?,
        "QUIT" | "EXIT" => no_arguments(&keyword, rest, Command::Quit)?,
        _ => return Err(ParseError::UnknownCommand(keyword)),
    };
    Ok(Some(command))
}

fn no_arguments(keyword: &str, rest: &str, command: Command) -> Result<Command, ParseError> {
    if rest.is_empty() {
        Ok(command)
    } else {
        Err(ParseError::bad_arguments(keyword, "takes no arguments"))
    }
}

/// FACETS takes its fields from the free text unless the query carries its
/// own FACETS clause. A leading number in the text is the minimum count.
fn facets_query(keyword: &str, rest: &str) -> Result<Query, ParseError> {
    let mut query = parse_query(rest)?;
    if query.facets.is_none() {
        let mut words = query.search.split_whitespace().peekable();
        let min = match words.peek().and_then(|w| w.parse::<u64>().ok()) {
            Some(min) => {
                words.next();
                min
            }
            None => 0,
        };
        let fields: Vec<String> = words
            .flat_map(|w| w.split(','))
            .filter(|f| !f.is_empty())
            .map(str::to_lowercase)
            .collect();
        if fields.is_empty() {
            return Err(ParseError::bad_arguments(keyword, "expected at least one field"));
        }
        query.facets = Some(FacetRequest { min, fields });
        query.search = String::new();
    }
    query.limit = Some(0);
    query.offset = 0;
    query.order_by = None;
    query.distinct = None;
    Ok(query)
}

fn endpoint_tokens(keyword: &str, rest: &str) -> Result<Vec<String>, ParseError> {
    let tokens: Vec<String> = rest
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    if tokens.is_empty() {
        return Err(ParseError::bad_arguments(keyword, "expected at least one endpoint"));
    }
    Ok(tokens)
}

fn parse_index(payload: &str, commit: bool) -> Result<Command, ParseError> {
    let (document, endpoints) = parse_document(payload)?;
    Ok(Command::Index {
        document,
        endpoints,
        commit,
    })
}

const DOCUMENT_FIELDS: &[&str] = &[
    "id", "data", "values", "terms", "texts", "language", "spelling", "positions", "endpoints",
];

/// Validate and decode an INDEX payload
pub fn parse_document(payload: &str) -> Result<(Document, Option<Vec<String>>), ParseError> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| ParseError::MalformedDocument(e.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(malformed("document must be a JSON object"));
    };

    if let Some(unknown) = object.keys().find(|k| !DOCUMENT_FIELDS.contains(&k.as_str())) {
        return Err(malformed(format!("unknown field {:?}", unknown)));
    }

    let id = match object.remove("id") {
        Some(Value::String(id)) if !id.trim().is_empty() => id,
        Some(Value::String(_)) => return Err(malformed("id must not be empty")),
        Some(_) => return Err(malformed("id must be a string")),
        None => return Err(malformed("missing id")),
    };

    let data = match object.remove("data") {
        Some(Value::Null) | None => return Err(malformed("missing data")),
        Some(data) => data,
    };

    let mut document = Document::new(id, data);

    if let Some(values) = object.remove("values") {
        document.values = parse_values(values)?;
    }
    if let Some(terms) = object.remove("terms") {
        document.terms = parse_entries::<TermEntry>(terms, "terms")?;
        if document.terms.iter().any(|t| t.term.is_empty()) {
            return Err(malformed("terms entries need a non-empty \"term\""));
        }
    }
    if let Some(texts) = object.remove("texts") {
        document.texts = parse_entries::<TextEntry>(texts, "texts")?;
        if document.texts.iter().any(|t| t.text.is_empty()) {
            return Err(malformed("texts entries need a non-empty \"text\""));
        }
    }
    match object.remove("language") {
        Some(Value::String(language)) => document.language = Some(language),
        Some(Value::Null) | None => {}
        Some(_) => return Err(malformed("language must be a string")),
    }
    document.spelling = parse_flag(&mut object, "spelling")?;
    document.positions = parse_flag(&mut object, "positions")?;

    let endpoints = match object.remove("endpoints") {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) => {
            let mut endpoints = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) if !s.is_empty() => endpoints.push(s),
                    _ => return Err(malformed("endpoints must be non-empty strings")),
                }
            }
            if endpoints.is_empty() {
                return Err(malformed("endpoints must not be empty"));
            }
            Some(endpoints)
        }
        Some(_) => return Err(malformed("endpoints must be an array")),
    };

    Ok((document, endpoints))
}

fn parse_values(values: Value) -> Result<BTreeMap<String, FieldValue>, ParseError> {
    let Value::Object(map) = values else {
        return Err(malformed("values must be an object"));
    };
    let mut parsed = BTreeMap::new();
    for (name, value) in map {
        if !is_valid_field_name(&name) {
            return Err(malformed(format!("invalid value field name {:?}", name)));
        }
        let value = match value {
            Value::Bool(b) => FieldValue::Bool(b),
            Value::Number(n) => match n.as_f64() {
                Some(n) => FieldValue::Number(n),
                None => return Err(malformed(format!("value {:?} is out of range", name))),
            },
            Value::String(s) => FieldValue::Text(s),
            _ => {
                return Err(malformed(format!(
                    "value {:?} must be a string, number or boolean",
                    name
                )))
            }
        };
        parsed.insert(name.to_lowercase(), value);
    }
    Ok(parsed)
}

fn parse_entries<T: serde::de::DeserializeOwned>(
    value: Value,
    field: &str,
) -> Result<Vec<T>, ParseError> {
    if !value.is_array() {
        return Err(malformed(format!("{} must be an array", field)));
    }
    serde_json::from_value(value).map_err(|e| malformed(format!("{}: {}", field, e)))
}

fn parse_flag(object: &mut Map<String, Value>, field: &str) -> Result<bool, ParseError> {
    match object.remove(field) {
        Some(Value::Bool(b)) => Ok(b),
        Some(Value::Null) | None => Ok(false),
        Some(_) => Err(malformed(format!("{} must be a boolean", field))),
    }
}

fn malformed(reason: impl Into<String>) -> ParseError {
    ParseError::MalformedDocument(reason.into())
}
