//! Line Protocol
//!
//! Every command yields zero or more payload lines followed by exactly one
//! status line:
//!
//! ```text
//! {"id":"doc-1","rank":0,...}        payload (JSON)
//! # WARNING: LIMIT clamped to 10000  comment
//! >> OK: 1 documents found in 1.2ms  status
//! >> ERR: [404] Unknown command: FOO
//! >> BYE!
//! ```

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::CommandError;
use crate::types::{EndpointFailure, SearchResults};

/// Prefix of every status line
pub const STATUS_PREFIX: &str = ">> ";

/// Prefix of comment lines (banner, warnings)
pub const COMMENT_PREFIX: &str = "# ";

/// Default upper bound on one request line
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Final line of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ok(Option<String>),
    Error { code: u16, message: String },
    Bye,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Render as a wire line, without the trailing newline
    pub fn encode(&self) -> String {
        match self {
            Self::Ok(None) => format!("{}OK", STATUS_PREFIX),
            Self::Ok(Some(detail)) => format!("{}OK: {}", STATUS_PREFIX, detail),
            Self::Error { code, message } => {
                format!("{}ERR: [{}] {}", STATUS_PREFIX, code, single_line(message))
            }
            Self::Bye => format!("{}BYE!", STATUS_PREFIX),
        }
    }

    /// Parse a status line. Returns `None` for payload and comment lines.
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.strip_prefix(STATUS_PREFIX)?;
        if rest == "OK" {
            return Some(Self::Ok(None));
        }
        if let Some(detail) = rest.strip_prefix("OK: ") {
            return Some(Self::Ok(Some(detail.to_string())));
        }
        if rest == "BYE!" {
            return Some(Self::Bye);
        }
        let err = rest.strip_prefix("ERR: ")?;
        let (code, message) = err
            .strip_prefix('[')
            .and_then(|s| s.split_once("] "))
            .and_then(|(code, message)| code.parse::<u16>().ok().map(|c| (c, message)))
            .unwrap_or((500, err));
        Some(Self::Error {
            code,
            message: message.to_string(),
        })
    }
}

/// Complete response to one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub lines: Vec<String>,
    pub status: Status,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            lines: Vec::new(),
            status: Status::Ok(None),
        }
    }

    pub fn ok_with(detail: impl Into<String>) -> Self {
        Self {
            lines: Vec::new(),
            status: Status::Ok(Some(detail.into())),
        }
    }

    pub fn bye() -> Self {
        Self {
            lines: Vec::new(),
            status: Status::Bye,
        }
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            lines: Vec::new(),
            status: Status::Error {
                code,
                message: message.into(),
            },
        }
    }

    /// Error response for a failed command
    pub fn from_error(error: &CommandError) -> Self {
        Self::error(error.code().as_u16(), error.to_string())
    }

    /// Append a plain payload line
    pub fn line(mut self, line: impl Into<String>) -> Self {
        self.lines.push(single_line(&line.into()));
        self
    }

    /// Append a `# ` comment line
    pub fn comment(mut self, text: impl AsRef<str>) -> Self {
        self.lines
            .push(format!("{}{}", COMMENT_PREFIX, single_line(text.as_ref())));
        self
    }

    /// Append a JSON payload line
    pub fn json<T: Serialize>(mut self, value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(encoded) => self.lines.push(encoded),
            Err(e) => {
                self.status = Status::Error {
                    code: 500,
                    message: format!("Failed to encode response: {}", e),
                }
            }
        }
        self
    }

    /// Replace the status line
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Response block for a SEARCH: facets, hits, summary, warnings, status
    pub fn search(results: &SearchResults, elapsed: Duration) -> Self {
        let mut response = Self::ok();
        for (field, counts) in &results.facets {
            for count in counts {
                response = response.json(&FacetLine {
                    facet: field.clone(),
                    term: count.term.clone(),
                    termfreq: count.count,
                });
            }
        }
        for hit in &results.hits {
            response = response.json(hit);
        }
        response = response.json(&SearchSummary {
            size: results.hits.len(),
            estimated: results.estimated,
            partial: results.partial,
            failures: results.failures.clone(),
        });
        for warning in &results.warnings {
            response = response.comment(format!("WARNING: {}", warning));
        }
        if !response.status.is_ok() {
            return response;
        }
        response.with_status(Status::Ok(Some(format!(
            "{} documents found in {}",
            results.hits.len(),
            format_elapsed(elapsed)
        ))))
    }

    /// Render the full response, every line newline-terminated
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&self.status.encode());
        out.push('\n');
        out
    }
}

/// One facet entry in a SEARCH response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetLine {
    pub facet: String,
    pub term: String,
    pub termfreq: u64,
}

/// Closing summary of a SEARCH response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSummary {
    pub size: usize,
    pub estimated: u64,
    pub partial: bool,
    #[serde(default)]
    pub failures: Vec<EndpointFailure>,
}

/// Greeting sent when a client connects
pub fn welcome_banner() -> String {
    format!(
        "{}Welcome to lindex {}! Type HELP for help.",
        COMMENT_PREFIX,
        env!("CARGO_PKG_VERSION")
    )
}

/// Human-readable duration, e.g. `850.0us`, `12.3ms`, `1.50s`
pub fn format_elapsed(elapsed: Duration) -> String {
    let micros = elapsed.as_secs_f64() * 1_000_000.0;
    if micros < 1_000.0 {
        format!("{:.1}us", micros)
    } else if micros < 1_000_000.0 {
        format!("{:.1}ms", micros / 1_000.0)
    } else {
        format!("{:.2}s", micros / 1_000_000.0)
    }
}

/// Newlines would break framing
fn single_line(text: &str) -> String {
    if text.contains(['\n', '\r']) {
        text.replace(['\n', '\r'], " ")
    } else {
        text.to_string()
    }
}

/// Result of reading one bounded protocol line
#[derive(Debug, PartialEq, Eq)]
pub enum LineRead {
    Line(Vec<u8>),
    /// The line was longer than the limit and has been discarded
    TooLong,
    Eof,
}

/// Read up to the next `\n`, holding at most `max_bytes` of it in memory
pub async fn read_bounded_line<R>(reader: &mut R, max_bytes: usize) -> io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut overflow = false;

    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(if overflow {
                LineRead::TooLong
            } else if line.is_empty() {
                LineRead::Eof
            } else {
                LineRead::Line(line)
            });
        }

        let newline = buf.iter().position(|&b| b == b'\n');
        let chunk = &buf[..newline.unwrap_or(buf.len())];
        if !overflow {
            if line.len() + chunk.len() > max_bytes {
                overflow = true;
                line = Vec::new();
            } else {
                line.extend_from_slice(chunk);
            }
        }

        let consumed = newline.map(|i| i + 1).unwrap_or(buf.len());
        reader.consume(consumed);

        if newline.is_some() {
            return Ok(if overflow {
                LineRead::TooLong
            } else {
                LineRead::Line(line)
            });
        }
    }
}
