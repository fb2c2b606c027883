//! Client Module
//!
//! Line-protocol client used by the `send` CLI command, the remote backend
//! adapter and the integration tests.

pub mod connection;

pub use connection::Client;

use thiserror::Error;

use crate::daemon::protocol::{FacetLine, SearchSummary, Status};
use crate::types::{Document, Hit, IndexOutcome};

/// Errors that can occur when talking to a server
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Server is not running (connection refused)")]
    ServerNotRunning,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Connection closed by server")]
    Closed,

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("[{code}] {message}")]
    Server { code: u16, message: String },
}

impl ClientError {
    /// True when the connection can no longer be used
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ServerNotRunning | Self::ConnectionFailed(_) | Self::RequestFailed(_) | Self::Closed
        )
    }
}

/// Response to one command as seen by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Payload lines
    pub lines: Vec<String>,
    /// Comment lines with the `# ` prefix removed
    pub comments: Vec<String>,
    pub status: Status,
}

impl Default for Reply {
    fn default() -> Self {
        Self {
            lines: Vec::new(),
            comments: Vec::new(),
            status: Status::Ok(None),
        }
    }
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    /// Convert an error status into [`ClientError::Server`]
    pub fn into_result(self) -> Result<Self, ClientError> {
        match &self.status {
            Status::Error { code, message } => Err(ClientError::Server {
                code: *code,
                message: message.clone(),
            }),
            _ => Ok(self),
        }
    }
}

/// Parsed SEARCH response
#[derive(Debug, Clone, PartialEq)]
pub struct SearchReply {
    pub facets: Vec<FacetLine>,
    pub hits: Vec<Hit>,
    pub summary: SearchSummary,
    pub warnings: Vec<String>,
}

impl SearchReply {
    /// Interpret the payload of a successful SEARCH
    pub fn from_reply(reply: &Reply) -> Result<Self, ClientError> {
        let mut facets = Vec::new();
        let mut hits = Vec::new();
        let mut summary = None;

        for line in &reply.lines {
            let value: serde_json::Value = serde_json::from_str(line)
                .map_err(|e| ClientError::UnexpectedResponse(format!("{}: {}", e, line)))?;
            let decoded = if value.get("facet").is_some() {
                serde_json::from_value(value).map(|f| facets.push(f))
            } else if value.get("estimated").is_some() && value.get("id").is_none() {
                serde_json::from_value(value).map(|s| summary = Some(s))
            } else {
                serde_json::from_value(value).map(|h| hits.push(h))
            };
            decoded.map_err(|e| ClientError::UnexpectedResponse(format!("{}: {}", e, line)))?;
        }

        let summary = summary.ok_or_else(|| {
            ClientError::UnexpectedResponse("SEARCH response has no summary".to_string())
        })?;
        let warnings = reply
            .comments
            .iter()
            .filter_map(|c| c.strip_prefix("WARNING: "))
            .map(str::to_string)
            .collect();

        Ok(Self {
            facets,
            hits,
            summary,
            warnings,
        })
    }

    /// Hit ids in rank order
    pub fn ids(&self) -> Vec<&str> {
        self.hits.iter().map(|h| h.id.as_str()).collect()
    }
}

impl Client {
    /// `USING <endpoints>`
    pub async fn using(&mut self, endpoints: &str) -> Result<Reply, ClientError> {
        self.send(&format!("USING {}", endpoints)).await?.into_result()
    }

    /// `CREATE <endpoints>`
    pub async fn create(&mut self, endpoints: &str) -> Result<Reply, ClientError> {
        self.send(&format!("CREATE {}", endpoints)).await?.into_result()
    }

    /// `INDEX <json>`, returning the per-endpoint outcome
    pub async fn index(&mut self, document: &Document) -> Result<IndexOutcome, ClientError> {
        let payload = serde_json::to_string(document)
            .map_err(|e| ClientError::RequestFailed(format!("Failed to encode document: {}", e)))?;
        let reply = self.send(&format!("INDEX {}", payload)).await?;
        let outcome = reply
            .lines
            .first()
            .and_then(|line| serde_json::from_str::<IndexOutcome>(line).ok());
        match (reply.status, outcome) {
            (Status::Ok(_), Some(outcome)) => Ok(outcome),
            (Status::Error { code, message }, _) => Err(ClientError::Server { code, message }),
            (Status::Bye, _) => Err(ClientError::Closed),
            (Status::Ok(_), None) => Err(ClientError::UnexpectedResponse(
                "INDEX response has no outcome".to_string(),
            )),
        }
    }

    /// `SEARCH <query>`
    pub async fn search(&mut self, query: &str) -> Result<SearchReply, ClientError> {
        let reply = self.send(&format!("SEARCH {}", query)).await?.into_result()?;
        SearchReply::from_reply(&reply)
    }

    /// `COMMIT`
    pub async fn commit(&mut self) -> Result<Reply, ClientError> {
        self.send("COMMIT").await?.into_result()
    }
}
