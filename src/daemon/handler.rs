//! Request Handler
//!
//! Dispatches parsed commands against a connection's [`Session`] and builds
//! the protocol response.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::backend::OpenMode;
use crate::backend::{CountLine, DeleteLine};
use crate::config::Config;
use crate::endpoint::{Endpoint, EndpointRegistry};
use crate::error::CommandError;
use crate::query::{Query, QueryCoordinator};
use crate::types::{Document, EndpointFailure};

use super::command::{help_lines, parse_command, Command};
use super::protocol::{Response, Status};

/// Per-connection state: the bound endpoints and how they were bound
#[derive(Debug, Default)]
pub struct Session {
    endpoints: Vec<Endpoint>,
    mode: Option<OpenMode>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Mode of the last successful USING/CREATE
    pub fn mode(&self) -> Option<OpenMode> {
        self.mode
    }

    pub fn is_bound(&self) -> bool {
        !self.endpoints.is_empty()
    }

    /// Replace the binding with `endpoints`
    pub fn bind(&mut self, endpoints: Vec<Endpoint>, mode: OpenMode) {
        self.endpoints = endpoints;
        self.mode = Some(mode);
    }

    /// Drop every binding
    pub fn release(&mut self) {
        self.endpoints.clear();
        self.mode = None;
    }
}

/// Executes commands on behalf of every connection
pub struct RequestHandler {
    registry: Arc<EndpointRegistry>,
    coordinator: QueryCoordinator,
}

impl RequestHandler {
    pub fn new(registry: Arc<EndpointRegistry>, coordinator: QueryCoordinator) -> Self {
        Self {
            registry,
            coordinator,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(EndpointRegistry::from_config(&config.server)),
            QueryCoordinator::from_config(&config.server, &config.query),
        )
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Parse and execute one request line. Blank lines get no response.
    pub async fn handle_line(&self, session: &mut Session, line: &str) -> Option<Response> {
        match parse_command(line) {
            Ok(Some(command)) => Some(self.handle(session, command).await),
            Ok(None) => None,
            Err(e) => {
                debug!("Rejected request: {}", e);
                Some(Response::from_error(&CommandError::from(e)))
            }
        }
    }

    /// Execute a parsed command
    pub async fn handle(&self, session: &mut Session, command: Command) -> Response {
        debug!("Handling {}", command.name());

        let result = match command {
            Command::Using(tokens) => self.handle_bind(session, tokens, OpenMode::Open).await,
            Command::Create(tokens) => self.handle_bind(session, tokens, OpenMode::Create).await,
            Command::Index {
                document,
                endpoints,
                commit,
            } => self.handle_index(session, document, endpoints, commit).await,
            Command::Search(query) | Command::Facets(query) => {
                self.handle_search(session, query, true).await
            }
            Command::Find(query) | Command::Terms(query) => {
                self.handle_search(session, query, false).await
            }
            Command::Count(query) => self.handle_count(session, query).await,
            Command::Delete { id, commit } => self.handle_delete(session, id, commit).await,
            Command::Commit => self.handle_commit(session).await,
            Command::Reopen => self.handle_reopen(session).await,
            Command::Endpoints => Ok(self.handle_endpoints(session)),
            Command::Databases => Ok(self.handle_databases()),
            Command::Version => Ok(Response::ok_with(format!(
                "lindex {}",
                env!("CARGO_PKG_VERSION")
            ))),
            Command::Help(topic) => help_lines(topic.as_deref())
                .map(|lines| lines.into_iter().fold(Response::ok(), Response::line))
                .map_err(CommandError::from),
            Command::Quit => Ok(Response::bye()),
        };

        result.unwrap_or_else(|e| {
            warn!("Command failed: {}", e);
            Response::from_error(&e)
        })
    }

    // ============ Session Handlers ============

    async fn handle_bind(
        &self,
        session: &mut Session,
        tokens: Vec<String>,
        mode: OpenMode,
    ) -> Result<Response, CommandError> {
        // All-or-nothing: the binding only changes once every token resolved
        let endpoints = self.registry.resolve_all(&tokens, mode).await?;
        let names: Vec<String> = endpoints.iter().map(|e| e.name()).collect();
        info!("Session bound to {}", names.join(", "));
        session.bind(endpoints, mode);
        Ok(Response::ok_with(format!("Using {}", names.join(", "))))
    }

    async fn handle_reopen(&self, session: &Session) -> Result<Response, CommandError> {
        let reopened = self.coordinator.reopen(session.endpoints()).await?;
        Ok(Response::ok_with(format!("Reopened {} endpoints", reopened)))
    }

    fn handle_endpoints(&self, session: &Session) -> Response {
        let response = session
            .endpoints()
            .iter()
            .fold(Response::ok(), |response, endpoint| {
                response.line(format!("{} ({})", endpoint.name(), endpoint.backend.kind()))
            });
        let count = session.endpoints().len();
        response.with_status(Status::Ok(Some(format!("{} endpoints", count))))
    }

    fn handle_databases(&self) -> Response {
        let entries = self.registry.entries();
        let count = entries.len();
        entries
            .into_iter()
            .fold(Response::ok(), |response, entry| {
                response.line(format!("{} ({})", entry.key, entry.kind))
            })
            .with_status(Status::Ok(Some(format!("{} databases", count))))
    }

    // ============ Write Handlers ============

    async fn handle_index(
        &self,
        session: &Session,
        document: Document,
        endpoints: Option<Vec<String>>,
        commit: bool,
    ) -> Result<Response, CommandError> {
        let overridden;
        let targets: &[Endpoint] = match endpoints {
            Some(tokens) => {
                let mode = session.mode().unwrap_or(OpenMode::Open);
                overridden = self.registry.resolve_all(&tokens, mode).await?;
                &overridden
            }
            None => session.endpoints(),
        };

        let outcome = self.coordinator.index(targets, document).await?;
        debug!(
            "Indexed {} on {} of {} endpoints",
            outcome.id,
            outcome.indexed.len(),
            targets.len()
        );

        if commit && outcome.is_complete() {
            self.coordinator.commit(targets).await?;
        }

        let response = Response::ok().json(&outcome);
        Ok(with_failures(response, &outcome.failures, targets.len()))
    }

    async fn handle_delete(
        &self,
        session: &Session,
        id: String,
        commit: bool,
    ) -> Result<Response, CommandError> {
        let targets = session.endpoints();
        let outcome = self.coordinator.delete(targets, &id).await?;
        if commit && outcome.failures.is_empty() {
            self.coordinator.commit(targets).await?;
        }

        let response = Response::ok().json(&DeleteLine {
            id: outcome.id,
            deleted: outcome.deleted,
        });
        Ok(with_failures(response, &outcome.failures, targets.len()))
    }

    async fn handle_commit(&self, session: &Session) -> Result<Response, CommandError> {
        let committed = self.coordinator.commit(session.endpoints()).await?;
        Ok(Response::ok_with(format!("Committed {} endpoints", committed)))
    }

    // ============ Query Handlers ============

    /// SEARCH and FACETS return document data, FIND and TERMS do not
    async fn handle_search(
        &self,
        session: &Session,
        query: Query,
        with_data: bool,
    ) -> Result<Response, CommandError> {
        let start = Instant::now();
        let mut results = self.coordinator.search(session.endpoints(), &query).await?;
        if !with_data {
            for hit in results.hits.iter_mut() {
                hit.data = serde_json::Value::Null;
            }
        }
        let elapsed = start.elapsed();

        debug!(
            "Search returned {} of ~{} documents in {:?}{}",
            results.hits.len(),
            results.estimated,
            elapsed,
            if results.partial { " (partial)" } else { "" }
        );
        Ok(Response::search(&results, elapsed))
    }

    async fn handle_count(&self, session: &Session, query: Query) -> Result<Response, CommandError> {
        let outcome = self.coordinator.count(session.endpoints(), &query).await?;
        let response = outcome
            .failures
            .iter()
            .fold(Response::ok().json(&CountLine { count: outcome.count }), |response, f| {
                response.comment(format!("WARNING: {}", f))
            });
        Ok(response.with_status(Status::Ok(Some(format!("{} documents", outcome.count)))))
    }
}

/// Turn a response with per-endpoint write failures into a 500
fn with_failures(response: Response, failures: &[EndpointFailure], total: usize) -> Response {
    if failures.is_empty() {
        return response;
    }
    let error = CommandError::FanOutFailed {
        failed: failures.to_vec(),
        total,
    };
    response.with_status(Status::Error {
        code: error.code().as_u16(),
        message: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendFactory, RemoteSettings};
    use crate::endpoint::AddressDefaults;
    use std::time::Duration;
    use tempfile::TempDir;

    fn handler(data_dir: &std::path::Path) -> RequestHandler {
        RequestHandler::new(
            Arc::new(EndpointRegistry::new(
                BackendFactory::new(data_dir, RemoteSettings::default()),
                AddressDefaults::default(),
            )),
            QueryCoordinator::new(Duration::from_secs(5), 100, 1000),
        )
    }

    async fn send(handler: &RequestHandler, session: &mut Session, line: &str) -> Response {
        handler.handle_line(session, line).await.unwrap()
    }

    fn error_code(response: &Response) -> Option<u16> {
        match &response.status {
            Status::Error { code, .. } => Some(*code),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_requires_bound_endpoint() {
        let temp_dir = TempDir::new().unwrap();
        let handler = handler(temp_dir.path());
        let mut session = Session::new();

        let response = send(&handler, &mut session, "SEARCH anything").await;
        assert_eq!(error_code(&response), Some(405));

        let response = send(&handler, &mut session, r#"{"id":"a","data":1}"#).await;
        assert_eq!(error_code(&response), Some(405));
    }

    #[tokio::test]
    async fn test_using_missing_database() {
        let temp_dir = TempDir::new().unwrap();
        let handler = handler(temp_dir.path());
        let mut session = Session::new();

        let response = send(&handler, &mut session, "USING nothing").await;
        assert_eq!(error_code(&response), Some(404));
        assert!(!session.is_bound());
    }

    #[tokio::test]
    async fn test_failed_bind_keeps_previous_binding() {
        let temp_dir = TempDir::new().unwrap();
        let handler = handler(temp_dir.path());
        let mut session = Session::new();

        assert!(send(&handler, &mut session, "CREATE first").await.status.is_ok());
        let response = send(&handler, &mut session, "USING first missing").await;
        assert_eq!(error_code(&response), Some(404));

        let names: Vec<String> = session.endpoints().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["first"]);
        assert_eq!(session.mode(), Some(OpenMode::Create));

        session.release();
        assert!(!session.is_bound());
        assert_eq!(session.mode(), None);
    }

    #[tokio::test]
    async fn test_index_and_search_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let handler = handler(temp_dir.path());
        let mut session = Session::new();

        send(&handler, &mut session, "CREATE books").await;
        let response = send(
            &handler,
            &mut session,
            r#"INDEX {"id":"b1","data":{"title":"Dune"},"texts":[{"text":"desert planet"}]}"#,
        )
        .await;
        assert!(response.status.is_ok());
        assert!(response.lines[0].contains("\"indexed\":[\"books\"]"));

        let response = send(&handler, &mut session, "SEARCH TERMS b1").await;
        assert!(response.status.is_ok());
        assert!(response.lines[0].contains("\"id\":\"b1\""));
    }

    #[tokio::test]
    async fn test_parse_errors_are_reported() {
        let temp_dir = TempDir::new().unwrap();
        let handler = handler(temp_dir.path());
        let mut session = Session::new();

        let response = send(&handler, &mut session, "BOGUS").await;
        assert_eq!(error_code(&response), Some(404));

        let response = send(&handler, &mut session, "INDEX {broken").await;
        assert_eq!(error_code(&response), Some(400));

        assert!(handler.handle_line(&mut session, "").await.is_none());
    }

    #[tokio::test]
    async fn test_endpoints_and_databases() {
        let temp_dir = TempDir::new().unwrap();
        let handler = handler(temp_dir.path());
        let mut session = Session::new();

        send(&handler, &mut session, "CREATE a b").await;
        let response = send(&handler, &mut session, "ENDPOINTS").await;
        assert_eq!(response.lines, vec!["a (local)", "b (local)"]);

        let response = send(&handler, &mut session, "DATABASES").await;
        assert_eq!(response.status, Status::Ok(Some("2 databases".into())));
    }

    #[tokio::test]
    async fn test_count_delete_commit() {
        let temp_dir = TempDir::new().unwrap();
        let handler = handler(temp_dir.path());
        let mut session = Session::new();

        send(&handler, &mut session, "CREATE db").await;
        send(&handler, &mut session, r#"CINDEX {"id":"x","data":1,"texts":[{"text":"alpha"}]}"#).await;

        let response = send(&handler, &mut session, "COUNT alpha").await;
        assert_eq!(response.lines, vec![r#"{"count":1}"#]);

        let response = send(&handler, &mut session, "CDELETE x").await;
        assert_eq!(response.lines, vec![r#"{"id":"x","deleted":1}"#]);

        let response = send(&handler, &mut session, "COMMIT").await;
        assert!(response.status.is_ok());

        let response = send(&handler, &mut session, "COUNT alpha").await;
        assert_eq!(response.lines, vec![r#"{"count":0}"#]);
    }

    #[tokio::test]
    async fn test_find_facets_terms() {
        let temp_dir = TempDir::new().unwrap();
        let handler = handler(temp_dir.path());
        let mut session = Session::new();

        send(&handler, &mut session, "CREATE shop").await;
        for (id, color) in [("s1", "red"), ("s2", "red"), ("s3", "blue")] {
            let line = format!(
                r#"INDEX {{"id":"{}","data":{{"name":"{}"}},"values":{{"color":"{}"}},"texts":[{{"text":"shoe"}}]}}"#,
                id, id, color
            );
            assert!(send(&handler, &mut session, &line).await.status.is_ok());
        }

        let response = send(&handler, &mut session, "FIND TERMS s1").await;
        assert!(response.status.is_ok());
        assert!(response.lines[0].contains("\"id\":\"s1\""));
        assert!(!response.lines[0].contains("\"data\""));

        let response = send(&handler, &mut session, "FACETS 2 color").await;
        assert!(response.status.is_ok());
        assert_eq!(
            response.lines[0],
            r#"{"facet":"color","term":"red","termfreq":2}"#
        );
        assert!(response.lines[1].contains("\"estimated\":3"));
        assert_eq!(response.lines.len(), 2);

        let response = send(&handler, &mut session, "TERMS shoe LIMIT 1").await;
        assert!(response.status.is_ok());
        assert!(response.lines[0].contains(r#""terms":["s1","shoe"]"#));
        assert!(!response.lines[0].contains("\"data\""));
    }

    #[tokio::test]
    async fn test_reopen_requires_binding() {
        let temp_dir = TempDir::new().unwrap();
        let handler = handler(temp_dir.path());
        let mut session = Session::new();

        let response = send(&handler, &mut session, "REOPEN").await;
        assert_eq!(error_code(&response), Some(405));

        send(&handler, &mut session, "CREATE db").await;
        send(&handler, &mut session, r#"CINDEX {"id":"x","data":1,"texts":[{"text":"alpha"}]}"#).await;
        let response = send(&handler, &mut session, "REOPEN").await;
        assert_eq!(response.status, Status::Ok(Some("Reopened 1 endpoints".into())));

        let response = send(&handler, &mut session, "COUNT alpha").await;
        assert_eq!(response.lines, vec![r#"{"count":1}"#]);
    }

    #[tokio::test]
    async fn test_open_is_using() {
        let temp_dir = TempDir::new().unwrap();
        let handler = handler(temp_dir.path());
        let mut session = Session::new();

        let response = send(&handler, &mut session, "OPEN missing").await;
        assert_eq!(error_code(&response), Some(404));

        send(&handler, &mut session, "CREATE there").await;
        let mut other = Session::new();
        let response = send(&handler, &mut other, "OPEN there").await;
        assert!(response.status.is_ok());
        assert_eq!(other.mode(), Some(OpenMode::Open));
    }

    #[tokio::test]
    async fn test_quit_and_help() {
        let temp_dir = TempDir::new().unwrap();
        let handler = handler(temp_dir.path());
        let mut session = Session::new();

        assert_eq!(send(&handler, &mut session, "QUIT").await.status, Status::Bye);

        let response = send(&handler, &mut session, "HELP").await;
        assert!(response.lines.iter().any(|l| l.starts_with("SEARCH")));

        let response = send(&handler, &mut session, "HELP nope").await;
        assert_eq!(error_code(&response), Some(404));
    }
}
