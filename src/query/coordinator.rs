//! Query coordinator: fans one operation out to every bound endpoint

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::merge::{merge_pages, EndpointPage};
use super::Query;
use crate::backend::StorageBackend;
use crate::config::{QueryConfig, ServerConfig};
use crate::endpoint::Endpoint;
use crate::error::{BackendError, BackendResult, CommandError};
use crate::types::{Document, EndpointFailure, IndexOutcome, SearchResults};

/// Per-endpoint results of one fan-out, in binding order
#[derive(Debug)]
pub struct FanOutReport<T> {
    /// `(binding position, endpoint name, value)`
    pub succeeded: Vec<(usize, String, T)>,
    pub failures: Vec<EndpointFailure>,
    pub total: usize,
}

impl<T> FanOutReport<T> {
    pub fn all_failed(&self) -> bool {
        self.succeeded.is_empty() && !self.failures.is_empty()
    }

    fn into_error(self) -> CommandError {
        CommandError::FanOutFailed {
            failed: self.failures,
            total: self.total,
        }
    }
}

/// Outcome of COUNT across endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountOutcome {
    pub count: u64,
    pub failures: Vec<EndpointFailure>,
}

/// Outcome of DELETE across endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub id: String,
    /// Endpoints that held the document
    pub deleted: usize,
    pub failures: Vec<EndpointFailure>,
}

/// Scatter/gather over the endpoints bound to a session
#[derive(Debug, Clone)]
pub struct QueryCoordinator {
    /// Deadline for one whole fan-out
    timeout: Duration,
    default_limit: usize,
    max_limit: usize,
}

impl QueryCoordinator {
    pub fn new(timeout: Duration, default_limit: usize, max_limit: usize) -> Self {
        Self {
            timeout,
            default_limit,
            max_limit,
        }
    }

    pub fn from_config(server: &ServerConfig, query: &QueryConfig) -> Self {
        Self::new(server.command_timeout(), query.default_limit, query.max_limit)
    }

    /// Run `op` against every endpoint concurrently.
    ///
    /// Sub-tasks still running at the deadline are abandoned and reported as
    /// timeouts. Results are returned in binding order whatever order they
    /// completed in.
    pub async fn fan_out<T, F, Fut>(&self, endpoints: &[Endpoint], op: F) -> FanOutReport<T>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn StorageBackend>) -> Fut,
        Fut: Future<Output = BackendResult<T>> + Send + 'static,
    {
        let deadline = Instant::now() + self.timeout;
        let timeout_ms = self.timeout.as_millis() as u64;

        let handles: Vec<_> = endpoints
            .iter()
            .map(|endpoint| tokio::spawn(op(endpoint.backend.clone())))
            .collect();

        let outcomes = futures::future::join_all(handles.into_iter().map(|handle| async move {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => Err(BackendError::Storage(format!(
                    "endpoint task failed: {}",
                    join_error
                ))),
                Err(_) => Err(BackendError::Timeout(timeout_ms)),
            }
        }))
        .await;

        let mut report = FanOutReport {
            succeeded: Vec::with_capacity(endpoints.len()),
            failures: Vec::new(),
            total: endpoints.len(),
        };
        for (position, (endpoint, outcome)) in endpoints.iter().zip(outcomes).enumerate() {
            match outcome {
                Ok(value) => report.succeeded.push((position, endpoint.name(), value)),
                Err(e) => {
                    warn!("Endpoint {} failed: {}", endpoint.name(), e);
                    report.failures.push(EndpointFailure::new(endpoint.name(), e));
                }
            }
        }
        report
    }

    /// Search every endpoint and merge the pages.
    ///
    /// Fails only when the query is invalid or every endpoint fails; any
    /// other failure marks the result partial.
    pub async fn search(
        &self,
        endpoints: &[Endpoint],
        query: &Query,
    ) -> Result<SearchResults, CommandError> {
        if endpoints.is_empty() {
            return Err(CommandError::NoEndpointSelected);
        }
        query.validate()?;

        let mut warnings = Vec::new();
        let mut limit = query.limit.unwrap_or(self.default_limit);
        if limit > self.max_limit {
            warnings.push(format!(
                "LIMIT {} exceeds the maximum, clamped to {}",
                limit, self.max_limit
            ));
            limit = self.max_limit;
        }

        let window = Arc::new(query.backend_window(limit));
        debug!(
            "Searching {} endpoints (offset {}, limit {})",
            endpoints.len(),
            query.offset,
            limit
        );

        let report = self
            .fan_out(endpoints, |backend| {
                let window = window.clone();
                async move { backend.search(&window).await }
            })
            .await;

        if report.all_failed() {
            return Err(CommandError::SearchFailed(report.failures));
        }

        let pages = report
            .succeeded
            .into_iter()
            .map(|(position, endpoint, results)| EndpointPage {
                position,
                endpoint,
                results,
            })
            .collect();
        let facet_min = query.facets.as_ref().map(|f| f.min).unwrap_or(0);
        let merged = merge_pages(
            pages,
            query.order_by.as_ref(),
            query.distinct.as_ref(),
            query.offset,
            limit,
            facet_min,
        );

        let mut facets = merged.facets;
        if let Some(request) = &query.facets {
            for field in &request.fields {
                facets.entry(field.clone()).or_default();
            }
        }

        Ok(SearchResults {
            hits: merged.hits,
            estimated: merged.estimated,
            facets,
            partial: merged.partial || !report.failures.is_empty(),
            failures: report.failures,
            warnings,
        })
    }

    /// Count matches on every endpoint
    pub async fn count(
        &self,
        endpoints: &[Endpoint],
        query: &Query,
    ) -> Result<CountOutcome, CommandError> {
        if endpoints.is_empty() {
            return Err(CommandError::NoEndpointSelected);
        }
        query.validate()?;

        let query = Arc::new(query.clone());
        let report = self
            .fan_out(endpoints, |backend| {
                let query = query.clone();
                async move { backend.count(&query).await }
            })
            .await;
        if report.all_failed() {
            return Err(report.into_error());
        }

        Ok(CountOutcome {
            count: report.succeeded.iter().map(|(_, _, n)| *n).sum(),
            failures: report.failures,
        })
    }

    /// Index a document on every endpoint.
    ///
    /// Writes that succeed stay durable even when others fail; the outcome
    /// lists both.
    pub async fn index(
        &self,
        endpoints: &[Endpoint],
        document: Document,
    ) -> Result<IndexOutcome, CommandError> {
        if endpoints.is_empty() {
            return Err(CommandError::NoEndpointSelected);
        }

        let id = document.id.clone();
        let document = Arc::new(document);
        let report = self
            .fan_out(endpoints, |backend| {
                let document = document.clone();
                async move { backend.index(&document).await }
            })
            .await;
        if report.all_failed() {
            return Err(report.into_error());
        }

        Ok(IndexOutcome {
            id,
            indexed: report.succeeded.into_iter().map(|(_, name, _)| name).collect(),
            failures: report.failures,
        })
    }

    /// Delete a document from every endpoint
    pub async fn delete(
        &self,
        endpoints: &[Endpoint],
        id: &str,
    ) -> Result<DeleteOutcome, CommandError> {
        if endpoints.is_empty() {
            return Err(CommandError::NoEndpointSelected);
        }

        let shared_id: Arc<str> = Arc::from(id);
        let report = self
            .fan_out(endpoints, |backend| {
                let id = shared_id.clone();
                async move { backend.delete(&id).await }
            })
            .await;
        if report.all_failed() {
            return Err(report.into_error());
        }

        Ok(DeleteOutcome {
            id: id.to_string(),
            deleted: report.succeeded.iter().filter(|(_, _, found)| *found).count(),
            failures: report.failures,
        })
    }

    /// Commit every endpoint. Succeeds only if all of them do.
    pub async fn commit(&self, endpoints: &[Endpoint]) -> Result<usize, CommandError> {
        if endpoints.is_empty() {
            return Err(CommandError::NoEndpointSelected);
        }

        let report = self
            .fan_out(endpoints, |backend| async move { backend.commit().await })
            .await;
        if !report.failures.is_empty() {
            return Err(report.into_error());
        }
        Ok(report.succeeded.len())
    }

    /// Re-open every endpoint at its latest state. Succeeds only if all of
    /// them do.
    pub async fn reopen(&self, endpoints: &[Endpoint]) -> Result<usize, CommandError> {
        if endpoints.is_empty() {
            return Err(CommandError::NoEndpointSelected);
        }

        let report = self
            .fan_out(endpoints, |backend| async move { backend.reopen().await })
            .await;
        if !report.failures.is_empty() {
            return Err(report.into_error());
        }
        Ok(report.succeeded.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendKind, LocalBackend};
    use crate::endpoint::EndpointAddress;
    use crate::query::{parse_query, OrderBy};
    use crate::types::{BackendResults, FieldValue, Hit};
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    /// Backend answering every search with a fixed page after a delay
    struct CannedBackend {
        hits: Vec<Hit>,
        total: u64,
        delay: Duration,
        fail: bool,
    }

    impl CannedBackend {
        fn new(hits: Vec<Hit>, delay_ms: u64) -> Self {
            Self {
                total: hits.len() as u64,
                hits,
                delay: Duration::from_millis(delay_ms),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                hits: Vec::new(),
                total: 0,
                delay: Duration::ZERO,
                fail: true,
            }
        }

        async fn respond<T>(&self, value: T) -> BackendResult<T> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err(BackendError::Remote("connection reset".into()))
            } else {
                Ok(value)
            }
        }
    }

    #[async_trait]
    impl StorageBackend for CannedBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Remote
        }

        async fn index(&self, _document: &Document) -> BackendResult<()> {
            self.respond(()).await
        }

        async fn search(&self, query: &Query) -> BackendResult<BackendResults> {
            let limit = query.limit.unwrap_or(usize::MAX);
            self.respond(BackendResults {
                hits: self.hits.iter().take(limit).cloned().collect(),
                total: self.total,
                facets: BTreeMap::new(),
                partial: false,
            })
            .await
        }

        async fn count(&self, _query: &Query) -> BackendResult<u64> {
            self.respond(self.total).await
        }

        async fn delete(&self, _id: &str) -> BackendResult<bool> {
            self.respond(true).await
        }

        async fn commit(&self) -> BackendResult<()> {
            self.respond(()).await
        }

        async fn close(&self) -> BackendResult<()> {
            Ok(())
        }
    }

    fn hit(id: &str, weight: f64, size: f64) -> Hit {
        Hit {
            id: id.into(),
            rank: 0,
            weight,
            endpoint: String::new(),
            data: serde_json::json!({ "id": id }),
            values: BTreeMap::from([("size".to_string(), FieldValue::Number(size))]),
            terms: None,
        }
    }

    fn endpoint(name: &str, backend: impl StorageBackend + 'static) -> Endpoint {
        Endpoint::new(EndpointAddress::Local(name.into()), Arc::new(backend))
    }

    fn coordinator() -> QueryCoordinator {
        QueryCoordinator::new(Duration::from_secs(5), 100, 1000)
    }

    fn ordered(delays: [u64; 3]) -> Vec<Endpoint> {
        vec![
            endpoint("a", CannedBackend::new(vec![hit("a1", 1.0, 3.0), hit("a2", 1.0, 1.0)], delays[0])),
            endpoint("b", CannedBackend::new(vec![hit("b1", 1.0, 2.0), hit("b2", 1.0, 1.0)], delays[1])),
            endpoint("c", CannedBackend::new(vec![hit("c1", 1.0, 5.0)], delays[2])),
        ]
    }

    #[tokio::test]
    async fn test_merge_ignores_completion_order() {
        let mut query = Query::new("*");
        query.order_by = Some(OrderBy {
            fields: vec!["size".into()],
            descending: true,
        });

        let mut outputs = Vec::new();
        for delays in [[0, 10, 20], [20, 10, 0], [10, 0, 20], [5, 25, 0]] {
            let results = coordinator().search(&ordered(delays), &query).await.unwrap();
            let ids: Vec<(String, String)> = results
                .hits
                .iter()
                .map(|h| (h.id.clone(), h.endpoint.clone()))
                .collect();
            outputs.push(ids);
        }

        for output in &outputs[1..] {
            assert_eq!(output, &outputs[0]);
        }
        let first: Vec<&str> = outputs[0].iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(first, vec!["c1", "a1", "b1", "a2", "b2"]);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_survivors() {
        let endpoints = vec![
            endpoint("good", CannedBackend::new(vec![hit("g1", 2.0, 1.0)], 0)),
            endpoint("bad", CannedBackend::failing()),
        ];
        let results = coordinator().search(&endpoints, &Query::new("*")).await.unwrap();

        assert!(results.partial);
        assert_eq!(results.hits.len(), 1);
        assert_eq!(results.hits[0].endpoint, "good");
        assert_eq!(results.failures.len(), 1);
        assert_eq!(results.failures[0].endpoint, "bad");
    }

    #[tokio::test]
    async fn test_all_failed_is_search_failed() {
        let endpoints = vec![
            endpoint("x", CannedBackend::failing()),
            endpoint("y", CannedBackend::failing()),
        ];
        let err = coordinator()
            .search(&endpoints, &Query::new("*"))
            .await
            .unwrap_err();
        match err {
            CommandError::SearchFailed(failures) => assert_eq!(failures.len(), 2),
            other => panic!("expected SearchFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let endpoints = vec![
            endpoint("fast", CannedBackend::new(vec![hit("f", 1.0, 1.0)], 0)),
            endpoint("slow", CannedBackend::new(vec![hit("s", 9.0, 1.0)], 5_000)),
        ];
        let coordinator = QueryCoordinator::new(Duration::from_millis(100), 10, 100);
        let results = coordinator.search(&endpoints, &Query::new("*")).await.unwrap();

        assert!(results.partial);
        assert_eq!(results.hits.len(), 1);
        assert_eq!(results.hits[0].id, "f");
        assert!(results.failures[0].error.contains("Timed out"));
    }

    #[tokio::test]
    async fn test_zero_limit_keeps_estimate() {
        let query = parse_query("* OFFSET 0 LIMIT 0").unwrap();
        let results = coordinator().search(&ordered([0, 0, 0]), &query).await.unwrap();
        assert!(results.hits.is_empty());
        assert_eq!(results.estimated, 5);
    }

    #[tokio::test]
    async fn test_limit_is_clamped_with_warning() {
        let mut query = Query::new("*");
        query.limit = Some(5_000);
        let results = coordinator().search(&ordered([0, 0, 0]), &query).await.unwrap();
        assert_eq!(results.warnings.len(), 1);
        assert!(results.warnings[0].contains("clamped to 1000"));
    }

    #[tokio::test]
    async fn test_validation_before_any_backend_call() {
        let mut query = Query::new("*");
        query.order_by = Some(OrderBy {
            fields: vec!["bad-name".into()],
            descending: false,
        });
        let endpoints = vec![endpoint("x", CannedBackend::failing())];
        let err = coordinator().search(&endpoints, &query).await.unwrap_err();
        assert!(matches!(err, CommandError::Validation(_)));
    }

    #[tokio::test]
    async fn test_requires_endpoint() {
        let err = coordinator().search(&[], &Query::new("*")).await.unwrap_err();
        assert_eq!(err, CommandError::NoEndpointSelected);
    }

    #[tokio::test]
    async fn test_index_reports_partial_failure() {
        let local = LocalBackend::in_memory().unwrap();
        let endpoints = vec![
            endpoint("local", local.clone()),
            endpoint("broken", CannedBackend::failing()),
        ];

        let doc = Document::new("d1", serde_json::json!({})).with_text("kept");
        let outcome = coordinator().index(&endpoints, doc).await.unwrap();
        assert_eq!(outcome.indexed, vec!["local".to_string()]);
        assert_eq!(outcome.failures.len(), 1);
        assert!(!outcome.is_complete());

        // The successful write is not rolled back
        assert_eq!(local.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_fails_if_any_endpoint_fails() {
        let endpoints = vec![
            endpoint("ok", CannedBackend::new(Vec::new(), 0)),
            endpoint("broken", CannedBackend::failing()),
        ];
        let err = coordinator().commit(&endpoints).await.unwrap_err();
        assert!(matches!(err, CommandError::FanOutFailed { total: 2, .. }));
    }

    #[tokio::test]
    async fn test_distinct_id_across_endpoints() {
        let endpoints = vec![
            endpoint("a", CannedBackend::new(vec![hit("x", 1.0, 1.0), hit("y", 0.5, 2.0)], 0)),
            endpoint("b", CannedBackend::new(vec![hit("x", 2.0, 1.0)], 0)),
        ];
        let query = parse_query("* DISTINCT").unwrap();
        let results = coordinator().search(&endpoints, &query).await.unwrap();
        let ids: Vec<(&str, &str)> = results
            .hits
            .iter()
            .map(|h| (h.id.as_str(), h.endpoint.as_str()))
            .collect();
        assert_eq!(ids, vec![("x", "b"), ("y", "a")]);
    }

    #[tokio::test]
    async fn test_reopen_every_endpoint() {
        let endpoints = ordered([0, 0, 0]);
        assert_eq!(coordinator().reopen(&endpoints).await.unwrap(), 3);
        assert_eq!(
            coordinator().reopen(&[]).await.unwrap_err(),
            CommandError::NoEndpointSelected
        );
    }

    #[tokio::test]
    async fn test_count_and_delete_sum_endpoints() {
        let endpoints = ordered([0, 0, 0]);
        let count = coordinator().count(&endpoints, &Query::new("*")).await.unwrap();
        assert_eq!(count.count, 5);

        let deleted = coordinator().delete(&endpoints, "a1").await.unwrap();
        assert_eq!(deleted.deleted, 3);
    }
}
