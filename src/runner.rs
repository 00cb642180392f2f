//! Chain execution per test-data row, and the run over all rows.

use crate::config::PropagationRule;
use crate::dispatch::Dispatcher;
use crate::materialize::{Materialized, Materializer};
use crate::model::*;
use crate::path::{self, substitution_text};
use crate::store::ResponseStore;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Runs the collection for one row: materialize, dispatch, record and
/// store each request in order, stopping at the first failure.
pub struct ChainExecutor {
    dispatcher: Arc<dyn Dispatcher>,
    materializer: Materializer,
    propagate: Option<PropagationRule>,
}

impl ChainExecutor {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, materializer: Materializer) -> Self {
        Self {
            dispatcher,
            materializer,
            propagate: None,
        }
    }

    /// Carry `rule.field` from each successful response into header
    /// `rule.header` on the rest of the chain.
    pub fn with_propagation(mut self, rule: PropagationRule) -> Self {
        self.propagate = Some(rule);
        self
    }

    pub fn id_column(&self) -> &str {
        &self.materializer.options().id_column
    }

    /// Execute the chain for `row`. Always returns a result; failures are
    /// recorded in it, never raised.
    #[instrument(skip_all, fields(row = row_index + 1))]
    pub async fn run_row(
        &self,
        collection: &Collection,
        row: &TestDataRow,
        row_index: usize,
        cancel: &CancellationToken,
    ) -> TestCaseResult {
        let start = Instant::now();
        let id = row.identifier(self.id_column(), row_index);

        if let Err(err) = row.validate() {
            error!("Test case {} is invalid: {}", id, err);
            let logs = collection
                .requests
                .first()
                .map(|template| rejected_row_log(template, &err.to_string()))
                .into_iter()
                .collect();
            return TestCaseResult {
                id,
                row_index,
                status: Status::Failed,
                error: Some(err.to_string()),
                logs,
                duration_ms: start.elapsed().as_millis() as u64,
            };
        }

        let mut store = ResponseStore::new();
        let mut logs = Vec::with_capacity(collection.len());
        let mut status = Status::Passed;
        let mut row_error = None;

        for (idx, template) in collection.requests.iter().enumerate() {
            let position = idx + 1;

            if cancel.is_cancelled() {
                warn!("Run cancelled; {} stops before request {}", id, position);
                status = Status::NotRun;
                row_error = Some(format!(
                    "run cancelled before {}",
                    template.display_name(position)
                ));
                break;
            }

            info!(
                "Running request {}/{}: {}",
                position,
                collection.len(),
                template.display_name(position)
            );
            let log = self.run_step(template, row, &mut store, position).await;

            if log.status == Status::Failed {
                row_error = Some(format!(
                    "{}: {}",
                    log.name,
                    log.error.as_deref().unwrap_or("request failed")
                ));
                logs.push(log);
                status = Status::Failed;
                info!("Stopping chain for {} due to request failure", id);
                break;
            }
            logs.push(log);
        }

        let result = TestCaseResult {
            id,
            row_index,
            status,
            error: row_error,
            logs,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            "Test case finished: {} ({} ms) - {}",
            result.id, result.duration_ms, result.status
        );
        result
    }

    async fn run_step(
        &self,
        template: &RequestTemplate,
        row: &TestDataRow,
        store: &mut ResponseStore,
        position: usize,
    ) -> ExecutionLog {
        let start = Instant::now();
        let Materialized { request, warnings } =
            self.materializer.materialize(template, row, store, position);

        let response = self.dispatcher.dispatch(&request).await;
        let status = response.status();
        let error = response.error.clone();

        if response.ok {
            if let Some(rule) = &self.propagate {
                match path::resolve(&response.body, &rule.field) {
                    Some(value) => {
                        let value = substitution_text(value);
                        debug!("Carrying '{}' into header {}", rule.field, rule.header);
                        store.carry_header(&rule.header, value);
                    }
                    None => debug!(
                        "Propagation field '{}' not in response {}",
                        rule.field, position
                    ),
                }
            }
            store.put(position, response.clone());
        } else {
            error!(
                "Request {} failed: {}",
                position,
                error.as_deref().unwrap_or("unknown error")
            );
        }

        ExecutionLog {
            position,
            name: template.display_name(position),
            method: request.method,
            original_url: template.url.clone(),
            modified_url: request.url,
            headers: request.headers,
            body: request.body,
            status,
            response: Some(response),
            error,
            warnings,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

/// Log entry for the first request of a row whose data could not be used.
/// Nothing was sent, so there is no response.
fn rejected_row_log(template: &RequestTemplate, reason: &str) -> ExecutionLog {
    ExecutionLog {
        position: 1,
        name: template.display_name(1),
        method: template.method,
        original_url: template.url.clone(),
        modified_url: template.url.clone(),
        headers: template.headers.clone(),
        body: None,
        status: Status::Failed,
        response: None,
        error: Some(reason.to_string()),
        warnings: Vec::new(),
        duration_ms: 0,
    }
}

/// Runs the chain once per row and collects results in row order.
pub struct RunOrchestrator {
    executor: ChainExecutor,
    concurrency: usize,
    cancel: CancellationToken,
}

impl RunOrchestrator {
    pub fn new(executor: ChainExecutor) -> Self {
        Self {
            executor,
            concurrency: 1,
            cancel: CancellationToken::new(),
        }
    }

    /// Rows run at once. Each row keeps its own response store, and
    /// results are still returned in input order.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops the run between rows and between chain steps.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[instrument(skip_all, fields(rows = rows.len(), requests = collection.len()))]
    pub async fn run(&self, collection: &Collection, rows: &[TestDataRow]) -> RunResult {
        let started_at = Utc::now().to_rfc3339();
        let start = Instant::now();

        info!(
            "Starting run: {} row(s) x {} request(s)",
            rows.len(),
            collection.len()
        );

        let results: Vec<TestCaseResult> = if self.concurrency == 1 {
            let mut results = Vec::with_capacity(rows.len());
            for (index, row) in rows.iter().enumerate() {
                results.push(self.run_one(collection, row, index, rows.len()).await);
            }
            results
        } else {
            stream::iter(rows.iter().enumerate())
                .map(|(index, row)| self.run_one(collection, row, index, rows.len()))
                .buffered(self.concurrency)
                .collect()
                .await
        };

        let summary = RunSummary::from_rows(&results);
        let result = RunResult {
            collection: collection.name.clone(),
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            summary,
            rows: results,
        };

        info!(
            "Run finished ({} ms): {} passed, {} failed, {} not run",
            result.duration_ms, summary.passed, summary.failed, summary.not_run
        );
        result
    }

    async fn run_one(
        &self,
        collection: &Collection,
        row: &TestDataRow,
        index: usize,
        total: usize,
    ) -> TestCaseResult {
        if self.cancel.is_cancelled() {
            return TestCaseResult {
                id: row.identifier(self.executor.id_column(), index),
                row_index: index,
                status: Status::NotRun,
                error: Some("run cancelled".to_string()),
                logs: Vec::new(),
                duration_ms: 0,
            };
        }

        info!("Test case {}/{}", index + 1, total);
        self.executor
            .run_row(collection, row, index, &self.cancel)
            .await
    }
}
