//! Dune API Client
//!
//! Query executions run server-side and asynchronously: submit, poll the
//! status until a terminal state, then fetch the rows. There is no push
//! channel, so the poll loop is the only way to synchronize.

use anyhow::Result;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::DuneConfig;
use crate::error::SyncError;
use crate::models::{ExecutionState, ExecutionStatus, QueryParameters, QueryResults, ResultTable};

const API_KEY_HEADER: &str = "x-dune-api-key";

/// Upper bound on result pages followed for one execution
const MAX_RESULT_PAGES: usize = 10_000;

/// How the poll loop waits for an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` waits forever
    pub max_wait: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_wait: None,
        }
    }
}

/// A remote service that runs queries asynchronously
#[async_trait::async_trait]
pub trait QuerySource: Send + Sync {
    /// Start an execution and return its id.
    async fn execute_query(&self, query_id: &str, parameters: &QueryParameters) -> Result<String>;

    async fn get_status(&self, execution_id: &str) -> Result<ExecutionStatus>;

    /// Fetch the rows of a completed execution.
    async fn get_results(&self, execution_id: &str) -> Result<QueryResults>;

    /// Best-effort cancellation. Returns whether the service acknowledged it.
    async fn cancel_execution(&self, execution_id: &str) -> Result<bool>;

    /// Poll until the execution completes.
    ///
    /// `Failed` and `Cancelled` are fatal. When `policy.max_wait` runs out
    /// the execution is cancelled and `PollTimeout` is returned.
    async fn wait_for_completion(
        &self,
        execution_id: &str,
        policy: &PollPolicy,
    ) -> Result<ExecutionStatus> {
        let started = Instant::now();
        let mut status = self.get_status(execution_id).await?;

        loop {
            match status.state {
                ExecutionState::Completed => {
                    if status.is_partial() {
                        warn!(execution_id, "Execution completed with partial results");
                    }
                    return Ok(status);
                }
                ExecutionState::Failed | ExecutionState::Cancelled => {
                    return Err(SyncError::ExecutionFailed {
                        execution_id: execution_id.to_string(),
                        state: status.state,
                        message: status.error,
                    }
                    .into());
                }
                ExecutionState::Pending | ExecutionState::Running => {}
            }

            let elapsed = started.elapsed();
            if let Some(max_wait) = policy.max_wait {
                if elapsed >= max_wait {
                    warn!(
                        execution_id,
                        waited_secs = elapsed.as_secs(),
                        "Execution exceeded max wait, cancelling"
                    );
                    if let Err(e) = self.cancel_execution(execution_id).await {
                        warn!(execution_id, "Cancel after timeout failed: {:#}", e);
                    }
                    return Err(SyncError::PollTimeout {
                        execution_id: execution_id.to_string(),
                        waited: elapsed,
                    }
                    .into());
                }
            }

            sleep(policy.interval).await;
            status = self.get_status(execution_id).await?;
            info!(
                execution_id,
                state = %status.state,
                "{:.1} minutes elapsed",
                started.elapsed().as_secs_f64() / 60.0
            );
        }
    }

    /// Wait for completion, then fetch the rows once.
    async fn poll_until_complete(
        &self,
        execution_id: &str,
        policy: &PollPolicy,
    ) -> Result<QueryResults> {
        self.wait_for_completion(execution_id, policy).await?;
        self.get_results(execution_id).await
    }
}

#[derive(Clone, Debug)]
pub struct DuneClient {
    client: Client,
    base_url: String,
}

impl DuneClient {
    /// Build a client with the API key baked into its default headers.
    ///
    /// Fails with a configuration error, before any request, if the key is
    /// missing or still the placeholder.
    pub fn new(config: &DuneConfig) -> Result<Self> {
        config.validate()?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    API_KEY_HEADER,
                    config
                        .apikey
                        .trim()
                        .parse()
                        .map_err(|_| SyncError::config("Invalid dune api key"))?,
                );
                headers
            })
            .build()
            .map_err(|e| SyncError::transport("dune", format!("Failed to build DuneClient: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    #[inline]
    fn url(&self, module: &str, id: &str, action: &str) -> String {
        format!("{}/{}/{}/{}", self.base_url, module, id, action)
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder, what: &str) -> Result<T> {
        let resp = req
            .send()
            .await
            .map_err(|e| SyncError::transport("dune", format!("{} failed: {}", what, e)))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(
                SyncError::api(Some(status.as_u16()), format!("{} {}: {}", what, status, text)).into(),
            );
        }

        let body = resp
            .text()
            .await
            .map_err(|e| SyncError::transport("dune", format!("{} body: {}", what, e)))?;
        serde_json::from_str(&body).map_err(|e| {
            SyncError::api(
                Some(status.as_u16()),
                format!("Failed to parse {} response: {}", what, e),
            )
            .into()
        })
    }

    async fn fetch_results_page(&self, url: &str) -> Result<ResultsResponse> {
        self.send_json(self.client.get(url), "GET /execution/results")
            .await
    }
}

#[async_trait::async_trait]
impl QuerySource for DuneClient {
    async fn execute_query(&self, query_id: &str, parameters: &QueryParameters) -> Result<String> {
        let url = self.url("query", query_id, "execute");
        let body = ExecuteRequest {
            query_parameters: parameters,
        };
        let resp: ExecuteResponse = self
            .send_json(self.client.post(url).json(&body), "POST /query/execute")
            .await?;

        let execution_id = resp
            .execution_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SyncError::api(None, "execute response has no execution_id"))?;

        info!(query_id, execution_id = %execution_id, ?parameters, "Query execution submitted");
        Ok(execution_id)
    }

    async fn get_status(&self, execution_id: &str) -> Result<ExecutionStatus> {
        let url = self.url("execution", execution_id, "status");
        let resp: StatusResponse = self
            .send_json(self.client.get(url), "GET /execution/status")
            .await?;

        let state: ExecutionState = resp.state.parse()?;
        debug!(execution_id, state = %resp.state, "Execution status");

        Ok(ExecutionStatus {
            execution_id: resp.execution_id.unwrap_or_else(|| execution_id.to_string()),
            state,
            raw_state: resp.state,
            error: resp.error.map(error_message),
        })
    }

    async fn get_results(&self, execution_id: &str) -> Result<QueryResults> {
        let mut url = self.url("execution", execution_id, "results");
        let mut table = ResultTable::default();

        for _page in 0..MAX_RESULT_PAGES {
            let resp = self.fetch_results_page(&url).await?;
            let result = resp
                .result
                .ok_or_else(|| SyncError::api(None, "results response has no result body"))?;

            let column_names = result.metadata.and_then(|m| m.column_names);
            let page = ResultTable::from_json_rows(column_names, result.rows);
            let page_len = page.len();
            table.extend(page)?;

            match resp.next_uri {
                Some(next) if page_len > 0 => url = next,
                _ => break,
            }
        }

        info!(execution_id, rows = table.len(), "Fetched execution results");
        Ok(QueryResults {
            execution_id: execution_id.to_string(),
            table,
        })
    }

    async fn cancel_execution(&self, execution_id: &str) -> Result<bool> {
        let url = self.url("execution", execution_id, "cancel");
        let resp: CancelResponse = self
            .send_json(self.client.get(url), "GET /execution/cancel")
            .await?;
        info!(execution_id, success = resp.success, "Execution cancel requested");
        Ok(resp.success)
    }
}

fn error_message(err: Value) -> String {
    if let Some(msg) = err.get("message").and_then(|m| m.as_str()) {
        return msg.to_string();
    }
    match err {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    query_parameters: &'a QueryParameters,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteResponse {
    pub execution_id: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub execution_id: Option<String>,
    pub state: String,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultsResponse {
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub result: Option<ResultBody>,
    #[serde(default)]
    pub next_uri: Option<String>,
    #[serde(default)]
    pub next_offset: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultBody {
    #[serde(default)]
    pub rows: Vec<Map<String, Value>>,
    #[serde(default)]
    pub metadata: Option<ResultMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultMetadata {
    #[serde(default)]
    pub column_names: Option<Vec<String>>,
    #[serde(default)]
    pub row_count: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelResponse {
    #[serde(default)]
    pub success: bool,
}
