//! HTTP client for the sub-commands that act on a live `serve` process.
//!
//! Runs and scheduled tasks belong to the server: it holds the run locks,
//! the cancellation tokens and the scheduler's task table.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context};
use api::handlers::executions::CancelResponse;
use api::handlers::workflows::RunAccepted;
use engine::{ExecutionRecord, ScheduledTask, TaskSpec};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde_json::json;
use uuid::Uuid;

pub struct ServerClient {
    base: String,
    http: reqwest::Client,
}

impl ServerClient {
    pub fn new(server: &str) -> Self {
        Self {
            base: server.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{path}", self.base)
    }

    /// Send `request` and decode a 2xx body. Other statuses become an error
    /// carrying the server's `error` message.
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> anyhow::Result<T> {
        let response = request
            .send()
            .await
            .with_context(|| format!("contacting {}", self.base))?;

        let status = response.status();
        if !status.is_success() {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            bail!("{} ({status})", body["error"].as_str().unwrap_or("no details"));
        }

        response
            .json()
            .await
            .with_context(|| format!("decoding the response from {}", self.base))
    }

    pub async fn run_workflow(
        &self,
        name: &str,
        params: BTreeMap<String, String>,
    ) -> anyhow::Result<Uuid> {
        let request = self
            .http
            .post(self.url(&format!("workflows/{name}/run")))
            .json(&json!({ "params": params }));
        let accepted: RunAccepted = self.send(request).await?;
        Ok(accepted.execution_id)
    }

    pub async fn execution(&self, id: Uuid) -> anyhow::Result<ExecutionRecord> {
        self.send(self.http.get(self.url(&format!("executions/{id}")))).await
    }

    /// Poll the execution every `interval` until it is terminal.
    pub async fn wait_for(&self, id: Uuid, interval: Duration) -> anyhow::Result<ExecutionRecord> {
        loop {
            let record = self.execution(id).await?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn schedule_task(&self, spec: &TaskSpec) -> anyhow::Result<ScheduledTask> {
        self.send(self.http.post(self.url("tasks")).json(spec)).await
    }

    /// `false` if the execution exists but is no longer running.
    pub async fn cancel(&self, id: Uuid) -> anyhow::Result<bool> {
        let response: CancelResponse = self
            .send(self.http.post(self.url(&format!("executions/{id}/cancel"))))
            .await?;
        Ok(response.cancelled)
    }
}
