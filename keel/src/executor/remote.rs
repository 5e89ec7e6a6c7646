use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use super::ExecutorBackend;
use super::protocol::{
    CancelRequest, CancelResponse, ErrorBody, GetRunStatusRequest, LogChunk, RunStatusResponse,
    StreamLogsRequest, SubmitRequest, SubmitResponse,
};
use super::service::{CANCEL_PATH, LOGS_PATH, STATUS_PATH, SUBMIT_PATH};
use crate::channel::SecureChannel;
use crate::error::ExecutorError;
use crate::run::{LogCursor, RunId, RunStatus};
use crate::telemetry::executor_span;

/// Status reply with the status kept as sent, so a value this side does not
/// know still decodes.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusReply {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

impl From<StatusReply> for RunStatusResponse {
    fn from(reply: StatusReply) -> Self {
        let known = serde_json::from_value::<RunStatus>(serde_json::Value::String(
            reply.status.clone(),
        ));
        match known {
            Ok(status) => RunStatusResponse {
                status,
                message: reply.message,
            },
            Err(_) => {
                tracing::warn!(status = %reply.status, "executor reported an unrecognised status");
                let detail = match reply.message {
                    Some(message) => format!(": {message}"),
                    None => String::new(),
                };
                RunStatusResponse::with_message(
                    RunStatus::Failed,
                    format!("unrecognised executor status {:?}{detail}", reply.status),
                )
            }
        }
    }
}

/// Executor reached over the network through the executor protocol.
#[derive(Clone, Debug)]
pub struct RemoteExecutor {
    name: String,
    channel: SecureChannel,
}

impl RemoteExecutor {
    pub fn new(name: impl Into<String>, channel: SecureChannel) -> Self {
        Self {
            name: name.into(),
            channel,
        }
    }

    pub fn channel(&self) -> &SecureChannel {
        &self.channel
    }

    async fn call<Req, Resp>(
        &self,
        path: &str,
        body: &Req,
        run_id: RunId,
    ) -> Result<Resp, ExecutorError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let response = self
            .channel
            .post_json(path, body)
            .map_err(|e| ExecutorError::Transport(e.to_string()))?
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| ExecutorError::Transport(format!("undecodable response: {e}")));
        }

        let body = response.json::<ErrorBody>().await.ok();
        Err(error_from_status(status, body, run_id))
    }
}

fn error_from_status(status: StatusCode, body: Option<ErrorBody>, run_id: RunId) -> ExecutorError {
    let message = body
        .as_ref()
        .map(|b| b.error.clone())
        .unwrap_or_else(|| status.to_string());

    match status {
        StatusCode::NOT_FOUND => ExecutorError::NotFound(run_id),
        StatusCode::FORBIDDEN => match body.and_then(|b| b.scope) {
            Some(scope) => ExecutorError::CredentialScope {
                namespace: scope.namespace,
                expected: scope.expected,
                actual: scope.actual,
            },
            None => ExecutorError::CredentialScope {
                namespace: String::new(),
                expected: String::new(),
                actual: message,
            },
        },
        StatusCode::GONE => ExecutorError::CredentialExpired(run_id),
        StatusCode::UNPROCESSABLE_ENTITY => ExecutorError::Rejected(message),
        other => ExecutorError::Transport(format!("executor answered {other}: {message}")),
    }
}

#[async_trait]
impl ExecutorBackend for RemoteExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, ExecutorError> {
        let run_id = request.run_id;
        self.call(SUBMIT_PATH, &request, run_id)
            .instrument(executor_span("submit", run_id))
            .await
    }

    async fn get_run_status(&self, run_id: RunId) -> Result<RunStatusResponse, ExecutorError> {
        self.call::<_, StatusReply>(STATUS_PATH, &GetRunStatusRequest { run_id }, run_id)
            .instrument(executor_span("get_run_status", run_id))
            .await
            .map(RunStatusResponse::from)
    }

    async fn stream_logs(
        &self,
        run_id: RunId,
        cursor: LogCursor,
    ) -> Result<LogChunk, ExecutorError> {
        self.call(LOGS_PATH, &StreamLogsRequest { run_id, cursor }, run_id)
            .instrument(executor_span("stream_logs", run_id))
            .await
    }

    async fn cancel(&self, run_id: RunId) -> Result<CancelResponse, ExecutorError> {
        self.call(CANCEL_PATH, &CancelRequest { run_id }, run_id)
            .instrument(executor_span("cancel", run_id))
            .await
    }
}
