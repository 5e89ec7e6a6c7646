use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::lifecycle::{self, Driver};
use super::protocol::{
    CancelResponse, LogChunk, RunStatusResponse, SubmitRequest, SubmitResponse,
};
use super::table::{TaskEntry, TaskTable};
use super::ExecutorBackend;
use crate::config::CloudExecutorConfig;
use crate::error::ExecutorError;
use crate::run::{LogCursor, RunId, RunStatus};

pub const STOP_CODE_USER_INITIATED: &str = "UserInitiated";

/// One serverless task launch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskLaunch {
    pub cluster: String,
    pub task_definition: String,
    pub container_name: String,
    /// Run id, so the service can reject a duplicate launch on its own.
    pub client_token: String,
    pub started_by: String,
    pub env: BTreeMap<String, String>,
}

/// The task service's view of one task.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescription {
    /// e.g. `PROVISIONING`, `RUNNING`, `STOPPED`.
    pub last_status: String,
    pub stop_code: Option<String>,
    pub stopped_reason: Option<String>,
    /// Exit code of the runner container once stopped.
    pub exit_code: Option<i64>,
}

/// Minimal serverless task service surface the cloud executor drives.
#[async_trait]
pub trait TaskService: Send + Sync + 'static {
    /// Launch a task and return its reference (ARN).
    async fn run_task(&self, launch: &TaskLaunch) -> anyhow::Result<String>;

    /// Current description, or `None` when the service no longer knows the task.
    async fn describe_task(&self, task_ref: &str) -> anyhow::Result<Option<TaskDescription>>;

    /// Log events starting at zero-based line `from_line`.
    async fn log_events(&self, task_ref: &str, from_line: usize) -> anyhow::Result<Vec<String>>;

    async fn stop_task(&self, task_ref: &str, reason: &str) -> anyhow::Result<()>;
}

/// Translate a task description into a canonical status.
pub fn map_task_status(task: &TaskDescription) -> RunStatusResponse {
    match task.last_status.as_str() {
        "PROVISIONING" | "PENDING" | "ACTIVATING" => RunStatusResponse::new(RunStatus::Submitted),
        "RUNNING" | "DEACTIVATING" | "STOPPING" | "DEPROVISIONING" => {
            RunStatusResponse::new(RunStatus::Running)
        }
        "STOPPED" => {
            if task.stop_code.as_deref() == Some(STOP_CODE_USER_INITIATED) {
                return RunStatusResponse::with_message(
                    RunStatus::Cancelled,
                    task.stopped_reason
                        .clone()
                        .unwrap_or_else(|| "stopped by user".to_string()),
                );
            }
            match task.exit_code {
                Some(0) => RunStatusResponse::new(RunStatus::Succeeded),
                code => {
                    let reason = task.stopped_reason.clone().unwrap_or_else(|| match code {
                        Some(code) => format!("task exited with code {code}"),
                        None => "task stopped without an exit code".to_string(),
                    });
                    RunStatusResponse::with_message(RunStatus::Failed, reason)
                }
            }
        }
        other => RunStatusResponse::with_message(
            RunStatus::Failed,
            format!("unrecognised task status {other:?}"),
        ),
    }
}

/// Runs each pipeline run as one serverless task.
pub struct CloudExecutor<T> {
    service: Arc<T>,
    config: CloudExecutorConfig,
    table: Arc<TaskTable>,
}

impl<T> Clone for CloudExecutor<T> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            config: self.config.clone(),
            table: Arc::clone(&self.table),
        }
    }
}

impl<T> fmt::Debug for CloudExecutor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudExecutor")
            .field("config", &self.config)
            .field("runs", &self.table.len())
            .finish()
    }
}

impl<T: TaskService> CloudExecutor<T> {
    pub fn new(service: Arc<T>, config: CloudExecutorConfig) -> Self {
        Self {
            service,
            config,
            table: Arc::new(TaskTable::new()),
        }
    }

    pub fn service(&self) -> &Arc<T> {
        &self.service
    }

    pub fn tracked_runs(&self) -> usize {
        self.table.len()
    }
}

#[async_trait]
impl<T: TaskService> Driver for CloudExecutor<T> {
    fn table(&self) -> &TaskTable {
        &self.table
    }

    fn finished_retention(&self) -> Duration {
        self.config.finished_retention()
    }

    async fn launch(
        &self,
        request: &SubmitRequest,
        env: BTreeMap<String, String>,
    ) -> anyhow::Result<String> {
        let launch = TaskLaunch {
            cluster: self.config.cluster.clone(),
            task_definition: self.config.task_definition.clone(),
            container_name: self.config.container_name.clone(),
            client_token: request.run_id.to_string(),
            started_by: format!("keel/{}", request.namespace),
            env,
        };
        self.service.run_task(&launch).await
    }

    async fn observe(&self, entry: &TaskEntry) -> anyhow::Result<RunStatusResponse> {
        let task_ref = &entry.handle.backend_task_ref;
        Ok(match self.service.describe_task(task_ref).await? {
            Some(task) => map_task_status(&task),
            None => RunStatusResponse::with_message(
                RunStatus::Failed,
                format!("task {task_ref} is no longer known to the task service"),
            ),
        })
    }

    async fn read_logs(&self, task_ref: &str, from_line: usize) -> anyhow::Result<Vec<String>> {
        self.service.log_events(task_ref, from_line).await
    }

    async fn terminate(&self, task_ref: &str) -> anyhow::Result<()> {
        self.service
            .stop_task(task_ref, "cancelled by control plane")
            .await
    }
}

#[async_trait]
impl<T: TaskService> ExecutorBackend for CloudExecutor<T> {
    fn name(&self) -> &str {
        "cloud"
    }

    async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, ExecutorError> {
        lifecycle::submit(self, request).await
    }

    async fn get_run_status(&self, run_id: RunId) -> Result<RunStatusResponse, ExecutorError> {
        lifecycle::get_run_status(self, run_id).await
    }

    async fn stream_logs(
        &self,
        run_id: RunId,
        cursor: LogCursor,
    ) -> Result<LogChunk, ExecutorError> {
        lifecycle::stream_logs(self, run_id, cursor).await
    }

    async fn cancel(&self, run_id: RunId) -> Result<CancelResponse, ExecutorError> {
        lifecycle::cancel(self, run_id).await
    }
}
