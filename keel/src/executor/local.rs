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
use crate::config::LocalExecutorConfig;
use crate::error::ExecutorError;
use crate::run::{LogCursor, RunId, RunStatus};

pub const LABEL_RUN_ID: &str = "keel.run-id";
pub const LABEL_NAMESPACE: &str = "keel.namespace";

/// What to create for one run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// A container engine's view of one container.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    /// Engine status string, e.g. `running` or `exited`.
    pub status: String,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
}

/// Minimal container engine surface the local executor drives.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Create and start a container, returning its id.
    async fn create_and_start(&self, spec: &ContainerSpec) -> anyhow::Result<String>;

    /// Current state, or `None` when the container no longer exists.
    async fn inspect(&self, container_id: &str) -> anyhow::Result<Option<ContainerState>>;

    /// Log lines starting at zero-based line `from_line`.
    async fn logs(&self, container_id: &str, from_line: usize) -> anyhow::Result<Vec<String>>;

    async fn stop(&self, container_id: &str) -> anyhow::Result<()>;
}

/// Translate a container state into a canonical status.
pub fn map_container_state(state: &ContainerState, cancel_requested: bool) -> RunStatusResponse {
    let mapped = match state.status.as_str() {
        "created" => RunStatusResponse::new(RunStatus::Submitted),
        "running" | "restarting" | "paused" | "removing" => {
            RunStatusResponse::new(RunStatus::Running)
        }
        "exited" => match state.exit_code {
            Some(0) => RunStatusResponse::new(RunStatus::Succeeded),
            Some(code) => RunStatusResponse::with_message(
                RunStatus::Failed,
                state
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("container exited with code {code}")),
            ),
            None => RunStatusResponse::with_message(
                RunStatus::Failed,
                "container exited without an exit code",
            ),
        },
        "dead" => RunStatusResponse::with_message(
            RunStatus::Failed,
            state
                .error
                .clone()
                .unwrap_or_else(|| "container is dead".to_string()),
        ),
        other => {
            return RunStatusResponse::with_message(
                RunStatus::Failed,
                format!("unrecognised container status {other:?}"),
            );
        }
    };

    if cancel_requested && mapped.status.is_terminal() {
        return RunStatusResponse::with_message(RunStatus::Cancelled, "cancelled on request");
    }
    mapped
}

/// Runs each pipeline run as one container on a local engine.
pub struct LocalExecutor<R> {
    runtime: Arc<R>,
    config: LocalExecutorConfig,
    table: Arc<TaskTable>,
}

impl<R> Clone for LocalExecutor<R> {
    fn clone(&self) -> Self {
        Self {
            runtime: Arc::clone(&self.runtime),
            config: self.config.clone(),
            table: Arc::clone(&self.table),
        }
    }
}

impl<R> fmt::Debug for LocalExecutor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalExecutor")
            .field("config", &self.config)
            .field("runs", &self.table.len())
            .finish()
    }
}

impl<R: ContainerRuntime> LocalExecutor<R> {
    pub fn new(runtime: Arc<R>, config: LocalExecutorConfig) -> Self {
        Self {
            runtime,
            config,
            table: Arc::new(TaskTable::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    /// Runs this executor currently remembers.
    pub fn tracked_runs(&self) -> usize {
        self.table.len()
    }
}

#[async_trait]
impl<R: ContainerRuntime> Driver for LocalExecutor<R> {
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
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_RUN_ID.to_string(), request.run_id.to_string());
        labels.insert(LABEL_NAMESPACE.to_string(), request.namespace.to_string());

        let spec = ContainerSpec {
            name: format!("{}-{}", self.config.name_prefix, request.run_id),
            image: self.config.image.clone(),
            env,
            labels,
        };
        self.runtime.create_and_start(&spec).await
    }

    async fn observe(&self, entry: &TaskEntry) -> anyhow::Result<RunStatusResponse> {
        let container_id = &entry.handle.backend_task_ref;
        Ok(match self.runtime.inspect(container_id).await? {
            Some(state) => map_container_state(&state, entry.cancel_requested),
            None if entry.cancel_requested => {
                RunStatusResponse::with_message(RunStatus::Cancelled, "cancelled on request")
            }
            None => RunStatusResponse::with_message(
                RunStatus::Failed,
                format!("container {container_id} no longer exists"),
            ),
        })
    }

    async fn read_logs(&self, task_ref: &str, from_line: usize) -> anyhow::Result<Vec<String>> {
        self.runtime.logs(task_ref, from_line).await
    }

    async fn terminate(&self, task_ref: &str) -> anyhow::Result<()> {
        self.runtime.stop(task_ref).await
    }
}

#[async_trait]
impl<R: ContainerRuntime> ExecutorBackend for LocalExecutor<R> {
    fn name(&self) -> &str {
        "local"
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
