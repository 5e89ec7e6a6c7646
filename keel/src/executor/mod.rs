//! Executor backends.
//!
//! Every backend speaks the same four-operation protocol so the dispatcher can
//! treat local containers, cloud tasks and remote executor processes alike.
//! Status values are always translated to [`RunStatus`]; a backend's native
//! vocabulary never leaves this module.
//!
//! [`RunStatus`]: crate::run::RunStatus

mod cloud;
mod lifecycle;
mod local;
pub mod protocol;
mod remote;
pub mod service;
mod table;

use std::collections::BTreeMap;

use async_trait::async_trait;

pub use cloud::{
    CloudExecutor, STOP_CODE_USER_INITIATED, TaskDescription, TaskLaunch, TaskService,
    map_task_status,
};
pub use local::{
    ContainerRuntime, ContainerSpec, ContainerState, LABEL_NAMESPACE, LABEL_RUN_ID, LocalExecutor,
    map_container_state,
};
pub use protocol::{
    CancelRequest, CancelResponse, GetRunStatusRequest, LogChunk, RunStatusResponse,
    StreamLogsRequest, SubmitRequest, SubmitResponse,
};
pub use remote::RemoteExecutor;
pub use table::{Reservation, TaskEntry, TaskTable};

use crate::credentials::Credential;
use crate::error::ExecutorError;
use crate::run::{LogCursor, RunId};

pub const ENV_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const ENV_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const ENV_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
pub const ENV_RUN_ID: &str = "KEEL_RUN_ID";
pub const ENV_NAMESPACE: &str = "KEEL_NAMESPACE";
pub const ENV_PARAM_PREFIX: &str = "KEEL_PARAM_";

/// The protocol every execution backend satisfies.
///
/// `submit` is idempotent per run id. `cancel` is best-effort: a positive
/// acknowledgement only means the stop was requested, and callers keep
/// polling `get_run_status` until a terminal status appears.
#[async_trait]
pub trait ExecutorBackend: Send + Sync {
    /// Short backend name used in logs and metrics.
    fn name(&self) -> &str;

    async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, ExecutorError>;

    async fn get_run_status(&self, run_id: RunId) -> Result<RunStatusResponse, ExecutorError>;

    async fn stream_logs(&self, run_id: RunId, cursor: LogCursor)
    -> Result<LogChunk, ExecutorError>;

    async fn cancel(&self, run_id: RunId) -> Result<CancelResponse, ExecutorError>;
}

impl std::fmt::Debug for dyn ExecutorBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExecutorBackend({})", self.name())
    }
}

/// Check the credential attached to a submission and return it.
pub(crate) fn admit(request: &SubmitRequest) -> Result<&Credential, ExecutorError> {
    let credential = request.credential_override.as_ref().ok_or_else(|| {
        ExecutorError::Rejected("submission carries no scoped credential".to_string())
    })?;

    if !credential.is_scoped_to(&request.namespace) {
        return Err(ExecutorError::CredentialScope {
            namespace: request.namespace.to_string(),
            expected: request.namespace.allowed_prefix(),
            actual: credential.allowed_prefix.clone(),
        });
    }
    if credential.is_expired() {
        return Err(ExecutorError::CredentialExpired(request.run_id));
    }
    Ok(credential)
}

/// Environment handed to the compute unit running `request`.
pub fn run_environment(request: &SubmitRequest, credential: &Credential) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(ENV_ACCESS_KEY_ID.to_string(), credential.access_key.clone());
    env.insert(ENV_SECRET_ACCESS_KEY.to_string(), credential.secret_key.clone());
    env.insert(ENV_SESSION_TOKEN.to_string(), credential.session_token.clone());
    env.insert(ENV_RUN_ID.to_string(), request.run_id.to_string());
    env.insert(ENV_NAMESPACE.to_string(), request.namespace.to_string());
    for (name, value) in &request.parameters {
        env.insert(param_env_name(name), value.clone());
    }
    env
}

fn param_env_name(name: &str) -> String {
    let mut key = String::with_capacity(ENV_PARAM_PREFIX.len() + name.len());
    key.push_str(ENV_PARAM_PREFIX);
    key.extend(name.chars().map(|c| {
        if c.is_ascii_alphanumeric() {
            c.to_ascii_uppercase()
        } else {
            '_'
        }
    }));
    key
}
