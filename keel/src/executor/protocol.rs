//! Request and response shapes shared by every executor backend and by the
//! HTTP transport between the control plane and a remote executor.

use serde::{Deserialize, Serialize};

use crate::credentials::Credential;
use crate::run::{LogCursor, Namespace, RunId, RunParameters, RunStatus};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub run_id: RunId,
    pub namespace: Namespace,
    #[serde(default)]
    pub parameters: RunParameters,
    /// Credential injected into the compute unit. Backends refuse to launch
    /// without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_override: Option<Credential>,
}

impl SubmitRequest {
    pub fn new(run_id: RunId, namespace: Namespace) -> Self {
        Self {
            run_id,
            namespace,
            parameters: RunParameters::new(),
            credential_override: None,
        }
    }

    pub fn with_parameters(mut self, parameters: RunParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential_override = Some(credential);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub accepted: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRunStatusRequest {
    pub run_id: RunId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatusResponse {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RunStatusResponse {
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            message: None,
        }
    }

    pub fn with_message(status: RunStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamLogsRequest {
    pub run_id: RunId,
    #[serde(default)]
    pub cursor: LogCursor,
}

/// Log lines strictly after the requested cursor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogChunk {
    pub lines: Vec<String>,
    pub next_cursor: LogCursor,
}

impl LogChunk {
    pub fn from_offset(cursor: LogCursor, lines: Vec<String>) -> Self {
        let next_cursor = cursor.advance(lines.len());
        Self { lines, next_cursor }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub run_id: RunId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub acknowledged: bool,
}

/// Body of every non-2xx response from the executor service.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    /// Set on credential scope rejections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeDetail>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeDetail {
    pub namespace: String,
    pub expected: String,
    pub actual: String,
}
