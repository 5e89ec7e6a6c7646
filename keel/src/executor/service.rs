//! HTTP face of an executor backend.
//!
//! Serves the executor protocol so a [`LocalExecutor`] or [`CloudExecutor`]
//! can live in its own process and be reached through a [`RemoteExecutor`].
//!
//! [`LocalExecutor`]: super::LocalExecutor
//! [`CloudExecutor`]: super::CloudExecutor
//! [`RemoteExecutor`]: super::RemoteExecutor

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use tokio::net::TcpListener;

use super::ExecutorBackend;
use super::protocol::{
    CancelRequest, CancelResponse, ErrorBody, GetRunStatusRequest, LogChunk, RunStatusResponse,
    ScopeDetail, StreamLogsRequest, SubmitRequest, SubmitResponse,
};
use crate::election::ShutdownToken;
use crate::error::ExecutorError;

pub const SUBMIT_PATH: &str = "/v1/runs/submit";
pub const STATUS_PATH: &str = "/v1/runs/status";
pub const LOGS_PATH: &str = "/v1/runs/logs";
pub const CANCEL_PATH: &str = "/v1/runs/cancel";

type Backend = Arc<dyn ExecutorBackend>;

/// Error wrapper that renders an [`ExecutorError`] with its protocol status code.
#[derive(Debug)]
pub struct ApiError(pub ExecutorError);

impl From<ExecutorError> for ApiError {
    fn from(err: ExecutorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let scope = match &self.0 {
            ExecutorError::CredentialScope {
                namespace,
                expected,
                actual,
            } => Some(ScopeDetail {
                namespace: namespace.clone(),
                expected: expected.clone(),
                actual: actual.clone(),
            }),
            _ => None,
        };
        if status.is_server_error() {
            tracing::warn!(status = %status, "executor request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            scope,
        };
        (status, Json(body)).into_response()
    }
}

/// Status code the protocol uses for each error kind.
pub fn status_for(err: &ExecutorError) -> StatusCode {
    match err {
        ExecutorError::NotFound(_) => StatusCode::NOT_FOUND,
        ExecutorError::CredentialScope { .. } => StatusCode::FORBIDDEN,
        ExecutorError::CredentialExpired(_) => StatusCode::GONE,
        ExecutorError::Rejected(_) | ExecutorError::InvalidNamespace(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ExecutorError::Backend(_) | ExecutorError::Transport(_) => StatusCode::BAD_GATEWAY,
    }
}

/// Router exposing `backend` under `/v1/runs/*`.
pub fn router(backend: Backend) -> Router {
    Router::new()
        .route(SUBMIT_PATH, post(submit))
        .route(STATUS_PATH, post(status))
        .route(LOGS_PATH, post(logs))
        .route(CANCEL_PATH, post(cancel))
        .with_state(backend)
}

/// Serve `backend` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    backend: Backend,
    shutdown: ShutdownToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, backend = backend.name(), "executor service listening");
    }
    axum::serve(listener, router(backend))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn submit(
    State(backend): State<Backend>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    Ok(Json(backend.submit(request).await?))
}

async fn status(
    State(backend): State<Backend>,
    Json(request): Json<GetRunStatusRequest>,
) -> Result<Json<RunStatusResponse>, ApiError> {
    Ok(Json(backend.get_run_status(request.run_id).await?))
}

async fn logs(
    State(backend): State<Backend>,
    Json(request): Json<StreamLogsRequest>,
) -> Result<Json<LogChunk>, ApiError> {
    Ok(Json(
        backend.stream_logs(request.run_id, request.cursor).await?,
    ))
}

async fn cancel(
    State(backend): State<Backend>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<CancelResponse>, ApiError> {
    Ok(Json(backend.cancel(request.run_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NamespaceError;
    use crate::run::RunId;

    #[test]
    fn test_status_codes() {
        let run_id = RunId::new();
        assert_eq!(status_for(&ExecutorError::NotFound(run_id)), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&ExecutorError::CredentialExpired(run_id)),
            StatusCode::GONE
        );
        assert_eq!(
            status_for(&ExecutorError::InvalidNamespace(NamespaceError {
                namespace: "A".into(),
                reason: "may only contain [a-z0-9._-]",
            })),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&ExecutorError::Backend("engine down".into())),
            StatusCode::BAD_GATEWAY
        );
    }
}
