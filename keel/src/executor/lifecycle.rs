//! Run lifecycle shared by the in-process backends.
//!
//! Local and cloud executors differ only in how they launch, observe, read
//! logs from and stop a compute unit. Everything else (credential admission,
//! idempotent submit, status caching, cancel bookkeeping) lives here.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::Instrument;

use super::protocol::{CancelResponse, LogChunk, RunStatusResponse, SubmitRequest, SubmitResponse};
use super::table::{Reservation, TaskEntry, TaskTable};
use super::{admit, run_environment};
use crate::error::ExecutorError;
use crate::run::{LogCursor, RunId};
use crate::telemetry::executor_span;

/// Backend-specific half of an in-process executor.
///
/// Clones share the same table and backend client; a launch runs on a clone
/// so it finishes even when the submitting caller goes away.
#[async_trait]
pub(crate) trait Driver: Clone + Send + Sync + 'static {
    fn table(&self) -> &TaskTable;

    /// How long finished runs stay in the table.
    fn finished_retention(&self) -> Duration;

    /// Start a compute unit and return its backend reference.
    async fn launch(
        &self,
        request: &SubmitRequest,
        env: BTreeMap<String, String>,
    ) -> anyhow::Result<String>;

    /// Translate the unit's current native state.
    async fn observe(&self, entry: &TaskEntry) -> anyhow::Result<RunStatusResponse>;

    async fn read_logs(&self, task_ref: &str, from_line: usize) -> anyhow::Result<Vec<String>>;

    async fn terminate(&self, task_ref: &str) -> anyhow::Result<()>;
}

fn backend_error(err: anyhow::Error) -> ExecutorError {
    ExecutorError::Backend(format!("{err:#}"))
}

/// Releases a reservation unless the launch completed.
struct ReservationGuard<'a> {
    table: &'a TaskTable,
    run_id: RunId,
    armed: bool,
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.table.release(self.run_id);
        }
    }
}

pub(crate) async fn submit<D: Driver>(
    driver: &D,
    request: SubmitRequest,
) -> Result<SubmitResponse, ExecutorError> {
    let run_id = request.run_id;
    async move {
        let credential = admit(&request)?;

        let table = driver.table();
        let evicted = table.evict_finished(driver.finished_retention());
        if evicted > 0 {
            tracing::debug!(evicted, "forgot finished runs");
        }
        if table.reserve(run_id) == Reservation::Known {
            tracing::debug!("run already known, not launching again");
            return Ok(SubmitResponse { accepted: true });
        }

        let env = run_environment(&request, credential);
        let launch = tokio::spawn(
            launch_reserved(driver.clone(), request, env).instrument(tracing::Span::current()),
        );
        match launch.await {
            Ok(result) => result,
            Err(err) => Err(ExecutorError::Backend(format!("launch task failed: {err}"))),
        }
    }
    .instrument(executor_span("submit", run_id))
    .await
}

/// Launch a reserved run and record it. Stops the new unit straight away if a
/// cancel arrived while it was starting.
async fn launch_reserved<D: Driver>(
    driver: D,
    request: SubmitRequest,
    env: BTreeMap<String, String>,
) -> Result<SubmitResponse, ExecutorError> {
    let run_id = request.run_id;
    let table = driver.table();
    let mut guard = ReservationGuard {
        table,
        run_id,
        armed: true,
    };
    let task_ref = driver.launch(&request, env).await.map_err(backend_error)?;

    guard.armed = false;
    let entry = table.launch(run_id, request.namespace.clone(), task_ref.clone());
    tracing::info!(task_ref = %task_ref, namespace = %request.namespace, "compute unit launched");

    if entry.cancel_requested {
        match driver.terminate(&task_ref).await {
            Ok(()) => tracing::info!(task_ref = %task_ref, "cancelled while launching, stop requested"),
            Err(err) => {
                table.clear_cancel_requested(run_id);
                tracing::warn!(task_ref = %task_ref, error = %format!("{err:#}"), "stop after launch failed");
            }
        }
    }
    Ok(SubmitResponse { accepted: true })
}

pub(crate) async fn get_run_status<D: Driver>(
    driver: &D,
    run_id: RunId,
) -> Result<RunStatusResponse, ExecutorError> {
    refresh(driver, run_id)
        .instrument(executor_span("get_run_status", run_id))
        .await
}

async fn refresh<D: Driver>(driver: &D, run_id: RunId) -> Result<RunStatusResponse, ExecutorError> {
    let entry = driver.table().get(run_id)?;
    if entry.handle.status.is_terminal() {
        return Ok(RunStatusResponse {
            status: entry.handle.status,
            message: entry.message,
        });
    }

    let observed = driver.observe(&entry).await.map_err(backend_error)?;
    if observed.status != entry.handle.status {
        tracing::debug!(from = %entry.handle.status, to = %observed.status, "status changed");
    }
    driver
        .table()
        .record_status(run_id, observed.status, observed.message.clone());
    Ok(observed)
}

pub(crate) async fn stream_logs<D: Driver>(
    driver: &D,
    run_id: RunId,
    cursor: LogCursor,
) -> Result<LogChunk, ExecutorError> {
    async move {
        let entry = driver.table().get(run_id)?;
        let lines = driver
            .read_logs(&entry.handle.backend_task_ref, cursor.offset())
            .await
            .map_err(backend_error)?;
        let chunk = LogChunk::from_offset(cursor, lines);
        driver.table().record_cursor(run_id, chunk.next_cursor);
        Ok(chunk)
    }
    .instrument(executor_span("stream_logs", run_id))
    .await
}

pub(crate) async fn cancel<D: Driver>(
    driver: &D,
    run_id: RunId,
) -> Result<CancelResponse, ExecutorError> {
    async move {
        if driver.table().cancel_reserved(run_id) {
            tracing::info!("cancel recorded, stop follows the launch");
            return Ok(CancelResponse { acknowledged: true });
        }

        let current = refresh(driver, run_id).await?;
        if current.status.is_terminal() {
            tracing::debug!(status = %current.status, "cancel ignored, run already finished");
            return Ok(CancelResponse {
                acknowledged: false,
            });
        }

        let table = driver.table();
        if !table.mark_cancel_requested(run_id) {
            return Ok(CancelResponse { acknowledged: true });
        }

        let entry = table.get(run_id)?;
        if let Err(err) = driver.terminate(&entry.handle.backend_task_ref).await {
            table.clear_cancel_requested(run_id);
            return Err(backend_error(err));
        }
        tracing::info!(task_ref = %entry.handle.backend_task_ref, "stop requested");
        Ok(CancelResponse { acknowledged: true })
    }
    .instrument(executor_span("cancel", run_id))
    .await
}
