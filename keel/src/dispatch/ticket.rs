use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::election::ShutdownToken;
use crate::error::ExecutorError;
use crate::executor::ExecutorBackend;
use crate::run::{LogCursor, RunId, RunStatus};

/// Latest known state of a dispatched run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub status: RunStatus,
    pub message: Option<String>,
}

impl RunProgress {
    pub(crate) fn pending() -> Self {
        Self {
            status: RunStatus::Pending,
            message: None,
        }
    }
}

/// Final result of a dispatched run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    pub message: Option<String>,
    /// Name of the backend the run was routed to, if any.
    pub backend: Option<String>,
}

/// Caller's handle on one dispatched run.
#[derive(Debug)]
pub struct RunTicket {
    pub(crate) run_id: RunId,
    pub(crate) backend: Option<Arc<dyn ExecutorBackend>>,
    pub(crate) progress: watch::Receiver<RunProgress>,
    pub(crate) cancel: ShutdownToken,
    pub(crate) task: JoinHandle<RunOutcome>,
    pub(crate) log_poll_interval: Duration,
}

impl RunTicket {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn status(&self) -> RunStatus {
        self.progress.borrow().status
    }

    pub fn progress(&self) -> RunProgress {
        self.progress.borrow().clone()
    }

    /// Receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<RunProgress> {
        self.progress.clone()
    }

    /// Ask the run to stop. The run keeps being polled until the backend
    /// reports a terminal status.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Follow the run's log from the start.
    pub fn logs(&self) -> LogFollower {
        LogFollower {
            run_id: self.run_id,
            backend: self.backend.clone(),
            progress: self.progress.clone(),
            cursor: LogCursor::START,
            interval: self.log_poll_interval,
        }
    }

    /// Wait for the run to reach a terminal status.
    pub async fn wait(self) -> RunOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(run_id = %self.run_id, "dispatch task failed: {err}");
                RunOutcome {
                    run_id: self.run_id,
                    status: RunStatus::Failed,
                    message: Some(format!("dispatch task failed: {err}")),
                    backend: self.backend.as_ref().map(|b| b.name().to_string()),
                }
            }
        }
    }
}

/// Polls a run's log and hands out each line exactly once.
///
/// Finishes after the run is terminal and one more poll returns nothing.
#[derive(Debug)]
pub struct LogFollower {
    run_id: RunId,
    backend: Option<Arc<dyn ExecutorBackend>>,
    progress: watch::Receiver<RunProgress>,
    cursor: LogCursor,
    interval: Duration,
}

impl LogFollower {
    pub fn cursor(&self) -> LogCursor {
        self.cursor
    }

    /// Resume from `cursor` instead of the start.
    pub fn from_cursor(mut self, cursor: LogCursor) -> Self {
        self.cursor = cursor;
        self
    }

    /// Next non-empty batch of lines, or `None` once the log is complete.
    pub async fn next_batch(&mut self) -> Option<Vec<String>> {
        let backend = self.backend.clone()?;
        loop {
            let status = self.progress.borrow().status;
            let terminal = status.is_terminal();

            if status != RunStatus::Pending || terminal {
                match backend.stream_logs(self.run_id, self.cursor).await {
                    Ok(chunk) if !chunk.lines.is_empty() => {
                        self.cursor = self.cursor.max(chunk.next_cursor);
                        return Some(chunk.lines);
                    }
                    Ok(_) if terminal => return None,
                    Ok(_) => {}
                    Err(ExecutorError::NotFound(_)) if terminal => return None,
                    Err(err) if terminal => {
                        tracing::warn!(run_id = %self.run_id, "final log poll failed: {err}");
                        return None;
                    }
                    Err(err) => {
                        tracing::debug!(run_id = %self.run_id, "log poll failed: {err}");
                    }
                }
            }

            self.wait_for_more().await;
        }
    }

    async fn wait_for_more(&mut self) {
        tokio::select! {
            changed = self.progress.changed() => {
                if changed.is_err() {
                    // The dispatch task is gone; its last status is already visible.
                    tokio::time::sleep(self.interval).await;
                }
            }
            _ = tokio::time::sleep(self.interval) => {}
        }
    }

    /// Stream of individual log lines.
    pub fn into_stream(self) -> impl Stream<Item = String> + Send {
        stream::unfold(self, |mut follower| async move {
            follower
                .next_batch()
                .await
                .map(|lines| (stream::iter(lines), follower))
        })
        .flatten()
    }
}
