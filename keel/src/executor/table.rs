use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;

use crate::error::ExecutorError;
use crate::run::{LogCursor, Namespace, RunHandle, RunId, RunStatus};

/// Outcome of [`TaskTable::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The caller owns the run id and must either `launch` or `release` it.
    Fresh,
    /// The run id is already reserved or launched; do not launch again.
    Known,
}

/// What the executor remembers about a launched run.
#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub handle: RunHandle,
    pub message: Option<String>,
    pub cancel_requested: bool,
    /// When a terminal status was first recorded.
    pub finished_at: Option<Instant>,
}

#[derive(Debug)]
enum Slot {
    Reserved { cancel_requested: bool },
    Launched(TaskEntry),
}

/// In-memory map from run id to backend task reference.
///
/// Not persisted: after a restart every previously launched run is unknown
/// and callers get [`ExecutorError::NotFound`]. Finished runs are dropped by
/// [`evict_finished`](Self::evict_finished) once their retention lapses.
#[derive(Debug, Default)]
pub struct TaskTable {
    slots: Mutex<HashMap<RunId, Slot>>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `run_id` before launching so concurrent duplicate submits
    /// collapse into one compute unit.
    pub fn reserve(&self, run_id: RunId) -> Reservation {
        let mut slots = self.slots.lock();
        if slots.contains_key(&run_id) {
            return Reservation::Known;
        }
        slots.insert(
            run_id,
            Slot::Reserved {
                cancel_requested: false,
            },
        );
        Reservation::Fresh
    }

    /// Record the backend reference for a reserved run.
    ///
    /// A cancel that arrived while the run was reserved carries over, and the
    /// caller is expected to stop the fresh compute unit when it is set.
    pub fn launch(&self, run_id: RunId, namespace: Namespace, task_ref: String) -> TaskEntry {
        let mut slots = self.slots.lock();
        let cancel_requested = matches!(
            slots.get(&run_id),
            Some(Slot::Reserved {
                cancel_requested: true
            })
        );
        let entry = TaskEntry {
            handle: RunHandle {
                run_id,
                namespace,
                backend_task_ref: task_ref,
                status: RunStatus::Submitted,
                submitted_at: Utc::now(),
                log_cursor: LogCursor::START,
            },
            message: None,
            cancel_requested,
            finished_at: None,
        };
        slots.insert(run_id, Slot::Launched(entry.clone()));
        entry
    }

    /// Drop a reservation whose launch failed so the run can be resubmitted.
    pub fn release(&self, run_id: RunId) {
        let mut slots = self.slots.lock();
        if matches!(slots.get(&run_id), Some(Slot::Reserved { .. })) {
            slots.remove(&run_id);
        }
    }

    /// Snapshot of a launched run. Reserved-but-unlaunched runs are not found.
    pub fn get(&self, run_id: RunId) -> Result<TaskEntry, ExecutorError> {
        match self.slots.lock().get(&run_id) {
            Some(Slot::Launched(entry)) => Ok(entry.clone()),
            _ => Err(ExecutorError::NotFound(run_id)),
        }
    }

    /// Store the latest observed status.
    pub fn record_status(&self, run_id: RunId, status: RunStatus, message: Option<String>) {
        if let Some(Slot::Launched(entry)) = self.slots.lock().get_mut(&run_id) {
            entry.handle.status = status;
            entry.message = message;
            if status.is_terminal() && entry.finished_at.is_none() {
                entry.finished_at = Some(Instant::now());
            }
        }
    }

    pub fn record_cursor(&self, run_id: RunId, cursor: LogCursor) {
        if let Some(Slot::Launched(entry)) = self.slots.lock().get_mut(&run_id) {
            entry.handle.log_cursor = entry.handle.log_cursor.max(cursor);
        }
    }

    /// Flag a cancel for a run that is still launching. Returns `false` when
    /// the run is not in the reserved state.
    pub fn cancel_reserved(&self, run_id: RunId) -> bool {
        match self.slots.lock().get_mut(&run_id) {
            Some(Slot::Reserved { cancel_requested }) => {
                *cancel_requested = true;
                true
            }
            _ => false,
        }
    }

    /// Flag a cancel request. Returns `false` when one was already recorded.
    pub fn mark_cancel_requested(&self, run_id: RunId) -> bool {
        match self.slots.lock().get_mut(&run_id) {
            Some(Slot::Launched(entry)) if !entry.cancel_requested => {
                entry.cancel_requested = true;
                true
            }
            _ => false,
        }
    }

    /// Undo [`mark_cancel_requested`](Self::mark_cancel_requested) after the
    /// stop call failed, so a later cancel tries again.
    pub fn clear_cancel_requested(&self, run_id: RunId) {
        if let Some(Slot::Launched(entry)) = self.slots.lock().get_mut(&run_id) {
            entry.cancel_requested = false;
        }
    }

    /// Forget runs that finished at least `retention` ago. Returns how many
    /// were dropped.
    pub fn evict_finished(&self, retention: Duration) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Launched(TaskEntry {
                finished_at: Some(at),
                ..
            }) => at.elapsed() < retention,
            _ => true,
        });
        before - slots.len()
    }

    /// Number of reserved or launched runs.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
