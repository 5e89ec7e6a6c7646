use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::run::{Namespace, RunId, RunStatus};

/// Metadata envelope attached to every run event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    /// Shared by every event of one dispatch.
    pub correlation_id: Uuid,
    /// Unique per event, so consumers can drop redeliveries.
    pub idempotency_key: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(run_id: RunId, correlation_id: Option<Uuid>, idempotency_key: impl Into<String>) -> Self {
        Self {
            version: 1,
            correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            idempotency_key: idempotency_key.into(),
            run_id,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunEvent {
    pub meta: EventMeta,
    pub payload: RunEventPayload,
}

/// Lifecycle transitions of a dispatched run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum RunEventPayload {
    /// A scoped credential was vended for the run. Never carries the secret.
    CredentialsIssued {
        namespace: Namespace,
        expires_at: DateTime<Utc>,
    },
    /// The backend accepted the submission.
    Submitted { backend: String },
    /// Observed status advanced.
    StatusChanged {
        from: RunStatus,
        to: RunStatus,
        message: Option<String>,
    },
    /// A cancel was sent to the backend.
    CancelRequested { acknowledged: bool },
    /// The run reached a terminal status.
    Finished {
        status: RunStatus,
        message: Option<String>,
    },
}

impl RunEventPayload {
    pub fn name(&self) -> &'static str {
        match self {
            RunEventPayload::CredentialsIssued { .. } => "credentials_issued",
            RunEventPayload::Submitted { .. } => "submitted",
            RunEventPayload::StatusChanged { .. } => "status_changed",
            RunEventPayload::CancelRequested { .. } => "cancel_requested",
            RunEventPayload::Finished { .. } => "finished",
        }
    }
}

/// In-process fan-out bus for [`RunEvent`]s.
///
/// Publishing never waits: a subscriber that falls behind the buffer gets
/// `RecvError::Lagged` and the publisher carries on.
#[derive(Clone)]
pub struct RunEventBus {
    sender: broadcast::Sender<RunEvent>,
    capacity: usize,
}

impl std::fmt::Debug for RunEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for RunEventBus {
    fn default() -> Self {
        Self::new(1_024)
    }
}

impl RunEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Broadcast `event`. Dropped silently when nobody is subscribed.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}
