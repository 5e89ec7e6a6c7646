use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NamespaceError;

/// Parameters handed to a pipeline run, forwarded verbatim to the executor.
pub type RunParameters = BTreeMap<String, String>;

const MAX_NAMESPACE_LEN: usize = 63;

/// Unique identifier for one pipeline run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl RunId {
    /// Create a new run ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A logical partition of stored data. Credentials and runs are scoped to
/// exactly one namespace.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace(String);

impl Namespace {
    pub fn parse(value: impl Into<String>) -> Result<Self, NamespaceError> {
        let value = value.into();
        let reject = |reason| {
            Err(NamespaceError {
                namespace: value.clone(),
                reason,
            })
        };

        if value.is_empty() {
            return reject("must not be empty");
        }
        if value.len() > MAX_NAMESPACE_LEN {
            return reject("must be at most 63 bytes");
        }
        if value.starts_with('.') || value.starts_with('-') {
            return reject("must start with a letter, digit or underscore");
        }
        if !value.bytes().all(|b| {
            b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-')
        }) {
            return reject("may only contain [a-z0-9._-]");
        }

        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The only object prefix a credential for this namespace may cover.
    pub fn allowed_prefix(&self) -> String {
        format!("{}/*", self.0)
    }
}

impl Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Namespace {
    type Error = NamespaceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Namespace> for String {
    fn from(value: Namespace) -> Self {
        value.0
    }
}

/// Backend-agnostic run lifecycle state.
///
/// `Pending` only exists inside the dispatcher before a submission has been
/// acknowledged; executors never report it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Submitted,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Position in the lifecycle. Terminal states share the highest rank.
    pub fn rank(&self) -> u8 {
        match self {
            RunStatus::Pending => 0,
            RunStatus::Submitted => 1,
            RunStatus::Running => 2,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled => 3,
        }
    }

    /// Whether moving from `self` to `next` goes forward in the lifecycle.
    pub fn can_advance_to(&self, next: RunStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Submitted => "submitted",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Offset into a run's log. Lines before the cursor have been delivered.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LogCursor(pub u64);

impl LogCursor {
    pub const START: LogCursor = LogCursor(0);

    pub fn advance(self, delivered: usize) -> Self {
        Self(self.0 + delivered as u64)
    }

    pub fn offset(self) -> usize {
        self.0 as usize
    }
}

/// Executor-side record of a submitted run.
///
/// `backend_task_ref` is the executor's opaque reference (container id, task
/// ARN) and only ever lives in that executor's memory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunHandle {
    pub run_id: RunId,
    pub namespace: Namespace,
    pub backend_task_ref: String,
    pub status: RunStatus,
    pub submitted_at: DateTime<Utc>,
    pub log_cursor: LogCursor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_validation() {
        assert!(Namespace::parse("acct-42").is_ok());
        assert!(Namespace::parse("billing.eu_1").is_ok());
        assert!(Namespace::parse("").is_err());
        assert!(Namespace::parse("a/b").is_err());
        assert!(Namespace::parse("acct-*").is_err());
        assert!(Namespace::parse("Upper").is_err());
        assert!(Namespace::parse("-leading").is_err());
        assert!(Namespace::parse("x".repeat(64)).is_err());
    }

    #[test]
    fn test_allowed_prefix() {
        let ns = Namespace::parse("acct-42").unwrap();
        assert_eq!(ns.allowed_prefix(), "acct-42/*");
    }

    #[test]
    fn test_namespace_deserialize_validates() {
        let ok: Namespace = serde_json::from_str("\"billing\"").unwrap();
        assert_eq!(ok.as_str(), "billing");
        assert!(serde_json::from_str::<Namespace>("\"../etc\"").is_err());
    }

    #[test]
    fn test_status_never_regresses() {
        assert!(RunStatus::Pending.can_advance_to(RunStatus::Submitted));
        assert!(RunStatus::Submitted.can_advance_to(RunStatus::Running));
        assert!(RunStatus::Submitted.can_advance_to(RunStatus::Cancelled));
        assert!(!RunStatus::Running.can_advance_to(RunStatus::Submitted));
        assert!(!RunStatus::Running.can_advance_to(RunStatus::Running));
        assert!(!RunStatus::Failed.can_advance_to(RunStatus::Succeeded));
    }

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&RunStatus::Cancelled).unwrap();
        assert_eq!(json, "\"Cancelled\"");
    }

    #[test]
    fn test_run_id_parse() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
