use std::path::PathBuf;

use thiserror::Error;

use crate::run::RunId;

/// A namespace string that cannot scope credentials or runs.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid namespace {namespace:?}: {reason}")]
pub struct NamespaceError {
    pub namespace: String,
    pub reason: &'static str,
}

/// Misconfiguration detected while building a channel or loading config.
///
/// These are never retried: a bad certificate does not get better by
/// waiting, and falling back to cleartext would hide the mistake.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CA bundle {path} is not usable: {reason}")]
    InvalidCaBundle { path: PathBuf, reason: String },

    #[error("client identity could not be loaded: {reason}")]
    InvalidIdentity { reason: String },

    #[error("mutual TLS needs both CLIENT_CERT_PATH and CLIENT_KEY_PATH, only {present} is set")]
    IncompleteIdentity { present: &'static str },

    #[error("endpoint {endpoint} does not match the {transport} transport")]
    SchemeMismatch {
        endpoint: String,
        transport: &'static str,
    },

    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("environment variable {name} has invalid value {value:?}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Failure to obtain a scoped credential for a run.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error(transparent)]
    InvalidNamespace(#[from] NamespaceError),

    #[error(transparent)]
    Channel(#[from] ConfigurationError),

    #[error("credential request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("identity provider rejected the request with {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("identity provider response could not be decoded: {0}")]
    Decode(String),

    #[error("credential is scoped to {actual:?}, expected {expected:?}")]
    ScopeMismatch { expected: String, actual: String },

    #[error("credential for namespace {namespace} expired at {expires_at}")]
    Expired {
        namespace: String,
        expires_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("credential request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Errors surfaced by an executor backend.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The executor does not know this run, e.g. after it restarted and lost
    /// its in-memory task table.
    #[error("run {0} is not known to this executor")]
    NotFound(RunId),

    #[error(transparent)]
    InvalidNamespace(#[from] NamespaceError),

    #[error("credential scoped to {actual:?} cannot be used for namespace {namespace} (expected {expected:?})")]
    CredentialScope {
        namespace: String,
        expected: String,
        actual: String,
    },

    #[error("credential for run {0} has expired")]
    CredentialExpired(RunId),

    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl ExecutorError {
    /// Whether a retry may succeed: the executor was unreachable or failed
    /// internally, and the failure says nothing about the run itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutorError::Transport(_) | ExecutorError::Backend(_))
    }
}

impl From<reqwest::Error> for ExecutorError {
    fn from(err: reqwest::Error) -> Self {
        ExecutorError::Transport(err.to_string())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ElectionError {
    #[error("election loop for lock {0} is already running")]
    AlreadyStarted(i64),
}

/// No executor backend could be selected for a run.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no executor backend named {0:?} is registered")]
    UnknownBackend(String),

    #[error("no executor backend is registered")]
    NoBackend,
}
