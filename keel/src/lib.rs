//! Keel - leader election and executor dispatch for pipeline control planes.
//!
//! A fleet of stateless control-plane replicas uses keel to make sure exactly
//! one of them runs the background schedulers and reapers, and to hand each
//! pipeline run to an interchangeable execution backend with a credential
//! scoped to that run's namespace.
//!
//! # Core Concepts
//!
//! - **Election**: [`LeaderElector`] retries a [`LockAcquirer`] on a fixed
//!   interval and, once it holds the lock, starts leader-only work through an
//!   [`ElectedHook`]. Losing the lock or shutting down stops that work before
//!   the replica reports itself as a follower.
//!
//! - **Channels**: [`SecureChannelFactory`] builds the HTTP/2 client used to
//!   reach credential and executor services, cleartext or (m)TLS.
//!
//! - **Credentials**: a [`CredentialBroker`] vends a short-lived
//!   [`Credential`] limited to `<namespace>/*` for every run.
//!
//! - **Executors**: [`ExecutorBackend`] is the submit/status/logs/cancel
//!   protocol. [`LocalExecutor`] drives containers, [`CloudExecutor`] drives
//!   serverless tasks and [`RemoteExecutor`] reaches either one in another
//!   process.
//!
//! - **Dispatch**: [`RunDispatcher`] takes a run from credential vending to a
//!   terminal [`RunStatus`], exposing progress, logs and cancellation through
//!   a [`RunTicket`].
//!
//! # Feature Flags
//!
//! - `postgres` - advisory-lock [`LockAcquirer`] via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use keel::*;
//!
//! let elector = LeaderElectorBuilder::new(ElectionConfig::from_env()?)
//!     .with_acquirer(Arc::new(PgAdvisoryLock::connect(&db).await?))
//!     .with_hook(Arc::new(WorkerSetHook::new().with_worker(scheduler)))
//!     .build()?;
//! elector.start(shutdown.clone())?;
//! ```

/// Outbound HTTP/2 channels with optional (m)TLS.
pub mod channel;

/// Configuration structures and environment loading.
pub mod config;

/// Scoped credential vending.
pub mod credentials;

/// Per-run orchestration: [`RunDispatcher`], [`ExecutorRouter`], [`RunTicket`].
pub mod dispatch;

/// Single-leader election.
///
/// The `election` module provides:
/// - [`LeaderElector`] - the retry loop gating leader-only work
/// - [`LockAcquirer`] - seam to the distributed mutual-exclusion primitive
/// - [`ElectedHook`] and [`StopHandle`] - start and stop leader-only work
/// - [`WorkerSetHook`] - runs a fixed set of [`BackgroundWorker`]s per tenure
/// - [`ShutdownToken`] - cooperative cancellation
pub mod election;

/// Error types for configuration, credentials, executors and election.
pub mod error;

/// Run lifecycle events and the in-process event bus.
pub mod events;

/// Executor protocol and backends.
pub mod executor;

/// Lock identifiers and leadership state.
pub mod lock;

pub mod metrics;

#[cfg(feature = "postgres")]
/// PostgreSQL advisory-lock acquirer.
pub mod persistence;

/// Run identifiers, namespaces and statuses.
pub mod run;

/// Tracing spans and metric recording helpers.
pub mod telemetry;

pub use channel::{SecureChannel, SecureChannelFactory, Transport};
pub use config::*;
pub use credentials::{Credential, CredentialBroker, HttpCredentialBroker, scoped_policy};
pub use dispatch::{
    ExecutorRouter, LogFollower, Route, RunDispatcher, RunOutcome, RunProgress, RunRequest,
    RunTicket,
};
pub use election::*;
pub use error::*;
pub use events::*;
pub use executor::{
    CloudExecutor, ContainerRuntime, ExecutorBackend, LocalExecutor, RemoteExecutor, TaskService,
};
pub use lock::*;
#[cfg(feature = "postgres")]
pub use persistence::PgAdvisoryLock;
pub use run::*;
