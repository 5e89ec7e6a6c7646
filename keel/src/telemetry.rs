//! Tracing and telemetry instrumentation for keel.
//!
//! Helper functions for creating tracing spans and recording metrics during
//! elections and run dispatch. All functions work both with and without the
//! `metrics` feature flag.
//!
//! # Example
//!
//! ```ignore
//! use keel::telemetry::{run_dispatch_span, record_run_finished};
//!
//! let span = run_dispatch_span(run_id, namespace, "local");
//! let _enter = span.enter();
//! // ... drive the run
//! record_run_finished("local", RunStatus::Succeeded, started);
//! ```

use std::fmt::Display;
use std::time::Instant;

use tracing::{info_span, Span};

use crate::lock::{LeadershipState, LockId};
use crate::run::RunStatus;

/// Create a tracing span for a single leader-lock acquisition attempt.
#[must_use]
pub fn election_attempt_span(lock_id: LockId) -> Span {
    info_span!("keel.election.attempt", lock_id = %lock_id)
}

/// Create a tracing span covering one run from credential fetch to terminal status.
#[must_use]
pub fn run_dispatch_span(run_id: impl Display, namespace: impl Display, backend: &str) -> Span {
    info_span!(
        "keel.dispatch",
        run_id = %run_id,
        namespace = %namespace,
        backend = %backend,
    )
}

/// Create a tracing span for a credential vending request.
#[must_use]
pub fn credential_span(principal: &str, namespace: impl Display) -> Span {
    info_span!(
        "keel.credentials",
        principal = %principal,
        namespace = %namespace,
    )
}

/// Create a tracing span for one executor protocol call.
#[must_use]
pub fn executor_span(operation: &'static str, run_id: impl Display) -> Span {
    info_span!(
        "keel.executor",
        operation = operation,
        run_id = %run_id,
    )
}

/// Record the outcome of an acquisition attempt.
///
/// `outcome` is one of `acquired`, `held_elsewhere`, `error`, `timeout`.
pub fn record_election_attempt(lock_id: LockId, outcome: &str) {
    tracing::trace!(lock_id = %lock_id, outcome = outcome, "election attempt");

    #[cfg(feature = "metrics")]
    crate::metrics::record_election_attempt(&lock_id.to_string(), outcome);
}

/// Record a change of leadership role.
pub fn record_leadership_transition(lock_id: LockId, to: LeadershipState) {
    tracing::info!(lock_id = %lock_id, state = %to, "leadership transition");

    #[cfg(feature = "metrics")]
    crate::metrics::record_leadership_transition(&lock_id.to_string(), to.as_str());
}

/// Record a run handed to a backend.
pub fn record_run_dispatched(backend: &str, namespace: impl Display) {
    tracing::info!(backend = backend, namespace = %namespace, "run dispatched");

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_dispatched(backend);
}

/// Record a credential vending failure.
pub fn record_credential_failure(namespace: impl Display, error: impl Display) {
    tracing::warn!(namespace = %namespace, error = %error, "credential vending failed");

    #[cfg(feature = "metrics")]
    crate::metrics::record_credential_failure();
}

/// Record a run reaching a terminal status.
pub fn record_run_finished(backend: &str, status: RunStatus, started: Instant) {
    let duration_secs = started.elapsed().as_secs_f64();
    tracing::info!(
        backend = backend,
        status = %status,
        duration_secs = duration_secs,
        "run finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_finished(backend, status.as_str(), duration_secs);
}
