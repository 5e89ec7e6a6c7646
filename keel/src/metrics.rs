//! Prometheus metrics instrumentation for keel.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `keel_election_attempts_total` - Acquisition attempts by outcome
//! - `keel_leadership_transitions_total` - Role changes by target state
//! - `keel_runs_dispatched_total` - Runs handed to a backend
//! - `keel_runs_finished_total` - Runs reaching a terminal status
//! - `keel_credential_failures_total` - Failed credential requests
//!
//! ## Gauges
//! - `keel_is_leader` - 1 while this replica leads the lock, else 0
//!
//! ## Histograms
//! - `keel_run_duration_seconds` - Dispatch-to-terminal duration
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, CounterVec, GaugeVec, HistogramOpts, HistogramVec, IntCounter, Opts,
    Registry,
};
use std::sync::LazyLock;

/// Global Prometheus registry for keel metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `lock_id`, `outcome` (acquired, held_elsewhere, error, timeout).
pub static ELECTION_ATTEMPTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "keel_election_attempts_total",
        "Total number of leader lock acquisition attempts",
    );
    CounterVec::new(opts, &["lock_id", "outcome"])
        .expect("keel_election_attempts_total metric creation failed")
});

/// Labels: `lock_id`, `to` (leader, follower).
pub static LEADERSHIP_TRANSITIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "keel_leadership_transitions_total",
        "Total number of leadership role changes",
    );
    CounterVec::new(opts, &["lock_id", "to"])
        .expect("keel_leadership_transitions_total metric creation failed")
});

/// Labels: `lock_id`.
pub static IS_LEADER: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("keel_is_leader", "1 while this replica holds leadership");
    GaugeVec::new(opts, &["lock_id"]).expect("keel_is_leader metric creation failed")
});

/// Labels: `backend`.
pub static RUNS_DISPATCHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("keel_runs_dispatched_total", "Total number of runs dispatched");
    CounterVec::new(opts, &["backend"]).expect("keel_runs_dispatched_total metric creation failed")
});

/// Labels: `backend`, `status`.
pub static RUNS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "keel_runs_finished_total",
        "Total number of runs that reached a terminal status",
    );
    CounterVec::new(opts, &["backend", "status"])
        .expect("keel_runs_finished_total metric creation failed")
});

pub static CREDENTIAL_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keel_credential_failures_total",
        "Total number of failed credential requests",
    )
    .expect("keel_credential_failures_total metric creation failed")
});

/// Labels: `backend`, `status`.
pub static RUN_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.5, 2.0, 14).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "keel_run_duration_seconds",
        "Run duration from dispatch to terminal status in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["backend", "status"])
        .expect("keel_run_duration_seconds metric creation failed")
});

/// Register all metrics with the global registry.
///
/// Idempotent: duplicate registrations are ignored.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(ELECTION_ATTEMPTS_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(LEADERSHIP_TRANSITIONS_TOTAL.clone()),
        Box::new(IS_LEADER.clone()),
        Box::new(RUNS_DISPATCHED_TOTAL.clone()),
        Box::new(RUNS_FINISHED_TOTAL.clone()),
        Box::new(CREDENTIAL_FAILURES_TOTAL.clone()),
        Box::new(RUN_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_election_attempt(lock_id: &str, outcome: &str) {
    ELECTION_ATTEMPTS_TOTAL
        .with_label_values(&[lock_id, outcome])
        .inc();
}

pub fn record_leadership_transition(lock_id: &str, to: &str) {
    LEADERSHIP_TRANSITIONS_TOTAL
        .with_label_values(&[lock_id, to])
        .inc();
    IS_LEADER
        .with_label_values(&[lock_id])
        .set(if to == "leader" { 1.0 } else { 0.0 });
}

pub fn record_run_dispatched(backend: &str) {
    RUNS_DISPATCHED_TOTAL.with_label_values(&[backend]).inc();
}

pub fn record_credential_failure() {
    CREDENTIAL_FAILURES_TOTAL.inc();
}

pub fn record_run_finished(backend: &str, status: &str, duration_secs: f64) {
    RUNS_FINISHED_TOTAL
        .with_label_values(&[backend, status])
        .inc();
    RUN_DURATION_SECONDS
        .with_label_values(&[backend, status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
