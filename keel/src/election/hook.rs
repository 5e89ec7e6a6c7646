use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::task::JoinHandle;

use super::shutdown::ShutdownToken;
use crate::lock::LockId;

/// Handed to [`ElectedHook::on_elected`] at the start of a leadership tenure.
#[derive(Clone, Debug)]
pub struct ElectedContext {
    pub lock_id: LockId,
    pub elected_at: DateTime<Utc>,
    /// Cancelled when this tenure ends, whether by shutdown or by losing the lock.
    pub shutdown: ShutdownToken,
}

/// Stops whatever an [`ElectedHook`] started.
///
/// The elector calls `stop` exactly once per tenure and waits for it to
/// return before reporting itself as a follower.
#[async_trait]
pub trait StopHandle: Send {
    async fn stop(&mut self);
}

/// Starts leader-only background work.
///
/// Invoked at most once per continuous leadership tenure.
#[async_trait]
pub trait ElectedHook: Send + Sync {
    async fn on_elected(&self, ctx: ElectedContext) -> Box<dyn StopHandle>;
}

/// A long-running task that only the leader replica may run (scheduler,
/// reaper, trigger evaluator).
#[async_trait]
pub trait BackgroundWorker: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Run until `shutdown` is cancelled.
    async fn run(&self, shutdown: ShutdownToken);
}

/// Default time a stopping tenure waits for each worker.
pub const DEFAULT_WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// [`ElectedHook`] that spawns a fixed set of [`BackgroundWorker`]s on election
/// and joins them on stop.
pub struct WorkerSetHook {
    workers: Vec<Arc<dyn BackgroundWorker>>,
    join_timeout: Duration,
}

impl fmt::Debug for WorkerSetHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.workers.iter().map(|w| w.name()).collect();
        f.debug_struct("WorkerSetHook")
            .field("workers", &names)
            .field("join_timeout", &self.join_timeout)
            .finish()
    }
}

impl WorkerSetHook {
    pub fn new() -> Self {
        Self {
            workers: Vec::new(),
            join_timeout: DEFAULT_WORKER_JOIN_TIMEOUT,
        }
    }

    /// Add a worker to start on every election.
    pub fn with_worker(mut self, worker: Arc<dyn BackgroundWorker>) -> Self {
        self.workers.push(worker);
        self
    }

    /// Set how long stop waits for each worker before aborting it.
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }
}

impl Default for WorkerSetHook {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ElectedHook for WorkerSetHook {
    async fn on_elected(&self, ctx: ElectedContext) -> Box<dyn StopHandle> {
        let mut handles = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            let worker = Arc::clone(worker);
            let shutdown = ctx.shutdown.clone();
            let name = worker.name().to_string();
            tracing::info!(worker = %name, lock_id = %ctx.lock_id, "starting leader worker");
            let handle = tokio::spawn(async move { worker.run(shutdown).await });
            handles.push((name, handle));
        }

        Box::new(WorkerSetStop {
            shutdown: ctx.shutdown,
            handles,
            join_timeout: self.join_timeout,
        })
    }
}

struct WorkerSetStop {
    shutdown: ShutdownToken,
    handles: Vec<(String, JoinHandle<()>)>,
    join_timeout: Duration,
}

#[async_trait]
impl StopHandle for WorkerSetStop {
    async fn stop(&mut self) {
        self.shutdown.cancel();

        for (name, mut handle) in std::mem::take(&mut self.handles) {
            match tokio::time::timeout(self.join_timeout, &mut handle).await {
                Ok(Ok(())) => tracing::info!(worker = %name, "leader worker stopped"),
                Ok(Err(e)) => tracing::warn!(worker = %name, "leader worker failed: {:?}", e),
                Err(_) => {
                    tracing::warn!(worker = %name, "leader worker timed out during stop, aborting");
                    handle.abort();
                }
            }
        }
    }
}

type Tick = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Worker that runs a fallible tick on a fixed interval, logging failures.
pub struct IntervalWorker {
    name: String,
    interval: Duration,
    tick: Tick,
}

impl IntervalWorker {
    pub fn new<F>(name: impl Into<String>, interval: Duration, tick: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            interval,
            tick: Box::new(tick),
        }
    }
}

impl fmt::Debug for IntervalWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntervalWorker")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .finish()
    }
}

#[async_trait]
impl BackgroundWorker for IntervalWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, shutdown: ShutdownToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(worker = %self.name, "worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(err) = (self.tick)().await {
                        tracing::warn!(worker = %self.name, "worker tick failed: {err:#}");
                    }
                }
            }
        }
    }
}
