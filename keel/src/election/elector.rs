use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::hook::{ElectedContext, ElectedHook, StopHandle};
use super::shutdown::ShutdownToken;
use crate::config::ElectionConfig;
use crate::error::ElectionError;
use crate::lock::{LeadershipState, LockId};
use crate::telemetry;

/// Backend for the mutual-exclusion resource.
///
/// `try_acquire` must not block waiting for the lock: it answers whether this
/// replica holds the lock right now. Holding must be session-scoped so the
/// store releases the lock when the holder's connection dies.
#[async_trait]
pub trait LockAcquirer: Send + Sync {
    /// Attempt to take (or confirm) the lock. `Ok(false)` means another
    /// replica holds it.
    async fn try_acquire(&self, lock: LockId) -> anyhow::Result<bool>;

    /// Give the lock up. Called once when the election loop exits.
    async fn release(&self, _lock: LockId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Adapts an async closure into a [`LockAcquirer`].
pub struct FnAcquirer<F> {
    acquire: F,
}

impl<F> FnAcquirer<F> {
    pub fn new(acquire: F) -> Self {
        Self { acquire }
    }
}

impl<F> fmt::Debug for FnAcquirer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAcquirer")
            .field("acquire", &type_name::<F>())
            .finish()
    }
}

#[async_trait]
impl<F, Fut> LockAcquirer for FnAcquirer<F>
where
    F: Fn(LockId) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<bool>> + Send,
{
    async fn try_acquire(&self, lock: LockId) -> anyhow::Result<bool> {
        (self.acquire)(lock).await
    }
}

struct Tenure {
    shutdown: ShutdownToken,
    stop: Option<Box<dyn StopHandle>>,
}

struct Guarded {
    state: LeadershipState,
    tenure: Option<Tenure>,
}

/// Leadership flag plus the current tenure's stop handle, behind one guard.
///
/// Only exposes snapshots and compare-and-set style transitions.
pub(crate) struct LeadershipCell {
    inner: parking_lot::Mutex<Guarded>,
}

impl LeadershipCell {
    pub(crate) fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(Guarded {
                state: LeadershipState::Follower,
                tenure: None,
            }),
        }
    }

    pub(crate) fn snapshot(&self) -> LeadershipState {
        self.inner.lock().state
    }

    /// Follower -> Leader. Returns false if already leader.
    fn promote(&self, shutdown: ShutdownToken) -> bool {
        let mut guard = self.inner.lock();
        if guard.state.is_leader() {
            return false;
        }
        guard.state = LeadershipState::Leader;
        guard.tenure = Some(Tenure {
            shutdown,
            stop: None,
        });
        true
    }

    fn install_stop(&self, stop: Box<dyn StopHandle>) {
        let mut guard = self.inner.lock();
        if let Some(tenure) = guard.tenure.as_mut() {
            tenure.stop = Some(stop);
        }
    }

    /// Take the tenure out while still reporting Leader, so the stop handle
    /// can run before anyone observes the replica as a follower.
    fn take_tenure(&self) -> Option<Tenure> {
        let mut guard = self.inner.lock();
        if !guard.state.is_leader() {
            return None;
        }
        guard.tenure.take()
    }

    fn demote(&self) {
        let mut guard = self.inner.lock();
        guard.state = LeadershipState::Follower;
        guard.tenure = None;
    }
}

struct ElectionSession {
    shutdown: ShutdownToken,
    handle: JoinHandle<()>,
}

/// Runs a single-leader election for one lock and gates leader-only work.
///
/// One background task per elector performs acquisition attempts, strictly
/// one at a time: immediately on start, then every `retry_interval`. Failures
/// are logged and retried forever at that interval.
pub struct LeaderElector<A, H>
where
    A: LockAcquirer + 'static,
    H: ElectedHook + 'static,
{
    config: ElectionConfig,
    acquirer: Arc<A>,
    hook: Arc<H>,
    cell: Arc<LeadershipCell>,
    session: parking_lot::Mutex<Option<ElectionSession>>,
}

impl<A, H> fmt::Debug for LeaderElector<A, H>
where
    A: LockAcquirer + 'static,
    H: ElectedHook + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderElector")
            .field("config", &self.config)
            .field("acquirer_type", &type_name::<A>())
            .field("hook_type", &type_name::<H>())
            .field("state", &self.cell.snapshot())
            .field("running", &self.session.lock().is_some())
            .finish()
    }
}

impl<A, H> LeaderElector<A, H>
where
    A: LockAcquirer + 'static,
    H: ElectedHook + 'static,
{
    pub fn new(config: ElectionConfig, acquirer: Arc<A>, hook: Arc<H>) -> Self {
        Self {
            config,
            acquirer,
            hook,
            cell: Arc::new(LeadershipCell::new()),
            session: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    pub fn lock_id(&self) -> LockId {
        self.config.lock_id
    }

    /// Snapshot of the current leadership state.
    pub fn is_leader(&self) -> bool {
        self.cell.snapshot().is_leader()
    }

    pub fn state(&self) -> LeadershipState {
        self.cell.snapshot()
    }

    /// Start the election loop. The loop exits when `token` or [`stop`] cancels it.
    ///
    /// [`stop`]: LeaderElector::stop
    pub fn start(&self, token: ShutdownToken) -> Result<(), ElectionError> {
        let mut session = self.session.lock();
        if session.is_some() {
            return Err(ElectionError::AlreadyStarted(self.config.lock_id.value()));
        }

        let stop_token = ShutdownToken::new();
        let handle = tokio::spawn(Self::election_loop(
            self.config.clone(),
            Arc::clone(&self.acquirer),
            Arc::clone(&self.hook),
            Arc::clone(&self.cell),
            token,
            stop_token.clone(),
        ));

        tracing::info!(lock_id = %self.config.lock_id, "leader election started");
        *session = Some(ElectionSession {
            shutdown: stop_token,
            handle,
        });
        Ok(())
    }

    /// Cancel the loop and wait until it has exited and any leadership has
    /// been handed back. A no-op if the elector was never started.
    pub async fn stop(&self) {
        let session = self.session.lock().take();
        let Some(session) = session else {
            return;
        };

        session.shutdown.cancel();
        if let Err(e) = session.handle.await {
            tracing::warn!(lock_id = %self.config.lock_id, "election loop failed: {:?}", e);
            // The loop died before relinquishing; make sure workers still stop.
            Self::relinquish(self.config.lock_id, &self.cell).await;
        }
        tracing::info!(lock_id = %self.config.lock_id, "leader election stopped");
    }

    async fn election_loop(
        config: ElectionConfig,
        acquirer: Arc<A>,
        hook: Arc<H>,
        cell: Arc<LeadershipCell>,
        external: ShutdownToken,
        stop: ShutdownToken,
    ) {
        let lock_id = config.lock_id;
        let mut ticker = tokio::time::interval(config.retry_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = external.cancelled() => break,
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            Self::attempt(&config, acquirer.as_ref(), hook.as_ref(), &cell).await;
        }

        Self::relinquish(lock_id, &cell).await;

        match tokio::time::timeout(config.attempt_timeout(), acquirer.release(lock_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(%lock_id, "failed to release leader lock: {err:#}"),
            Err(_) => tracing::warn!(%lock_id, "timed out releasing leader lock"),
        }
    }

    async fn attempt(config: &ElectionConfig, acquirer: &A, hook: &H, cell: &LeadershipCell) {
        let lock_id = config.lock_id;
        let span = telemetry::election_attempt_span(lock_id);
        let result = tokio::time::timeout(config.attempt_timeout(), acquirer.try_acquire(lock_id))
            .instrument(span)
            .await;

        match result {
            Err(_) => {
                telemetry::record_election_attempt(lock_id, "timeout");
                tracing::warn!(
                    %lock_id,
                    timeout_ms = config.attempt_timeout_ms,
                    "leader lock attempt timed out, retrying next interval"
                );
            }
            Ok(Err(err)) => {
                telemetry::record_election_attempt(lock_id, "error");
                tracing::warn!(%lock_id, "leader lock attempt failed, retrying next interval: {err:#}");
            }
            Ok(Ok(true)) => {
                telemetry::record_election_attempt(lock_id, "acquired");
                let shutdown = ShutdownToken::new();
                if !cell.promote(shutdown.clone()) {
                    tracing::trace!(%lock_id, "leader lock still held");
                    return;
                }

                tracing::info!(%lock_id, "acquired leadership, starting leader workers");
                telemetry::record_leadership_transition(lock_id, LeadershipState::Leader);
                let stop = hook
                    .on_elected(ElectedContext {
                        lock_id,
                        elected_at: Utc::now(),
                        shutdown,
                    })
                    .await;
                cell.install_stop(stop);
            }
            Ok(Ok(false)) => {
                telemetry::record_election_attempt(lock_id, "held_elsewhere");
                if cell.snapshot().is_leader() {
                    tracing::warn!(%lock_id, "leader lock lost to another replica");
                    Self::relinquish(lock_id, cell).await;
                } else {
                    tracing::debug!(%lock_id, "leader lock held by another replica");
                }
            }
        }
    }

    async fn relinquish(lock_id: LockId, cell: &LeadershipCell) {
        let Some(tenure) = cell.take_tenure() else {
            return;
        };

        tracing::info!(%lock_id, "stopping leader workers");
        tenure.shutdown.cancel();
        if let Some(mut stop) = tenure.stop {
            if AssertUnwindSafe(stop.stop()).catch_unwind().await.is_err() {
                tracing::error!(%lock_id, "leader stop handle panicked");
            }
        }
        cell.demote();
        telemetry::record_leadership_transition(lock_id, LeadershipState::Follower);
        tracing::info!(%lock_id, "relinquished leadership");
    }
}

impl<A, H> Drop for LeaderElector<A, H>
where
    A: LockAcquirer + 'static,
    H: ElectedHook + 'static,
{
    fn drop(&mut self) {
        // Cannot await here; signal the loop so it winds down on its own.
        if let Some(session) = self.session.get_mut().as_ref() {
            session.shutdown.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Default)]
    struct Counters {
        elected: AtomicUsize,
        stopped: AtomicUsize,
    }

    struct CountingHook(Arc<Counters>);

    struct CountingStop(Arc<Counters>);

    #[async_trait]
    impl StopHandle for CountingStop {
        async fn stop(&mut self) {
            self.0.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ElectedHook for CountingHook {
        async fn on_elected(&self, _ctx: ElectedContext) -> Box<dyn StopHandle> {
            self.0.elected.fetch_add(1, Ordering::SeqCst);
            Box::new(CountingStop(Arc::clone(&self.0)))
        }
    }

    fn config() -> ElectionConfig {
        ElectionConfig::new(LockId(7_526_700_533_049))
            .with_retry_interval(10)
            .with_attempt_timeout(1_000)
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let counters = Arc::new(Counters::default());
        let elector = LeaderElector::new(
            config(),
            Arc::new(FnAcquirer::new(|_| async { Ok::<_, anyhow::Error>(true) })),
            Arc::new(CountingHook(Arc::clone(&counters))),
        );

        timeout(Duration::from_secs(1), elector.stop())
            .await
            .expect("stop before start must not block");
        assert!(!elector.is_leader());
        assert_eq!(counters.elected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let elector = LeaderElector::new(
            config(),
            Arc::new(FnAcquirer::new(|_| async { Ok::<_, anyhow::Error>(false) })),
            Arc::new(CountingHook(Arc::new(Counters::default()))),
        );

        elector.start(ShutdownToken::new()).unwrap();
        assert_eq!(
            elector.start(ShutdownToken::new()),
            Err(ElectionError::AlreadyStarted(7_526_700_533_049))
        );
        elector.stop().await;
    }

    #[tokio::test]
    async fn test_repeated_acquisition_elects_once() {
        let counters = Arc::new(Counters::default());
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);
        let elector = LeaderElector::new(
            config(),
            Arc::new(FnAcquirer::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, anyhow::Error>(true) }
            })),
            Arc::new(CountingHook(Arc::clone(&counters))),
        );

        elector.start(ShutdownToken::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(elector.is_leader());
        assert!(attempts.load(Ordering::SeqCst) > 2);
        assert_eq!(counters.elected.load(Ordering::SeqCst), 1);

        elector.stop().await;
        assert!(!elector.is_leader());
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_external_token_relinquishes_leadership() {
        let counters = Arc::new(Counters::default());
        let elector = LeaderElector::new(
            config(),
            Arc::new(FnAcquirer::new(|_| async { Ok::<_, anyhow::Error>(true) })),
            Arc::new(CountingHook(Arc::clone(&counters))),
        );

        let token = ShutdownToken::new();
        elector.start(token.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(elector.is_leader());

        token.cancel();
        timeout(Duration::from_secs(5), elector.stop())
            .await
            .expect("stop should join the loop");

        assert!(!elector.is_leader());
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_losing_the_lock_stops_workers() {
        let counters = Arc::new(Counters::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let elector = LeaderElector::new(
            config(),
            // Held for the first two attempts, then another replica owns it.
            Arc::new(FnAcquirer::new(move |_| {
                let n = seen.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, anyhow::Error>(n < 2) }
            })),
            Arc::new(CountingHook(Arc::clone(&counters))),
        );

        elector.start(ShutdownToken::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(!elector.is_leader());
        assert_eq!(counters.elected.load(Ordering::SeqCst), 1);
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);

        elector.stop().await;
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);
    }

    struct PanickingStop;

    #[async_trait]
    impl StopHandle for PanickingStop {
        async fn stop(&mut self) {
            panic!("worker join failed");
        }
    }

    struct PanickingHook;

    #[async_trait]
    impl ElectedHook for PanickingHook {
        async fn on_elected(&self, _ctx: ElectedContext) -> Box<dyn StopHandle> {
            Box::new(PanickingStop)
        }
    }

    #[tokio::test]
    async fn test_panicking_stop_still_demotes() {
        let elector = LeaderElector::new(
            config(),
            Arc::new(FnAcquirer::new(|_| async { Ok::<_, anyhow::Error>(true) })),
            Arc::new(PanickingHook),
        );

        elector.start(ShutdownToken::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(elector.is_leader());

        timeout(Duration::from_secs(1), elector.stop())
            .await
            .expect("stop must return after a panicking stop handle");
        assert!(!elector.is_leader());
    }
}
