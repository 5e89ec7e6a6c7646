use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use keel::{LockAcquirer, LockId};
use parking_lot::Mutex;

/// Serializing lock store shared by several acquirers, one per simulated
/// replica session.
#[derive(Clone, Default)]
pub struct InMemoryLockStore {
    holders: Arc<Mutex<HashMap<LockId, u64>>>,
    severed: Arc<Mutex<HashSet<u64>>>,
    next_session: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new session against this store.
    pub fn acquirer(&self) -> InMemoryAcquirer {
        InMemoryAcquirer {
            store: self.clone(),
            session: self.next_session.fetch_add(1, Ordering::SeqCst) + 1,
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn holder(&self, lock: LockId) -> Option<u64> {
        self.holders.lock().get(&lock).copied()
    }

    /// Drop whatever session holds `lock`, as if its connection died.
    ///
    /// The severed session sees `false` on its next attempt, the way a
    /// replica notices its lost connection before reconnecting.
    pub fn kill_holder(&self, lock: LockId) -> Option<u64> {
        let session = self.holders.lock().remove(&lock)?;
        self.severed.lock().insert(session);
        Some(session)
    }

    /// Make every attempt fail until set back to `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

/// One replica's session on an [`InMemoryLockStore`].
#[derive(Clone)]
pub struct InMemoryAcquirer {
    store: InMemoryLockStore,
    session: u64,
    attempts: Arc<AtomicUsize>,
}

impl InMemoryAcquirer {
    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LockAcquirer for InMemoryAcquirer {
    async fn try_acquire(&self, lock: LockId) -> anyhow::Result<bool> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.store.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        if self.store.severed.lock().remove(&self.session) {
            return Ok(false);
        }
        let mut holders = self.store.holders.lock();
        let holder = *holders.entry(lock).or_insert(self.session);
        Ok(holder == self.session)
    }

    async fn release(&self, lock: LockId) -> anyhow::Result<()> {
        let mut holders = self.store.holders.lock();
        if holders.get(&lock) == Some(&self.session) {
            holders.remove(&lock);
        }
        Ok(())
    }
}

/// Reports the lock as held elsewhere until `grant_after` has elapsed since
/// construction, then grants it on every attempt.
pub struct ScriptedAcquirer {
    started: Instant,
    grant_after: Duration,
    attempts: AtomicUsize,
}

impl ScriptedAcquirer {
    pub fn granting_after(grant_after: Duration) -> Self {
        Self {
            started: Instant::now(),
            grant_after,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LockAcquirer for ScriptedAcquirer {
    async fn try_acquire(&self, _lock: LockId) -> anyhow::Result<bool> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Ok(self.started.elapsed() >= self.grant_after)
    }
}

/// Fails every attempt with the same error.
pub struct FailingAcquirer {
    message: String,
    attempts: AtomicUsize,
}

impl FailingAcquirer {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LockAcquirer for FailingAcquirer {
    async fn try_acquire(&self, _lock: LockId) -> anyhow::Result<bool> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::anyhow!("{}", self.message))
    }
}
