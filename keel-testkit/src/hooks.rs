use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use keel::{ElectedContext, ElectedHook, ShutdownToken, StopHandle};
use parking_lot::Mutex;

#[derive(Default)]
struct Counts {
    elected: AtomicUsize,
    stopped: AtomicUsize,
    tenures: Mutex<Vec<ShutdownToken>>,
}

/// Hook that counts elections and stops, optionally taking a while to stop.
#[derive(Clone, Default)]
pub struct CountingHook {
    counts: Arc<Counts>,
    stop_delay: Duration,
}

impl CountingHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every stop handle sleep for `delay` before returning.
    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    pub fn elected(&self) -> usize {
        self.counts.elected.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.counts.stopped.load(Ordering::SeqCst)
    }

    /// Tenure tokens handed to each election, oldest first.
    pub fn tenures(&self) -> Vec<ShutdownToken> {
        self.counts.tenures.lock().clone()
    }
}

struct CountingStop {
    counts: Arc<Counts>,
    delay: Duration,
}

#[async_trait]
impl StopHandle for CountingStop {
    async fn stop(&mut self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.counts.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ElectedHook for CountingHook {
    async fn on_elected(&self, ctx: ElectedContext) -> Box<dyn StopHandle> {
        self.counts.elected.fetch_add(1, Ordering::SeqCst);
        self.counts.tenures.lock().push(ctx.shutdown);
        Box::new(CountingStop {
            counts: Arc::clone(&self.counts),
            delay: self.stop_delay,
        })
    }
}
