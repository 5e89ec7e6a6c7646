use std::sync::Arc;

use tokio::sync::watch;

/// Cooperative cancellation shared by an election session, a leader tenure or
/// a dispatched run.
///
/// Cancelling is sticky: once any clone cancels, every current and future
/// waiter returns immediately.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    state: Arc<watch::Sender<bool>>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}
