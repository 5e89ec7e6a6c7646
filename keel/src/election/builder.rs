use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use super::elector::{LeaderElector, LockAcquirer};
use super::hook::ElectedHook;
use crate::config::ElectionConfig;

/// Builder for constructing a `LeaderElector` with explicit dependencies.
///
/// # Example
///
/// ```ignore
/// use keel::election::*;
///
/// let elector = LeaderElectorBuilder::new(ElectionConfig::from_env()?)
///     .with_acquirer(Arc::new(advisory_lock))
///     .with_hook(Arc::new(WorkerSetHook::new().with_worker(reaper)))
///     .build()?;
/// elector.start(shutdown.clone())?;
/// ```
pub struct LeaderElectorBuilder<A, H>
where
    A: LockAcquirer + 'static,
    H: ElectedHook + 'static,
{
    config: ElectionConfig,
    acquirer: Option<Arc<A>>,
    hook: Option<Arc<H>>,
}

impl<A, H> fmt::Debug for LeaderElectorBuilder<A, H>
where
    A: LockAcquirer + 'static,
    H: ElectedHook + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("LeaderElectorBuilder");
        debug.field("config", &self.config);
        debug.field("acquirer_set", &self.acquirer.is_some());
        debug.field("hook_set", &self.hook.is_some());

        if self.acquirer.is_some() {
            debug.field("acquirer_type", &type_name::<A>());
        }
        if self.hook.is_some() {
            debug.field("hook_type", &type_name::<H>());
        }

        debug.finish()
    }
}

impl<A, H> LeaderElectorBuilder<A, H>
where
    A: LockAcquirer + 'static,
    H: ElectedHook + 'static,
{
    /// Create a new builder with the given election configuration.
    pub fn new(config: ElectionConfig) -> Self {
        Self {
            config,
            acquirer: None,
            hook: None,
        }
    }

    /// Set the lock acquirer.
    pub fn with_acquirer(mut self, acquirer: Arc<A>) -> Self {
        self.acquirer = Some(acquirer);
        self
    }

    /// Set the hook run on election.
    pub fn with_hook(mut self, hook: Arc<H>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Build the `LeaderElector`.
    ///
    /// # Errors
    ///
    /// Returns an error if any required dependency is missing.
    pub fn build(self) -> anyhow::Result<LeaderElector<A, H>> {
        let acquirer = self
            .acquirer
            .ok_or_else(|| anyhow::anyhow!("acquirer dependency missing"))?;
        let hook = self
            .hook
            .ok_or_else(|| anyhow::anyhow!("hook dependency missing"))?;

        Ok(LeaderElector::new(self.config, acquirer, hook))
    }
}
