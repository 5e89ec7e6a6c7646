/// Builder for assembling an elector from its dependencies.
pub mod builder;
/// The election loop and the acquisition seam.
pub mod elector;
/// Elected hooks, stop handles and leader-only workers.
pub mod hook;
/// Cooperative cancellation shared by the loop and its workers.
pub mod shutdown;

pub use builder::LeaderElectorBuilder;
pub use elector::{FnAcquirer, LeaderElector, LockAcquirer};
pub use hook::{
    BackgroundWorker, ElectedContext, ElectedHook, IntervalWorker, StopHandle, WorkerSetHook,
    DEFAULT_WORKER_JOIN_TIMEOUT,
};
pub use shutdown::ShutdownToken;
