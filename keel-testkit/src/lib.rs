//! Test doubles for keel.
//!
//! Everything here is in memory and guarded by `parking_lot` locks so tests
//! can share one fake between several electors or executors.

pub mod credentials;
pub mod executor;
pub mod hooks;
pub mod lock;

pub use credentials::{FailingCredentialBroker, StaticCredentialBroker};
pub use executor::{FakeContainerRuntime, FakeTaskService};
pub use hooks::CountingHook;
pub use lock::{FailingAcquirer, InMemoryAcquirer, InMemoryLockStore, ScriptedAcquirer};
