//! PostgreSQL-backed leader lock.
//!
//! Provides [`PgAdvisoryLock`], a [`LockAcquirer`] built on session-level
//! advisory locks.
//!
//! [`LockAcquirer`]: crate::election::LockAcquirer
pub mod postgres;

pub use postgres::PgAdvisoryLock;
