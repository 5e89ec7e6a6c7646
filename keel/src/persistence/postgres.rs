use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::Connection;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::PersistenceConfig;
use crate::election::LockAcquirer;
use crate::lock::LockId;

/// Session-level advisory lock held on a connection detached from the pool.
///
/// Every attempt takes its own detached connection, so a lock can never leak
/// back into the pool on a connection some other caller then reuses.
/// Postgres releases the lock when that session ends, so a crashed or
/// partitioned leader loses it without any cleanup. While the lock is held,
/// each attempt pings the session instead of locking again.
#[derive(Debug)]
pub struct PgAdvisoryLock {
    pool: PgPool,
    session: Mutex<Option<HeldSession>>,
}

#[derive(Debug)]
struct HeldSession {
    lock: LockId,
    conn: PgConnection,
}

impl PgAdvisoryLock {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            session: Mutex::new(None),
        }
    }

    /// Build the pool from `config` and wrap it.
    pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.connection_string)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Whether this instance currently holds a session for some lock.
    pub async fn is_held(&self) -> bool {
        self.session.lock().await.is_some()
    }
}

#[async_trait]
impl LockAcquirer for PgAdvisoryLock {
    async fn try_acquire(&self, lock: LockId) -> anyhow::Result<bool> {
        let mut session = self.session.lock().await;

        if let Some(held) = session.as_mut() {
            if held.lock != lock {
                anyhow::bail!(
                    "advisory session already holds lock {}, cannot also take {}",
                    held.lock,
                    lock
                );
            }
            return match sqlx::query("SELECT 1").execute(&mut held.conn).await {
                Ok(_) => Ok(true),
                Err(err) => {
                    // Dropping the session lets the server release the lock.
                    warn!(lock_id = %lock, error = %err, "advisory lock session lost");
                    *session = None;
                    Ok(false)
                }
            };
        }

        // Detached before locking: if this attempt is dropped mid-query the
        // connection closes with it instead of returning to the pool locked.
        let mut conn = self.pool.acquire().await?.detach();
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(lock.value())
            .fetch_one(&mut conn)
            .await?;

        if acquired {
            debug!(lock_id = %lock, "advisory lock acquired");
            *session = Some(HeldSession { lock, conn });
        } else if let Err(err) = conn.close().await {
            debug!(lock_id = %lock, error = %err, "closing unused advisory session failed");
        }
        Ok(acquired)
    }

    async fn release(&self, lock: LockId) -> anyhow::Result<()> {
        let Some(mut held) = self.session.lock().await.take() else {
            return Ok(());
        };
        if held.lock != lock {
            warn!(held = %held.lock, requested = %lock, "releasing a different advisory lock than held");
        }

        let unlocked: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(held.lock.value())
            .fetch_one(&mut held.conn)
            .await
            .unwrap_or(false);
        if !unlocked {
            debug!(lock_id = %held.lock, "unlock not confirmed, closing session");
        }
        held.conn.close().await?;
        Ok(())
    }
}
