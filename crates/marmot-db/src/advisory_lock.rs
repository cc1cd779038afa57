//! Cluster-wide mutual exclusion for `SingletonTask` (spec.md §4.C): the
//! task name is hashed to a 64-bit key and passed to
//! `pg_try_advisory_lock`. The lock is session-scoped, so a crash mid-task
//! releases it automatically when the connection drops — no heartbeat or
//! explicit unlock is required for correctness, only for timely reuse
//! within a long-lived pool connection.
//!
//! SQLite has no advisory lock primitive. A single process is assumed to
//! be the only writer in that configuration, so the fallback is an
//! in-process `tokio::sync::Mutex` keyed by task name: it prevents two
//! tasks inside the same process from overlapping but does not protect
//! against multiple processes sharing one SQLite file.

use crate::pool::DbPool;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// A held lock. Dropping it releases the underlying resource.
pub enum LockGuard {
    Postgres {
        pool: sqlx::PgPool,
        key: i64,
    },
    Sqlite(OwnedMutexGuard<()>),
}

/// Hashes `name` down to a signed 64-bit key, matching postgres's
/// `bigint` advisory lock key space.
fn lock_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Process-local table of mutexes, one per task name, used only by the
/// SQLite fallback. Shared across `SingletonTask` instances via a
/// `once_cell`-free lazy static would require extra deps, so callers own
/// an `Arc<AdvisoryLocks>` and pass it in explicitly instead.
#[derive(Default)]
pub struct LocalLockTable {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LocalLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get_or_create(&self, name: &str) -> Arc<Mutex<()>> {
        let mut table = self.locks.lock().await;
        table
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Attempts to acquire the named lock without blocking. Returns `None`
/// if it is already held elsewhere — the caller should skip this tick.
pub async fn try_lock(
    db: &DbPool,
    local: &LocalLockTable,
    task_name: &str,
) -> Result<Option<LockGuard>, sqlx::Error> {
    match db {
        DbPool::Postgres(pool) => {
            let key = lock_key(task_name);
            let acquired: (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
                .bind(key)
                .fetch_one(pool)
                .await?;
            if acquired.0 {
                debug!(task_name, key, "acquired advisory lock");
                Ok(Some(LockGuard::Postgres {
                    pool: pool.clone(),
                    key,
                }))
            } else {
                Ok(None)
            }
        }
        DbPool::Sqlite(_) => {
            let mutex = local.get_or_create(task_name).await;
            match mutex.try_lock_owned() {
                Ok(guard) => Ok(Some(LockGuard::Sqlite(guard))),
                Err(_) => Ok(None),
            }
        }
    }
}

impl LockGuard {
    /// Releases the lock. Spawned as fire-and-forget cleanup rather than
    /// blocking `Drop` on an async call — `pg_advisory_unlock` failures
    /// are non-fatal since the session-scoped lock still releases on
    /// connection close.
    pub fn release(self) {
        if let LockGuard::Postgres { pool, key } = self {
            tokio::spawn(async move {
                if let Err(err) = sqlx::query("SELECT pg_advisory_unlock($1)")
                    .bind(key)
                    .execute(&pool)
                    .await
                {
                    tracing::warn!(key, %err, "failed to release advisory lock");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_deterministic() {
        assert_eq!(lock_key("rule-reconciler"), lock_key("rule-reconciler"));
        assert_ne!(lock_key("rule-reconciler"), lock_key("stale-run-sweeper"));
    }

    #[tokio::test]
    async fn sqlite_fallback_excludes_concurrent_holders() {
        let table = LocalLockTable::new();
        let first = table.get_or_create("t").await;
        let _guard = first.try_lock_owned().unwrap();
        let second = table.get_or_create("t").await;
        assert!(second.try_lock_owned().is_err());
    }
}
