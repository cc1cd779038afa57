//! Cluster-wide cron (spec.md §4.C). `spawn` returns a handle that ticks
//! forever at `interval`, but on each tick it first attempts the
//! advisory lock keyed by the task's name — only the node that wins the
//! lock actually executes the task body. The scheduler dispatch loop,
//! the rule reconciler, the notification prune, and stale-run cleanup
//! are all built on this primitive.
//!
//! `task_runs` rows are identified by `(task_name, started_at, node_id)`
//! since a given node can only be running one instance of a named task
//! at a time — the advisory lock guarantees that.

use chrono::{DateTime, Utc};
use marmot_db::advisory_lock::{try_lock, LocalLockTable};
use marmot_db::pool::DbPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct SingletonTaskConfig {
    pub name: String,
    pub interval: Duration,
    pub initial_delay: Duration,
}

/// Spawns the background loop. The returned `JoinHandle` resolves once
/// `cancel` is triggered and the current tick (if any) finishes.
pub fn spawn<F, Fut>(
    db: Arc<DbPool>,
    locks: Arc<LocalLockTable>,
    node_id: String,
    config: SingletonTaskConfig,
    cancel: CancellationToken,
    task_fn: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), anyhow::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        if config.initial_delay > Duration::ZERO {
            tokio::select! {
                _ = tokio::time::sleep(config.initial_delay) => {}
                _ = cancel.cancelled() => return,
            }
        }

        loop {
            tokio::select! {
                _ = tick(&db, &locks, &node_id, &config.name, &task_fn) => {}
                _ = cancel.cancelled() => return,
            }

            tokio::select! {
                _ = tokio::time::sleep(config.interval) => {}
                _ = cancel.cancelled() => return,
            }
        }
    })
}

async fn tick<F, Fut>(db: &Arc<DbPool>, locks: &Arc<LocalLockTable>, node_id: &str, task_name: &str, task_fn: &F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<(), anyhow::Error>>,
{
    let guard = match try_lock(db, locks, task_name).await {
        Ok(Some(guard)) => guard,
        Ok(None) => {
            info!(task_name, "singleton task skipped, lock held elsewhere");
            return;
        }
        Err(err) => {
            warn!(task_name, %err, "failed to attempt advisory lock");
            return;
        }
    };

    let started_at = Utc::now();
    if let Err(err) = record_start(db, task_name, started_at, node_id).await {
        warn!(task_name, %err, "failed to record task_runs start row");
    }

    let result = task_fn().await;

    let error_message = match &result {
        Ok(()) => None,
        Err(err) => {
            error!(task_name, %err, "singleton task failed");
            Some(err.to_string())
        }
    };
    if let Err(err) = record_end(db, task_name, started_at, node_id, error_message.as_deref()).await {
        warn!(task_name, %err, "failed to record task_runs end row");
    }

    guard.release();
}

async fn record_start(
    db: &DbPool,
    task_name: &str,
    started_at: DateTime<Utc>,
    node_id: &str,
) -> Result<(), sqlx::Error> {
    match db {
        DbPool::Postgres(pool) => {
            sqlx::query(
                "INSERT INTO task_runs (task_name, started_at, node_id) VALUES ($1, $2, $3)",
            )
            .bind(task_name)
            .bind(started_at)
            .bind(node_id)
            .execute(pool)
            .await?;
        }
        DbPool::Sqlite(pool) => {
            sqlx::query(
                "INSERT INTO task_runs (task_name, started_at, node_id) VALUES (?, ?, ?)",
            )
            .bind(task_name)
            .bind(started_at)
            .bind(node_id)
            .execute(pool)
            .await?;
        }
    }
    Ok(())
}

async fn record_end(
    db: &DbPool,
    task_name: &str,
    started_at: DateTime<Utc>,
    node_id: &str,
    error_message: Option<&str>,
) -> Result<(), sqlx::Error> {
    let ended_at = Utc::now();
    match db {
        DbPool::Postgres(pool) => {
            sqlx::query(
                "UPDATE task_runs SET ended_at = $1, error_message = $2 \
                 WHERE task_name = $3 AND started_at = $4 AND node_id = $5",
            )
            .bind(ended_at)
            .bind(error_message)
            .bind(task_name)
            .bind(started_at)
            .bind(node_id)
            .execute(pool)
            .await?;
        }
        DbPool::Sqlite(pool) => {
            sqlx::query(
                "UPDATE task_runs SET ended_at = ?, error_message = ? \
                 WHERE task_name = ? AND started_at = ? AND node_id = ?",
            )
            .bind(ended_at)
            .bind(error_message)
            .bind(task_name)
            .bind(started_at)
            .bind(node_id)
            .execute(pool)
            .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_holds_interval_and_delay() {
        let config = SingletonTaskConfig {
            name: "rule-reconciler".to_string(),
            interval: Duration::from_secs(30),
            initial_delay: Duration::from_secs(5),
        };
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.initial_delay, Duration::from_secs(5));
    }
}
