//! Daily notification pruning (spec.md §4.J "Retention"): read
//! notifications older than 14 days, all notifications older than 90
//! days, and a 500-per-user cap — run as a [`marmot_singleton_task`] so
//! only one node executes it per tick.

use crate::repo::NotificationRepo;
use chrono::{Duration as ChronoDuration, Utc};
use marmot_db::advisory_lock::LocalLockTable;
use marmot_db::pool::DbPool;
use marmot_singleton_task::{spawn, SingletonTaskConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const READ_RETENTION_DAYS: i64 = 14;
pub const MAX_RETENTION_DAYS: i64 = 90;
pub const PER_USER_CAP: i64 = 500;

pub fn spawn_retention_task(
    repo: Arc<dyn NotificationRepo>,
    db: Arc<DbPool>,
    locks: Arc<LocalLockTable>,
    node_id: String,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let config = SingletonTaskConfig {
        name: "notification-retention".to_string(),
        interval: Duration::from_secs(24 * 60 * 60),
        initial_delay: Duration::from_secs(30),
    };
    spawn(db, locks, node_id, config, cancel, move || {
        let repo = repo.clone();
        async move { prune(&repo).await }
    })
}

async fn prune(repo: &Arc<dyn NotificationRepo>) -> anyhow::Result<()> {
    let now = Utc::now();
    let read_cutoff = now - ChronoDuration::days(READ_RETENTION_DAYS);
    let max_cutoff = now - ChronoDuration::days(MAX_RETENTION_DAYS);

    let read_deleted = repo.prune_read_older_than(read_cutoff).await?;
    let all_deleted = repo.prune_all_older_than(max_cutoff).await?;
    let capped = repo.enforce_per_user_cap(PER_USER_CAP).await?;

    info!(read_deleted, all_deleted, capped, "notification retention pass complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Notification, RecipientType};
    use crate::repo::InMemoryNotificationRepo;
    use marmot_common::ids::NotificationId;
    use serde_json::json;

    fn notification(created_at: chrono::DateTime<Utc>, read: bool) -> Notification {
        Notification {
            id: NotificationId::new_v4(),
            recipient_user_id: "alice".to_string(),
            original_recipient_type: RecipientType::User,
            original_recipient_id: "alice".to_string(),
            notification_type: "asset_updated".to_string(),
            title: "t".to_string(),
            message: "m".to_string(),
            data: json!({}),
            read,
            read_at: None,
            created_at,
        }
    }

    #[tokio::test]
    async fn prune_removes_old_read_and_caps_per_user() {
        let repo: Arc<dyn NotificationRepo> = Arc::new(InMemoryNotificationRepo::new());
        let now = Utc::now();
        repo.bulk_insert(&[notification(now - ChronoDuration::days(20), true)]).await.unwrap();
        repo.bulk_insert(&[notification(now - ChronoDuration::days(1), false)]).await.unwrap();

        prune(&repo).await.unwrap();

        let remaining = repo.list_for_user("alice", 100).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(!remaining[0].read);
    }
}
