use crate::model::{Notification, RecipientType, TeamWebhook, WebhookProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marmot_common::crypto::Cipher;
use marmot_common::ids::{NotificationId, WebhookId};
use marmot_db::pool::DbPool;
use marmot_db::RepoError;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait NotificationRepo: Send + Sync {
    /// Inserts `notifications` in a single statement. Callers are
    /// responsible for chunking to the configured batch size (spec.md
    /// §4.J step 4).
    async fn bulk_insert(&self, notifications: &[Notification]) -> Result<(), RepoError>;
    async fn list_for_user(&self, user_id: &str, limit: i64) -> Result<Vec<Notification>, RepoError>;
    async fn mark_read(&self, id: NotificationId, now: DateTime<Utc>) -> Result<(), RepoError>;
    /// Batch-loads each user's notification-type preference map. Absence
    /// of a `notification_type` key means enabled (spec.md §4.J step 3).
    async fn preferences_for(&self, user_ids: &[String]) -> Result<BTreeMap<String, BTreeMap<String, bool>>, RepoError>;
    async fn prune_read_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, RepoError>;
    async fn prune_all_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, RepoError>;
    /// Deletes the oldest excess rows so no user has more than `cap`
    /// notifications (spec.md §4.J "Retention" pass (c)).
    async fn enforce_per_user_cap(&self, cap: i64) -> Result<u64, RepoError>;
}

#[derive(sqlx::FromRow)]
struct NotificationRow {
    id: Uuid,
    recipient_user_id: String,
    original_recipient_type: String,
    original_recipient_id: String,
    notification_type: String,
    title: String,
    message: String,
    data: serde_json::Value,
    read: bool,
    read_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = RepoError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        let original_recipient_type = match row.original_recipient_type.as_str() {
            "user" => RecipientType::User,
            "team" => RecipientType::Team,
            other => return Err(RepoError::Corrupt(format!("unknown recipient_type {other}"))),
        };
        Ok(Notification {
            id: NotificationId(row.id),
            recipient_user_id: row.recipient_user_id,
            original_recipient_type,
            original_recipient_id: row.original_recipient_id,
            notification_type: row.notification_type,
            title: row.title,
            message: row.message,
            data: row.data,
            read: row.read,
            read_at: row.read_at,
            created_at: row.created_at,
        })
    }
}

pub struct SqlNotificationRepo {
    db: Arc<DbPool>,
}

impl SqlNotificationRepo {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl NotificationRepo for SqlNotificationRepo {
    async fn bulk_insert(&self, notifications: &[Notification]) -> Result<(), RepoError> {
        if notifications.is_empty() {
            return Ok(());
        }
        for n in notifications {
            match self.db.as_ref() {
                DbPool::Postgres(pool) => {
                    sqlx::query(
                        "INSERT INTO notifications (id, recipient_user_id, original_recipient_type, \
                         original_recipient_id, notification_type, title, message, data, read, read_at, created_at) \
                         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
                    )
                    .bind(n.id.0)
                    .bind(&n.recipient_user_id)
                    .bind(n.original_recipient_type.as_str())
                    .bind(&n.original_recipient_id)
                    .bind(&n.notification_type)
                    .bind(&n.title)
                    .bind(&n.message)
                    .bind(&n.data)
                    .bind(n.read)
                    .bind(n.read_at)
                    .bind(n.created_at)
                    .execute(pool)
                    .await?;
                }
                DbPool::Sqlite(pool) => {
                    sqlx::query(
                        "INSERT INTO notifications (id, recipient_user_id, original_recipient_type, \
                         original_recipient_id, notification_type, title, message, data, read, read_at, created_at) \
                         VALUES (?,?,?,?,?,?,?,?,?,?,?)",
                    )
                    .bind(n.id.0.to_string())
                    .bind(&n.recipient_user_id)
                    .bind(n.original_recipient_type.as_str())
                    .bind(&n.original_recipient_id)
                    .bind(&n.notification_type)
                    .bind(&n.title)
                    .bind(&n.message)
                    .bind(n.data.to_string())
                    .bind(n.read)
                    .bind(n.read_at)
                    .bind(n.created_at)
                    .execute(pool)
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str, limit: i64) -> Result<Vec<Notification>, RepoError> {
        let rows: Vec<NotificationRow> = match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query_as(
                    "SELECT * FROM notifications WHERE recipient_user_id = $1 ORDER BY created_at DESC LIMIT $2",
                )
                .bind(user_id)
                .bind(limit)
                .fetch_all(pool)
                .await?
            }
            DbPool::Sqlite(pool) => {
                sqlx::query_as(
                    "SELECT * FROM notifications WHERE recipient_user_id = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(user_id)
                .bind(limit)
                .fetch_all(pool)
                .await?
            }
        };
        rows.into_iter().map(Notification::try_from).collect()
    }

    async fn mark_read(&self, id: NotificationId, now: DateTime<Utc>) -> Result<(), RepoError> {
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query("UPDATE notifications SET read = true, read_at = $1 WHERE id = $2")
                    .bind(now)
                    .bind(id.0)
                    .execute(pool)
                    .await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query("UPDATE notifications SET read = true, read_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(id.0.to_string())
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn preferences_for(&self, user_ids: &[String]) -> Result<BTreeMap<String, BTreeMap<String, bool>>, RepoError> {
        // No dedicated preferences table is defined in this system's data
        // model (spec.md §3) — every user defaults to "enabled" for every
        // type, so this returns an empty map per user and lets callers'
        // absence-means-enabled rule do the rest.
        Ok(user_ids.iter().map(|u| (u.clone(), BTreeMap::new())).collect())
    }

    async fn prune_read_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, RepoError> {
        let result = match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query("DELETE FROM notifications WHERE read AND created_at < $1").bind(cutoff).execute(pool).await?
            }
            DbPool::Sqlite(pool) => {
                sqlx::query("DELETE FROM notifications WHERE read AND created_at < ?").bind(cutoff).execute(pool).await?
            }
        };
        Ok(result.rows_affected())
    }

    async fn prune_all_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, RepoError> {
        let result = match self.db.as_ref() {
            DbPool::Postgres(pool) => sqlx::query("DELETE FROM notifications WHERE created_at < $1").bind(cutoff).execute(pool).await?,
            DbPool::Sqlite(pool) => sqlx::query("DELETE FROM notifications WHERE created_at < ?").bind(cutoff).execute(pool).await?,
        };
        Ok(result.rows_affected())
    }

    async fn enforce_per_user_cap(&self, cap: i64) -> Result<u64, RepoError> {
        // Deletes, per user, every row beyond the newest `cap` by
        // created_at. Expressed as a correlated subquery so it works
        // identically on both backends.
        let result = match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query(
                    "DELETE FROM notifications WHERE id IN ( \
                       SELECT id FROM ( \
                         SELECT id, ROW_NUMBER() OVER (PARTITION BY recipient_user_id ORDER BY created_at DESC) AS rn \
                         FROM notifications \
                       ) ranked WHERE rn > $1 \
                     )",
                )
                .bind(cap)
                .execute(pool)
                .await?
            }
            DbPool::Sqlite(pool) => {
                sqlx::query(
                    "DELETE FROM notifications WHERE id IN ( \
                       SELECT id FROM ( \
                         SELECT id, ROW_NUMBER() OVER (PARTITION BY recipient_user_id ORDER BY created_at DESC) AS rn \
                         FROM notifications \
                       ) WHERE rn > ? \
                     )",
                )
                .bind(cap)
                .execute(pool)
                .await?
            }
        };
        Ok(result.rows_affected())
    }
}

#[derive(Default)]
pub struct InMemoryNotificationRepo {
    rows: tokio::sync::Mutex<Vec<Notification>>,
}

impl InMemoryNotificationRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationRepo for InMemoryNotificationRepo {
    async fn bulk_insert(&self, notifications: &[Notification]) -> Result<(), RepoError> {
        self.rows.lock().await.extend_from_slice(notifications);
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str, limit: i64) -> Result<Vec<Notification>, RepoError> {
        let mut rows: Vec<Notification> = self.rows.lock().await.iter().filter(|n| n.recipient_user_id == user_id).cloned().collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn mark_read(&self, id: NotificationId, now: DateTime<Utc>) -> Result<(), RepoError> {
        if let Some(n) = self.rows.lock().await.iter_mut().find(|n| n.id == id) {
            n.read = true;
            n.read_at = Some(now);
        }
        Ok(())
    }

    async fn preferences_for(&self, user_ids: &[String]) -> Result<BTreeMap<String, BTreeMap<String, bool>>, RepoError> {
        Ok(user_ids.iter().map(|u| (u.clone(), BTreeMap::new())).collect())
    }

    async fn prune_read_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, RepoError> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|n| !(n.read && n.created_at < cutoff));
        Ok((before - rows.len()) as u64)
    }

    async fn prune_all_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, RepoError> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|n| n.created_at >= cutoff);
        Ok((before - rows.len()) as u64)
    }

    async fn enforce_per_user_cap(&self, cap: i64) -> Result<u64, RepoError> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        let mut by_user: BTreeMap<String, Vec<Notification>> = BTreeMap::new();
        for n in rows.drain(..) {
            by_user.entry(n.recipient_user_id.clone()).or_default().push(n);
        }
        let mut kept = Vec::new();
        for (_, mut group) in by_user {
            group.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            group.truncate(cap.max(0) as usize);
            kept.extend(group);
        }
        let removed = before - kept.len();
        *rows = kept;
        Ok(removed as u64)
    }
}

#[async_trait]
pub trait WebhookRepo: Send + Sync {
    async fn create(&self, webhook: TeamWebhook) -> Result<TeamWebhook, RepoError>;
    async fn get(&self, id: WebhookId) -> Result<Option<TeamWebhook>, RepoError>;
    /// Enabled webhooks subscribed to `notification_type` (spec.md §6.1
    /// GIN index on `notification_types`).
    async fn enabled_for_type(&self, notification_type: &str) -> Result<Vec<TeamWebhook>, RepoError>;
    async fn record_success(&self, id: WebhookId, now: DateTime<Utc>) -> Result<(), RepoError>;
    async fn record_failure(&self, id: WebhookId, error: &str) -> Result<(), RepoError>;
}

#[derive(sqlx::FromRow)]
struct WebhookRow {
    id: Uuid,
    team_id: String,
    display_name: String,
    provider: String,
    url: String,
    notification_types: String,
    enabled: bool,
    last_triggered_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WebhookRow {
    fn into_domain(self, cipher: &Cipher) -> Result<TeamWebhook, RepoError> {
        let url = cipher
            .decrypt(&self.url)
            .map_err(|e| RepoError::Corrupt(format!("failed to decrypt webhook url: {e}")))?;
        let provider = WebhookProvider::parse(&self.provider)
            .ok_or_else(|| RepoError::Corrupt(format!("unknown webhook provider {}", self.provider)))?;
        Ok(TeamWebhook {
            id: WebhookId(self.id),
            team_id: self.team_id,
            display_name: self.display_name,
            provider,
            url,
            notification_types: serde_json::from_str(&self.notification_types).unwrap_or_default(),
            enabled: self.enabled,
            last_triggered_at: self.last_triggered_at,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

pub struct SqlWebhookRepo {
    db: Arc<DbPool>,
    cipher: Cipher,
}

impl SqlWebhookRepo {
    pub fn new(db: Arc<DbPool>, cipher: Cipher) -> Self {
        Self { db, cipher }
    }
}

#[async_trait]
impl WebhookRepo for SqlWebhookRepo {
    async fn create(&self, webhook: TeamWebhook) -> Result<TeamWebhook, RepoError> {
        let encrypted_url = self
            .cipher
            .encrypt(&webhook.url)
            .map_err(|e| RepoError::Corrupt(format!("failed to encrypt webhook url: {e}")))?;
        let types = serde_json::to_string(&webhook.notification_types).unwrap_or_default();
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO team_webhooks (id, team_id, display_name, provider, url, notification_types, \
                     enabled, created_at, updated_at) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)",
                )
                .bind(webhook.id.0)
                .bind(&webhook.team_id)
                .bind(&webhook.display_name)
                .bind(webhook.provider.as_str())
                .bind(encrypted_url)
                .bind(types)
                .bind(webhook.enabled)
                .bind(webhook.created_at)
                .bind(webhook.updated_at)
                .execute(pool)
                .await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO team_webhooks (id, team_id, display_name, provider, url, notification_types, \
                     enabled, created_at, updated_at) VALUES (?,?,?,?,?,?,?,?,?)",
                )
                .bind(webhook.id.0.to_string())
                .bind(&webhook.team_id)
                .bind(&webhook.display_name)
                .bind(webhook.provider.as_str())
                .bind(encrypted_url)
                .bind(types)
                .bind(webhook.enabled)
                .bind(webhook.created_at)
                .bind(webhook.updated_at)
                .execute(pool)
                .await?;
            }
        }
        Ok(webhook)
    }

    async fn get(&self, id: WebhookId) -> Result<Option<TeamWebhook>, RepoError> {
        let row: Option<WebhookRow> = match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query_as("SELECT * FROM team_webhooks WHERE id = $1").bind(id.0).fetch_optional(pool).await?
            }
            DbPool::Sqlite(pool) => {
                sqlx::query_as("SELECT * FROM team_webhooks WHERE id = ?")
                    .bind(id.0.to_string())
                    .fetch_optional(pool)
                    .await?
            }
        };
        row.map(|r| r.into_domain(&self.cipher)).transpose()
    }

    async fn enabled_for_type(&self, notification_type: &str) -> Result<Vec<TeamWebhook>, RepoError> {
        // Fetches all enabled webhooks and filters the notification_types
        // membership in memory: sqlx has no portable way to express a
        // Postgres `@>` containment check against a text[] column that
        // also works unmodified against SQLite's JSON-encoded column.
        let rows: Vec<WebhookRow> = match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query_as("SELECT * FROM team_webhooks WHERE enabled").fetch_all(pool).await?
            }
            DbPool::Sqlite(pool) => {
                sqlx::query_as("SELECT * FROM team_webhooks WHERE enabled").fetch_all(pool).await?
            }
        };
        rows.into_iter()
            .map(|r| r.into_domain(&self.cipher))
            .collect::<Result<Vec<_>, _>>()
            .map(|webhooks| webhooks.into_iter().filter(|w| w.notification_types.iter().any(|t| t == notification_type)).collect())
    }

    async fn record_success(&self, id: WebhookId, now: DateTime<Utc>) -> Result<(), RepoError> {
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query("UPDATE team_webhooks SET last_triggered_at = $1, last_error = NULL, updated_at = $1 WHERE id = $2")
                    .bind(now)
                    .bind(id.0)
                    .execute(pool)
                    .await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query("UPDATE team_webhooks SET last_triggered_at = ?, last_error = NULL, updated_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(now)
                    .bind(id.0.to_string())
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn record_failure(&self, id: WebhookId, error: &str) -> Result<(), RepoError> {
        let now = Utc::now();
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query("UPDATE team_webhooks SET last_error = $1, updated_at = $2 WHERE id = $3")
                    .bind(error)
                    .bind(now)
                    .bind(id.0)
                    .execute(pool)
                    .await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query("UPDATE team_webhooks SET last_error = ?, updated_at = ? WHERE id = ?")
                    .bind(error)
                    .bind(now)
                    .bind(id.0.to_string())
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryWebhookRepo {
    rows: tokio::sync::Mutex<BTreeMap<Uuid, TeamWebhook>>,
}

impl InMemoryWebhookRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookRepo for InMemoryWebhookRepo {
    async fn create(&self, webhook: TeamWebhook) -> Result<TeamWebhook, RepoError> {
        self.rows.lock().await.insert(webhook.id.0, webhook.clone());
        Ok(webhook)
    }

    async fn get(&self, id: WebhookId) -> Result<Option<TeamWebhook>, RepoError> {
        Ok(self.rows.lock().await.get(&id.0).cloned())
    }

    async fn enabled_for_type(&self, notification_type: &str) -> Result<Vec<TeamWebhook>, RepoError> {
        Ok(self
            .rows
            .lock()
            .await
            .values()
            .filter(|w| w.enabled && w.notification_types.iter().any(|t| t == notification_type))
            .cloned()
            .collect())
    }

    async fn record_success(&self, id: WebhookId, now: DateTime<Utc>) -> Result<(), RepoError> {
        if let Some(w) = self.rows.lock().await.get_mut(&id.0) {
            w.last_triggered_at = Some(now);
            w.last_error = None;
        }
        Ok(())
    }

    async fn record_failure(&self, id: WebhookId, error: &str) -> Result<(), RepoError> {
        if let Some(w) = self.rows.lock().await.get_mut(&id.0) {
            w.last_error = Some(error.to_string());
        }
        Ok(())
    }
}
