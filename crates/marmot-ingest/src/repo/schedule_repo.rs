use crate::model::Schedule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marmot_common::ids::{PluginId, ScheduleId};
use marmot_db::pool::DbPool;
use marmot_db::RepoError;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait ScheduleRepo: Send + Sync {
    async fn create(&self, schedule: Schedule) -> Result<Schedule, RepoError>;
    async fn get(&self, id: ScheduleId) -> Result<Option<Schedule>, RepoError>;
    async fn delete(&self, id: ScheduleId) -> Result<(), RepoError>;
    /// Schedules eligible to claim right now (spec §4.E step 1).
    async fn find_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Schedule>, RepoError>;
    /// Atomic conditional claim (spec §4.E step 2). Returns `true` if
    /// this node won the row.
    async fn try_claim(
        &self,
        id: ScheduleId,
        node_id: &str,
        claim_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError>;
    async fn renew_claim(&self, id: ScheduleId, node_id: &str, claim_expires_at: DateTime<Utc>) -> Result<bool, RepoError>;
    /// Releases the claim and advances `next_fire_time` in one write.
    async fn release_and_advance(&self, id: ScheduleId, next_fire_time: DateTime<Utc>) -> Result<(), RepoError>;
    async fn list_all(&self) -> Result<Vec<Schedule>, RepoError>;
    async fn update(
        &self,
        id: ScheduleId,
        cron_expression: &str,
        config: serde_json::Value,
        enabled: bool,
        updated_at: DateTime<Utc>,
    ) -> Result<(), RepoError>;
    /// Forces the next tick to pick this schedule up regardless of its
    /// current `next_fire_time` (the `/trigger` endpoint).
    async fn trigger_now(&self, id: ScheduleId, now: DateTime<Utc>) -> Result<(), RepoError>;
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: Uuid,
    name: String,
    plugin_id: String,
    pipeline_name: String,
    source_name: String,
    config: String,
    cron_expression: String,
    enabled: bool,
    next_fire_time: DateTime<Utc>,
    claimed_by: Option<String>,
    claim_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ScheduleRow> for Schedule {
    type Error = RepoError;

    fn try_from(row: ScheduleRow) -> Result<Self, Self::Error> {
        Ok(Schedule {
            id: ScheduleId(row.id),
            name: row.name,
            plugin_id: PluginId(row.plugin_id),
            pipeline_name: row.pipeline_name,
            source_name: row.source_name,
            config: serde_json::from_str(&row.config).unwrap_or(serde_json::Value::Null),
            cron_expression: row.cron_expression,
            enabled: row.enabled,
            next_fire_time: row.next_fire_time,
            claimed_by: row.claimed_by,
            claim_expires_at: row.claim_expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub struct SqlScheduleRepo {
    db: Arc<DbPool>,
}

impl SqlScheduleRepo {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ScheduleRepo for SqlScheduleRepo {
    async fn create(&self, schedule: Schedule) -> Result<Schedule, RepoError> {
        let config = schedule.config.to_string();
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO schedules (id, name, plugin_id, pipeline_name, source_name, config, \
                     cron_expression, enabled, next_fire_time, created_at, updated_at) \
                     VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
                )
                .bind(schedule.id.0)
                .bind(&schedule.name)
                .bind(&schedule.plugin_id.0)
                .bind(&schedule.pipeline_name)
                .bind(&schedule.source_name)
                .bind(config)
                .bind(&schedule.cron_expression)
                .bind(schedule.enabled)
                .bind(schedule.next_fire_time)
                .bind(schedule.created_at)
                .bind(schedule.updated_at)
                .execute(pool)
                .await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO schedules (id, name, plugin_id, pipeline_name, source_name, config, \
                     cron_expression, enabled, next_fire_time, created_at, updated_at) \
                     VALUES (?,?,?,?,?,?,?,?,?,?,?)",
                )
                .bind(schedule.id.0.to_string())
                .bind(&schedule.name)
                .bind(&schedule.plugin_id.0)
                .bind(&schedule.pipeline_name)
                .bind(&schedule.source_name)
                .bind(config)
                .bind(&schedule.cron_expression)
                .bind(schedule.enabled)
                .bind(schedule.next_fire_time)
                .bind(schedule.created_at)
                .bind(schedule.updated_at)
                .execute(pool)
                .await?;
            }
        }
        Ok(schedule)
    }

    async fn get(&self, id: ScheduleId) -> Result<Option<Schedule>, RepoError> {
        let row: Option<ScheduleRow> = match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query_as("SELECT * FROM schedules WHERE id = $1")
                    .bind(id.0)
                    .fetch_optional(pool)
                    .await?
            }
            DbPool::Sqlite(pool) => {
                sqlx::query_as("SELECT * FROM schedules WHERE id = ?")
                    .bind(id.0.to_string())
                    .fetch_optional(pool)
                    .await?
            }
        };
        row.map(Schedule::try_from).transpose()
    }

    async fn delete(&self, id: ScheduleId) -> Result<(), RepoError> {
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query("DELETE FROM schedules WHERE id = $1").bind(id.0).execute(pool).await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query("DELETE FROM schedules WHERE id = ?")
                    .bind(id.0.to_string())
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Schedule>, RepoError> {
        let rows: Vec<ScheduleRow> = match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query_as(
                    "SELECT * FROM schedules WHERE enabled AND next_fire_time <= $1 \
                     AND (claimed_by IS NULL OR claim_expires_at < $1) LIMIT $2",
                )
                .bind(now)
                .bind(limit as i64)
                .fetch_all(pool)
                .await?
            }
            DbPool::Sqlite(pool) => {
                sqlx::query_as(
                    "SELECT * FROM schedules WHERE enabled AND next_fire_time <= ? \
                     AND (claimed_by IS NULL OR claim_expires_at < ?) LIMIT ?",
                )
                .bind(now)
                .bind(now)
                .bind(limit as i64)
                .fetch_all(pool)
                .await?
            }
        };
        rows.into_iter().map(Schedule::try_from).collect()
    }

    async fn try_claim(
        &self,
        id: ScheduleId,
        node_id: &str,
        claim_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let result = match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query(
                    "UPDATE schedules SET claimed_by = $1, claim_expires_at = $2 \
                     WHERE id = $3 AND (claimed_by IS NULL OR claim_expires_at < $4)",
                )
                .bind(node_id)
                .bind(claim_expires_at)
                .bind(id.0)
                .bind(now)
                .execute(pool)
                .await?
            }
            DbPool::Sqlite(pool) => {
                sqlx::query(
                    "UPDATE schedules SET claimed_by = ?, claim_expires_at = ? \
                     WHERE id = ? AND (claimed_by IS NULL OR claim_expires_at < ?)",
                )
                .bind(node_id)
                .bind(claim_expires_at)
                .bind(id.0.to_string())
                .bind(now)
                .execute(pool)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    async fn renew_claim(&self, id: ScheduleId, node_id: &str, claim_expires_at: DateTime<Utc>) -> Result<bool, RepoError> {
        let result = match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query("UPDATE schedules SET claim_expires_at = $1 WHERE id = $2 AND claimed_by = $3")
                    .bind(claim_expires_at)
                    .bind(id.0)
                    .bind(node_id)
                    .execute(pool)
                    .await?
            }
            DbPool::Sqlite(pool) => {
                sqlx::query("UPDATE schedules SET claim_expires_at = ? WHERE id = ? AND claimed_by = ?")
                    .bind(claim_expires_at)
                    .bind(id.0.to_string())
                    .bind(node_id)
                    .execute(pool)
                    .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    async fn release_and_advance(&self, id: ScheduleId, next_fire_time: DateTime<Utc>) -> Result<(), RepoError> {
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query(
                    "UPDATE schedules SET claimed_by = NULL, claim_expires_at = NULL, next_fire_time = $1 WHERE id = $2",
                )
                .bind(next_fire_time)
                .bind(id.0)
                .execute(pool)
                .await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query(
                    "UPDATE schedules SET claimed_by = NULL, claim_expires_at = NULL, next_fire_time = ? WHERE id = ?",
                )
                .bind(next_fire_time)
                .bind(id.0.to_string())
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<Schedule>, RepoError> {
        let rows: Vec<ScheduleRow> = match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query_as("SELECT * FROM schedules ORDER BY created_at").fetch_all(pool).await?
            }
            DbPool::Sqlite(pool) => {
                sqlx::query_as("SELECT * FROM schedules ORDER BY created_at").fetch_all(pool).await?
            }
        };
        rows.into_iter().map(Schedule::try_from).collect()
    }

    async fn update(
        &self,
        id: ScheduleId,
        cron_expression: &str,
        config: serde_json::Value,
        enabled: bool,
        updated_at: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        let config = config.to_string();
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query(
                    "UPDATE schedules SET cron_expression = $1, config = $2, enabled = $3, updated_at = $4 WHERE id = $5",
                )
                .bind(cron_expression)
                .bind(config)
                .bind(enabled)
                .bind(updated_at)
                .bind(id.0)
                .execute(pool)
                .await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query(
                    "UPDATE schedules SET cron_expression = ?, config = ?, enabled = ?, updated_at = ? WHERE id = ?",
                )
                .bind(cron_expression)
                .bind(config)
                .bind(enabled)
                .bind(updated_at)
                .bind(id.0.to_string())
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn trigger_now(&self, id: ScheduleId, now: DateTime<Utc>) -> Result<(), RepoError> {
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query("UPDATE schedules SET next_fire_time = $1 WHERE id = $2")
                    .bind(now)
                    .bind(id.0)
                    .execute(pool)
                    .await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query("UPDATE schedules SET next_fire_time = ? WHERE id = ?")
                    .bind(now)
                    .bind(id.0.to_string())
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }
}

/// In-memory fake used to unit test the claim/lease protocol's
/// at-most-one-winner property without a live database.
pub struct InMemoryScheduleRepo {
    rows: tokio::sync::Mutex<BTreeMap<Uuid, Schedule>>,
}

impl InMemoryScheduleRepo {
    pub fn new() -> Self {
        Self {
            rows: tokio::sync::Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for InMemoryScheduleRepo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScheduleRepo for InMemoryScheduleRepo {
    async fn create(&self, schedule: Schedule) -> Result<Schedule, RepoError> {
        self.rows.lock().await.insert(schedule.id.0, schedule.clone());
        Ok(schedule)
    }

    async fn get(&self, id: ScheduleId) -> Result<Option<Schedule>, RepoError> {
        Ok(self.rows.lock().await.get(&id.0).cloned())
    }

    async fn delete(&self, id: ScheduleId) -> Result<(), RepoError> {
        self.rows.lock().await.remove(&id.0);
        Ok(())
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Schedule>, RepoError> {
        Ok(self
            .rows
            .lock()
            .await
            .values()
            .filter(|s| {
                s.enabled
                    && s.next_fire_time <= now
                    && (s.claimed_by.is_none() || s.claim_expires_at.map(|e| e < now).unwrap_or(false))
            })
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn try_claim(
        &self,
        id: ScheduleId,
        node_id: &str,
        claim_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let mut rows = self.rows.lock().await;
        let Some(schedule) = rows.get_mut(&id.0) else {
            return Ok(false);
        };
        let claimable = schedule.claimed_by.is_none()
            || schedule.claim_expires_at.map(|e| e < now).unwrap_or(false);
        if claimable {
            schedule.claimed_by = Some(node_id.to_string());
            schedule.claim_expires_at = Some(claim_expires_at);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn renew_claim(&self, id: ScheduleId, node_id: &str, claim_expires_at: DateTime<Utc>) -> Result<bool, RepoError> {
        let mut rows = self.rows.lock().await;
        let Some(schedule) = rows.get_mut(&id.0) else {
            return Ok(false);
        };
        if schedule.claimed_by.as_deref() == Some(node_id) {
            schedule.claim_expires_at = Some(claim_expires_at);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release_and_advance(&self, id: ScheduleId, next_fire_time: DateTime<Utc>) -> Result<(), RepoError> {
        if let Some(schedule) = self.rows.lock().await.get_mut(&id.0) {
            schedule.claimed_by = None;
            schedule.claim_expires_at = None;
            schedule.next_fire_time = next_fire_time;
        }
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<Schedule>, RepoError> {
        Ok(self.rows.lock().await.values().cloned().collect())
    }

    async fn update(
        &self,
        id: ScheduleId,
        cron_expression: &str,
        config: serde_json::Value,
        enabled: bool,
        updated_at: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        if let Some(schedule) = self.rows.lock().await.get_mut(&id.0) {
            schedule.cron_expression = cron_expression.to_string();
            schedule.config = config;
            schedule.enabled = enabled;
            schedule.updated_at = updated_at;
        }
        Ok(())
    }

    async fn trigger_now(&self, id: ScheduleId, now: DateTime<Utc>) -> Result<(), RepoError> {
        if let Some(schedule) = self.rows.lock().await.get_mut(&id.0) {
            schedule.next_fire_time = now;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marmot_common::ids::PluginId;

    fn schedule(now: DateTime<Utc>) -> Schedule {
        Schedule {
            id: ScheduleId::new_v4(),
            name: "kafka-orders".to_string(),
            plugin_id: PluginId("kafka".to_string()),
            pipeline_name: "kafka-pipeline".to_string(),
            source_name: "prod".to_string(),
            config: serde_json::json!({}),
            cron_expression: "*/5 * * * *".to_string(),
            enabled: true,
            next_fire_time: now,
            claimed_by: None,
            claim_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn only_one_claim_wins_the_race() {
        let repo = InMemoryScheduleRepo::new();
        let now = Utc::now();
        let created = repo.create(schedule(now)).await.unwrap();

        let a = repo
            .try_claim(created.id, "node-a", now + chrono::Duration::seconds(30), now)
            .await
            .unwrap();
        let b = repo
            .try_claim(created.id, "node-b", now + chrono::Duration::seconds(30), now)
            .await
            .unwrap();

        assert!(a);
        assert!(!b, "second node must not win an already-claimed schedule");
    }

    #[tokio::test]
    async fn expired_claim_can_be_reclaimed() {
        let repo = InMemoryScheduleRepo::new();
        let now = Utc::now();
        let mut s = schedule(now);
        s.claimed_by = Some("dead-node".to_string());
        s.claim_expires_at = Some(now - chrono::Duration::seconds(1));
        let created = repo.create(s).await.unwrap();

        let reclaimed = repo
            .try_claim(created.id, "node-b", now + chrono::Duration::seconds(30), now)
            .await
            .unwrap();
        assert!(reclaimed);
    }

    #[tokio::test]
    async fn update_overwrites_cron_config_and_enabled() {
        let repo = InMemoryScheduleRepo::new();
        let now = Utc::now();
        let created = repo.create(schedule(now)).await.unwrap();

        repo.update(created.id, "0 */2 * * *", serde_json::json!({"topic": "orders"}), false, now)
            .await
            .unwrap();

        let updated = repo.get(created.id).await.unwrap().unwrap();
        assert_eq!(updated.cron_expression, "0 */2 * * *");
        assert_eq!(updated.config, serde_json::json!({"topic": "orders"}));
        assert!(!updated.enabled);
    }

    #[tokio::test]
    async fn trigger_now_pulls_next_fire_time_forward() {
        let repo = InMemoryScheduleRepo::new();
        let far_future = Utc::now() + chrono::Duration::days(1);
        let created = repo.create(schedule(far_future)).await.unwrap();

        let now = Utc::now();
        repo.trigger_now(created.id, now).await.unwrap();

        let updated = repo.get(created.id).await.unwrap().unwrap();
        assert_eq!(updated.next_fire_time, now);
    }

    #[tokio::test]
    async fn list_all_returns_every_schedule() {
        let repo = InMemoryScheduleRepo::new();
        let now = Utc::now();
        repo.create(schedule(now)).await.unwrap();
        repo.create(schedule(now)).await.unwrap();

        assert_eq!(repo.list_all().await.unwrap().len(), 2);
    }
}
