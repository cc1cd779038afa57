use crate::model::{EntityClass, EntityStatus, Run, RunEntity, RunStatus, RunSummary};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marmot_common::ids::RunId;
use marmot_db::pool::DbPool;
use marmot_db::RepoError;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait RunRepo: Send + Sync {
    async fn start_run(&self, pipeline: &str, source: &str, now: DateTime<Utc>) -> Result<Run, RepoError>;
    async fn get(&self, run_id: RunId) -> Result<Option<Run>, RepoError>;
    /// Rejects the write (returns `RepoError::Conflict`) if the run is
    /// already in a terminal state.
    async fn complete_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        summary: RunSummary,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), RepoError>;
    async fn touch(&self, run_id: RunId, now: DateTime<Utc>) -> Result<(), RepoError>;
    /// Adds `delta` onto the run's running summary counters without
    /// touching its status or `ended_at` — batch_create calls this as
    /// items are processed, independently of when the run itself ends.
    async fn accumulate_summary(&self, run_id: RunId, delta: RunSummary) -> Result<(), RepoError>;
    async fn record_entity(&self, entity: RunEntity) -> Result<(), RepoError>;
    /// Flips any run still `running` whose last write predates `cutoff`
    /// to `failed`; returns how many were swept.
    async fn cleanup_stale_runs(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64, RepoError>;
    async fn list_recent(&self, pipeline: Option<&str>, limit: u32) -> Result<Vec<Run>, RepoError>;
    /// Sets the cancellation flag; the scheduler's lease-renewal loop
    /// observes this on its next tick and cancels the plugin's context.
    async fn cancel(&self, run_id: RunId) -> Result<(), RepoError>;
    async fn entities_for_run(&self, run_id: RunId) -> Result<Vec<RunEntity>, RepoError>;
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    pipeline_name: String,
    source_name: String,
    status: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    created_count: i32,
    updated_count: i32,
    deleted_count: i32,
    failed_count: i32,
    error_message: Option<String>,
    cancelled: bool,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for Run {
    type Error = RepoError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(Run {
            id: RunId(row.id),
            pipeline_name: row.pipeline_name,
            source_name: row.source_name,
            status: RunStatus::parse(&row.status)
                .ok_or_else(|| RepoError::Corrupt(format!("unknown run status {}", row.status)))?,
            started_at: row.started_at,
            ended_at: row.ended_at,
            summary: RunSummary {
                created: row.created_count as u32,
                updated: row.updated_count as u32,
                deleted: row.deleted_count as u32,
                failed: row.failed_count as u32,
            },
            error_message: row.error_message,
            cancelled: row.cancelled,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RunEntityRow {
    run_id: Uuid,
    pipeline_name: String,
    source_name: String,
    entity_class: String,
    status: String,
    mrn: String,
    error_message: Option<String>,
}

impl TryFrom<RunEntityRow> for RunEntity {
    type Error = RepoError;

    fn try_from(row: RunEntityRow) -> Result<Self, Self::Error> {
        let entity_class = match row.entity_class.as_str() {
            "asset" => EntityClass::Asset,
            "lineage" => EntityClass::Lineage,
            "documentation" => EntityClass::Documentation,
            "statistic" => EntityClass::Statistic,
            other => return Err(RepoError::Corrupt(format!("unknown entity class {other}"))),
        };
        let status = match row.status.as_str() {
            "created" => EntityStatus::Created,
            "updated" => EntityStatus::Updated,
            "deleted" => EntityStatus::Deleted,
            "failed" => EntityStatus::Failed,
            "unchanged" => EntityStatus::Unchanged,
            other => return Err(RepoError::Corrupt(format!("unknown entity status {other}"))),
        };
        Ok(RunEntity {
            run_id: RunId(row.run_id),
            pipeline_name: row.pipeline_name,
            source_name: row.source_name,
            entity_class,
            status,
            mrn: row.mrn,
            error_message: row.error_message,
        })
    }
}

pub struct SqlRunRepo {
    db: Arc<DbPool>,
}

impl SqlRunRepo {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RunRepo for SqlRunRepo {
    async fn start_run(&self, pipeline: &str, source: &str, now: DateTime<Utc>) -> Result<Run, RepoError> {
        let run = Run {
            id: RunId::new_v4(),
            pipeline_name: pipeline.to_string(),
            source_name: source.to_string(),
            status: RunStatus::Running,
            started_at: now,
            ended_at: None,
            summary: RunSummary::default(),
            error_message: None,
            cancelled: false,
            updated_at: now,
        };
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO runs (id, pipeline_name, source_name, status, started_at, updated_at) \
                     VALUES ($1,$2,$3,$4,$5,$6)",
                )
                .bind(run.id.0)
                .bind(&run.pipeline_name)
                .bind(&run.source_name)
                .bind(run.status.as_str())
                .bind(run.started_at)
                .bind(run.updated_at)
                .execute(pool)
                .await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO runs (id, pipeline_name, source_name, status, started_at, updated_at) \
                     VALUES (?,?,?,?,?,?)",
                )
                .bind(run.id.0.to_string())
                .bind(&run.pipeline_name)
                .bind(&run.source_name)
                .bind(run.status.as_str())
                .bind(run.started_at)
                .bind(run.updated_at)
                .execute(pool)
                .await?;
            }
        }
        Ok(run)
    }

    async fn get(&self, run_id: RunId) -> Result<Option<Run>, RepoError> {
        let row: Option<RunRow> = match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query_as("SELECT * FROM runs WHERE id = $1")
                    .bind(run_id.0)
                    .fetch_optional(pool)
                    .await?
            }
            DbPool::Sqlite(pool) => {
                sqlx::query_as("SELECT * FROM runs WHERE id = ?")
                    .bind(run_id.0.to_string())
                    .fetch_optional(pool)
                    .await?
            }
        };
        row.map(Run::try_from).transpose()
    }

    async fn complete_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        summary: RunSummary,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        let current = self.get(run_id).await?.ok_or(RepoError::NotFound)?;
        if current.status.is_terminal() {
            return Err(RepoError::Conflict("run already in a terminal state".to_string()));
        }
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query(
                    "UPDATE runs SET status = $1, ended_at = $2, created_count = $3, updated_count = $4, \
                     deleted_count = $5, failed_count = $6, error_message = $7, updated_at = $8 WHERE id = $9",
                )
                .bind(status.as_str())
                .bind(now)
                .bind(summary.created as i32)
                .bind(summary.updated as i32)
                .bind(summary.deleted as i32)
                .bind(summary.failed as i32)
                .bind(&error)
                .bind(now)
                .bind(run_id.0)
                .execute(pool)
                .await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query(
                    "UPDATE runs SET status = ?, ended_at = ?, created_count = ?, updated_count = ?, \
                     deleted_count = ?, failed_count = ?, error_message = ?, updated_at = ? WHERE id = ?",
                )
                .bind(status.as_str())
                .bind(now)
                .bind(summary.created as i32)
                .bind(summary.updated as i32)
                .bind(summary.deleted as i32)
                .bind(summary.failed as i32)
                .bind(&error)
                .bind(now)
                .bind(run_id.0.to_string())
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn touch(&self, run_id: RunId, now: DateTime<Utc>) -> Result<(), RepoError> {
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query("UPDATE runs SET updated_at = $1 WHERE id = $2")
                    .bind(now)
                    .bind(run_id.0)
                    .execute(pool)
                    .await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query("UPDATE runs SET updated_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(run_id.0.to_string())
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn accumulate_summary(&self, run_id: RunId, delta: RunSummary) -> Result<(), RepoError> {
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query(
                    "UPDATE runs SET created_count = created_count + $1, updated_count = updated_count + $2, \
                     deleted_count = deleted_count + $3, failed_count = failed_count + $4 WHERE id = $5",
                )
                .bind(delta.created as i32)
                .bind(delta.updated as i32)
                .bind(delta.deleted as i32)
                .bind(delta.failed as i32)
                .bind(run_id.0)
                .execute(pool)
                .await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query(
                    "UPDATE runs SET created_count = created_count + ?, updated_count = updated_count + ?, \
                     deleted_count = deleted_count + ?, failed_count = failed_count + ? WHERE id = ?",
                )
                .bind(delta.created as i32)
                .bind(delta.updated as i32)
                .bind(delta.deleted as i32)
                .bind(delta.failed as i32)
                .bind(run_id.0.to_string())
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn record_entity(&self, entity: RunEntity) -> Result<(), RepoError> {
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO run_entities (id, run_id, pipeline_name, source_name, entity_class, status, mrn, error_message) \
                     VALUES ($1,$2,$3,$4,$5,$6,$7,$8) \
                     ON CONFLICT (pipeline_name, source_name, mrn, run_id, entity_class) DO UPDATE SET status = EXCLUDED.status, error_message = EXCLUDED.error_message",
                )
                .bind(Uuid::new_v4())
                .bind(entity.run_id.0)
                .bind(&entity.pipeline_name)
                .bind(&entity.source_name)
                .bind(entity.entity_class.as_str())
                .bind(entity.status.as_str())
                .bind(&entity.mrn)
                .bind(&entity.error_message)
                .execute(pool)
                .await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO run_entities (id, run_id, pipeline_name, source_name, entity_class, status, mrn, error_message) \
                     VALUES (?,?,?,?,?,?,?,?) \
                     ON CONFLICT (pipeline_name, source_name, mrn, run_id, entity_class) DO UPDATE SET status = excluded.status, error_message = excluded.error_message",
                )
                .bind(Uuid::new_v4().to_string())
                .bind(entity.run_id.0.to_string())
                .bind(&entity.pipeline_name)
                .bind(&entity.source_name)
                .bind(entity.entity_class.as_str())
                .bind(entity.status.as_str())
                .bind(&entity.mrn)
                .bind(&entity.error_message)
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn cleanup_stale_runs(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64, RepoError> {
        let result = match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query(
                    "UPDATE runs SET status = 'failed', ended_at = $1, error_message = 'stale run swept', updated_at = $1 \
                     WHERE status = 'running' AND updated_at < $2",
                )
                .bind(now)
                .bind(cutoff)
                .execute(pool)
                .await?
            }
            DbPool::Sqlite(pool) => {
                sqlx::query(
                    "UPDATE runs SET status = 'failed', ended_at = ?, error_message = 'stale run swept', updated_at = ? \
                     WHERE status = 'running' AND updated_at < ?",
                )
                .bind(now)
                .bind(now)
                .bind(cutoff)
                .execute(pool)
                .await?
            }
        };
        Ok(result.rows_affected())
    }

    async fn list_recent(&self, pipeline: Option<&str>, limit: u32) -> Result<Vec<Run>, RepoError> {
        let rows: Vec<RunRow> = match (self.db.as_ref(), pipeline) {
            (DbPool::Postgres(pool), Some(p)) => {
                sqlx::query_as("SELECT * FROM runs WHERE pipeline_name = $1 ORDER BY started_at DESC LIMIT $2")
                    .bind(p)
                    .bind(limit as i64)
                    .fetch_all(pool)
                    .await?
            }
            (DbPool::Postgres(pool), None) => {
                sqlx::query_as("SELECT * FROM runs ORDER BY started_at DESC LIMIT $1")
                    .bind(limit as i64)
                    .fetch_all(pool)
                    .await?
            }
            (DbPool::Sqlite(pool), Some(p)) => {
                sqlx::query_as("SELECT * FROM runs WHERE pipeline_name = ? ORDER BY started_at DESC LIMIT ?")
                    .bind(p)
                    .bind(limit as i64)
                    .fetch_all(pool)
                    .await?
            }
            (DbPool::Sqlite(pool), None) => {
                sqlx::query_as("SELECT * FROM runs ORDER BY started_at DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(pool)
                    .await?
            }
        };
        rows.into_iter().map(Run::try_from).collect()
    }

    async fn cancel(&self, run_id: RunId) -> Result<(), RepoError> {
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query("UPDATE runs SET cancelled = true WHERE id = $1").bind(run_id.0).execute(pool).await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query("UPDATE runs SET cancelled = true WHERE id = ?")
                    .bind(run_id.0.to_string())
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn entities_for_run(&self, run_id: RunId) -> Result<Vec<RunEntity>, RepoError> {
        let rows: Vec<RunEntityRow> = match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query_as(
                    "SELECT run_id, pipeline_name, source_name, entity_class, status, mrn, error_message \
                     FROM run_entities WHERE run_id = $1 ORDER BY created_at",
                )
                .bind(run_id.0)
                .fetch_all(pool)
                .await?
            }
            DbPool::Sqlite(pool) => {
                sqlx::query_as(
                    "SELECT run_id, pipeline_name, source_name, entity_class, status, mrn, error_message \
                     FROM run_entities WHERE run_id = ? ORDER BY created_at",
                )
                .bind(run_id.0.to_string())
                .fetch_all(pool)
                .await?
            }
        };
        rows.into_iter().map(RunEntity::try_from).collect()
    }
}

/// In-memory fake driving unit tests of the claim protocol, stale-run
/// sweep, and batch-ingest idempotence without a live connection.
pub struct InMemoryRunRepo {
    runs: tokio::sync::Mutex<BTreeMap<Uuid, Run>>,
    entities: tokio::sync::Mutex<Vec<RunEntity>>,
}

impl InMemoryRunRepo {
    pub fn new() -> Self {
        Self {
            runs: tokio::sync::Mutex::new(BTreeMap::new()),
            entities: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn entities(&self) -> Vec<RunEntity> {
        self.entities.lock().await.clone()
    }
}

impl Default for InMemoryRunRepo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunRepo for InMemoryRunRepo {
    async fn start_run(&self, pipeline: &str, source: &str, now: DateTime<Utc>) -> Result<Run, RepoError> {
        let run = Run {
            id: RunId::new_v4(),
            pipeline_name: pipeline.to_string(),
            source_name: source.to_string(),
            status: RunStatus::Running,
            started_at: now,
            ended_at: None,
            summary: RunSummary::default(),
            error_message: None,
            cancelled: false,
            updated_at: now,
        };
        self.runs.lock().await.insert(run.id.0, run.clone());
        Ok(run)
    }

    async fn get(&self, run_id: RunId) -> Result<Option<Run>, RepoError> {
        Ok(self.runs.lock().await.get(&run_id.0).cloned())
    }

    async fn complete_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        summary: RunSummary,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        let mut runs = self.runs.lock().await;
        let run = runs.get_mut(&run_id.0).ok_or(RepoError::NotFound)?;
        if run.status.is_terminal() {
            return Err(RepoError::Conflict("run already in a terminal state".to_string()));
        }
        run.status = status;
        run.ended_at = Some(now);
        run.summary = summary;
        run.error_message = error;
        run.updated_at = now;
        Ok(())
    }

    async fn touch(&self, run_id: RunId, now: DateTime<Utc>) -> Result<(), RepoError> {
        if let Some(run) = self.runs.lock().await.get_mut(&run_id.0) {
            run.updated_at = now;
        }
        Ok(())
    }

    async fn accumulate_summary(&self, run_id: RunId, delta: RunSummary) -> Result<(), RepoError> {
        if let Some(run) = self.runs.lock().await.get_mut(&run_id.0) {
            run.summary.created += delta.created;
            run.summary.updated += delta.updated;
            run.summary.deleted += delta.deleted;
            run.summary.failed += delta.failed;
        }
        Ok(())
    }

    async fn record_entity(&self, entity: RunEntity) -> Result<(), RepoError> {
        let mut entities = self.entities.lock().await;
        if let Some(existing) = entities.iter_mut().find(|e| {
            e.run_id == entity.run_id
                && e.pipeline_name == entity.pipeline_name
                && e.source_name == entity.source_name
                && e.mrn == entity.mrn
                && e.entity_class == entity.entity_class
        }) {
            *existing = entity;
        } else {
            entities.push(entity);
        }
        Ok(())
    }

    async fn cleanup_stale_runs(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64, RepoError> {
        let mut count = 0u64;
        for run in self.runs.lock().await.values_mut() {
            if run.status == RunStatus::Running && run.updated_at < cutoff {
                run.status = RunStatus::Failed;
                run.ended_at = Some(now);
                run.error_message = Some("stale run swept".to_string());
                run.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list_recent(&self, pipeline: Option<&str>, limit: u32) -> Result<Vec<Run>, RepoError> {
        let mut runs: Vec<Run> = self
            .runs
            .lock()
            .await
            .values()
            .filter(|r| pipeline.map(|p| r.pipeline_name == p).unwrap_or(true))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn cancel(&self, run_id: RunId) -> Result<(), RepoError> {
        if let Some(run) = self.runs.lock().await.get_mut(&run_id.0) {
            run.cancelled = true;
        }
        Ok(())
    }

    async fn entities_for_run(&self, run_id: RunId) -> Result<Vec<RunEntity>, RepoError> {
        Ok(self.entities.lock().await.iter().filter(|e| e.run_id == run_id).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_run_rejects_second_write() {
        let repo = InMemoryRunRepo::new();
        let run = repo.start_run("kafka-pipeline", "prod", Utc::now()).await.unwrap();
        repo.complete_run(run.id, RunStatus::Completed, RunSummary::default(), None, Utc::now())
            .await
            .unwrap();
        let second = repo
            .complete_run(run.id, RunStatus::Failed, RunSummary::default(), None, Utc::now())
            .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn cleanup_stale_runs_only_flips_old_running_rows() {
        let repo = InMemoryRunRepo::new();
        let now = Utc::now();
        let stale = repo.start_run("p", "s", now - chrono::Duration::hours(2)).await.unwrap();
        let fresh = repo.start_run("p", "s2", now).await.unwrap();

        let swept = repo
            .cleanup_stale_runs(now - chrono::Duration::hours(1), now)
            .await
            .unwrap();
        assert_eq!(swept, 1);
        assert_eq!(repo.get(stale.id).await.unwrap().unwrap().status, RunStatus::Failed);
        assert_eq!(repo.get(fresh.id).await.unwrap().unwrap().status, RunStatus::Running);
    }

    #[tokio::test]
    async fn cancel_sets_the_flag_without_changing_status() {
        let repo = InMemoryRunRepo::new();
        let run = repo.start_run("p", "s", Utc::now()).await.unwrap();

        repo.cancel(run.id).await.unwrap();

        let after = repo.get(run.id).await.unwrap().unwrap();
        assert!(after.cancelled);
        assert_eq!(after.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn entities_for_run_only_returns_matching_run() {
        let repo = InMemoryRunRepo::new();
        let run_a = repo.start_run("p", "s", Utc::now()).await.unwrap();
        let run_b = repo.start_run("p", "s", Utc::now()).await.unwrap();

        repo.record_entity(RunEntity {
            run_id: run_a.id,
            pipeline_name: "p".to_string(),
            source_name: "s".to_string(),
            entity_class: EntityClass::Asset,
            status: EntityStatus::Created,
            mrn: "mrn://table/warehouse/orders".to_string(),
            error_message: None,
        })
        .await
        .unwrap();
        repo.record_entity(RunEntity {
            run_id: run_b.id,
            pipeline_name: "p".to_string(),
            source_name: "s".to_string(),
            entity_class: EntityClass::Asset,
            status: EntityStatus::Created,
            mrn: "mrn://table/warehouse/customers".to_string(),
            error_message: None,
        })
        .await
        .unwrap();

        let entities = repo.entities_for_run(run_a.id).await.unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].mrn, "mrn://table/warehouse/orders");
    }

    #[tokio::test]
    async fn list_recent_filters_by_pipeline_and_orders_newest_first() {
        let repo = InMemoryRunRepo::new();
        let now = Utc::now();
        repo.start_run("p1", "s", now - chrono::Duration::seconds(10)).await.unwrap();
        let newest = repo.start_run("p1", "s", now).await.unwrap();
        repo.start_run("p2", "s", now).await.unwrap();

        let recent = repo.list_recent(Some("p1"), 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, newest.id);
    }
}
