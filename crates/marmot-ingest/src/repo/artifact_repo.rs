//! Lineage edges, documentation, and statistics — the smaller artifact
//! kinds a batch can carry alongside assets (spec.md §4.D steps 3-5).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marmot_db::pool::DbPool;
use marmot_db::RepoError;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait ArtifactRepo: Send + Sync {
    async fn upsert_lineage_edge(&self, source_mrn: &str, target_mrn: &str, edge_type: &str) -> Result<(), RepoError>;
    async fn upsert_documentation(
        &self,
        asset_mrn: &str,
        doc_type: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepoError>;
    async fn append_statistic(&self, asset_mrn: &str, metric: &str, value: f64, now: DateTime<Utc>) -> Result<(), RepoError>;
}

pub struct SqlArtifactRepo {
    db: Arc<DbPool>,
}

impl SqlArtifactRepo {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ArtifactRepo for SqlArtifactRepo {
    async fn upsert_lineage_edge(&self, source_mrn: &str, target_mrn: &str, edge_type: &str) -> Result<(), RepoError> {
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO lineage_edges (id, source_mrn, target_mrn, edge_type) VALUES ($1,$2,$3,$4) \
                     ON CONFLICT (source_mrn, target_mrn, edge_type) DO NOTHING",
                )
                .bind(Uuid::new_v4())
                .bind(source_mrn)
                .bind(target_mrn)
                .bind(edge_type)
                .execute(pool)
                .await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO lineage_edges (id, source_mrn, target_mrn, edge_type) VALUES (?,?,?,?) \
                     ON CONFLICT (source_mrn, target_mrn, edge_type) DO NOTHING",
                )
                .bind(Uuid::new_v4().to_string())
                .bind(source_mrn)
                .bind(target_mrn)
                .bind(edge_type)
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn upsert_documentation(
        &self,
        asset_mrn: &str,
        doc_type: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO documentation (id, asset_mrn, doc_type, content, created_at, updated_at) \
                     VALUES ($1,$2,$3,$4,$5,$5) \
                     ON CONFLICT (asset_mrn, doc_type) DO UPDATE SET content = EXCLUDED.content, updated_at = EXCLUDED.updated_at",
                )
                .bind(Uuid::new_v4())
                .bind(asset_mrn)
                .bind(doc_type)
                .bind(content)
                .bind(now)
                .execute(pool)
                .await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO documentation (id, asset_mrn, doc_type, content, created_at, updated_at) \
                     VALUES (?,?,?,?,?,?) \
                     ON CONFLICT (asset_mrn, doc_type) DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at",
                )
                .bind(Uuid::new_v4().to_string())
                .bind(asset_mrn)
                .bind(doc_type)
                .bind(content)
                .bind(now)
                .bind(now)
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn append_statistic(&self, asset_mrn: &str, metric: &str, value: f64, now: DateTime<Utc>) -> Result<(), RepoError> {
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO asset_statistics (id, asset_mrn, metric, value, recorded_at) VALUES ($1,$2,$3,$4,$5)",
                )
                .bind(Uuid::new_v4())
                .bind(asset_mrn)
                .bind(metric)
                .bind(value)
                .bind(now)
                .execute(pool)
                .await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO asset_statistics (id, asset_mrn, metric, value, recorded_at) VALUES (?,?,?,?,?)",
                )
                .bind(Uuid::new_v4().to_string())
                .bind(asset_mrn)
                .bind(metric)
                .bind(value)
                .bind(now)
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryArtifactRepo {
    edges: tokio::sync::Mutex<BTreeSet<(String, String, String)>>,
    docs: tokio::sync::Mutex<std::collections::BTreeMap<(String, String), String>>,
    statistics: tokio::sync::Mutex<Vec<(String, String, f64)>>,
}

impl InMemoryArtifactRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn edge_count(&self) -> usize {
        self.edges.lock().await.len()
    }

    pub async fn statistic_count(&self) -> usize {
        self.statistics.lock().await.len()
    }
}

#[async_trait]
impl ArtifactRepo for InMemoryArtifactRepo {
    async fn upsert_lineage_edge(&self, source_mrn: &str, target_mrn: &str, edge_type: &str) -> Result<(), RepoError> {
        self.edges
            .lock()
            .await
            .insert((source_mrn.to_string(), target_mrn.to_string(), edge_type.to_string()));
        Ok(())
    }

    async fn upsert_documentation(
        &self,
        asset_mrn: &str,
        doc_type: &str,
        content: &str,
        _now: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        self.docs
            .lock()
            .await
            .insert((asset_mrn.to_string(), doc_type.to_string()), content.to_string());
        Ok(())
    }

    async fn append_statistic(&self, asset_mrn: &str, metric: &str, value: f64, _now: DateTime<Utc>) -> Result<(), RepoError> {
        self.statistics.lock().await.push((asset_mrn.to_string(), metric.to_string(), value));
        Ok(())
    }
}
