use crate::model::{Asset, ProducedBy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marmot_common::ids::{AssetId, Mrn};
use marmot_db::pool::DbPool;
use marmot_db::RepoError;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Row shape as stored — separate from [`Asset`] because several columns
/// are JSON-as-text on SQLite and `jsonb` on Postgres, and because the
/// set-typed fields are stored as sorted JSON arrays, not native arrays.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct AssetRow {
    pub id: Uuid,
    pub mrn: String,
    pub name: String,
    pub asset_type: String,
    pub providers: String,
    pub description: String,
    pub user_description: Option<String>,
    pub schema: Option<Value>,
    pub tags: String,
    pub sources: String,
    pub external_links: Value,
    pub metadata: Value,
    pub user_metadata_keys: String,
    pub owners: Value,
    pub is_stub: bool,
    pub produced_by: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<AssetRow> for Asset {
    type Error = RepoError;

    fn try_from(row: AssetRow) -> Result<Self, Self::Error> {
        let parse_set = |s: &str| -> Result<BTreeSet<String>, RepoError> {
            Ok(serde_json::from_str::<Vec<String>>(s)
                .map_err(|e| RepoError::Corrupt(e.to_string()))?
                .into_iter()
                .collect())
        };
        Ok(Asset {
            id: AssetId(row.id),
            mrn: Mrn(row.mrn),
            name: row.name,
            asset_type: row.asset_type,
            providers: parse_set(&row.providers)?,
            description: row.description,
            user_description: row.user_description,
            schema: row.schema,
            tags: parse_set(&row.tags)?,
            sources: parse_set(&row.sources)?,
            external_links: serde_json::from_value(row.external_links)
                .map_err(|e| RepoError::Corrupt(e.to_string()))?,
            metadata: serde_json::from_value(row.metadata)
                .map_err(|e| RepoError::Corrupt(e.to_string()))?,
            user_metadata_keys: parse_set(&row.user_metadata_keys)?,
            owners: serde_json::from_value(row.owners).map_err(|e| RepoError::Corrupt(e.to_string()))?,
            is_stub: row.is_stub,
            produced_by: serde_json::from_value(row.produced_by)
                .map_err(|e| RepoError::Corrupt(e.to_string()))?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn sorted_json(values: &BTreeSet<String>) -> String {
    serde_json::to_string(&values.iter().collect::<Vec<_>>()).unwrap()
}

#[async_trait]
pub trait AssetRepo: Send + Sync {
    async fn get_by_mrn(&self, mrn: &Mrn) -> Result<Option<Asset>, RepoError>;
    async fn upsert(&self, asset: &Asset) -> Result<(), RepoError>;
    async fn delete(&self, mrn: &Mrn) -> Result<(), RepoError>;
    /// MRNs previously produced by `(pipeline, source)`, for stale
    /// reclamation (spec §4.D step 6).
    async fn mrns_produced_by(&self, pipeline: &str, source: &str) -> Result<BTreeSet<String>, RepoError>;
    async fn is_referenced_by_other_pipeline(
        &self,
        mrn: &Mrn,
        pipeline: &str,
        source: &str,
    ) -> Result<bool, RepoError>;
    async fn delete_by_pipeline(&self, pipeline: &str) -> Result<u64, RepoError>;
    /// Every non-stub asset, for full-corpus reconciliation passes
    /// (spec §4.H "Differential reconciliation") that can't rely on the
    /// `rule_targets` shortlist alone.
    async fn list_all(&self) -> Result<Vec<Asset>, RepoError>;
}

pub struct SqlAssetRepo {
    db: std::sync::Arc<DbPool>,
}

impl SqlAssetRepo {
    pub fn new(db: std::sync::Arc<DbPool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AssetRepo for SqlAssetRepo {
    async fn get_by_mrn(&self, mrn: &Mrn) -> Result<Option<Asset>, RepoError> {
        let row: Option<AssetRow> = match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query_as("SELECT * FROM assets WHERE mrn = $1")
                    .bind(&mrn.0)
                    .fetch_optional(pool)
                    .await?
            }
            DbPool::Sqlite(pool) => {
                sqlx::query_as("SELECT * FROM assets WHERE mrn = ?")
                    .bind(&mrn.0)
                    .fetch_optional(pool)
                    .await?
            }
        };
        row.map(Asset::try_from).transpose()
    }

    async fn upsert(&self, asset: &Asset) -> Result<(), RepoError> {
        let providers = sorted_json(&asset.providers);
        let tags = sorted_json(&asset.tags);
        let sources = sorted_json(&asset.sources);
        let user_metadata_keys = sorted_json(&asset.user_metadata_keys);
        let external_links = serde_json::to_value(&asset.external_links).unwrap();
        let metadata = serde_json::to_value(&asset.metadata).unwrap();
        let owners = serde_json::to_value(&asset.owners).unwrap();
        let produced_by = serde_json::to_value(&asset.produced_by).unwrap();

        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query(
                    r#"INSERT INTO assets (id, mrn, name, asset_type, providers, description,
                        user_description, schema, tags, sources, external_links, metadata,
                        user_metadata_keys, owners, is_stub, produced_by, created_at, updated_at)
                       VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18)
                       ON CONFLICT (mrn) DO UPDATE SET
                         name = EXCLUDED.name, asset_type = EXCLUDED.asset_type,
                         providers = EXCLUDED.providers, description = EXCLUDED.description,
                         user_description = EXCLUDED.user_description, schema = EXCLUDED.schema,
                         tags = EXCLUDED.tags, sources = EXCLUDED.sources,
                         external_links = EXCLUDED.external_links, metadata = EXCLUDED.metadata,
                         user_metadata_keys = EXCLUDED.user_metadata_keys, owners = EXCLUDED.owners,
                         is_stub = EXCLUDED.is_stub, produced_by = EXCLUDED.produced_by,
                         updated_at = EXCLUDED.updated_at"#,
                )
                .bind(asset.id.0)
                .bind(&asset.mrn.0)
                .bind(&asset.name)
                .bind(&asset.asset_type)
                .bind(providers)
                .bind(&asset.description)
                .bind(&asset.user_description)
                .bind(&asset.schema)
                .bind(tags)
                .bind(sources)
                .bind(external_links)
                .bind(metadata)
                .bind(user_metadata_keys)
                .bind(owners)
                .bind(asset.is_stub)
                .bind(produced_by)
                .bind(asset.created_at)
                .bind(asset.updated_at)
                .execute(pool)
                .await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query(
                    r#"INSERT INTO assets (id, mrn, name, asset_type, providers, description,
                        user_description, schema, tags, sources, external_links, metadata,
                        user_metadata_keys, owners, is_stub, produced_by, created_at, updated_at)
                       VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
                       ON CONFLICT (mrn) DO UPDATE SET
                         name = excluded.name, asset_type = excluded.asset_type,
                         providers = excluded.providers, description = excluded.description,
                         user_description = excluded.user_description, schema = excluded.schema,
                         tags = excluded.tags, sources = excluded.sources,
                         external_links = excluded.external_links, metadata = excluded.metadata,
                         user_metadata_keys = excluded.user_metadata_keys, owners = excluded.owners,
                         is_stub = excluded.is_stub, produced_by = excluded.produced_by,
                         updated_at = excluded.updated_at"#,
                )
                .bind(asset.id.0.to_string())
                .bind(&asset.mrn.0)
                .bind(&asset.name)
                .bind(&asset.asset_type)
                .bind(providers)
                .bind(&asset.description)
                .bind(&asset.user_description)
                .bind(&asset.schema)
                .bind(tags)
                .bind(sources)
                .bind(external_links.to_string())
                .bind(metadata.to_string())
                .bind(user_metadata_keys)
                .bind(owners.to_string())
                .bind(asset.is_stub)
                .bind(produced_by.to_string())
                .bind(asset.created_at)
                .bind(asset.updated_at)
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, mrn: &Mrn) -> Result<(), RepoError> {
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query("DELETE FROM assets WHERE mrn = $1")
                    .bind(&mrn.0)
                    .execute(pool)
                    .await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query("DELETE FROM assets WHERE mrn = ?")
                    .bind(&mrn.0)
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn mrns_produced_by(&self, pipeline: &str, source: &str) -> Result<BTreeSet<String>, RepoError> {
        let needle = serde_json::to_string(&ProducedBy {
            pipeline_name: pipeline.to_string(),
            source_name: source.to_string(),
        })
        .unwrap();
        // produced_by is stored as a JSON array; postgres/sqlite both get
        // a plain LIKE scan here rather than a jsonb containment operator
        // so the query stays portable across backends.
        let pattern = format!("%{}%", needle.trim_matches(|c| c == '{' || c == '}'));
        let rows: Vec<(String,)> = match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query_as("SELECT mrn FROM assets WHERE produced_by::text LIKE $1")
                    .bind(&pattern)
                    .fetch_all(pool)
                    .await?
            }
            DbPool::Sqlite(pool) => {
                sqlx::query_as("SELECT mrn FROM assets WHERE produced_by LIKE ?")
                    .bind(&pattern)
                    .fetch_all(pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(|(mrn,)| mrn).collect())
    }

    async fn is_referenced_by_other_pipeline(
        &self,
        mrn: &Mrn,
        pipeline: &str,
        source: &str,
    ) -> Result<bool, RepoError> {
        let asset = self.get_by_mrn(mrn).await?;
        Ok(match asset {
            Some(asset) => asset
                .produced_by
                .iter()
                .any(|p| !(p.pipeline_name == pipeline && p.source_name == source)),
            None => false,
        })
    }

    async fn delete_by_pipeline(&self, pipeline: &str) -> Result<u64, RepoError> {
        let mrns = self.mrns_produced_by(pipeline, "%").await.unwrap_or_default();
        let mut deleted = 0u64;
        for mrn in mrns {
            self.delete(&Mrn(mrn)).await?;
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn list_all(&self) -> Result<Vec<Asset>, RepoError> {
        let rows: Vec<AssetRow> = match self.db.as_ref() {
            DbPool::Postgres(pool) => sqlx::query_as("SELECT * FROM assets WHERE NOT is_stub").fetch_all(pool).await?,
            DbPool::Sqlite(pool) => sqlx::query_as("SELECT * FROM assets WHERE NOT is_stub").fetch_all(pool).await?,
        };
        rows.into_iter().map(Asset::try_from).collect()
    }
}

/// In-memory stand-in used by service-level unit tests; never touches a
/// live connection, matching the "no toolchain" testing strategy for the
/// upsert/diff/reclamation logic that otherwise needs a real database.
pub struct InMemoryAssetRepo {
    rows: tokio::sync::Mutex<BTreeMap<String, Asset>>,
}

impl InMemoryAssetRepo {
    pub fn new() -> Self {
        Self {
            rows: tokio::sync::Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for InMemoryAssetRepo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssetRepo for InMemoryAssetRepo {
    async fn get_by_mrn(&self, mrn: &Mrn) -> Result<Option<Asset>, RepoError> {
        Ok(self.rows.lock().await.get(&mrn.0).cloned())
    }

    async fn upsert(&self, asset: &Asset) -> Result<(), RepoError> {
        self.rows.lock().await.insert(asset.mrn.0.clone(), asset.clone());
        Ok(())
    }

    async fn delete(&self, mrn: &Mrn) -> Result<(), RepoError> {
        self.rows.lock().await.remove(&mrn.0);
        Ok(())
    }

    async fn mrns_produced_by(&self, pipeline: &str, source: &str) -> Result<BTreeSet<String>, RepoError> {
        Ok(self
            .rows
            .lock()
            .await
            .values()
            .filter(|a| {
                a.produced_by
                    .iter()
                    .any(|p| p.pipeline_name == pipeline && p.source_name == source)
            })
            .map(|a| a.mrn.0.clone())
            .collect())
    }

    async fn is_referenced_by_other_pipeline(
        &self,
        mrn: &Mrn,
        pipeline: &str,
        source: &str,
    ) -> Result<bool, RepoError> {
        Ok(self
            .rows
            .lock()
            .await
            .get(&mrn.0)
            .map(|a| {
                a.produced_by
                    .iter()
                    .any(|p| !(p.pipeline_name == pipeline && p.source_name == source))
            })
            .unwrap_or(false))
    }

    async fn delete_by_pipeline(&self, pipeline: &str) -> Result<u64, RepoError> {
        let mut rows = self.rows.lock().await;
        let to_delete: Vec<String> = rows
            .values()
            .filter(|a| a.produced_by.iter().any(|p| p.pipeline_name == pipeline))
            .map(|a| a.mrn.0.clone())
            .collect();
        for mrn in &to_delete {
            rows.remove(mrn);
        }
        Ok(to_delete.len() as u64)
    }

    async fn list_all(&self) -> Result<Vec<Asset>, RepoError> {
        Ok(self.rows.lock().await.values().filter(|a| !a.is_stub).cloned().collect())
    }
}
