//! Batch-ingest transaction orchestration (spec.md §4.D) — turns one
//! plugin submission into committed assets, lineage edges,
//! documentation, statistics, and `RunEntity` audit rows, then fans the
//! resulting asset changes out to observers.
//!
//! Steps 2-6 below each call into their own repository, rather than a
//! single `sqlx::Transaction` threaded through the whole batch: the
//! repo traits in this workspace take a pool, not a generic executor,
//! so a write failing partway leaves earlier writes in this batch
//! committed (see DESIGN.md's open design decisions). Re-running a
//! schedule is always safe regardless, since step 2 is idempotent and
//! steps 3-5 are upserts.

use crate::model::{
    BatchItemResult, EntityClass, EntityStatus, IngestBatch, Run, RunEntity, RunStatus, RunSummary,
};
use crate::repo::{ArtifactRepo, RunRepo};
use chrono::Utc;
use marmot_assets::{AssetChangeKind, AssetService};
use marmot_common::ids::{Mrn, RunId};
use marmot_db::RepoError;
use std::sync::Arc;
use tracing::warn;

pub struct RunService {
    runs: Arc<dyn RunRepo>,
    assets: Arc<AssetService>,
    artifacts: Arc<dyn ArtifactRepo>,
}

impl RunService {
    pub fn new(runs: Arc<dyn RunRepo>, assets: Arc<AssetService>, artifacts: Arc<dyn ArtifactRepo>) -> Self {
        Self { runs, assets, artifacts }
    }

    pub async fn start_run(&self, pipeline: &str, source: &str) -> Result<Run, RepoError> {
        self.runs.start_run(pipeline, source, Utc::now()).await
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, RepoError> {
        self.runs.get(run_id).await
    }

    /// Runs the §4.D batch transaction for one plugin submission and
    /// returns a per-item outcome for the caller.
    pub async fn batch_create(
        &self,
        run_id: RunId,
        pipeline: &str,
        source: &str,
        batch: IngestBatch,
    ) -> Result<Vec<BatchItemResult>, RepoError> {
        let now = Utc::now();
        let mut results = Vec::with_capacity(batch.assets.len());
        let mut summary = RunSummary::default();
        let mut batch_mrns = std::collections::BTreeSet::new();

        // Step 2: upsert by MRN.
        for input in batch.assets {
            let mrn = Mrn::compute(&input.asset_type, &input.primary_provider, &input.name);
            batch_mrns.insert(mrn.0.clone());

            match self.assets.upsert(input, pipeline, source, now).await {
                Ok(Some(change)) => {
                    let status = match change.kind {
                        AssetChangeKind::Created => EntityStatus::Created,
                        AssetChangeKind::Updated => EntityStatus::Updated,
                        AssetChangeKind::Deleted => EntityStatus::Deleted,
                    };
                    self.record(run_id, pipeline, source, EntityClass::Asset, status.clone(), &mrn.0, None)
                        .await?;
                    match status {
                        EntityStatus::Created => summary.created += 1,
                        EntityStatus::Updated => summary.updated += 1,
                        _ => {}
                    }
                    self.assets.notify_observers(&change).await;
                    results.push(BatchItemResult { mrn: mrn.0, status, error_message: None });
                }
                Ok(None) => {
                    // Idempotent repeat: no RunEntity, no summary bump, no
                    // observer dispatch (nothing changed to observe).
                    results.push(BatchItemResult {
                        mrn: mrn.0,
                        status: EntityStatus::Unchanged,
                        error_message: None,
                    });
                }
                Err(err) => {
                    warn!(mrn = %mrn, error = %err, "asset upsert failed");
                    summary.failed += 1;
                    self.record(
                        run_id,
                        pipeline,
                        source,
                        EntityClass::Asset,
                        EntityStatus::Failed,
                        &mrn.0,
                        Some(err.to_string()),
                    )
                    .await?;
                    results.push(BatchItemResult {
                        mrn: mrn.0,
                        status: EntityStatus::Failed,
                        error_message: Some(err.to_string()),
                    });
                }
            }
        }

        // Step 3: lineage, stubbing out either endpoint when it has
        // never been reported as a real asset.
        for edge in batch.lineage {
            let source_mrn = Mrn::compute(&edge.source_asset_type, &edge.source_primary_provider, &edge.source_name);
            let target_mrn = Mrn::compute(&edge.target_asset_type, &edge.target_primary_provider, &edge.target_name);
            self.assets.ensure_stub(&source_mrn, &edge.source_asset_type, now).await?;
            self.assets.ensure_stub(&target_mrn, &edge.target_asset_type, now).await?;
            if let Err(err) = self.artifacts.upsert_lineage_edge(&source_mrn.0, &target_mrn.0, &edge.edge_type).await {
                warn!(source = %source_mrn, target = %target_mrn, error = %err, "lineage edge upsert failed");
                summary.failed += 1;
                continue;
            }
            self.record(
                run_id,
                pipeline,
                source,
                EntityClass::Lineage,
                EntityStatus::Updated,
                &format!("{}->{}", source_mrn.0, target_mrn.0),
                None,
            )
            .await?;
            summary.updated += 1;
        }

        // Step 4: documentation, keyed by (asset mrn, doc_type).
        for doc in batch.documentation {
            let mrn = Mrn::compute(&doc.asset_asset_type, &doc.asset_primary_provider, &doc.asset_name);
            if let Err(err) = self.artifacts.upsert_documentation(&mrn.0, &doc.doc_type, &doc.content, now).await {
                warn!(mrn = %mrn, error = %err, "documentation upsert failed");
                summary.failed += 1;
                continue;
            }
            self.record(run_id, pipeline, source, EntityClass::Documentation, EntityStatus::Updated, &mrn.0, None)
                .await?;
            summary.updated += 1;
        }

        // Step 5: statistics, always appended rather than diffed.
        for stat in batch.statistics {
            let mrn = Mrn::compute(&stat.asset_asset_type, &stat.asset_primary_provider, &stat.asset_name);
            if let Err(err) = self.artifacts.append_statistic(&mrn.0, &stat.metric, stat.value, now).await {
                warn!(mrn = %mrn, error = %err, "statistic append failed");
                summary.failed += 1;
                continue;
            }
            self.record(run_id, pipeline, source, EntityClass::Statistic, EntityStatus::Created, &mrn.0, None)
                .await?;
            summary.created += 1;
        }

        // Step 6: stale reclamation — anything this (pipeline, source)
        // produced before but did not report this time.
        let previously_produced = self.assets.mrns_produced_by(pipeline, source).await?;
        for stale_mrn in previously_produced.difference(&batch_mrns) {
            let mrn = Mrn(stale_mrn.clone());
            if let Some(change) = self.assets.reclaim(&mrn, pipeline, source, now).await? {
                let status = match change.kind {
                    AssetChangeKind::Deleted => EntityStatus::Deleted,
                    _ => EntityStatus::Updated,
                };
                self.record(run_id, pipeline, source, EntityClass::Asset, status.clone(), stale_mrn, None)
                    .await?;
                match status {
                    EntityStatus::Deleted => summary.deleted += 1,
                    _ => summary.updated += 1,
                }
                self.assets.notify_observers(&change).await;
            }
        }

        self.runs.touch(run_id, Utc::now()).await?;
        self.runs.accumulate_summary(run_id, summary).await?;
        Ok(results)
    }

    pub async fn complete_run(&self, run_id: RunId, status: RunStatus, error: Option<String>) -> Result<(), RepoError> {
        let run = self.runs.get(run_id).await?.ok_or(RepoError::NotFound)?;
        self.runs.complete_run(run_id, status, run.summary, error, Utc::now()).await
    }

    /// Deletes every asset this pipeline has ever produced — invoked
    /// when a pipeline definition itself is removed, not on a per-run
    /// basis.
    pub async fn destroy_pipeline(&self, pipeline: &str) -> Result<u64, RepoError> {
        self.assets.delete_by_pipeline(pipeline).await
    }

    pub async fn cleanup_stale_runs(&self, cutoff: chrono::DateTime<Utc>) -> Result<u64, RepoError> {
        self.runs.cleanup_stale_runs(cutoff, Utc::now()).await
    }

    pub async fn list_recent(&self, pipeline: Option<&str>, limit: u32) -> Result<Vec<Run>, RepoError> {
        self.runs.list_recent(pipeline, limit).await
    }

    pub async fn cancel_run(&self, run_id: RunId) -> Result<(), RepoError> {
        self.runs.cancel(run_id).await
    }

    pub async fn entities_for_run(&self, run_id: RunId) -> Result<Vec<RunEntity>, RepoError> {
        self.runs.entities_for_run(run_id).await
    }

    async fn record(
        &self,
        run_id: RunId,
        pipeline: &str,
        source: &str,
        class: EntityClass,
        status: EntityStatus,
        mrn: &str,
        error_message: Option<String>,
    ) -> Result<(), RepoError> {
        self.runs
            .record_entity(RunEntity {
                run_id,
                pipeline_name: pipeline.to_string(),
                source_name: source.to_string(),
                entity_class: class,
                status,
                mrn: mrn.to_string(),
                error_message,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{InMemoryArtifactRepo, InMemoryRunRepo};
    use marmot_assets::{AssetInput, InMemoryAssetRepo};

    fn asset_input(name: &str) -> AssetInput {
        AssetInput {
            asset_type: "Topic".to_string(),
            primary_provider: "Kafka".to_string(),
            name: name.to_string(),
            providers: vec!["kafka".to_string()],
            description: "orders topic".to_string(),
            schema: None,
            tags: vec![],
            sources: vec![],
            external_links: vec![],
            metadata: Default::default(),
        }
    }

    fn service() -> RunService {
        let assets = Arc::new(AssetService::new(Arc::new(InMemoryAssetRepo::new())));
        RunService::new(Arc::new(InMemoryRunRepo::new()), assets, Arc::new(InMemoryArtifactRepo::new()))
    }

    #[tokio::test]
    async fn first_batch_creates_assets_and_bumps_summary() {
        let svc = service();
        let run = svc.start_run("kafka-pipeline", "prod").await.unwrap();
        let batch = IngestBatch {
            assets: vec![asset_input("orders.created"), asset_input("orders.updated")],
            lineage: vec![],
            documentation: vec![],
            statistics: vec![],
        };
        let results = svc.batch_create(run.id, "kafka-pipeline", "prod", batch).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == EntityStatus::Created));

        let reloaded = svc.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(reloaded.summary.created, 2);
    }

    #[tokio::test]
    async fn repeat_batch_is_idempotent_and_records_nothing_new() {
        let svc = service();
        let run = svc.start_run("kafka-pipeline", "prod").await.unwrap();
        let batch = || IngestBatch {
            assets: vec![asset_input("orders.created")],
            lineage: vec![],
            documentation: vec![],
            statistics: vec![],
        };
        svc.batch_create(run.id, "kafka-pipeline", "prod", batch()).await.unwrap();
        let second = svc.batch_create(run.id, "kafka-pipeline", "prod", batch()).await.unwrap();

        assert_eq!(second[0].status, EntityStatus::Unchanged);
        let reloaded = svc.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(reloaded.summary.created, 1, "second identical batch must not bump counters");
    }

    #[tokio::test]
    async fn dropped_asset_is_reclaimed_on_next_batch() {
        let svc = service();
        let run = svc.start_run("kafka-pipeline", "prod").await.unwrap();
        let first = IngestBatch {
            assets: vec![asset_input("orders.created"), asset_input("orders.cancelled")],
            lineage: vec![],
            documentation: vec![],
            statistics: vec![],
        };
        svc.batch_create(run.id, "kafka-pipeline", "prod", first).await.unwrap();

        let second = IngestBatch {
            assets: vec![asset_input("orders.created")],
            lineage: vec![],
            documentation: vec![],
            statistics: vec![],
        };
        svc.batch_create(run.id, "kafka-pipeline", "prod", second).await.unwrap();

        let mrn = Mrn::compute("Topic", "Kafka", "orders.cancelled");
        let asset = svc.assets.get_by_mrn(&mrn).await.unwrap();
        assert!(asset.is_none() || asset.unwrap().is_stub, "asset no longer produced should be deleted or demoted");
    }
}
