//! The run-lifecycle endpoints a plugin calls (spec.md §6.1):
//! `start_run` → one or more `batch_create`s → `complete_run`, plus the
//! admin sweep/purge endpoints and a read-only mirror of run state for
//! the CLI/dashboard.

use crate::api::ApiTags;
use crate::error::ApiError;
use chrono::{DateTime, Utc};
use marmot_assets::{AssetInput, ExternalLink};
use marmot_common::ids::RunId;
use marmot_ingest::model::{
    BatchItemResult, DocumentationInput, IngestBatch, LineageInput, Run, RunEntity, RunStatus,
    StatisticInput,
};
use marmot_ingest::RunService;
use poem_openapi::param::{Path, Query};
use poem_openapi::payload::Json;
use poem_openapi::{Object, OpenApi};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Clone, Object)]
pub struct ExternalLinkDto {
    pub name: String,
    pub icon: Option<String>,
    pub url: String,
}

impl From<ExternalLinkDto> for ExternalLink {
    fn from(value: ExternalLinkDto) -> Self {
        ExternalLink { name: value.name, icon: value.icon, url: value.url }
    }
}

#[derive(Debug, Clone, Object)]
pub struct AssetInputDto {
    pub asset_type: String,
    pub primary_provider: String,
    pub name: String,
    pub providers: Vec<String>,
    pub description: String,
    pub schema: Option<Value>,
    pub tags: Vec<String>,
    pub sources: Vec<String>,
    pub external_links: Vec<ExternalLinkDto>,
    pub metadata: BTreeMap<String, Value>,
}

impl From<AssetInputDto> for AssetInput {
    fn from(value: AssetInputDto) -> Self {
        AssetInput {
            asset_type: value.asset_type,
            primary_provider: value.primary_provider,
            name: value.name,
            providers: value.providers,
            description: value.description,
            schema: value.schema,
            tags: value.tags,
            sources: value.sources,
            external_links: value.external_links.into_iter().map(Into::into).collect(),
            metadata: value.metadata,
        }
    }
}

#[derive(Debug, Clone, Object)]
pub struct LineageInputDto {
    pub source_asset_type: String,
    pub source_primary_provider: String,
    pub source_name: String,
    pub target_asset_type: String,
    pub target_primary_provider: String,
    pub target_name: String,
    pub edge_type: String,
}

impl From<LineageInputDto> for LineageInput {
    fn from(value: LineageInputDto) -> Self {
        LineageInput {
            source_asset_type: value.source_asset_type,
            source_primary_provider: value.source_primary_provider,
            source_name: value.source_name,
            target_asset_type: value.target_asset_type,
            target_primary_provider: value.target_primary_provider,
            target_name: value.target_name,
            edge_type: value.edge_type,
        }
    }
}

#[derive(Debug, Clone, Object)]
pub struct DocumentationInputDto {
    pub asset_asset_type: String,
    pub asset_primary_provider: String,
    pub asset_name: String,
    pub doc_type: String,
    pub content: String,
}

impl From<DocumentationInputDto> for DocumentationInput {
    fn from(value: DocumentationInputDto) -> Self {
        DocumentationInput {
            asset_asset_type: value.asset_asset_type,
            asset_primary_provider: value.asset_primary_provider,
            asset_name: value.asset_name,
            doc_type: value.doc_type,
            content: value.content,
        }
    }
}

#[derive(Debug, Clone, Object)]
pub struct StatisticInputDto {
    pub asset_asset_type: String,
    pub asset_primary_provider: String,
    pub asset_name: String,
    pub metric: String,
    pub value: f64,
}

impl From<StatisticInputDto> for StatisticInput {
    fn from(value: StatisticInputDto) -> Self {
        StatisticInput {
            asset_asset_type: value.asset_asset_type,
            asset_primary_provider: value.asset_primary_provider,
            asset_name: value.asset_name,
            metric: value.metric,
            value: value.value,
        }
    }
}

#[derive(Debug, Clone, Object)]
pub struct StartRunRequest {
    pub pipeline_name: String,
    pub source_name: String,
    /// Accepted for parity with the plugin contract; the scheduler is
    /// what actually supplies a schedule's decrypted config to a plugin,
    /// not this endpoint, so it's not persisted here.
    pub config: Option<Value>,
}

#[derive(Debug, Clone, Object)]
pub struct StartRunResponse {
    pub run_id: Uuid,
}

#[derive(Debug, Clone, Object)]
pub struct BatchRequest {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub source_name: String,
    pub assets: Vec<AssetInputDto>,
    pub lineage: Vec<LineageInputDto>,
    pub documentation: Vec<DocumentationInputDto>,
    pub statistics: Vec<StatisticInputDto>,
}

#[derive(Debug, Clone, Object)]
pub struct BatchItemResultDto {
    pub mrn: String,
    pub status: String,
    pub error_message: Option<String>,
}

impl From<BatchItemResult> for BatchItemResultDto {
    fn from(value: BatchItemResult) -> Self {
        BatchItemResultDto {
            mrn: value.mrn,
            status: value.status.as_str().to_string(),
            error_message: value.error_message,
        }
    }
}

#[derive(Debug, Clone, Object)]
pub struct BatchResponse {
    pub results: Vec<BatchItemResultDto>,
}

#[derive(Debug, Clone, Object)]
pub struct CompleteRunRequest {
    pub run_id: Uuid,
    pub status: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Object)]
pub struct CleanupResponse {
    pub swept: u64,
}

#[derive(Debug, Clone, Object)]
pub struct DestroyPipelineResponse {
    pub removed: u64,
}

#[derive(Debug, Clone, Object)]
pub struct RunDto {
    pub id: Uuid,
    pub pipeline_name: String,
    pub source_name: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created: u32,
    pub updated: u32,
    pub deleted: u32,
    pub failed: u32,
    pub error_message: Option<String>,
    pub cancelled: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<Run> for RunDto {
    fn from(value: Run) -> Self {
        RunDto {
            id: value.id.0,
            pipeline_name: value.pipeline_name,
            source_name: value.source_name,
            status: value.status.as_str().to_string(),
            started_at: value.started_at,
            ended_at: value.ended_at,
            created: value.summary.created,
            updated: value.summary.updated,
            deleted: value.summary.deleted,
            failed: value.summary.failed,
            error_message: value.error_message,
            cancelled: value.cancelled,
            updated_at: value.updated_at,
        }
    }
}

#[derive(Debug, Clone, Object)]
pub struct RunEntityDto {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub source_name: String,
    pub entity_class: String,
    pub status: String,
    pub mrn: String,
    pub error_message: Option<String>,
}

impl From<RunEntity> for RunEntityDto {
    fn from(value: RunEntity) -> Self {
        RunEntityDto {
            run_id: value.run_id.0,
            pipeline_name: value.pipeline_name,
            source_name: value.source_name,
            entity_class: value.entity_class.as_str().to_string(),
            status: value.status.as_str().to_string(),
            mrn: value.mrn,
            error_message: value.error_message,
        }
    }
}

pub struct RunsApi {
    runs: Arc<RunService>,
    stale_run_timeout: Duration,
}

#[OpenApi(prefix_path = "/", tag = ApiTags::Runs)]
impl RunsApi {
    pub fn new(runs: Arc<RunService>, stale_run_timeout: Duration) -> Self {
        Self { runs, stale_run_timeout }
    }

    /// Starts a run for a pipeline/source pair, returning the run id a
    /// plugin threads through its subsequent `batch_create` calls.
    #[oai(path = "/runs/start", method = "post", operation_id = "start_run")]
    async fn start_run(&self, body: Json<StartRunRequest>) -> ApiResult<Json<StartRunResponse>> {
        let run = self.runs.start_run(&body.0.pipeline_name, &body.0.source_name).await?;
        Ok(Json(StartRunResponse { run_id: run.id.0 }))
    }

    /// Runs the batch-ingest transaction (spec.md §4.D) for one plugin
    /// submission, returning a per-item result regardless of whether
    /// individual items failed — the batch itself only errors if the
    /// transaction failed outright.
    #[oai(path = "/runs/assets/batch", method = "post", operation_id = "batch_create")]
    async fn batch_create(&self, body: Json<BatchRequest>) -> ApiResult<Json<BatchResponse>> {
        let body = body.0;
        let batch = IngestBatch {
            assets: body.assets.into_iter().map(Into::into).collect(),
            lineage: body.lineage.into_iter().map(Into::into).collect(),
            documentation: body.documentation.into_iter().map(Into::into).collect(),
            statistics: body.statistics.into_iter().map(Into::into).collect(),
        };
        let results = self
            .runs
            .batch_create(RunId(body.run_id), &body.pipeline_name, &body.source_name, batch)
            .await?;
        Ok(Json(BatchResponse { results: results.into_iter().map(Into::into).collect() }))
    }

    /// Marks a run terminal. Its error text, if any, is recorded on the
    /// row for later inspection (spec.md §7).
    #[oai(path = "/runs/complete", method = "post", operation_id = "complete_run")]
    async fn complete_run(&self, body: Json<CompleteRunRequest>) -> ApiResult<Json<()>> {
        let body = body.0;
        let status = RunStatus::parse(&body.status)
            .ok_or_else(|| ApiError::from(marmot_common::error::Error::Validation(format!("unknown run status '{}'", body.status))))?;
        self.runs.complete_run(RunId(body.run_id), status, body.error).await?;
        Ok(Json(()))
    }

    /// Admin sweep: reclaims runs left `Running` past the configured
    /// stale-run timeout.
    #[oai(path = "/runs/cleanup", method = "post", operation_id = "cleanup_stale_runs")]
    async fn cleanup(&self) -> ApiResult<Json<CleanupResponse>> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.stale_run_timeout).unwrap_or_default();
        let swept = self.runs.cleanup_stale_runs(cutoff).await?;
        Ok(Json(CleanupResponse { swept }))
    }

    /// Purges every run, run-entity, and asset ever produced by a
    /// pipeline.
    #[oai(path = "/pipelines/:name", method = "delete", operation_id = "destroy_pipeline")]
    async fn destroy_pipeline(&self, name: Path<String>) -> ApiResult<Json<DestroyPipelineResponse>> {
        let removed = self.runs.destroy_pipeline(&name.0).await?;
        Ok(Json(DestroyPipelineResponse { removed }))
    }

    #[oai(path = "/ingestion/runs", method = "get", operation_id = "list_runs")]
    async fn list_runs(
        &self,
        pipeline: Query<Option<String>>,
        limit: Query<Option<u32>>,
    ) -> ApiResult<Json<Vec<RunDto>>> {
        let runs = self.runs.list_recent(pipeline.0.as_deref(), limit.0.unwrap_or(50)).await?;
        Ok(Json(runs.into_iter().map(Into::into).collect()))
    }

    #[oai(path = "/ingestion/runs/:id", method = "get", operation_id = "get_run")]
    async fn get_run(&self, id: Path<Uuid>) -> ApiResult<Json<RunDto>> {
        let run = self.runs.get_run(RunId(id.0)).await?;
        match run {
            Some(run) => Ok(Json(run.into())),
            None => Err(ApiError::from(marmot_common::error::Error::NotFound(format!("run {} not found", id.0)))),
        }
    }

    #[oai(path = "/ingestion/runs/:id/entities", method = "get", operation_id = "run_entities")]
    async fn run_entities(&self, id: Path<Uuid>) -> ApiResult<Json<Vec<RunEntityDto>>> {
        let entities = self.runs.entities_for_run(RunId(id.0)).await?;
        Ok(Json(entities.into_iter().map(Into::into).collect()))
    }

    #[oai(path = "/ingestion/runs/:id/cancel", method = "post", operation_id = "cancel_run")]
    async fn cancel_run(&self, id: Path<Uuid>) -> ApiResult<Json<()>> {
        self.runs.cancel_run(RunId(id.0)).await?;
        Ok(Json(()))
    }
}
