//! Schedule CRUD and the admin `/trigger` escape hatch (spec.md §6.1),
//! backed by [`ScheduleService`] — configs are encrypted at rest and
//! decrypted on read, never logged (see `marmot_common::crypto`).

use crate::api::ApiTags;
use crate::error::ApiError;
use chrono::{DateTime, Utc};
use marmot_common::ids::ScheduleId;
use marmot_ingest::{NewSchedule, Schedule, ScheduleService};
use poem_openapi::param::Path;
use poem_openapi::payload::Json;
use poem_openapi::{Object, OpenApi};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Clone, Object)]
pub struct NewScheduleRequest {
    pub name: String,
    pub plugin_id: String,
    pub pipeline_name: String,
    pub source_name: String,
    pub config: Value,
    pub cron_expression: String,
}

#[derive(Debug, Clone, Object)]
pub struct UpdateScheduleRequest {
    pub cron_expression: String,
    pub config: Value,
    pub enabled: bool,
}

/// Never includes `config` — it holds plugin secrets.
#[derive(Debug, Clone, Object)]
pub struct ScheduleDto {
    pub id: Uuid,
    pub name: String,
    pub plugin_id: String,
    pub pipeline_name: String,
    pub source_name: String,
    pub cron_expression: String,
    pub enabled: bool,
    pub next_fire_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Schedule> for ScheduleDto {
    fn from(value: Schedule) -> Self {
        ScheduleDto {
            id: value.id.0,
            name: value.name,
            plugin_id: value.plugin_id.0,
            pipeline_name: value.pipeline_name,
            source_name: value.source_name,
            cron_expression: value.cron_expression,
            enabled: value.enabled,
            next_fire_time: value.next_fire_time,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

pub struct SchedulesApi {
    schedules: Arc<ScheduleService>,
}

#[OpenApi(prefix_path = "/", tag = ApiTags::Schedules)]
impl SchedulesApi {
    pub fn new(schedules: Arc<ScheduleService>) -> Self {
        Self { schedules }
    }

    #[oai(path = "/ingestion/schedules", method = "post", operation_id = "create_schedule")]
    async fn create(&self, body: Json<NewScheduleRequest>) -> ApiResult<Json<ScheduleDto>> {
        let body = body.0;
        let schedule = self
            .schedules
            .create(NewSchedule {
                name: body.name,
                plugin_id: marmot_common::ids::PluginId(body.plugin_id),
                pipeline_name: body.pipeline_name,
                source_name: body.source_name,
                config: body.config,
                cron_expression: body.cron_expression,
            })
            .await?;
        Ok(Json(schedule.into()))
    }

    #[oai(path = "/ingestion/schedules", method = "get", operation_id = "list_schedules")]
    async fn list(&self) -> ApiResult<Json<Vec<ScheduleDto>>> {
        let schedules = self.schedules.list().await?;
        Ok(Json(schedules.into_iter().map(Into::into).collect()))
    }

    #[oai(path = "/ingestion/schedules/:id", method = "get", operation_id = "get_schedule")]
    async fn get(&self, id: Path<Uuid>) -> ApiResult<Json<ScheduleDto>> {
        let schedule = self.schedules.get(ScheduleId(id.0)).await?;
        match schedule {
            Some(schedule) => Ok(Json(schedule.into())),
            None => Err(ApiError::from(marmot_common::error::Error::NotFound(format!(
                "schedule {} not found",
                id.0
            )))),
        }
    }

    #[oai(path = "/ingestion/schedules/:id", method = "put", operation_id = "update_schedule")]
    async fn update(&self, id: Path<Uuid>, body: Json<UpdateScheduleRequest>) -> ApiResult<Json<ScheduleDto>> {
        let body = body.0;
        let schedule = self
            .schedules
            .update(ScheduleId(id.0), body.cron_expression, body.config, body.enabled)
            .await?;
        Ok(Json(schedule.into()))
    }

    #[oai(path = "/ingestion/schedules/:id", method = "delete", operation_id = "delete_schedule")]
    async fn delete(&self, id: Path<Uuid>) -> ApiResult<Json<()>> {
        self.schedules.delete(ScheduleId(id.0)).await?;
        Ok(Json(()))
    }

    /// Forces the next scheduler tick to pick this schedule up
    /// regardless of its stored `next_fire_time`.
    #[oai(path = "/ingestion/schedules/:id/trigger", method = "post", operation_id = "trigger_schedule")]
    async fn trigger(&self, id: Path<Uuid>) -> ApiResult<Json<()>> {
        self.schedules.trigger(ScheduleId(id.0)).await?;
        Ok(Json(()))
    }
}
