use chrono::{DateTime, Utc};
use marmot_common::ids::{PluginId, RunId, ScheduleId};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityClass {
    Asset,
    Lineage,
    Documentation,
    Statistic,
}

impl EntityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asset => "asset",
            Self::Lineage => "lineage",
            Self::Documentation => "documentation",
            Self::Statistic => "statistic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityStatus {
    Created,
    Updated,
    Deleted,
    Failed,
    /// Reported back to the caller when an asset's observable fields were
    /// unchanged by this ingest; never persisted as a `RunEntity` row.
    Unchanged,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
            Self::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunEntity {
    pub run_id: RunId,
    pub pipeline_name: String,
    pub source_name: String,
    pub entity_class: EntityClass,
    pub status: EntityStatus,
    pub mrn: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub created: u32,
    pub updated: u32,
    pub deleted: u32,
    pub failed: u32,
}

#[derive(Debug, Clone)]
pub struct Run {
    pub id: RunId,
    pub pipeline_name: String,
    pub source_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: RunSummary,
    pub error_message: Option<String>,
    pub cancelled: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Schedule {
    pub id: ScheduleId,
    pub name: String,
    pub plugin_id: PluginId,
    pub pipeline_name: String,
    pub source_name: String,
    /// Plugin configuration, already decrypted. Never logged.
    pub config: Value,
    pub cron_expression: String,
    pub enabled: bool,
    pub next_fire_time: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Raw asset/lineage/documentation/statistic fields a plugin reports for
/// one `batch_create` call, prior to canonicalization.
#[derive(Debug, Clone, Default)]
pub struct IngestBatch {
    pub assets: Vec<marmot_assets::AssetInput>,
    pub lineage: Vec<LineageInput>,
    pub documentation: Vec<DocumentationInput>,
    pub statistics: Vec<StatisticInput>,
}

pub struct LineageInput {
    pub source_asset_type: String,
    pub source_primary_provider: String,
    pub source_name: String,
    pub target_asset_type: String,
    pub target_primary_provider: String,
    pub target_name: String,
    pub edge_type: String,
}

pub struct DocumentationInput {
    pub asset_asset_type: String,
    pub asset_primary_provider: String,
    pub asset_name: String,
    pub doc_type: String,
    pub content: String,
}

pub struct StatisticInput {
    pub asset_asset_type: String,
    pub asset_primary_provider: String,
    pub asset_name: String,
    pub metric: String,
    pub value: f64,
}

/// Per-item outcome returned from `batch_create`, one per reported asset.
#[derive(Debug, Clone)]
pub struct BatchItemResult {
    pub mrn: String,
    pub status: EntityStatus,
    pub error_message: Option<String>,
}
