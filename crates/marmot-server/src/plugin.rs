//! The concrete transport a real plugin uses to receive `(schedule,
//! run_id)` and report back assets/lineage/documentation/statistics
//! (subprocess, gRPC, wasm, ...) is outside this workspace's scope —
//! spec.md frames the contract purely in terms of
//! `run_service.batch_create` calls. This no-op executor demonstrates
//! the scheduler-to-run-service wiring; a deployment wires its own
//! `PluginExecutor` in its place.

use async_trait::async_trait;
use marmot_common::ids::RunId;
use marmot_ingest::model::{IngestBatch, Schedule};
use marmot_ingest::PluginExecutor;

pub struct NoopPluginExecutor;

#[async_trait]
impl PluginExecutor for NoopPluginExecutor {
    async fn execute(&self, _schedule: &Schedule, _run_id: RunId) -> anyhow::Result<IngestBatch> {
        Ok(IngestBatch {
            assets: vec![],
            lineage: vec![],
            documentation: vec![],
            statistics: vec![],
        })
    }
}
