//! Leader-less cron dispatch (spec.md §4.E). Every node in the cluster
//! runs this same loop; `ScheduleRepo::try_claim`'s conditional update is
//! what keeps two nodes from running the same schedule concurrently, not
//! any notion of a leader.
//!
//! Each claimed schedule's plugin job runs on the shared
//! [`marmot_worker_pool::WorkerPool`], bounding how many pipelines this
//! node executes at once independently of how many schedules it wins the
//! claim race for. A lease-renewal task runs alongside the job and keeps
//! `claim_expires_at` pushed forward at a third of the lease TTL so a
//! slow plugin never has its schedule reclaimed out from under it.

use crate::model::{IngestBatch, RunStatus, Schedule};
use crate::repo::ScheduleRepo;
use crate::run_service::RunService;
use async_trait::async_trait;
use chrono::Utc;
use marmot_common::ids::{RunId, ScheduleId};
use marmot_worker_pool::{WorkerPool, WorkerPoolConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// The extension point a plugin implementation hangs off of: given a
/// schedule's (decrypted) configuration, produce the batch of assets,
/// lineage, documentation, and statistics it found this run.
#[async_trait]
pub trait PluginExecutor: Send + Sync {
    async fn execute(&self, schedule: &Schedule, run_id: RunId) -> anyhow::Result<IngestBatch>;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub node_id: String,
    pub poll_interval: Duration,
    pub claim_ttl: Duration,
    pub batch_limit: u32,
    pub worker_pool: WorkerPoolConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            poll_interval: Duration::from_secs(5),
            claim_ttl: Duration::from_secs(60),
            batch_limit: 20,
            worker_pool: WorkerPoolConfig::default(),
        }
    }
}

struct DispatchJob {
    schedule: Schedule,
    run_id: RunId,
    lease_cancel: CancellationToken,
}

pub struct Scheduler {
    schedules: Arc<dyn ScheduleRepo>,
    runs: Arc<RunService>,
    executor: Arc<dyn PluginExecutor>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        schedules: Arc<dyn ScheduleRepo>,
        runs: Arc<RunService>,
        executor: Arc<dyn PluginExecutor>,
        config: SchedulerConfig,
    ) -> Self {
        Self { schedules, runs, executor, config }
    }

    /// Spawns the dispatch loop. The returned handle resolves once
    /// `cancel` fires and the in-flight worker pool drains.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool: WorkerPool<DispatchJob, ()> = {
            let this = self.clone();
            WorkerPool::start(
                self.config.worker_pool,
                move |job| {
                    let this = this.clone();
                    async move {
                        this.run_job(job).await;
                    }
                },
                |_| {},
            )
        };
        let pool = Arc::new(tokio::sync::Mutex::new(Some(pool)));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.tick(&pool) => {}
                    _ = cancel.cancelled() => break,
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = cancel.cancelled() => break,
                }
            }
            if let Some(pool) = pool.lock().await.take() {
                pool.stop().await;
            }
        })
    }

    async fn tick(&self, pool: &Arc<tokio::sync::Mutex<Option<WorkerPool<DispatchJob, ()>>>>) {
        let now = Utc::now();
        let due = match self.schedules.find_due(now, self.config.batch_limit).await {
            Ok(due) => due,
            Err(err) => {
                warn!(%err, "failed to query due schedules");
                return;
            }
        };

        for schedule in due {
            let claim_expires_at = now + chrono::Duration::from_std(self.config.claim_ttl).unwrap_or(chrono::Duration::seconds(60));
            let won = match self
                .schedules
                .try_claim(schedule.id, &self.config.node_id, claim_expires_at, now)
                .await
            {
                Ok(won) => won,
                Err(err) => {
                    warn!(schedule = %schedule.id, %err, "claim attempt failed");
                    continue;
                }
            };
            if !won {
                continue;
            }

            let run = match self.runs.start_run(&schedule.pipeline_name, &schedule.source_name).await {
                Ok(run) => run,
                Err(err) => {
                    error!(schedule = %schedule.id, %err, "failed to start run for claimed schedule");
                    continue;
                }
            };

            let lease_cancel = CancellationToken::new();
            self.spawn_lease_renewal(schedule.id, lease_cancel.clone());

            let job = DispatchJob { schedule, run_id: run.id, lease_cancel };
            let guard = pool.lock().await;
            if let Some(pool) = guard.as_ref() {
                if !pool.submit(job) {
                    warn!(run = %run.id, "worker pool queue full, schedule will be retried next tick");
                }
            }
        }
    }

    fn spawn_lease_renewal(&self, id: ScheduleId, cancel: CancellationToken) {
        let schedules = self.schedules.clone();
        let node_id = self.config.node_id.clone();
        let ttl = self.config.claim_ttl;
        let renew_every = ttl / 3;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(renew_every) => {}
                    _ = cancel.cancelled() => return,
                }
                let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(60));
                if let Err(err) = schedules.renew_claim(id, &node_id, expires_at).await {
                    warn!(schedule = %id, %err, "failed to renew schedule claim");
                }
            }
        });
    }

    async fn run_job(&self, job: DispatchJob) {
        let DispatchJob { schedule, run_id, lease_cancel } = job;
        let result = self.executor.execute(&schedule, run_id).await;
        let outcome = match result {
            Ok(batch) => self
                .runs
                .batch_create(run_id, &schedule.pipeline_name, &schedule.source_name, batch)
                .await
                .map(|_| ())
                .map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };

        lease_cancel.cancel();

        let (status, error) = match outcome {
            Ok(()) => (RunStatus::Completed, None),
            Err(msg) => {
                error!(run = %run_id, schedule = %schedule.id, error = %msg, "plugin run failed");
                (RunStatus::Failed, Some(msg))
            }
        };
        if let Err(err) = self.runs.complete_run(run_id, status, error).await {
            warn!(run = %run_id, %err, "failed to mark run complete");
        }

        let next_fire_time = match crate::cron::CronSchedule::parse(&schedule.cron_expression) {
            Ok(parsed) => parsed.next_after(Utc::now()),
            Err(err) => {
                warn!(schedule = %schedule.id, %err, "schedule has an unparsable cron expression, retrying in an hour");
                Utc::now() + chrono::Duration::hours(1)
            }
        };
        if let Err(err) = self.schedules.release_and_advance(schedule.id, next_fire_time).await {
            warn!(schedule = %schedule.id, %err, "failed to release schedule claim");
        }
        info!(schedule = %schedule.id, run = %run_id, "schedule dispatch cycle complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IngestBatch;
    use crate::repo::{InMemoryArtifactRepo, InMemoryRunRepo, InMemoryScheduleRepo};
    use marmot_assets::{AssetService, InMemoryAssetRepo};
    use marmot_common::ids::PluginId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::advance;

    fn schedule(next_fire_time: chrono::DateTime<Utc>, cron: &str) -> Schedule {
        let now = Utc::now();
        Schedule {
            id: ScheduleId(uuid::Uuid::new_v4()),
            name: "nightly".to_string(),
            plugin_id: PluginId("noop".to_string()),
            pipeline_name: "pipeline".to_string(),
            source_name: "source".to_string(),
            config: serde_json::json!({}),
            cron_expression: cron.to_string(),
            enabled: true,
            next_fire_time,
            claimed_by: None,
            claim_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PluginExecutor for CountingExecutor {
        async fn execute(&self, _schedule: &Schedule, _run_id: RunId) -> anyhow::Result<IngestBatch> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(IngestBatch::default())
        }
    }

    fn run_service() -> Arc<RunService> {
        let assets = Arc::new(AssetService::new(Arc::new(InMemoryAssetRepo::new())));
        Arc::new(RunService::new(
            Arc::new(InMemoryRunRepo::new()),
            assets,
            Arc::new(InMemoryArtifactRepo::new()),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn due_schedule_runs_exactly_once() {
        let repo = Arc::new(InMemoryScheduleRepo::new());
        let due = schedule(Utc::now(), "0 0 * * * *");
        repo.create(due.clone()).await.unwrap();

        let executor = Arc::new(CountingExecutor { calls: AtomicUsize::new(0) });
        let config = SchedulerConfig {
            node_id: "node-a".to_string(),
            poll_interval: Duration::from_millis(20),
            claim_ttl: Duration::from_secs(60),
            batch_limit: 10,
            worker_pool: WorkerPoolConfig::default(),
        };
        let scheduler = Arc::new(Scheduler::new(repo.clone(), run_service(), executor.clone(), config));

        let cancel = CancellationToken::new();
        let handle = scheduler.clone().spawn(cancel.clone());

        advance(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        let stored = repo.get(due.id).await.unwrap().unwrap();
        assert!(stored.claimed_by.is_none(), "claim should be released after the job completes");
        assert!(stored.next_fire_time > due.next_fire_time, "cron should advance next_fire_time");
    }

    #[tokio::test]
    async fn try_claim_is_exclusive_across_concurrent_callers() {
        let repo = Arc::new(InMemoryScheduleRepo::new());
        let due = schedule(Utc::now(), "0 0 * * * *");
        repo.create(due.clone()).await.unwrap();

        let now = Utc::now();
        let expires = now + chrono::Duration::seconds(30);
        let (won_a, won_b) = tokio::join!(
            repo.try_claim(due.id, "node-a", expires, now),
            repo.try_claim(due.id, "node-b", expires, now),
        );

        let winners = [won_a.unwrap(), won_b.unwrap()].into_iter().filter(|won| *won).count();
        assert_eq!(winners, 1, "exactly one caller should win the claim race");
    }

    #[tokio::test(start_paused = true)]
    async fn unparsable_cron_falls_back_to_hourly_retry() {
        let repo = Arc::new(InMemoryScheduleRepo::new());
        let mut bad = schedule(Utc::now(), "not a cron expression");
        bad.id = ScheduleId(uuid::Uuid::new_v4());
        repo.create(bad.clone()).await.unwrap();

        let executor = Arc::new(CountingExecutor { calls: AtomicUsize::new(0) });
        let config = SchedulerConfig {
            node_id: "node-a".to_string(),
            poll_interval: Duration::from_millis(20),
            claim_ttl: Duration::from_secs(60),
            batch_limit: 10,
            worker_pool: WorkerPoolConfig::default(),
        };
        let scheduler = Arc::new(Scheduler::new(repo.clone(), run_service(), executor.clone(), config));

        let cancel = CancellationToken::new();
        let handle = scheduler.clone().spawn(cancel.clone());
        advance(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        let stored = repo.get(bad.id).await.unwrap().unwrap();
        assert!(
            stored.next_fire_time > Utc::now() + chrono::Duration::minutes(30),
            "an unparsable cron expression should push next_fire_time out by about an hour instead of looping"
        );
    }
}
