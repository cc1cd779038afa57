//! Constructs and wires every long-lived component the HTTP layer and
//! background loops share: the database pool, the encryption cipher, the
//! repo → service → observer graph (spec.md §4.D step 2 fans asset
//! changes out to the Rule Engine and the Change Aggregator), and the
//! scheduler / reconciler / retention background tasks.
//!
//! [`crate::plugin::NoopPluginExecutor`], [`InMemorySearchBackend`], and
//! [`InMemoryTeamMembershipProvider`] stand in for collaborators this
//! workspace doesn't own (the plugin transport, the search index, the
//! team directory) — a real deployment swaps each for a client to the
//! actual service.

use crate::config::ServerConfig;
use crate::observer::ChangeAggregatorBridge;
use crate::plugin::NoopPluginExecutor;
use marmot_assets::{AssetRepo, AssetService, SqlAssetRepo};
use marmot_common::crypto::{Cipher, EncryptionKey};
use marmot_db::advisory_lock::LocalLockTable;
use marmot_db::pool::DbPool;
use marmot_ingest::{
    ArtifactRepo, RunRepo, RunService, Scheduler, SchedulerConfig, ScheduleRepo, ScheduleService,
    SqlArtifactRepo, SqlRunRepo, SqlScheduleRepo,
};
use marmot_notify::{
    ChangeAggregator, ChangeAggregatorConfig, InMemoryTeamMembershipProvider, NotificationRepo,
    NotificationService, NotificationServiceConfig, SqlNotificationRepo, SqlWebhookRepo,
    TeamMembershipProvider, WebhookDispatcher, WebhookRepo,
};
use marmot_rules::{
    InMemorySearchBackend, MembershipRepo, RuleEngine, RuleReconciler, RuleRepo, SearchBackend,
    SqlMembershipRepo, SqlRuleRepo,
};
use marmot_worker_pool::WorkerPoolConfig;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Every long-lived handle the API layer and background tasks reach for.
/// Cloning is cheap — every field is an `Arc`.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<ServerConfig>,
    pub db: Arc<DbPool>,
    pub locks: Arc<LocalLockTable>,
    pub assets: Arc<AssetService>,
    pub runs: Arc<RunService>,
    pub schedules: Arc<ScheduleService>,
    pub scheduler: Arc<Scheduler>,
    pub rule_reconciler: Arc<RuleReconciler>,
    pub notifications: Arc<NotificationService>,
    pub notification_repo: Arc<dyn NotificationRepo>,
    pub aggregator: Arc<ChangeAggregator>,
    pub webhooks: Arc<WebhookDispatcher>,
}

impl Services {
    pub async fn new(config: ServerConfig) -> anyhow::Result<Self> {
        if config.core.encryption_key.is_none() && !config.core.allow_unencrypted {
            anyhow::bail!(
                "ENCRYPTION_KEY is required to start (schedule/webhook configs hold secrets); \
                 set ALLOW_UNENCRYPTED=true to run without one in local/dev setups"
            );
        }

        let db = DbPool::connect(&config.core.db).await?;
        marmot_db::pool::migrate(&config.core.db).await?;

        let cipher = Cipher::new(config.core.encryption_key.as_deref().map(EncryptionKey::from_secret));
        let locks = Arc::new(LocalLockTable::new());

        let asset_repo: Arc<dyn AssetRepo> = Arc::new(SqlAssetRepo::new(db.clone()));
        let mut asset_service = AssetService::new(asset_repo);

        let rule_repo: Arc<dyn RuleRepo> = Arc::new(SqlRuleRepo::new(db.clone()));
        let membership_repo: Arc<dyn MembershipRepo> = Arc::new(SqlMembershipRepo::new(db.clone()));
        // the real search/query-language service is an external collaborator;
        // this in-memory double keeps the reconciler fully operable standalone.
        let search: Arc<dyn SearchBackend> = Arc::new(InMemorySearchBackend::new());

        let notification_repo: Arc<dyn NotificationRepo> = Arc::new(SqlNotificationRepo::new(db.clone()));
        let webhook_repo: Arc<dyn WebhookRepo> = Arc::new(SqlWebhookRepo::new(db.clone(), cipher.clone()));
        // likewise for team membership expansion (spec.md §6).
        let teams: Arc<dyn TeamMembershipProvider> = Arc::new(InMemoryTeamMembershipProvider::new());

        let notifications = NotificationService::new(
            notification_repo.clone(),
            teams,
            NotificationServiceConfig { worker_pool: worker_pool_config(&config), ..Default::default() },
        );
        let aggregator = ChangeAggregator::start(ChangeAggregatorConfig::default(), notifications.clone());
        let webhooks = WebhookDispatcher::new(
            webhook_repo,
            worker_pool_config(&config),
            marmot_notify::webhook::DEFAULT_MAX_RETRIES,
        );

        let rule_engine = Arc::new(RuleEngine::new(rule_repo.clone(), membership_repo.clone(), search.clone()));
        let change_bridge = Arc::new(ChangeAggregatorBridge::new(aggregator.clone()));
        asset_service.register_observer(rule_engine);
        asset_service.register_observer(change_bridge);
        let assets = Arc::new(asset_service);

        let rule_reconciler = Arc::new(RuleReconciler::new(rule_repo, membership_repo, assets.clone(), search));

        let artifact_repo: Arc<dyn ArtifactRepo> = Arc::new(SqlArtifactRepo::new(db.clone()));
        let run_repo: Arc<dyn RunRepo> = Arc::new(SqlRunRepo::new(db.clone()));
        let runs = Arc::new(RunService::new(run_repo, assets.clone(), artifact_repo));

        let schedule_repo: Arc<dyn ScheduleRepo> = Arc::new(SqlScheduleRepo::new(db.clone()));
        let schedules = Arc::new(ScheduleService::new(schedule_repo.clone(), cipher));

        let scheduler_config = SchedulerConfig {
            node_id: config.node_id.clone(),
            poll_interval: config.core.scheduler_interval,
            claim_ttl: config.core.lease_expiry,
            worker_pool: WorkerPoolConfig { workers: config.core.max_workers, ..Default::default() },
            ..Default::default()
        };
        let scheduler = Arc::new(Scheduler::new(
            schedule_repo,
            runs.clone(),
            Arc::new(NoopPluginExecutor),
            scheduler_config,
        ));

        Ok(Services {
            config: Arc::new(config),
            db,
            locks,
            assets,
            runs,
            schedules,
            scheduler,
            rule_reconciler,
            notifications,
            notification_repo,
            aggregator,
            webhooks,
        })
    }

    /// Spawns the scheduler dispatch loop, the rule reconciler, and the
    /// notification retention task, all cancelled together by `cancel`.
    pub fn spawn_background_tasks(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            self.scheduler.clone().spawn(cancel.clone()),
            self.rule_reconciler.clone().spawn(
                self.db.clone(),
                self.locks.clone(),
                self.config.node_id.clone(),
                self.config.rule_reconcile_interval,
                cancel.clone(),
            ),
            marmot_notify::spawn_retention_task(
                self.notification_repo.clone(),
                self.db.clone(),
                self.locks.clone(),
                self.config.node_id.clone(),
                cancel,
            ),
        ]
    }

    /// Drains in-flight work before the process exits (spec.md §6: clean
    /// shutdown returns zero only after this completes).
    pub async fn shutdown(&self) {
        self.aggregator.stop().await;
    }
}

fn worker_pool_config(config: &ServerConfig) -> WorkerPoolConfig {
    WorkerPoolConfig { workers: config.core.max_workers.max(1), ..Default::default() }
}
