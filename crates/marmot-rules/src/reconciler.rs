//! Differential reconciliation (spec.md §4.H "Differential
//! reconciliation"): a periodic full sweep that catches drift the
//! incremental engine can miss (backfilled assets, bulk edits, rules
//! whose definition changed). Runs as a [`marmot_singleton_task`] so
//! only one node in the cluster executes it per tick.

use crate::matcher;
use crate::model::RuleKind;
use crate::repo::{MembershipRepo, RuleRepo};
use crate::search::SearchBackend;
use chrono::Utc;
use marmot_assets::AssetService;
use marmot_common::ids::RuleId;
use marmot_db::advisory_lock::LocalLockTable;
use marmot_db::pool::DbPool;
use marmot_singleton_task::{spawn, SingletonTaskConfig};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Rows are replaced in chunks of this size so a single reconciliation
/// pass never issues one enormous statement for a popular rule.
const CHUNK_SIZE: usize = 5_000;

pub struct RuleReconciler {
    rules: Arc<dyn RuleRepo>,
    memberships: Arc<dyn MembershipRepo>,
    assets: Arc<AssetService>,
    search: Arc<dyn SearchBackend>,
}

impl RuleReconciler {
    pub fn new(
        rules: Arc<dyn RuleRepo>,
        memberships: Arc<dyn MembershipRepo>,
        assets: Arc<AssetService>,
        search: Arc<dyn SearchBackend>,
    ) -> Self {
        Self { rules, memberships, assets, search }
    }

    pub fn spawn(
        self: Arc<Self>,
        db: Arc<DbPool>,
        locks: Arc<LocalLockTable>,
        node_id: String,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let config = SingletonTaskConfig {
            name: "rule-reconciler".to_string(),
            interval,
            initial_delay: Duration::from_secs(5),
        };
        spawn(db, locks, node_id, config, cancel, move || {
            let this = self.clone();
            async move { this.reconcile_all().await }
        })
    }

    pub async fn reconcile_all(&self) -> anyhow::Result<()> {
        let rules = self.rules.list_enabled().await?;
        for rule in rules {
            self.reconcile_rule(&rule.id).await?;
        }
        Ok(())
    }

    pub async fn reconcile_rule(&self, rule_id: &RuleId) -> anyhow::Result<()> {
        let Some(rule) = self.rules.get(*rule_id).await? else {
            return Ok(());
        };
        if !rule.enabled {
            return Ok(());
        }

        let hash = rule.content_hash();
        if rule.reconciliation_hash.as_deref() == Some(hash.as_str()) {
            info!(rule_id = %rule.id, "rule unchanged since last reconciliation, skipping");
            return Ok(());
        }

        let desired: BTreeSet<String> = match &rule.kind {
            RuleKind::Query { query_expression } => {
                self.search.search(query_expression).await.map_err(|e| anyhow::anyhow!(e.to_string()))?
            }
            RuleKind::MetadataMatch { field, pattern_type, pattern_value } => {
                let assets = self.assets.list_all().await?;
                assets
                    .iter()
                    .filter(|asset| matcher::matches(asset, field, *pattern_type, pattern_value))
                    .map(|asset| asset.mrn.0.clone())
                    .collect()
            }
        };

        let current = self.memberships.members_of(rule.id).await?;
        let to_add: Vec<String> = desired.difference(&current).cloned().collect();
        let to_remove: Vec<String> = current.difference(&desired).cloned().collect();

        let now = Utc::now();
        let source = format!("rule:{}", rule.id);
        for chunk in to_add.chunks(CHUNK_SIZE) {
            self.memberships.insert_members(rule.id, chunk, now).await?;
            for mrn in chunk {
                self.memberships.upsert_terms(mrn, &rule.term_ids, &source, now).await?;
            }
        }
        for chunk in to_remove.chunks(CHUNK_SIZE) {
            self.memberships.delete_members(rule.id, chunk).await?;
            for mrn in chunk {
                self.memberships.delete_terms(mrn, &rule.term_ids, &source).await?;
            }
        }

        self.rules.store_reconciliation(rule.id, &hash, now).await?;
        self.rules.set_membership_count(rule.id, desired.len() as i32).await?;
        info!(rule_id = %rule.id, added = to_add.len(), removed = to_remove.len(), "reconciled rule");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PatternType, Rule};
    use crate::repo::{InMemoryMembershipRepo, InMemoryRuleRepo};
    use crate::search::InMemorySearchBackend;
    use chrono::Utc;
    use marmot_assets::{Asset, AssetRepo, InMemoryAssetRepo};
    use marmot_common::ids::Mrn;
    use serde_json::json;

    fn metadata_rule(field: &str, pattern_value: &str) -> Rule {
        let now = Utc::now();
        Rule {
            id: RuleId::new_v4(),
            name: "finance-owned".to_string(),
            description: String::new(),
            kind: RuleKind::MetadataMatch {
                field: field.to_string(),
                pattern_type: PatternType::Exact,
                pattern_value: pattern_value.to_string(),
            },
            link_assignments: vec![],
            term_ids: vec!["term:finance".to_string()],
            priority: 0,
            enabled: true,
            membership_count: 0,
            reconciliation_hash: None,
            last_reconciled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn full_scan_adds_and_removes_memberships() {
        let rule_repo = Arc::new(InMemoryRuleRepo::new());
        let membership_repo = Arc::new(InMemoryMembershipRepo::new());
        let asset_repo = Arc::new(InMemoryAssetRepo::new());
        let mut matching = Asset::new_stub(Mrn::compute("Topic", "Kafka", "orders"), "Topic".to_string(), Utc::now());
        matching.is_stub = false;
        matching.metadata.insert("owner".to_string(), json!("finance"));
        asset_repo.upsert(&matching).await.unwrap();
        let asset_service = Arc::new(AssetService::new(asset_repo));
        let search = Arc::new(InMemorySearchBackend::new());

        let rule = rule_repo.create(metadata_rule("owner", "finance")).await.unwrap();
        let reconciler = RuleReconciler::new(rule_repo.clone(), membership_repo.clone(), asset_service.clone(), search);
        reconciler.reconcile_rule(&rule.id).await.unwrap();

        assert!(membership_repo.members_of(rule.id).await.unwrap().contains(&matching.mrn.0));
        let stored = rule_repo.get(rule.id).await.unwrap().unwrap();
        assert!(stored.reconciliation_hash.is_some());
        assert_eq!(stored.membership_count, 1);
    }

    #[tokio::test]
    async fn unchanged_hash_skips_reevaluation() {
        let rule_repo = Arc::new(InMemoryRuleRepo::new());
        let membership_repo = Arc::new(InMemoryMembershipRepo::new());
        let asset_repo = Arc::new(InMemoryAssetRepo::new());
        let asset_service = Arc::new(AssetService::new(asset_repo));
        let search = Arc::new(InMemorySearchBackend::new());

        let rule = rule_repo.create(metadata_rule("owner", "finance")).await.unwrap();
        let reconciler = RuleReconciler::new(rule_repo.clone(), membership_repo.clone(), asset_service.clone(), search);
        reconciler.reconcile_rule(&rule.id).await.unwrap();
        let first_reconciled_at = rule_repo.get(rule.id).await.unwrap().unwrap().last_reconciled_at;

        reconciler.reconcile_rule(&rule.id).await.unwrap();
        let second_reconciled_at = rule_repo.get(rule.id).await.unwrap().unwrap().last_reconciled_at;
        assert_eq!(first_reconciled_at, second_reconciled_at, "unchanged rule should short-circuit before re-stamping");
    }
}
