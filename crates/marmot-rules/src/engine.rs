//! Incremental rule evaluation (spec.md §4.H steps 1-4). Subscribes as an
//! [`AssetChangeObserver`] and, for every asset create/update, shortlists
//! candidate rules by signature and evaluates each one against just that
//! asset — the cheap path that keeps most membership changes off the
//! periodic reconciliation pass.

use crate::matcher;
use crate::model::RuleKind;
use crate::repo::{MembershipRepo, RuleRepo};
use crate::search::SearchBackend;
use async_trait::async_trait;
use chrono::Utc;
use marmot_assets::{AssetChange, AssetChangeKind, AssetChangeObserver};
use std::sync::Arc;
use tracing::warn;

pub struct RuleEngine {
    rules: Arc<dyn RuleRepo>,
    memberships: Arc<dyn MembershipRepo>,
    search: Arc<dyn SearchBackend>,
}

impl RuleEngine {
    pub fn new(rules: Arc<dyn RuleRepo>, memberships: Arc<dyn MembershipRepo>, search: Arc<dyn SearchBackend>) -> Self {
        Self { rules, memberships, search }
    }

    async fn evaluate_change(&self, change: &AssetChange) {
        let mrn = change.mrn.0.clone();

        let Some(asset) = &change.after else {
            // A hard delete: clear this asset out of every rule it might
            // have belonged to. There is no signature to shortlist by
            // since the asset is gone, so this sweeps all enabled rules.
            match self.rules.list_enabled().await {
                Ok(rules) => {
                    for rule in rules {
                        if self.memberships.members_of(rule.id).await.map(|m| m.contains(&mrn)).unwrap_or(false) {
                            let _ = self.memberships.delete_members(rule.id, &[mrn.clone()]).await;
                            let _ = self.memberships.delete_terms(&mrn, &rule.term_ids, &format!("rule:{}", rule.id)).await;
                        }
                    }
                }
                Err(err) => warn!(%err, "failed to list rules for deleted-asset cleanup"),
            }
            return;
        };

        let signature = asset.signature();
        let target_rows: Vec<(&str, String)> = signature
            .metadata_keys
            .iter()
            .map(|k| ("metadata_key", k.clone()))
            .collect();

        let candidates = match self.rules.candidates_for_signature(&target_rows).await {
            Ok(rules) => rules,
            Err(err) => {
                warn!(%err, "failed to fetch candidate rules");
                return;
            }
        };

        for rule in candidates {
            if !rule.enabled {
                continue;
            }
            let is_match = match &rule.kind {
                RuleKind::MetadataMatch { field, pattern_type, pattern_value } => {
                    matcher::matches(asset, field, *pattern_type, pattern_value)
                }
                RuleKind::Query { query_expression } => {
                    match self.search.matches_single(query_expression, &mrn).await {
                        Ok(matched) => matched,
                        Err(_) => {
                            // Backend can't scope to a single asset; the
                            // periodic reconciler will pick this up.
                            continue;
                        }
                    }
                }
            };

            let already_member = self
                .memberships
                .members_of(rule.id)
                .await
                .map(|m| m.contains(&mrn))
                .unwrap_or(false);

            let source = format!("rule:{}", rule.id);
            let now = Utc::now();
            match (is_match, already_member) {
                (true, false) => {
                    let _ = self.memberships.insert_members(rule.id, &[mrn.clone()], now).await;
                    let _ = self.memberships.upsert_terms(&mrn, &rule.term_ids, &source, now).await;
                }
                (false, true) => {
                    let _ = self.memberships.delete_members(rule.id, &[mrn.clone()]).await;
                    let _ = self.memberships.delete_terms(&mrn, &rule.term_ids, &source).await;
                }
                _ => {}
            }
        }
    }
}

#[async_trait]
impl AssetChangeObserver for RuleEngine {
    async fn on_change(&self, change: &AssetChange) {
        match change.kind {
            AssetChangeKind::Created | AssetChangeKind::Updated => self.evaluate_change(change).await,
            AssetChangeKind::Deleted => self.evaluate_change(change).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PatternType, Rule, RuleKind};
    use crate::repo::{InMemoryMembershipRepo, InMemoryRuleRepo};
    use crate::search::InMemorySearchBackend;
    use chrono::Utc;
    use marmot_assets::Asset;
    use marmot_common::ids::{Mrn, RuleId};
    use serde_json::json;

    fn metadata_rule(field: &str, pattern_value: &str) -> Rule {
        let now = Utc::now();
        Rule {
            id: RuleId::new_v4(),
            name: "pii-finance".to_string(),
            description: String::new(),
            kind: RuleKind::MetadataMatch {
                field: field.to_string(),
                pattern_type: PatternType::Exact,
                pattern_value: pattern_value.to_string(),
            },
            link_assignments: vec![],
            term_ids: vec!["term:pii".to_string()],
            priority: 0,
            enabled: true,
            membership_count: 0,
            reconciliation_hash: None,
            last_reconciled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn asset_with(field: &str, value: serde_json::Value) -> Asset {
        let mut asset = Asset::new_stub(Mrn::compute("Topic", "Kafka", "orders"), "Topic".to_string(), Utc::now());
        asset.is_stub = false;
        asset.metadata.insert(field.to_string(), value);
        asset
    }

    #[tokio::test]
    async fn matching_change_adds_membership_and_terms() {
        let rules = Arc::new(InMemoryRuleRepo::new());
        let memberships = Arc::new(InMemoryMembershipRepo::new());
        let search = Arc::new(InMemorySearchBackend::new());
        let rule = rules.create(metadata_rule("owner", "finance")).await.unwrap();
        rules.replace_targets(rule.id, &rule.target_rows()).await.unwrap();

        let engine = RuleEngine::new(rules.clone(), memberships.clone(), search);
        let asset = asset_with("owner", json!("finance"));
        let change = AssetChange { kind: AssetChangeKind::Created, mrn: asset.mrn.clone(), before: None, after: Some(asset.clone()) };
        engine.on_change(&change).await;

        assert!(memberships.members_of(rule.id).await.unwrap().contains(&asset.mrn.0));
    }

    #[tokio::test]
    async fn stale_membership_is_removed_when_asset_no_longer_matches() {
        let rules = Arc::new(InMemoryRuleRepo::new());
        let memberships = Arc::new(InMemoryMembershipRepo::new());
        let search = Arc::new(InMemorySearchBackend::new());
        let rule = rules.create(metadata_rule("owner", "finance")).await.unwrap();
        rules.replace_targets(rule.id, &rule.target_rows()).await.unwrap();

        let engine = RuleEngine::new(rules.clone(), memberships.clone(), search);
        let mut asset = asset_with("owner", json!("finance"));
        let change = AssetChange { kind: AssetChangeKind::Created, mrn: asset.mrn.clone(), before: None, after: Some(asset.clone()) };
        engine.on_change(&change).await;
        assert!(memberships.members_of(rule.id).await.unwrap().contains(&asset.mrn.0));

        asset.metadata.insert("owner".to_string(), json!("engineering"));
        let change = AssetChange { kind: AssetChangeKind::Updated, mrn: asset.mrn.clone(), before: None, after: Some(asset.clone()) };
        engine.on_change(&change).await;
        assert!(!memberships.members_of(rule.id).await.unwrap().contains(&asset.mrn.0));
    }

    #[tokio::test]
    async fn deleted_asset_is_removed_from_all_rules() {
        let rules = Arc::new(InMemoryRuleRepo::new());
        let memberships = Arc::new(InMemoryMembershipRepo::new());
        let search = Arc::new(InMemorySearchBackend::new());
        let rule = rules.create(metadata_rule("owner", "finance")).await.unwrap();
        rules.replace_targets(rule.id, &rule.target_rows()).await.unwrap();

        let engine = RuleEngine::new(rules.clone(), memberships.clone(), search);
        let asset = asset_with("owner", json!("finance"));
        let change = AssetChange { kind: AssetChangeKind::Created, mrn: asset.mrn.clone(), before: None, after: Some(asset.clone()) };
        engine.on_change(&change).await;
        assert!(memberships.members_of(rule.id).await.unwrap().contains(&asset.mrn.0));

        let delete = AssetChange { kind: AssetChangeKind::Deleted, mrn: asset.mrn.clone(), before: Some(asset.clone()), after: None };
        engine.on_change(&delete).await;
        assert!(!memberships.members_of(rule.id).await.unwrap().contains(&asset.mrn.0));
    }
}
