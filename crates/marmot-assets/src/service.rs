//! Single-asset upsert/diff logic (spec.md §4.D step 2, §4.G). The Run
//! Repository drives this per item inside its batch transaction; the
//! Rule Engine and Notification Service subscribe as observers and are
//! notified once the whole batch has committed.

use crate::model::{Asset, AssetChange, AssetChangeKind, AssetInput};
use crate::repo::AssetRepo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marmot_common::ids::Mrn;
use marmot_db::RepoError;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait AssetChangeObserver: Send + Sync {
    async fn on_change(&self, change: &AssetChange);
}

pub struct AssetService {
    repo: Arc<dyn AssetRepo>,
    observers: Vec<Arc<dyn AssetChangeObserver>>,
}

impl AssetService {
    pub fn new(repo: Arc<dyn AssetRepo>) -> Self {
        Self {
            repo,
            observers: Vec::new(),
        }
    }

    pub fn register_observer(&mut self, observer: Arc<dyn AssetChangeObserver>) {
        self.observers.push(observer);
    }

    pub async fn notify_observers(&self, change: &AssetChange) {
        for observer in &self.observers {
            observer.on_change(change).await;
        }
    }

    /// Canonicalizes `input`, then inserts, promotes, or merges it
    /// against the stored row. Returns `None` when a real (non-stub) row
    /// already matched the input exactly — no RunEntity should be
    /// recorded in that case.
    pub async fn upsert(
        &self,
        input: AssetInput,
        pipeline: &str,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AssetChange>, RepoError> {
        let mrn = Mrn::compute(&input.asset_type, &input.primary_provider, &input.name);
        let providers = canonicalize(&input.providers);
        let tags = canonicalize(&input.tags);
        let sources = canonicalize(&input.sources);

        let existing = self.repo.get_by_mrn(&mrn).await?;
        match existing {
            None => {
                let mut asset = Asset::new_stub(mrn.clone(), input.asset_type.clone(), now);
                asset.is_stub = false;
                asset.providers = providers;
                asset.description = input.description;
                asset.schema = input.schema;
                asset.tags = tags;
                asset.sources = sources;
                asset.external_links = input.external_links;
                asset.metadata = input.metadata;
                asset.produced_by = vec![crate::model::ProducedBy {
                    pipeline_name: pipeline.to_string(),
                    source_name: source.to_string(),
                }];
                self.repo.upsert(&asset).await?;
                debug!(mrn = %mrn, "created asset");
                Ok(Some(AssetChange {
                    kind: AssetChangeKind::Created,
                    mrn,
                    before: None,
                    after: Some(asset),
                }))
            }
            Some(before) if before.is_stub => {
                let mut after = before.clone();
                after.is_stub = false;
                after.providers = providers;
                after.description = input.description;
                after.schema = input.schema;
                after.tags = tags;
                after.sources = sources;
                after.external_links = input.external_links;
                after.metadata = input.metadata;
                add_produced_by(&mut after, pipeline, source);
                after.updated_at = now;
                self.repo.upsert(&after).await?;
                Ok(Some(AssetChange {
                    kind: AssetChangeKind::Updated,
                    mrn,
                    before: Some(before),
                    after: Some(after),
                }))
            }
            Some(before) => {
                let mut after = before.clone();
                after.providers = before.providers.union(&providers).cloned().collect();
                after.tags = before.tags.union(&tags).cloned().collect();
                after.sources = before.sources.union(&sources).cloned().collect();

                for (key, value) in input.metadata {
                    if !before.user_metadata_keys.contains(&key) {
                        after.metadata.insert(key, value);
                    }
                }
                if !input.description.is_empty() {
                    after.description = input.description;
                }
                if input.schema.is_some() {
                    after.schema = input.schema;
                }
                after.external_links = merge_links(&before.external_links, input.external_links);
                add_produced_by(&mut after, pipeline, source);

                if observable_fields_equal(&before, &after) {
                    return Ok(None);
                }

                after.updated_at = now;
                self.repo.upsert(&after).await?;
                Ok(Some(AssetChange {
                    kind: AssetChangeKind::Updated,
                    mrn,
                    before: Some(before),
                    after: Some(after),
                }))
            }
        }
    }

    /// Creates a placeholder asset referenced only by a lineage edge, if
    /// one does not already exist (spec §4.D step 3).
    pub async fn ensure_stub(&self, mrn: &Mrn, asset_type: &str, now: DateTime<Utc>) -> Result<(), RepoError> {
        if self.repo.get_by_mrn(mrn).await?.is_none() {
            let stub = Asset::new_stub(mrn.clone(), asset_type.to_string(), now);
            self.repo.upsert(&stub).await?;
        }
        Ok(())
    }

    /// Stale reclamation for one MRN no longer produced by `(pipeline,
    /// source)` (spec §4.D step 6): delete unless still referenced
    /// elsewhere or user-edited, in which case demote to a stub.
    pub async fn reclaim(
        &self,
        mrn: &Mrn,
        pipeline: &str,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AssetChange>, RepoError> {
        let before = match self.repo.get_by_mrn(mrn).await? {
            Some(asset) => asset,
            None => return Ok(None),
        };

        let referenced_elsewhere = self
            .repo
            .is_referenced_by_other_pipeline(mrn, pipeline, source)
            .await?;
        let has_user_edits = before.user_description.is_some() || !before.user_metadata_keys.is_empty();

        if referenced_elsewhere || has_user_edits {
            let mut after = before.clone();
            after.is_stub = true;
            after.produced_by.retain(|p| !(p.pipeline_name == pipeline && p.source_name == source));
            after.updated_at = now;
            self.repo.upsert(&after).await?;
            Ok(Some(AssetChange {
                kind: AssetChangeKind::Updated,
                mrn: mrn.clone(),
                before: Some(before),
                after: Some(after),
            }))
        } else {
            self.repo.delete(mrn).await?;
            Ok(Some(AssetChange {
                kind: AssetChangeKind::Deleted,
                mrn: mrn.clone(),
                before: Some(before),
                after: None,
            }))
        }
    }

    pub async fn get_by_mrn(&self, mrn: &Mrn) -> Result<Option<Asset>, RepoError> {
        self.repo.get_by_mrn(mrn).await
    }

    pub async fn mrns_produced_by(&self, pipeline: &str, source: &str) -> Result<std::collections::BTreeSet<String>, RepoError> {
        self.repo.mrns_produced_by(pipeline, source).await
    }

    pub async fn delete_by_pipeline(&self, pipeline: &str) -> Result<u64, RepoError> {
        self.repo.delete_by_pipeline(pipeline).await
    }

    pub async fn list_all(&self) -> Result<Vec<Asset>, RepoError> {
        self.repo.list_all().await
    }
}

fn canonicalize(values: &[String]) -> std::collections::BTreeSet<String> {
    values.iter().cloned().collect()
}

fn add_produced_by(asset: &mut Asset, pipeline: &str, source: &str) {
    let entry = crate::model::ProducedBy {
        pipeline_name: pipeline.to_string(),
        source_name: source.to_string(),
    };
    if !asset.produced_by.iter().any(|p| p.pipeline_name == entry.pipeline_name && p.source_name == entry.source_name) {
        asset.produced_by.push(entry);
    }
}

fn merge_links(
    existing: &[crate::model::ExternalLink],
    incoming: Vec<crate::model::ExternalLink>,
) -> Vec<crate::model::ExternalLink> {
    let mut by_name: std::collections::BTreeMap<String, crate::model::ExternalLink> =
        existing.iter().cloned().map(|l| (l.name.clone(), l)).collect();
    for link in incoming {
        by_name.insert(link.name.clone(), link);
    }
    by_name.into_values().collect()
}

fn observable_fields_equal(a: &Asset, b: &Asset) -> bool {
    a.providers == b.providers
        && a.tags == b.tags
        && a.sources == b.sources
        && a.metadata == b.metadata
        && a.description == b.description
        && a.schema == b.schema
        && a.external_links == b.external_links
        && a.produced_by == b.produced_by
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::InMemoryAssetRepo;
    use chrono::Utc;
    use serde_json::json;

    fn input(name: &str) -> AssetInput {
        AssetInput {
            asset_type: "Topic".to_string(),
            primary_provider: "Kafka".to_string(),
            name: name.to_string(),
            providers: vec!["kafka".to_string()],
            description: "orders topic".to_string(),
            schema: None,
            tags: vec!["pii".to_string()],
            sources: vec![],
            external_links: vec![],
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn first_upsert_creates_asset() {
        let service = AssetService::new(Arc::new(InMemoryAssetRepo::new()));
        let change = service
            .upsert(input("orders.created"), "kafka-pipeline", "prod", Utc::now())
            .await
            .unwrap()
            .expect("should observe a create");
        assert!(matches!(change.kind, AssetChangeKind::Created));
        assert_eq!(change.mrn.0, "mrn://topic/kafka/orders.created");
    }

    #[tokio::test]
    async fn identical_repeat_upsert_is_idempotent() {
        let service = AssetService::new(Arc::new(InMemoryAssetRepo::new()));
        service
            .upsert(input("orders.created"), "kafka-pipeline", "prod", Utc::now())
            .await
            .unwrap();
        let second = service
            .upsert(input("orders.created"), "kafka-pipeline", "prod", Utc::now())
            .await
            .unwrap();
        assert!(second.is_none(), "no observable change on repeat ingest");
    }

    #[tokio::test]
    async fn merge_preserves_user_metadata_and_unions_tags() {
        let service = AssetService::new(Arc::new(InMemoryAssetRepo::new()));
        service
            .upsert(input("orders.created"), "kafka-pipeline", "prod", Utc::now())
            .await
            .unwrap();

        let mrn = Mrn::compute("Topic", "Kafka", "orders.created");
        let mut asset = service.get_by_mrn(&mrn).await.unwrap().unwrap();
        asset.user_metadata_keys.insert("owner_note".to_string());
        asset.metadata.insert("owner_note".to_string(), json!("do not touch"));
        service.repo.upsert(&asset).await.unwrap();

        let mut second = input("orders.created");
        second.tags = vec!["pii".to_string(), "finance".to_string()];
        second.metadata.insert("owner_note".to_string(), json!("overwritten"));
        let change = service
            .upsert(second, "kafka-pipeline", "prod", Utc::now())
            .await
            .unwrap()
            .expect("tag union should register as a change");
        let after = change.after.unwrap();
        assert_eq!(after.tags.len(), 2);
        assert_eq!(after.metadata.get("owner_note"), Some(&json!("do not touch")));
    }
}
