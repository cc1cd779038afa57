//! Bridges the Asset Service's change-observer fan-out (spec.md §4.D
//! step 2) into the Change Aggregator (§4.K): translates an
//! `AssetChange` into the `(asset_id, mrn, name, change_type,
//! changed_fields, owners)` shape the aggregator keys on.

use async_trait::async_trait;
use marmot_assets::{AssetChange, AssetChangeKind, AssetChangeObserver};
use marmot_notify::{ChangeAggregator, ChangeEvent, Recipient, RecipientType};
use std::sync::Arc;

pub struct ChangeAggregatorBridge {
    aggregator: Arc<ChangeAggregator>,
}

impl ChangeAggregatorBridge {
    pub fn new(aggregator: Arc<ChangeAggregator>) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl AssetChangeObserver for ChangeAggregatorBridge {
    async fn on_change(&self, change: &AssetChange) {
        let change_type = match change.kind {
            AssetChangeKind::Created => "created",
            AssetChangeKind::Updated => "updated",
            AssetChangeKind::Deleted => "deleted",
        };

        let asset = change.after.as_ref().or(change.before.as_ref());
        let Some(asset) = asset else { return };

        let owners = asset
            .owners
            .iter()
            .map(|owner| match owner {
                marmot_assets::OwnerRef::User(id) => Recipient { recipient_type: RecipientType::User, id: id.clone() },
                marmot_assets::OwnerRef::Team(id) => Recipient { recipient_type: RecipientType::Team, id: id.clone() },
            })
            .collect();

        self.aggregator.submit(ChangeEvent {
            asset_id: asset.id.to_string(),
            mrn: change.mrn.0.clone(),
            name: asset.name.clone(),
            change_type: change_type.to_string(),
            changed_fields: changed_fields(change),
            owners,
        });
    }
}

fn changed_fields(change: &AssetChange) -> Vec<String> {
    let (Some(before), Some(after)) = (&change.before, &change.after) else {
        return vec!["*".to_string()];
    };
    let mut fields = Vec::new();
    if before.description != after.description {
        fields.push("description".to_string());
    }
    if before.tags != after.tags {
        fields.push("tags".to_string());
    }
    if before.schema != after.schema {
        fields.push("schema".to_string());
    }
    if before.metadata != after.metadata {
        fields.push("metadata".to_string());
    }
    if before.external_links != after.external_links {
        fields.push("external_links".to_string());
    }
    if fields.is_empty() {
        fields.push("metadata".to_string());
    }
    fields
}
