use chrono::{DateTime, Utc};
use marmot_common::ids::{AssetId, Mrn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalLink {
    pub name: String,
    pub icon: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerRef {
    User(String),
    Team(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducedBy {
    pub pipeline_name: String,
    pub source_name: String,
}

/// Input to an upsert: what a plugin reported for one asset in a batch.
/// `metadata` entries are plugin-origin by construction — human edits go
/// through a separate path that flags the touched keys as user-origin.
#[derive(Debug, Clone, Default)]
pub struct AssetInput {
    pub asset_type: String,
    pub primary_provider: String,
    pub name: String,
    pub providers: Vec<String>,
    pub description: String,
    pub schema: Option<Value>,
    pub tags: Vec<String>,
    pub sources: Vec<String>,
    pub external_links: Vec<ExternalLink>,
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub mrn: Mrn,
    pub name: String,
    pub asset_type: String,
    pub providers: BTreeSet<String>,
    pub description: String,
    pub user_description: Option<String>,
    pub schema: Option<Value>,
    pub tags: BTreeSet<String>,
    pub sources: BTreeSet<String>,
    pub external_links: Vec<ExternalLink>,
    pub metadata: BTreeMap<String, Value>,
    pub user_metadata_keys: BTreeSet<String>,
    pub owners: Vec<OwnerRef>,
    pub is_stub: bool,
    pub produced_by: Vec<ProducedBy>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Asset {
    pub fn new_stub(mrn: Mrn, asset_type: String, now: DateTime<Utc>) -> Self {
        Self {
            id: AssetId::new_v4(),
            name: mrn.name().unwrap_or_default().to_string(),
            mrn,
            asset_type,
            providers: BTreeSet::new(),
            description: String::new(),
            user_description: None,
            schema: None,
            tags: BTreeSet::new(),
            sources: BTreeSet::new(),
            external_links: Vec::new(),
            metadata: BTreeMap::new(),
            user_metadata_keys: BTreeSet::new(),
            owners: Vec::new(),
            is_stub: true,
            produced_by: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// `(type, providers, tags, metadata_keys)` — the necessary-condition
    /// signature used by the rule engine to shortlist candidate rules
    /// without scanning every rule on every write (spec §4.H).
    pub fn signature(&self) -> AssetSignature {
        AssetSignature {
            asset_type: self.asset_type.clone(),
            providers: self.providers.clone(),
            tags: self.tags.clone(),
            metadata_keys: self.metadata.keys().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssetSignature {
    pub asset_type: String,
    pub providers: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub metadata_keys: BTreeSet<String>,
}

/// Result of reconciling one [`AssetInput`] against the stored row
/// (spec.md §4.D step 2). `None` means a real asset already matched the
/// input field-for-field — no RunEntity is recorded, satisfying the
/// idempotence requirement in §8.
#[derive(Debug, Clone)]
pub enum AssetChangeKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct AssetChange {
    pub kind: AssetChangeKind,
    pub mrn: Mrn,
    pub before: Option<Asset>,
    pub after: Option<Asset>,
}
