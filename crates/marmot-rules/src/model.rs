use chrono::{DateTime, Utc};
use marmot_common::ids::RuleId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Exact,
    Wildcard,
    Prefix,
    Regex,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Wildcard => "wildcard",
            Self::Prefix => "prefix",
            Self::Regex => "regex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(Self::Exact),
            "wildcard" => Some(Self::Wildcard),
            "prefix" => Some(Self::Prefix),
            "regex" => Some(Self::Regex),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkAssignment {
    pub name: String,
    pub icon: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule_type", rename_all = "snake_case")]
pub enum RuleKind {
    Query { query_expression: String },
    MetadataMatch { field: String, pattern_type: PatternType, pattern_value: String },
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: RuleId,
    pub name: String,
    pub description: String,
    pub kind: RuleKind,
    pub link_assignments: Vec<LinkAssignment>,
    pub term_ids: Vec<String>,
    pub priority: i32,
    pub enabled: bool,
    pub membership_count: i32,
    pub reconciliation_hash: Option<String>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// `rule_targets` rows this rule should be indexed under so
    /// incremental evaluation can shortlist it without a full scan
    /// (spec.md §4.H step 2). Query rules get a single `query` row since
    /// they cannot be cheaply pre-indexed by signature.
    pub fn target_rows(&self) -> Vec<(&'static str, String)> {
        match &self.kind {
            RuleKind::Query { .. } => vec![("query", self.id.to_string())],
            RuleKind::MetadataMatch { field, .. } => {
                vec![("metadata_key", field.split('.').next().unwrap_or(field).to_string())]
            }
        }
    }

    /// The digest that gates reconciliation (spec.md §4.H step 1): any
    /// change to rule semantics invalidates the stored hash.
    pub fn content_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        match &self.kind {
            RuleKind::Query { query_expression } => {
                hasher.update(b"query");
                hasher.update(query_expression.as_bytes());
            }
            RuleKind::MetadataMatch { field, pattern_type, pattern_value } => {
                hasher.update(b"metadata_match");
                hasher.update(field.as_bytes());
                hasher.update(pattern_type.as_str().as_bytes());
                hasher.update(pattern_value.as_bytes());
            }
        }
        for link in &self.link_assignments {
            hasher.update(link.name.as_bytes());
            hasher.update(link.url.as_bytes());
        }
        for term in &self.term_ids {
            hasher.update(term.as_bytes());
        }
        hasher.update([self.enabled as u8]);
        format!("{:x}", hasher.finalize())
    }
}
