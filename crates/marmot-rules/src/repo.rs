use crate::matcher::validate_rule;
use crate::model::{LinkAssignment, PatternType, Rule, RuleKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marmot_common::ids::RuleId;
use marmot_db::pool::DbPool;
use marmot_db::RepoError;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait RuleRepo: Send + Sync {
    async fn create(&self, rule: Rule) -> Result<Rule, RepoError>;
    async fn get(&self, id: RuleId) -> Result<Option<Rule>, RepoError>;
    async fn delete(&self, id: RuleId) -> Result<(), RepoError>;
    /// All enabled rules, ordered by ascending priority then created_at
    /// (spec.md §4.H "Priority").
    async fn list_enabled(&self) -> Result<Vec<Rule>, RepoError>;
    /// Rules indexed under at least one of `signature`'s target rows,
    /// plus every query-type rule (spec.md §4.H step 2).
    async fn candidates_for_signature(&self, target_rows: &[(&str, String)]) -> Result<Vec<Rule>, RepoError>;
    async fn replace_targets(&self, rule_id: RuleId, target_rows: &[(&str, String)]) -> Result<(), RepoError>;
    async fn store_reconciliation(&self, rule_id: RuleId, hash: &str, reconciled_at: DateTime<Utc>) -> Result<(), RepoError>;
    async fn set_membership_count(&self, rule_id: RuleId, count: i32) -> Result<(), RepoError>;
}

#[async_trait]
pub trait MembershipRepo: Send + Sync {
    async fn members_of(&self, rule_id: RuleId) -> Result<BTreeSet<String>, RepoError>;
    async fn insert_members(&self, rule_id: RuleId, asset_mrns: &[String], now: DateTime<Utc>) -> Result<(), RepoError>;
    async fn delete_members(&self, rule_id: RuleId, asset_mrns: &[String]) -> Result<(), RepoError>;
    async fn upsert_terms(&self, asset_mrn: &str, term_ids: &[String], source: &str, now: DateTime<Utc>) -> Result<(), RepoError>;
    async fn delete_terms(&self, asset_mrn: &str, term_ids: &[String], source: &str) -> Result<(), RepoError>;
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    id: Uuid,
    name: String,
    description: String,
    link_assignments: String,
    term_ids: String,
    rule_type: String,
    query_expression: Option<String>,
    metadata_field: Option<String>,
    pattern_type: Option<String>,
    pattern_value: Option<String>,
    priority: i32,
    enabled: bool,
    membership_count: i32,
    reconciliation_hash: Option<String>,
    last_reconciled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RuleRow> for Rule {
    type Error = RepoError;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        let kind = match row.rule_type.as_str() {
            "query" => RuleKind::Query {
                query_expression: row.query_expression.unwrap_or_default(),
            },
            "metadata_match" => RuleKind::MetadataMatch {
                field: row.metadata_field.unwrap_or_default(),
                pattern_type: row
                    .pattern_type
                    .as_deref()
                    .and_then(PatternType::parse)
                    .ok_or_else(|| RepoError::Corrupt("unknown pattern_type".to_string()))?,
                pattern_value: row.pattern_value.unwrap_or_default(),
            },
            other => return Err(RepoError::Corrupt(format!("unknown rule_type {other}"))),
        };
        Ok(Rule {
            id: RuleId(row.id),
            name: row.name,
            description: row.description,
            kind,
            link_assignments: serde_json::from_str(&row.link_assignments).unwrap_or_default(),
            term_ids: serde_json::from_str(&row.term_ids).unwrap_or_default(),
            priority: row.priority,
            enabled: row.enabled,
            membership_count: row.membership_count,
            reconciliation_hash: row.reconciliation_hash,
            last_reconciled_at: row.last_reconciled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn rule_type_fields(kind: &RuleKind) -> (&'static str, Option<&str>, Option<&str>, Option<&'static str>, Option<&str>) {
    match kind {
        RuleKind::Query { query_expression } => ("query", Some(query_expression.as_str()), None, None, None),
        RuleKind::MetadataMatch { field, pattern_type, pattern_value } => {
            ("metadata_match", None, Some(field.as_str()), Some(pattern_type.as_str()), Some(pattern_value.as_str()))
        }
    }
}

pub struct SqlRuleRepo {
    db: Arc<DbPool>,
}

impl SqlRuleRepo {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RuleRepo for SqlRuleRepo {
    async fn create(&self, rule: Rule) -> Result<Rule, RepoError> {
        validate_rule(&rule).map_err(RepoError::Validation)?;
        let (rule_type, query_expression, metadata_field, pattern_type, pattern_value) = rule_type_fields(&rule.kind);
        let links = serde_json::to_string(&rule.link_assignments).unwrap_or_default();
        let terms = serde_json::to_string(&rule.term_ids).unwrap_or_default();
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO asset_rules (id, name, description, link_assignments, term_ids, rule_type, \
                     query_expression, metadata_field, pattern_type, pattern_value, priority, enabled, \
                     membership_count, created_at, updated_at) \
                     VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)",
                )
                .bind(rule.id.0)
                .bind(&rule.name)
                .bind(&rule.description)
                .bind(links)
                .bind(terms)
                .bind(rule_type)
                .bind(query_expression)
                .bind(metadata_field)
                .bind(pattern_type)
                .bind(pattern_value)
                .bind(rule.priority)
                .bind(rule.enabled)
                .bind(rule.membership_count)
                .bind(rule.created_at)
                .bind(rule.updated_at)
                .execute(pool)
                .await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO asset_rules (id, name, description, link_assignments, term_ids, rule_type, \
                     query_expression, metadata_field, pattern_type, pattern_value, priority, enabled, \
                     membership_count, created_at, updated_at) \
                     VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
                )
                .bind(rule.id.0.to_string())
                .bind(&rule.name)
                .bind(&rule.description)
                .bind(links)
                .bind(terms)
                .bind(rule_type)
                .bind(query_expression)
                .bind(metadata_field)
                .bind(pattern_type)
                .bind(pattern_value)
                .bind(rule.priority)
                .bind(rule.enabled)
                .bind(rule.membership_count)
                .bind(rule.created_at)
                .bind(rule.updated_at)
                .execute(pool)
                .await?;
            }
        }
        Ok(rule)
    }

    async fn get(&self, id: RuleId) -> Result<Option<Rule>, RepoError> {
        let row: Option<RuleRow> = match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query_as("SELECT * FROM asset_rules WHERE id = $1").bind(id.0).fetch_optional(pool).await?
            }
            DbPool::Sqlite(pool) => {
                sqlx::query_as("SELECT * FROM asset_rules WHERE id = ?")
                    .bind(id.0.to_string())
                    .fetch_optional(pool)
                    .await?
            }
        };
        row.map(Rule::try_from).transpose()
    }

    async fn delete(&self, id: RuleId) -> Result<(), RepoError> {
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query("DELETE FROM asset_rules WHERE id = $1").bind(id.0).execute(pool).await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query("DELETE FROM asset_rules WHERE id = ?").bind(id.0.to_string()).execute(pool).await?;
            }
        }
        Ok(())
    }

    async fn list_enabled(&self) -> Result<Vec<Rule>, RepoError> {
        let rows: Vec<RuleRow> = match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query_as("SELECT * FROM asset_rules WHERE enabled ORDER BY priority ASC, created_at ASC")
                    .fetch_all(pool)
                    .await?
            }
            DbPool::Sqlite(pool) => {
                sqlx::query_as("SELECT * FROM asset_rules WHERE enabled ORDER BY priority ASC, created_at ASC")
                    .fetch_all(pool)
                    .await?
            }
        };
        rows.into_iter().map(Rule::try_from).collect()
    }

    async fn candidates_for_signature(&self, target_rows: &[(&str, String)]) -> Result<Vec<Rule>, RepoError> {
        // sqlx's query builder doesn't support a dynamic IN-list of tuples
        // cleanly across both backends, so this fetches every enabled
        // rule and filters in memory — acceptable at the rule-table sizes
        // this system expects (hundreds, not millions).
        let all = self.list_enabled().await?;
        let wanted: BTreeSet<(&str, &str)> = target_rows.iter().map(|(t, v)| (*t, v.as_str())).collect();
        Ok(all
            .into_iter()
            .filter(|rule| match &rule.kind {
                RuleKind::Query { .. } => true,
                RuleKind::MetadataMatch { field, .. } => {
                    let top_level = field.split('.').next().unwrap_or(field);
                    wanted.contains(&("metadata_key", top_level))
                }
            })
            .collect())
    }

    async fn replace_targets(&self, rule_id: RuleId, target_rows: &[(&str, String)]) -> Result<(), RepoError> {
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query("DELETE FROM rule_targets WHERE rule_id = $1").bind(rule_id.0).execute(pool).await?;
                for (target_type, target_value) in target_rows {
                    sqlx::query("INSERT INTO rule_targets (rule_id, target_type, target_value) VALUES ($1,$2,$3)")
                        .bind(rule_id.0)
                        .bind(target_type)
                        .bind(target_value)
                        .execute(pool)
                        .await?;
                }
            }
            DbPool::Sqlite(pool) => {
                sqlx::query("DELETE FROM rule_targets WHERE rule_id = ?")
                    .bind(rule_id.0.to_string())
                    .execute(pool)
                    .await?;
                for (target_type, target_value) in target_rows {
                    sqlx::query("INSERT INTO rule_targets (rule_id, target_type, target_value) VALUES (?,?,?)")
                        .bind(rule_id.0.to_string())
                        .bind(target_type)
                        .bind(target_value)
                        .execute(pool)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn store_reconciliation(&self, rule_id: RuleId, hash: &str, reconciled_at: DateTime<Utc>) -> Result<(), RepoError> {
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query("UPDATE asset_rules SET reconciliation_hash = $1, last_reconciled_at = $2 WHERE id = $3")
                    .bind(hash)
                    .bind(reconciled_at)
                    .bind(rule_id.0)
                    .execute(pool)
                    .await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query("UPDATE asset_rules SET reconciliation_hash = ?, last_reconciled_at = ? WHERE id = ?")
                    .bind(hash)
                    .bind(reconciled_at)
                    .bind(rule_id.0.to_string())
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn set_membership_count(&self, rule_id: RuleId, count: i32) -> Result<(), RepoError> {
        match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query("UPDATE asset_rules SET membership_count = $1 WHERE id = $2")
                    .bind(count)
                    .bind(rule_id.0)
                    .execute(pool)
                    .await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query("UPDATE asset_rules SET membership_count = ? WHERE id = ?")
                    .bind(count)
                    .bind(rule_id.0.to_string())
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }
}

pub struct SqlMembershipRepo {
    db: Arc<DbPool>,
}

impl SqlMembershipRepo {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MembershipRepo for SqlMembershipRepo {
    async fn members_of(&self, rule_id: RuleId) -> Result<BTreeSet<String>, RepoError> {
        let rows: Vec<(String,)> = match self.db.as_ref() {
            DbPool::Postgres(pool) => {
                sqlx::query_as("SELECT asset_mrn FROM rule_memberships WHERE rule_id = $1")
                    .bind(rule_id.0)
                    .fetch_all(pool)
                    .await?
            }
            DbPool::Sqlite(pool) => {
                sqlx::query_as("SELECT asset_mrn FROM rule_memberships WHERE rule_id = ?")
                    .bind(rule_id.0.to_string())
                    .fetch_all(pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(|(mrn,)| mrn).collect())
    }

    async fn insert_members(&self, rule_id: RuleId, asset_mrns: &[String], now: DateTime<Utc>) -> Result<(), RepoError> {
        for mrn in asset_mrns {
            match self.db.as_ref() {
                DbPool::Postgres(pool) => {
                    sqlx::query(
                        "INSERT INTO rule_memberships (rule_id, asset_mrn, created_at) VALUES ($1,$2,$3) \
                         ON CONFLICT (rule_id, asset_mrn) DO NOTHING",
                    )
                    .bind(rule_id.0)
                    .bind(mrn)
                    .bind(now)
                    .execute(pool)
                    .await?;
                }
                DbPool::Sqlite(pool) => {
                    sqlx::query(
                        "INSERT INTO rule_memberships (rule_id, asset_mrn, created_at) VALUES (?,?,?) \
                         ON CONFLICT (rule_id, asset_mrn) DO NOTHING",
                    )
                    .bind(rule_id.0.to_string())
                    .bind(mrn)
                    .bind(now)
                    .execute(pool)
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn delete_members(&self, rule_id: RuleId, asset_mrns: &[String]) -> Result<(), RepoError> {
        for mrn in asset_mrns {
            match self.db.as_ref() {
                DbPool::Postgres(pool) => {
                    sqlx::query("DELETE FROM rule_memberships WHERE rule_id = $1 AND asset_mrn = $2")
                        .bind(rule_id.0)
                        .bind(mrn)
                        .execute(pool)
                        .await?;
                }
                DbPool::Sqlite(pool) => {
                    sqlx::query("DELETE FROM rule_memberships WHERE rule_id = ? AND asset_mrn = ?")
                        .bind(rule_id.0.to_string())
                        .bind(mrn)
                        .execute(pool)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn upsert_terms(&self, asset_mrn: &str, term_ids: &[String], source: &str, now: DateTime<Utc>) -> Result<(), RepoError> {
        for term_id in term_ids {
            match self.db.as_ref() {
                DbPool::Postgres(pool) => {
                    sqlx::query(
                        "INSERT INTO asset_terms (asset_mrn, term_id, source, created_at) VALUES ($1,$2,$3,$4) \
                         ON CONFLICT (asset_mrn, term_id, source) DO NOTHING",
                    )
                    .bind(asset_mrn)
                    .bind(term_id)
                    .bind(source)
                    .bind(now)
                    .execute(pool)
                    .await?;
                }
                DbPool::Sqlite(pool) => {
                    sqlx::query(
                        "INSERT INTO asset_terms (asset_mrn, term_id, source, created_at) VALUES (?,?,?,?) \
                         ON CONFLICT (asset_mrn, term_id, source) DO NOTHING",
                    )
                    .bind(asset_mrn)
                    .bind(term_id)
                    .bind(source)
                    .bind(now)
                    .execute(pool)
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn delete_terms(&self, asset_mrn: &str, term_ids: &[String], source: &str) -> Result<(), RepoError> {
        for term_id in term_ids {
            match self.db.as_ref() {
                DbPool::Postgres(pool) => {
                    sqlx::query("DELETE FROM asset_terms WHERE asset_mrn = $1 AND term_id = $2 AND source = $3")
                        .bind(asset_mrn)
                        .bind(term_id)
                        .bind(source)
                        .execute(pool)
                        .await?;
                }
                DbPool::Sqlite(pool) => {
                    sqlx::query("DELETE FROM asset_terms WHERE asset_mrn = ? AND term_id = ? AND source = ?")
                        .bind(asset_mrn)
                        .bind(term_id)
                        .bind(source)
                        .execute(pool)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

/// In-memory fakes driving the incremental-evaluation and
/// differential-reconciliation unit tests without a live database.
#[derive(Default)]
pub struct InMemoryRuleRepo {
    rules: tokio::sync::Mutex<BTreeMap<Uuid, Rule>>,
    targets: tokio::sync::Mutex<BTreeSet<(Uuid, String, String)>>,
}

impl InMemoryRuleRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleRepo for InMemoryRuleRepo {
    async fn create(&self, rule: Rule) -> Result<Rule, RepoError> {
        validate_rule(&rule).map_err(RepoError::Validation)?;
        self.rules.lock().await.insert(rule.id.0, rule.clone());
        Ok(rule)
    }

    async fn get(&self, id: RuleId) -> Result<Option<Rule>, RepoError> {
        Ok(self.rules.lock().await.get(&id.0).cloned())
    }

    async fn delete(&self, id: RuleId) -> Result<(), RepoError> {
        self.rules.lock().await.remove(&id.0);
        Ok(())
    }

    async fn list_enabled(&self) -> Result<Vec<Rule>, RepoError> {
        let mut rules: Vec<Rule> = self.rules.lock().await.values().filter(|r| r.enabled).cloned().collect();
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)));
        Ok(rules)
    }

    async fn candidates_for_signature(&self, target_rows: &[(&str, String)]) -> Result<Vec<Rule>, RepoError> {
        let wanted: BTreeSet<(&str, &str)> = target_rows.iter().map(|(t, v)| (*t, v.as_str())).collect();
        let rules = self.list_enabled().await?;
        Ok(rules
            .into_iter()
            .filter(|rule| match &rule.kind {
                RuleKind::Query { .. } => true,
                RuleKind::MetadataMatch { field, .. } => {
                    let top_level = field.split('.').next().unwrap_or(field);
                    wanted.contains(&("metadata_key", top_level))
                }
            })
            .collect())
    }

    async fn replace_targets(&self, rule_id: RuleId, target_rows: &[(&str, String)]) -> Result<(), RepoError> {
        let mut targets = self.targets.lock().await;
        targets.retain(|(id, _, _)| *id != rule_id.0);
        for (target_type, target_value) in target_rows {
            targets.insert((rule_id.0, target_type.to_string(), target_value.clone()));
        }
        Ok(())
    }

    async fn store_reconciliation(&self, rule_id: RuleId, hash: &str, reconciled_at: DateTime<Utc>) -> Result<(), RepoError> {
        if let Some(rule) = self.rules.lock().await.get_mut(&rule_id.0) {
            rule.reconciliation_hash = Some(hash.to_string());
            rule.last_reconciled_at = Some(reconciled_at);
        }
        Ok(())
    }

    async fn set_membership_count(&self, rule_id: RuleId, count: i32) -> Result<(), RepoError> {
        if let Some(rule) = self.rules.lock().await.get_mut(&rule_id.0) {
            rule.membership_count = count;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryMembershipRepo {
    memberships: tokio::sync::Mutex<BTreeMap<Uuid, BTreeSet<String>>>,
    terms: tokio::sync::Mutex<BTreeSet<(String, String, String)>>,
}

impl InMemoryMembershipRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MembershipRepo for InMemoryMembershipRepo {
    async fn members_of(&self, rule_id: RuleId) -> Result<BTreeSet<String>, RepoError> {
        Ok(self.memberships.lock().await.get(&rule_id.0).cloned().unwrap_or_default())
    }

    async fn insert_members(&self, rule_id: RuleId, asset_mrns: &[String], _now: DateTime<Utc>) -> Result<(), RepoError> {
        let mut memberships = self.memberships.lock().await;
        let entry = memberships.entry(rule_id.0).or_default();
        for mrn in asset_mrns {
            entry.insert(mrn.clone());
        }
        Ok(())
    }

    async fn delete_members(&self, rule_id: RuleId, asset_mrns: &[String]) -> Result<(), RepoError> {
        if let Some(entry) = self.memberships.lock().await.get_mut(&rule_id.0) {
            for mrn in asset_mrns {
                entry.remove(mrn);
            }
        }
        Ok(())
    }

    async fn upsert_terms(&self, asset_mrn: &str, term_ids: &[String], source: &str, _now: DateTime<Utc>) -> Result<(), RepoError> {
        let mut terms = self.terms.lock().await;
        for term_id in term_ids {
            terms.insert((asset_mrn.to_string(), term_id.clone(), source.to_string()));
        }
        Ok(())
    }

    async fn delete_terms(&self, asset_mrn: &str, term_ids: &[String], source: &str) -> Result<(), RepoError> {
        let mut terms = self.terms.lock().await;
        for term_id in term_ids {
            terms.remove(&(asset_mrn.to_string(), term_id.clone(), source.to_string()));
        }
        Ok(())
    }
}
