//! Metadata-match rule evaluation (spec.md §4.H). Query rules are
//! handled separately via [`crate::search::SearchBackend`] since they
//! require calling out to a search component instead of comparing
//! in-memory values.

use crate::model::{PatternType, Rule, RuleKind};
use marmot_assets::Asset;
use regex::Regex;
use serde_json::Value;
use wildmatch::WildMatch;

/// Walks `field` as a dotted path into `asset.metadata`, returning the
/// leaf value as a string (objects/arrays never match, only scalars).
pub fn resolve_field<'a>(asset: &'a Asset, field: &str) -> Option<String> {
    let mut segments = field.split('.');
    let root = segments.next()?;
    let mut current = asset.metadata.get(root)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// `true` if `asset`'s value at `field` matches `pattern_value` under
/// `pattern_type`'s semantics. A missing field never matches.
pub fn matches(asset: &Asset, field: &str, pattern_type: PatternType, pattern_value: &str) -> bool {
    let Some(actual) = resolve_field(asset, field) else {
        return false;
    };
    match pattern_type {
        PatternType::Exact => actual.trim().eq_ignore_ascii_case(pattern_value.trim()),
        PatternType::Wildcard => WildMatch::new(pattern_value).matches(&actual),
        PatternType::Prefix => actual.to_lowercase().starts_with(&pattern_value.to_lowercase()),
        PatternType::Regex => Regex::new(pattern_value)
            .map(|re| re.find(&actual).is_some_and(|m| m.start() == 0 && m.end() == actual.len()))
            .unwrap_or(false),
    }
}

/// Rejects an uncompilable regex at save time, per spec.md §4.H.
pub fn validate_pattern(pattern_type: PatternType, pattern_value: &str) -> Result<(), String> {
    if pattern_type == PatternType::Regex {
        Regex::new(pattern_value).map(|_| ()).map_err(|e| e.to_string())
    } else {
        Ok(())
    }
}

/// Enforces both of spec.md §3's `AssetRule` invariants before a rule is
/// persisted: an uncompilable regex pattern, and a rule that would have no
/// visible effect (no link assignments and no term ids).
pub fn validate_rule(rule: &Rule) -> Result<(), String> {
    if let RuleKind::MetadataMatch { pattern_type, pattern_value, .. } = &rule.kind {
        validate_pattern(*pattern_type, pattern_value)?;
    }
    if rule.link_assignments.is_empty() && rule.term_ids.is_empty() {
        return Err("rule must have at least one link assignment or term id".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use marmot_common::ids::Mrn;
    use serde_json::json;

    fn asset_with(field: &str, value: Value) -> Asset {
        let mut asset = Asset::new_stub(Mrn::compute("Topic", "Kafka", "orders"), "Topic".to_string(), Utc::now());
        asset.metadata.insert(field.to_string(), value);
        asset
    }

    #[test]
    fn exact_is_case_and_whitespace_insensitive() {
        let asset = asset_with("owner", json!(" Finance-Team "));
        assert!(matches(&asset, "owner", PatternType::Exact, "finance-team"));
    }

    #[test]
    fn wildcard_matches_star_and_question_mark() {
        let asset = asset_with("topic_name", json!("orders.created.v2"));
        assert!(matches(&asset, "topic_name", PatternType::Wildcard, "orders.*.v?"));
        assert!(!matches(&asset, "topic_name", PatternType::Wildcard, "payments.*"));
    }

    #[test]
    fn prefix_is_case_insensitive() {
        let asset = asset_with("env", json!("PRODUCTION-east"));
        assert!(matches(&asset, "env", PatternType::Prefix, "production"));
    }

    #[test]
    fn regex_requires_full_match() {
        let asset = asset_with("level", json!("pii-high"));
        assert!(matches(&asset, "level", PatternType::Regex, "pii-(high|medium)"));
        assert!(!matches(&asset, "level", PatternType::Regex, "pii"), "partial match must not count as a match");
    }

    #[test]
    fn dotted_path_resolves_into_nested_object() {
        let asset = asset_with("owner", json!({"team": "platform"}));
        assert_eq!(resolve_field(&asset, "owner.team"), Some("platform".to_string()));
    }

    #[test]
    fn missing_field_never_matches() {
        let asset = asset_with("owner", json!("platform"));
        assert!(!matches(&asset, "nonexistent", PatternType::Exact, "platform"));
    }

    #[test]
    fn invalid_regex_is_rejected_at_validation() {
        assert!(validate_pattern(PatternType::Regex, "(unterminated").is_err());
        assert!(validate_pattern(PatternType::Exact, "(unterminated").is_ok());
    }

    fn rule_with(kind: RuleKind, link_assignments: Vec<crate::model::LinkAssignment>, term_ids: Vec<String>) -> Rule {
        Rule {
            id: marmot_common::ids::RuleId::new_v4(),
            name: "rule".to_string(),
            description: String::new(),
            kind,
            link_assignments,
            term_ids,
            priority: 0,
            enabled: true,
            membership_count: 0,
            reconciliation_hash: None,
            last_reconciled_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn rule_with_no_links_and_no_terms_is_invalid() {
        let rule = rule_with(
            RuleKind::MetadataMatch { field: "owner".to_string(), pattern_type: PatternType::Exact, pattern_value: "x".to_string() },
            vec![],
            vec![],
        );
        assert!(validate_rule(&rule).is_err());
    }

    #[test]
    fn rule_with_term_ids_and_no_links_is_valid() {
        let rule = rule_with(
            RuleKind::MetadataMatch { field: "owner".to_string(), pattern_type: PatternType::Exact, pattern_value: "x".to_string() },
            vec![],
            vec!["term-1".to_string()],
        );
        assert!(validate_rule(&rule).is_ok());
    }

    #[test]
    fn rule_with_uncompilable_regex_is_invalid_even_with_term_ids() {
        let rule = rule_with(
            RuleKind::MetadataMatch { field: "owner".to_string(), pattern_type: PatternType::Regex, pattern_value: "(unterminated".to_string() },
            vec![],
            vec!["term-1".to_string()],
        );
        assert!(validate_rule(&rule).is_err());
    }
}
