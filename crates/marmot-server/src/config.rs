//! Top-level server config: `CoreConfig` (db, encryption, scheduler
//! timings — shared by every background component) plus the HTTP bind
//! address and a handful of server-only knobs. Loaded the same way as
//! the rest of the workspace via [`marmot_common::config::ConfigLoader`],
//! then patched with the literal environment variable names spec.md §6
//! contracts for (`ENCRYPTION_KEY`, `ALLOW_UNENCRYPTED`,
//! `PIPELINES_MAX_WORKERS`, `PIPELINES_SCHEDULER_INTERVAL`,
//! `PIPELINES_LEASE_EXPIRY`, `PIPELINES_CLAIM_EXPIRY`) since those don't
//! follow the workspace's usual `MARMOT__` nested-env convention.

use marmot_common::config::{ConfigLoader, CoreConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub core: CoreConfig,
    pub bind_addr: String,
    pub node_id: String,
    /// How often the Rule Reconciler runs a full differential pass.
    #[serde(with = "humantime_serde")]
    pub rule_reconcile_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            core: CoreConfig::default(),
            bind_addr: "0.0.0.0:8080".to_string(),
            node_id: uuid::Uuid::new_v4().to_string(),
            rule_reconcile_interval: Duration::from_secs(30 * 60),
        }
    }
}

pub fn make_config_loader() -> ConfigLoader<ServerConfig> {
    ConfigLoader::new(&PathBuf::from("config/marmot-server.toml"))
}

/// Applies the spec's literal (unprefixed) environment variable names on
/// top of whatever the TOML/`MARMOT__`-prefixed figment layer produced.
pub fn apply_literal_env_overrides(config: &mut ServerConfig) {
    if let Ok(key) = std::env::var("ENCRYPTION_KEY") {
        config.core.encryption_key = Some(key);
    }
    if let Ok(flag) = std::env::var("ALLOW_UNENCRYPTED") {
        if let Ok(parsed) = flag.parse::<bool>() {
            config.core.allow_unencrypted = parsed;
        }
    }
    if let Some(workers) = parse_env("PIPELINES_MAX_WORKERS") {
        config.core.max_workers = workers;
    }
    if let Some(secs) = parse_env::<u64>("PIPELINES_SCHEDULER_INTERVAL") {
        config.core.scheduler_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = parse_env::<u64>("PIPELINES_LEASE_EXPIRY") {
        config.core.lease_expiry = Duration::from_secs(secs);
    }
    if let Some(secs) = parse_env::<u64>("PIPELINES_CLAIM_EXPIRY") {
        config.core.claim_expiry = Duration::from_secs(secs);
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
