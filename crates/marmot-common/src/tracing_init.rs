//! Structured logging bootstrap, generalized from
//! `golem_common::tracing::init_tracing_with_default_env_filter`: an
//! `EnvFilter` defaulting to `info`, with an optional JSON formatter for
//! production deployments.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    pub default_level: String,
    pub json: bool,
}

impl TracingConfig {
    pub fn local_dev(service_name: &str) -> Self {
        tracing::debug!(service = service_name, "using local-dev tracing defaults");
        TracingConfig {
            default_level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        TracingConfig {
            default_level: "info".to_string(),
            json: false,
        }
    }
}

pub fn init_tracing_with_default_env_filter(config: &TracingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_level.clone()));

    let subscriber = fmt().with_env_filter(filter);

    if config.json {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}
