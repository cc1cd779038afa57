//! Config loading in the teacher's style: a TOML file merged with
//! environment variable overrides via `figment`, plus a `--dump-config`
//! escape hatch for operators. Mirrors
//! `golem_common::config::ConfigLoader` as used throughout
//! `cloud-service`/`cloud-component-service`.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::SafeDisplay;

pub trait ConfigLoaderConfig: Default + Serialize + DeserializeOwned {}
impl<T: Default + Serialize + DeserializeOwned> ConfigLoaderConfig for T {}

pub struct ConfigLoader<T> {
    pub config_file_name: PathBuf,
    env_prefix: String,
    _marker: std::marker::PhantomData<T>,
}

impl<T: ConfigLoaderConfig> ConfigLoader<T> {
    pub fn new(config_file_name: &PathBuf) -> Self {
        ConfigLoader {
            config_file_name: config_file_name.clone(),
            env_prefix: "MARMOT__".to_string(),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = prefix.to_string();
        self
    }

    fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed(&self.env_prefix).split("__"))
    }

    pub fn load(&self) -> figment::Result<T> {
        self.figment().extract()
    }

    /// If invoked with `--dump-config`, prints the effective configuration
    /// (as TOML) and returns `None` instead of loading. Otherwise loads and
    /// returns `Some`. Lets `main()` short-circuit cleanly before opening a
    /// database connection.
    pub fn load_or_dump_config(&self) -> Option<T>
    where
        T: Clone,
    {
        if std::env::args().any(|arg| arg == "--dump-config") {
            match self.load() {
                Ok(config) => {
                    println!(
                        "{}",
                        toml::to_string_pretty(&config)
                            .unwrap_or_else(|_| "<unserializable config>".to_string())
                    );
                }
                Err(error) => eprintln!("Failed to load config: {error}"),
            }
            None
        } else {
            match self.load() {
                Ok(config) => Some(config),
                Err(error) => {
                    eprintln!("Failed to load config: {error}");
                    None
                }
            }
        }
    }
}

/// Retry policy shape reused by the webhook dispatcher (§4.L) and anywhere
/// else a component needs bounded exponential backoff.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// `retry_delay * attempt^2`, per spec.md §4.L's webhook backoff.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.min_delay.as_secs_f64() * (attempt as f64).powi(2) * self.multiplier
            / self.multiplier.max(1.0);
        let scaled = scaled.max(self.min_delay.as_secs_f64());
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

impl SafeDisplay for RetryConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "max_attempts: {}, min_delay: {:?}, max_delay: {:?}, multiplier: {}",
            self.max_attempts, self.min_delay, self.max_delay, self.multiplier
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DbConfig {
    Postgres(DbPostgresConfig),
    Sqlite(DbSqliteConfig),
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig::Sqlite(DbSqliteConfig::default())
    }
}

impl SafeDisplay for DbConfig {
    fn to_safe_string(&self) -> String {
        match self {
            DbConfig::Postgres(c) => format!(
                "postgres {}:{}/{} (max_connections={})",
                c.host, c.port, c.database, c.max_connections
            ),
            DbConfig::Sqlite(c) => {
                format!("sqlite {} (max_connections={})", c.database, c.max_connections)
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbPostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_connections: u32,
    pub schema: String,
}

impl Default for DbPostgresConfig {
    fn default() -> Self {
        DbPostgresConfig {
            host: "localhost".to_string(),
            port: 5432,
            database: "marmot".to_string(),
            username: "marmot".to_string(),
            password: "marmot".to_string(),
            max_connections: 10,
            schema: "public".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbSqliteConfig {
    pub database: String,
    pub max_connections: u32,
}

impl Default for DbSqliteConfig {
    fn default() -> Self {
        DbSqliteConfig {
            database: "marmot.db".to_string(),
            max_connections: 10,
        }
    }
}

/// Shared section of `marmot-server`'s top-level config: everything every
/// background component needs regardless of which crate owns it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreConfig {
    pub db: DbConfig,
    pub encryption_key: Option<String>,
    pub allow_unencrypted: bool,
    pub max_workers: usize,
    #[serde(with = "humantime_serde")]
    pub scheduler_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub lease_expiry: Duration,
    #[serde(with = "humantime_serde")]
    pub claim_expiry: Duration,
    #[serde(with = "humantime_serde")]
    pub stale_run_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            db: DbConfig::default(),
            encryption_key: None,
            allow_unencrypted: false,
            max_workers: 10,
            scheduler_interval: Duration::from_secs(10),
            lease_expiry: Duration::from_secs(300),
            claim_expiry: Duration::from_secs(60),
            stale_run_timeout: Duration::from_secs(3600),
        }
    }
}

impl SafeDisplay for CoreConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "db: {}\nallow_unencrypted: {}\nmax_workers: {}\nscheduler_interval: {:?}\nlease_expiry: {:?}\nclaim_expiry: {:?}\nstale_run_timeout: {:?}",
            self.db.to_safe_string(),
            self.allow_unencrypted,
            self.max_workers,
            self.scheduler_interval,
            self.lease_expiry,
            self.claim_expiry,
            self.stale_run_timeout,
        )
    }
}
