//! Process wiring for the ingestion control plane: config loading,
//! database connection, service construction, and the poem-openapi HTTP
//! surface over the run/schedule lifecycle (spec.md §6).

pub mod api;
pub mod config;
pub mod error;
pub mod observer;
pub mod plugin;
pub mod services;

pub use config::ServerConfig;
pub use services::Services;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
