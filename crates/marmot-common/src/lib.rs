pub mod config;
pub mod crypto;
pub mod error;
pub mod ids;
pub mod retry;
pub mod tracing_init;

pub use error::{Error, SafeDisplay};
