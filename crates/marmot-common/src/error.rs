use std::fmt::Display;

/// Mirrors the error kind taxonomy of the ingestion control plane: every
/// fallible operation in every crate ultimately produces one of these kinds
/// so callers (schedulers, HTTP adapters, CLIs) can apply a uniform policy.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient error: {0}")]
    Transient(String),
    #[error("non-retryable error: {0}")]
    NonRetryable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation<T: Display>(msg: T) -> Self {
        Error::Validation(msg.to_string())
    }

    pub fn not_found<T: Display>(msg: T) -> Self {
        Error::NotFound(msg.to_string())
    }

    pub fn conflict<T: Display>(msg: T) -> Self {
        Error::Conflict(msg.to_string())
    }

    pub fn internal<T: Display>(msg: T) -> Self {
        Error::Internal(msg.to_string())
    }

    /// Transient (network/DB timeout) and other retryable kinds, per §7's
    /// propagation policy table.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

/// Renders an error (or value) for logs/API responses without leaking
/// secrets that a bare `Display`/`Debug` impl might include — decrypted
/// schedule configuration, webhook URLs, credentials. Every error type that
/// crosses a service boundary implements this, following the teacher's
/// `golem_common::SafeDisplay` convention.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;

    fn to_safe_string_indented(&self) -> String {
        self.to_safe_string()
            .lines()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl SafeDisplay for Error {
    fn to_safe_string(&self) -> String {
        match self {
            Error::Validation(msg) => format!("validation error: {msg}"),
            Error::NotFound(msg) => format!("not found: {msg}"),
            Error::Conflict(msg) => format!("conflict: {msg}"),
            Error::Transient(_) => "transient error, retry later".to_string(),
            Error::NonRetryable(_) => "request rejected by external endpoint".to_string(),
            Error::Internal(_) => "internal error".to_string(),
        }
    }
}
