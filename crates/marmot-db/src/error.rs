use marmot_common::error::Error as CoreError;

/// Storage-layer error, converted at each service boundary into the
/// caller's own error enum — the same `From<RepoError> for ...Error`
/// pattern the teacher applies in `cloud-component-service::service`.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("row not found")]
    NotFound,
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("invalid stored data: {0}")]
    Corrupt(String),
    #[error("validation error: {0}")]
    Validation(String),
}

impl From<RepoError> for CoreError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::NotFound => CoreError::NotFound("row not found".to_string()),
            RepoError::Conflict(msg) => CoreError::Conflict(msg),
            RepoError::Corrupt(msg) => CoreError::Internal(format!("corrupt row: {msg}")),
            RepoError::Validation(msg) => CoreError::Validation(msg),
            RepoError::Db(e) => {
                if e.as_database_error()
                    .and_then(|db_err| db_err.code())
                    .is_some_and(|code| code == "23505" || code == "2067")
                {
                    CoreError::Conflict(e.to_string())
                } else {
                    CoreError::Transient(e.to_string())
                }
            }
        }
    }
}
