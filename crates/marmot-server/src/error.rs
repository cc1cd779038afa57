//! Maps the workspace's `Error` taxonomy (spec.md §7) onto HTTP status
//! codes for the poem-openapi handlers.

use marmot_common::error::Error as CoreError;
use marmot_ingest::ScheduleServiceError;
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, Object};

#[derive(Debug, Clone, Object)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(ApiResponse, Debug)]
pub enum ApiError {
    #[oai(status = 400)]
    BadRequest(Json<ErrorBody>),
    #[oai(status = 404)]
    NotFound(Json<ErrorBody>),
    #[oai(status = 409)]
    Conflict(Json<ErrorBody>),
    #[oai(status = 500)]
    Internal(Json<ErrorBody>),
}

fn body(msg: impl ToString) -> Json<ErrorBody> {
    Json(ErrorBody { error: msg.to_string() })
}

impl From<CoreError> for ApiError {
    fn from(value: CoreError) -> Self {
        match value {
            CoreError::Validation(msg) => ApiError::BadRequest(body(msg)),
            CoreError::NotFound(msg) => ApiError::NotFound(body(msg)),
            CoreError::Conflict(msg) => ApiError::Conflict(body(msg)),
            CoreError::Transient(msg) | CoreError::NonRetryable(msg) | CoreError::Internal(msg) => {
                ApiError::Internal(body(msg))
            }
        }
    }
}

impl From<marmot_db::RepoError> for ApiError {
    fn from(value: marmot_db::RepoError) -> Self {
        CoreError::from(value).into()
    }
}

impl From<ScheduleServiceError> for ApiError {
    fn from(value: ScheduleServiceError) -> Self {
        match value {
            ScheduleServiceError::InvalidCron(e) => ApiError::BadRequest(body(e)),
            ScheduleServiceError::Repo(e) => e.into(),
            ScheduleServiceError::Crypto(e) => e.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        ApiError::Internal(body(value))
    }
}
