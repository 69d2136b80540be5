//! Error taxonomy shared by request handlers and the orchestrator.
//!
//! Handlers return `ApiError`; the dispatch layer maps each class to a
//! transport `ResponseStatus` and attaches the display text as `errorText`.
//! Background tasks have no response channel, so they log and, where the
//! work is job-shaped, mark the job ERROR instead.

use crate::wire::ResponseStatus;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("permission denied: {0}")]
    NoPermission(String),

    #[error(transparent)]
    Server(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> ResponseStatus {
        match self {
            ApiError::BadRequest(_) => ResponseStatus::BadRequest,
            ApiError::NotFound(_) => ResponseStatus::NotFound,
            ApiError::NoPermission(_) => ResponseStatus::NoPermission,
            ApiError::Server(_) => ResponseStatus::ServerError,
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => ApiError::NotFound("record".to_string()),
            other => ApiError::Server(other.into()),
        }
    }
}

impl From<crate::objstore::StoreError> for ApiError {
    fn from(e: crate::objstore::StoreError) -> Self {
        match e {
            crate::objstore::StoreError::NotFound { ref path, .. } => {
                ApiError::NotFound(path.clone())
            }
            other => ApiError::Server(other.into()),
        }
    }
}
