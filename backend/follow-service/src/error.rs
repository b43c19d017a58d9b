/// Error types for follow-service
use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use idempotent_consumer::IdempotencyError;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{CursorError, Edge};

/// Failures of the relation store
#[derive(Error, Debug)]
pub enum RelationError {
    #[error("Follow edge already exists")]
    AlreadyExists(Edge),

    #[error("Invalid edge: a user cannot follow themselves")]
    InvalidEdge,

    /// `tombstone` is the last removed edge of the pair, when known.
    #[error("Follow edge not found")]
    NotFound { tombstone: Option<Edge> },

    #[error("Relation store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for RelationError {
    fn from(err: sqlx::Error) -> Self {
        RelationError::Unavailable(err.to_string())
    }
}

/// Failures of the user directory (profiles and counter storage)
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("User directory unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for DirectoryError {
    fn from(err: sqlx::Error) -> Self {
        DirectoryError::Unavailable(err.to_string())
    }
}

impl From<IdempotencyError> for DirectoryError {
    fn from(err: IdempotencyError) -> Self {
        DirectoryError::Unavailable(err.to_string())
    }
}

/// Failures while recomputing counters from the edge set
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Relation(#[from] RelationError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("No counters stored for user {0}")]
    UnknownUser(Uuid),
}

/// Errors surfaced to callers of the follow API
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("User not found: {0}")]
    UnknownUser(Uuid),

    /// Storage or transport failure before the outcome is known; safe to retry.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Unavailable(_))
    }
}

impl From<CursorError> for ServiceError {
    fn from(err: CursorError) -> Self {
        ServiceError::InvalidRequest(err.to_string())
    }
}

impl From<DirectoryError> for ServiceError {
    fn from(err: DirectoryError) -> Self {
        ServiceError::Unavailable(err.to_string())
    }
}

impl From<RelationError> for ServiceError {
    fn from(err: RelationError) -> Self {
        match err {
            RelationError::Unavailable(msg) => ServiceError::Unavailable(msg),
            RelationError::InvalidEdge => {
                ServiceError::InvalidRequest("a user cannot follow themselves".to_string())
            }
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

impl From<ReconcileError> for ServiceError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::UnknownUser(id) => ServiceError::UnknownUser(id),
            ReconcileError::Relation(e) => e.into(),
            ReconcileError::Directory(e) => e.into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::UnknownUser(_) => StatusCode::NOT_FOUND,
            ServiceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let error_type = match self {
            ServiceError::InvalidRequest(_) => "INVALID_REQUEST",
            ServiceError::UnknownUser(_) => "USER_NOT_FOUND",
            ServiceError::Unavailable(_) => "UNAVAILABLE",
            ServiceError::Internal(_) => "INTERNAL_ERROR",
        };

        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        })
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;
