//! Error taxonomy of the core.
//!
//! Failures are isolated to the island or battle they occurred in; none of
//! them is fatal to the process.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::PlayerId;

/// Structured failure returned by the persistence adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// Retryable failure of the durable store (busy, locked, I/O).
    #[error("transient persistence failure: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &e {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound(e.to_string()),
            rusqlite::Error::SqliteFailure(err, msg) => {
                let detail = msg.clone().unwrap_or_else(|| err.to_string());
                match err.code {
                    ErrorCode::ConstraintViolation => {
                        if detail.contains("UNIQUE") || detail.contains("PRIMARY KEY") {
                            Self::Conflict(detail)
                        } else {
                            Self::Validation(detail)
                        }
                    }
                    _ => Self::Transient(detail),
                }
            }
            // Stored data that does not decode is not going to decode on a retry
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..) => Self::Validation(e.to_string()),
            _ => Self::Transient(e.to_string()),
        }
    }
}

/// Error returned by core operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("player {0} is already queued for a battle")]
    AlreadyQueued(PlayerId),

    #[error("player {0} is already in a battle")]
    AlreadyInBattle(PlayerId),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Persistence(#[from] StoreError),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Collapse into the coarse taxonomy reported to clients.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Conflict(_) | Self::AlreadyQueued(_) | Self::AlreadyInBattle(_) => {
                ErrorKind::Conflict
            }
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Persistence(StoreError::Conflict(_)) => ErrorKind::Conflict,
            Self::Persistence(StoreError::NotFound(_)) => ErrorKind::NotFound,
            Self::Persistence(StoreError::Validation(_)) => ErrorKind::Validation,
            Self::Persistence(StoreError::Transient(_)) => ErrorKind::TransientPersistence,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    TransientPersistence,
}
