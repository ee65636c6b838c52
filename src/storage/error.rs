//! Error types for the storage layer.

use std::fmt;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O against the snapshot directory failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot or row (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Relational backend failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Named branch/tag/resource/group absent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate name, or a mutation targeting an immutable tag.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed query pattern.
    #[error("Invalid pattern: {0}")]
    Pattern(String),

    /// Bad backend configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl StorageError {
    pub fn serialization<E: fmt::Display>(err: E) -> Self {
        Self::Serialization(err.to_string())
    }

    pub fn database<E: fmt::Display>(err: E) -> Self {
        Self::Database(err.to_string())
    }

    pub fn not_found<E: fmt::Display>(what: E) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn conflict<E: fmt::Display>(msg: E) -> Self {
        Self::Conflict(msg.to_string())
    }

    pub fn configuration<E: fmt::Display>(msg: E) -> Self {
        Self::Configuration(msg.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}

impl From<regex::Error> for StorageError {
    fn from(err: regex::Error) -> Self {
        Self::Pattern(err.to_string())
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::not_found("record not found"),
            other => Self::database(other),
        }
    }
}
