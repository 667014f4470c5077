//! Error types for Meal Pulse

use thiserror::Error;

/// Errors surfaced by the public service operations.
///
/// Benign outcomes (opted-out students, insufficient data, active cooldowns)
/// are never errors; they are reported through the outcome types instead.
#[derive(Debug, Error)]
pub enum PulseError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors raised by a [`crate::store::PulseStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Corrupt value in column {column}: {value}")]
    Corrupt { column: &'static str, value: String },
}

/// Errors returned by a notification transport.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Recipient rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    pub(crate) fn corrupt(column: &'static str, value: impl Into<String>) -> Self {
        StoreError::Corrupt {
            column,
            value: value.into(),
        }
    }
}
