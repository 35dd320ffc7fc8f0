//! Error types shared across the engine and its backends.

use crate::model::ChannelId;
use thiserror::Error;

/// Errors surfaced by [`ChannelStore`](crate::store::ChannelStore)
/// implementations.
///
/// The commit cycle treats these in two classes: row-level failures
/// (constraint violations, missing channels, unsupported operations) are
/// logged and skipped, while connection-class failures abort the remaining
/// items of the current phase. See [`StoreError::aborts_phase`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("channel {0} not found")]
    ChannelNotFound(ChannelId),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    /// A stored channel record or document could not be parsed.
    #[error("malformed channel record: {0}")]
    Document(String),

    #[error("blob decode error: {0}")]
    Codec(#[from] CodecError),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether this failure indicates the backing store itself is
    /// unreachable, in which case the commit cycle drops the remaining
    /// items of the current phase instead of retrying them one by one.
    pub fn aborts_phase(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Io(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        // Single-row constraint violations are recoverable item failures;
        // everything else from sqlx is treated as a connection-class error.
        if let sqlx::Error::Database(db) = &err
            && (db.is_unique_violation() || db.is_foreign_key_violation() || db.is_check_violation())
        {
            return StoreError::Constraint(db.message().to_string());
        }
        StoreError::Database(err)
    }
}

/// Errors raised when an encoded blob is unreadable from its very first
/// field. Anything recoverable (truncation mid-record, count mismatches)
/// is logged and handled by returning partial data instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("blob is empty")]
    Empty,

    #[error("legacy rank-name blob declares {0} entries, expected 12")]
    BadLegacyCount(u8),
}
