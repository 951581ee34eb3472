//! Error types for mirrorfs

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the mirrorfs error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mirrorfs operations
#[derive(Error, Debug)]
pub enum Error {
    // Role and lease errors
    #[error("database is read-only on this node")]
    ReadOnly,

    #[error("this node is not the primary")]
    NotPrimary,

    #[error("lease lost before the transaction could commit")]
    LeaseLost,

    #[error("another write transaction is in progress")]
    Busy,

    // Log integrity errors
    #[error("position gap: expected {expected}, got {got}")]
    PositionGap { expected: u64, got: u64 },

    #[error("checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: String, got: String },

    #[error("malformed frame: {0}")]
    InvalidFrame(String),

    // Sync state errors
    #[error("database {0} is out of sync and unavailable")]
    OutOfSync(String),

    #[error("snapshot required: log retained from position {min_position}")]
    SnapshotRequired { min_position: u64 },

    #[error("page cache invalidation failed: {0}")]
    InvalidationFailed(String),

    // Database errors
    #[error("no such database: {0}")]
    NoSuchDatabase(String),

    #[error("database already exists: {0}")]
    DatabaseExists(String),

    #[error("invalid database name: {0}")]
    InvalidDatabaseName(String),

    // Validation errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Lease backend errors
    #[error("lease backend error: {0}")]
    Lease(String),

    // Transport errors
    #[error("transport error: {0}")]
    Transport(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Stable error code carried on the wire and in logs
    pub fn code(&self) -> &'static str {
        match self {
            Error::ReadOnly => "ReadOnly",
            Error::NotPrimary => "NotPrimary",
            Error::LeaseLost => "LeaseLost",
            Error::Busy => "Busy",
            Error::PositionGap { .. } => "PositionGap",
            Error::ChecksumMismatch { .. } => "ChecksumMismatch",
            Error::InvalidFrame(_) => "InvalidFrame",
            Error::OutOfSync(_) => "OutOfSync",
            Error::SnapshotRequired { .. } => "SnapshotRequired",
            Error::InvalidationFailed(_) => "InvalidationFailed",
            Error::NoSuchDatabase(_) => "NoSuchDatabase",
            Error::DatabaseExists(_) => "DatabaseExists",
            Error::InvalidDatabaseName(_) => "InvalidDatabaseName",
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::Lease(_) => "LeaseError",
            Error::Transport(_) => "TransportError",
            Error::Internal(_) => "InternalError",
            Error::Io(_) => "InternalError",
            Error::Other(_) => "InternalError",
        }
    }

    /// HTTP status code for this error
    pub fn http_status(&self) -> u16 {
        match self {
            Error::InvalidFrame(_)
            | Error::InvalidDatabaseName(_)
            | Error::InvalidArgument(_) => 400,
            Error::NoSuchDatabase(_) => 404,
            Error::SnapshotRequired { .. } | Error::DatabaseExists(_) => 409,
            Error::PositionGap { .. } | Error::ChecksumMismatch { .. } => 422,
            Error::ReadOnly
            | Error::NotPrimary
            | Error::Busy
            | Error::LeaseLost
            | Error::OutOfSync(_) => 503,
            _ => 500,
        }
    }

    /// True when the caller may retry the operation after a delay
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy | Error::Transport(_) | Error::Lease(_))
    }
}

/// Wire representation of an error returned by the replication API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    /// Lowest retained position, set on `SnapshotRequired`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_position: Option<u64>,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        let min_position = match err {
            Error::SnapshotRequired { min_position } => Some(*min_position),
            _ => None,
        };
        ErrorBody {
            code: err.code().to_string(),
            message: err.to_string(),
            min_position,
        }
    }
}

impl ErrorBody {
    pub fn from_json(body: &str) -> Option<Self> {
        serde_json::from_str(body).ok()
    }

    /// Reconstruct the domain error a peer reported
    pub fn into_error(self) -> Error {
        match self.code.as_str() {
            "SnapshotRequired" => Error::SnapshotRequired {
                min_position: self.min_position.unwrap_or(1),
            },
            "NotPrimary" => Error::NotPrimary,
            "ReadOnly" => Error::ReadOnly,
            "Busy" => Error::Busy,
            "NoSuchDatabase" => Error::NoSuchDatabase(self.message),
            "OutOfSync" => Error::OutOfSync(self.message),
            _ => Error::Transport(format!("{}: {}", self.code, self.message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::NotPrimary.code(), "NotPrimary");
        assert_eq!(Error::Busy.code(), "Busy");
        assert_eq!(
            Error::PositionGap { expected: 5, got: 7 }.code(),
            "PositionGap"
        );
        assert_eq!(
            Error::SnapshotRequired { min_position: 50 }.code(),
            "SnapshotRequired"
        );
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(Error::NotPrimary.http_status(), 503);
        assert_eq!(Error::ReadOnly.http_status(), 503);
        assert_eq!(Error::SnapshotRequired { min_position: 1 }.http_status(), 409);
        assert_eq!(Error::NoSuchDatabase("x".into()).http_status(), 404);
        assert_eq!(Error::PositionGap { expected: 1, got: 3 }.http_status(), 422);
        assert_eq!(Error::InvalidArgument("x".into()).http_status(), 400);
        assert_eq!(Error::Internal("x".into()).http_status(), 500);
    }

    #[test]
    fn test_error_body_roundtrip() {
        let err = Error::SnapshotRequired { min_position: 50 };
        let body = ErrorBody::from(&err);
        let json = serde_json::to_string(&body).unwrap();
        let parsed = ErrorBody::from_json(&json).unwrap();
        match parsed.into_error() {
            Error::SnapshotRequired { min_position } => assert_eq!(min_position, 50),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_error_body_omits_min_position() {
        let body = ErrorBody::from(&Error::NotPrimary);
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("min_position"));
        assert!(matches!(
            ErrorBody::from_json(&json).unwrap().into_error(),
            Error::NotPrimary
        ));
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Busy.is_retryable());
        assert!(Error::Transport("timeout".into()).is_retryable());
        assert!(!Error::NotPrimary.is_retryable());
    }
}
