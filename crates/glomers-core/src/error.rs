//! Error types for glomers

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Placement needs at least one node
    #[error("cluster has no nodes")]
    EmptyCluster,
}

impl Error {
    /// Wire code reported to the requester.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::EmptyCluster => ErrorCode::MalformedRequest,
        }
    }
}

/// Numeric error codes carried in `error` bodies.
///
/// Codes below 1000 are reserved by the protocol; anything else round-trips
/// through [`ErrorCode::Custom`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u64", from = "u64")]
pub enum ErrorCode {
    /// The operation could not be completed within a timeout.
    Timeout,
    /// The request was addressed to a node that does not exist.
    NodeNotFound,
    /// The operation is not supported by this node.
    NotSupported,
    /// The operation definitely cannot be performed right now. Safe to retry.
    TemporarilyUnavailable,
    /// The request could not possibly have been processed.
    MalformedRequest,
    /// Indefinite failure; the operation may or may not have happened.
    Crash,
    /// Definite failure; the operation did not happen.
    Abort,
    KeyDoesNotExist,
    KeyAlreadyExists,
    PreconditionFailed,
    TxnConflict,
    Custom(u64),
}

impl ErrorCode {
    pub fn code(&self) -> u64 {
        match self {
            ErrorCode::Timeout => 0,
            ErrorCode::NodeNotFound => 1,
            ErrorCode::NotSupported => 10,
            ErrorCode::TemporarilyUnavailable => 11,
            ErrorCode::MalformedRequest => 12,
            ErrorCode::Crash => 13,
            ErrorCode::Abort => 14,
            ErrorCode::KeyDoesNotExist => 20,
            ErrorCode::KeyAlreadyExists => 21,
            ErrorCode::PreconditionFailed => 22,
            ErrorCode::TxnConflict => 23,
            ErrorCode::Custom(code) => *code,
        }
    }
}

impl From<ErrorCode> for u64 {
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

impl From<u64> for ErrorCode {
    fn from(code: u64) -> Self {
        match code {
            0 => ErrorCode::Timeout,
            1 => ErrorCode::NodeNotFound,
            10 => ErrorCode::NotSupported,
            11 => ErrorCode::TemporarilyUnavailable,
            12 => ErrorCode::MalformedRequest,
            13 => ErrorCode::Crash,
            14 => ErrorCode::Abort,
            20 => ErrorCode::KeyDoesNotExist,
            21 => ErrorCode::KeyAlreadyExists,
            22 => ErrorCode::PreconditionFailed,
            23 => ErrorCode::TxnConflict,
            other => ErrorCode::Custom(other),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::Timeout => "timeout",
            ErrorCode::NodeNotFound => "node-not-found",
            ErrorCode::NotSupported => "not-supported",
            ErrorCode::TemporarilyUnavailable => "temporarily-unavailable",
            ErrorCode::MalformedRequest => "malformed-request",
            ErrorCode::Crash => "crash",
            ErrorCode::Abort => "abort",
            ErrorCode::KeyDoesNotExist => "key-does-not-exist",
            ErrorCode::KeyAlreadyExists => "key-already-exists",
            ErrorCode::PreconditionFailed => "precondition-failed",
            ErrorCode::TxnConflict => "txn-conflict",
            ErrorCode::Custom(code) => return write!(f, "custom-{}", code),
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes() {
        assert_eq!(ErrorCode::from(11), ErrorCode::TemporarilyUnavailable);
        assert_eq!(u64::from(ErrorCode::MalformedRequest), 12);
        assert_eq!(ErrorCode::from(4242), ErrorCode::Custom(4242));
    }
}
