//! Error types for store client operations.

use thiserror::Error;
use tonic::{Code, Status};

/// Failure of a single store operation.
///
/// No variant is recovered inside this crate; callers observe the raw failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The connection handle could not be established or used.
    #[error("connection error: {0}")]
    Connection(String),

    /// The operation's time budget elapsed before the store answered.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Any other RPC-level failure reported by the store.
    #[error("store error ({code:?}): {message}")]
    Store { code: Code, message: String },
}

/// Convenience type alias for results of store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn store(code: Code, message: impl Into<String>) -> Self {
        StoreError::Store {
            code,
            message: message.into(),
        }
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, StoreError::DeadlineExceeded)
    }
}

impl From<Status> for StoreError {
    fn from(status: Status) -> Self {
        match status.code() {
            Code::DeadlineExceeded => StoreError::DeadlineExceeded,
            Code::Unavailable => StoreError::Connection(status.message().to_string()),
            code => StoreError::store(code, status.message()),
        }
    }
}

impl From<tonic::transport::Error> for StoreError {
    fn from(err: tonic::transport::Error) -> Self {
        StoreError::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_status_maps_to_deadline_exceeded() {
        let err: StoreError = Status::deadline_exceeded("too slow").into();
        assert!(err.is_deadline_exceeded());
    }

    #[test]
    fn test_unavailable_status_maps_to_connection() {
        let err: StoreError = Status::unavailable("no route").into();
        assert!(matches!(err, StoreError::Connection(ref msg) if msg == "no route"));
    }

    #[test]
    fn test_other_status_maps_to_store() {
        let err: StoreError = Status::invalid_argument("key is not provided").into();
        match err {
            StoreError::Store { code, message } => {
                assert_eq!(code, Code::InvalidArgument);
                assert_eq!(message, "key is not provided");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(StoreError::DeadlineExceeded.to_string(), "deadline exceeded");
        assert_eq!(
            StoreError::Connection("refused".into()).to_string(),
            "connection error: refused"
        );
    }
}
