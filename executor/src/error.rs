use std::fmt::Debug;
use std::sync::Arc;

use thiserror::Error;

/// Why a request was aborted before the coordinator answered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum AbortCause {
    ConnectionClosed,
    HeartbeatFailed,
    Other,
}

#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("Coordinator timed out waiting for replicas to answer a read")]
    ReadTimeout,
    #[error("Coordinator timed out waiting for replicas to acknowledge a write")]
    WriteTimeout,
    #[error("Not enough replicas alive to satisfy the consistency level")]
    Unavailable,
    #[error("Request aborted: {0}")]
    RequestAborted(AbortCause),
    #[error("Coordinator error: {0}")]
    Coordinator(String),
    #[error("Replicas failed to serve a read")]
    ReadFailure,
    #[error("Replicas failed to apply a write")]
    WriteFailure,
    #[error("Invalid statement: {0}")]
    InvalidStatement(String),
    #[error("Could not encode statement: {0}")]
    Encoding(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Internal error: {0}")]
    Internal(Arc<dyn std::error::Error + Send + Sync>),
}

/// Coarse classification of an [Error], which is all the retry policy looks
/// at.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum FailureCategory {
    ReadTimeout,
    WriteTimeout,
    Unavailable,
    Aborted(AbortCause),
    ServerFailure,
    Coordinator,
    ClientSide,
    Cancelled,
}

impl Error {
    pub fn category(&self) -> FailureCategory {
        match self {
            Error::ReadTimeout => FailureCategory::ReadTimeout,
            Error::WriteTimeout => FailureCategory::WriteTimeout,
            Error::Unavailable => FailureCategory::Unavailable,
            Error::RequestAborted(cause) => FailureCategory::Aborted(*cause),
            Error::ReadFailure | Error::WriteFailure => FailureCategory::ServerFailure,
            Error::Coordinator(_) => FailureCategory::Coordinator,
            Error::InvalidStatement(_) | Error::Encoding(_) | Error::Internal(_) => {
                FailureCategory::ClientSide
            }
            Error::Cancelled => FailureCategory::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// A terminal failure together with the statement, batch or read it
/// belongs to.
#[derive(Clone, Debug, Error)]
#[error("Bulk operation failed: {cause}")]
pub struct BulkExecutionError<T: Debug> {
    pub statement: T,
    #[source]
    pub cause: Error,
}

impl<T: Debug> BulkExecutionError<T> {
    pub fn new(statement: T, cause: Error) -> BulkExecutionError<T> {
        BulkExecutionError { statement, cause }
    }

    pub fn into_cause(self) -> Error {
        self.cause
    }
}
