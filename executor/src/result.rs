use std::sync::Arc;

use crate::error::{BulkExecutionError, Error};
use crate::session::{Write, WriteAck};

#[derive(Debug)]
pub struct WriteResult<S> {
    pub statement: Arc<Write<S>>,
    pub ack: WriteAck,
}

/// Where a row sits in the result of its read.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct RowPosition {
    /// Index of the page the row arrived in, counting from zero.
    pub page: u64,
    /// Index of the row within its page.
    pub index: usize,
}

#[derive(Debug)]
pub struct ReadResult<S, R> {
    pub statement: Arc<S>,
    pub row: R,
    pub position: RowPosition,
}

pub type WriteError<S> = BulkExecutionError<Arc<Write<S>>>;
pub type ReadError<S> = BulkExecutionError<Arc<S>>;

/// Everything a multi-statement operation produced once it stopped.
#[derive(Debug)]
pub struct BulkOutcome<T, E> {
    pub successes: Vec<T>,
    pub failures: Vec<E>,
    /// Set when the operation was interrupted before it consumed its whole
    /// input.
    pub interrupted: Option<Error>,
}

impl<T, E> BulkOutcome<T, E> {
    pub(crate) fn new() -> BulkOutcome<T, E> {
        BulkOutcome {
            successes: Vec::new(),
            failures: Vec::new(),
            interrupted: None,
        }
    }

    pub fn is_complete_success(&self) -> bool {
        self.failures.is_empty() && self.interrupted.is_none()
    }
}
