use bytes::Bytes;

use crate::token::Token;

/// A single read or write operation as seen by the bulk core. Payload and
/// encoding are opaque here; only routing information and an estimate of
/// the serialized size are needed.
pub trait BulkStatement: Send + Sync + 'static {
    fn routing_token(&self) -> Option<Token> {
        None
    }

    fn routing_key(&self) -> Option<Bytes> {
        None
    }

    fn estimated_size_in_bytes(&self) -> usize;
}

/// An ordered, non-empty group of statements dispatched together.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch<S> {
    statements: Vec<S>,
    size_in_bytes: usize,
}

impl<S: BulkStatement> Batch<S> {
    pub fn new(first: S) -> Batch<S> {
        let size_in_bytes = first.estimated_size_in_bytes();
        Batch {
            statements: vec![first],
            size_in_bytes,
        }
    }

    /// Returns `None` for an empty input, since a batch is never empty.
    pub fn from_statements(statements: Vec<S>) -> Option<Batch<S>> {
        if statements.is_empty() {
            return None;
        }
        let size_in_bytes = statements
            .iter()
            .map(BulkStatement::estimated_size_in_bytes)
            .sum();
        Some(Batch {
            statements,
            size_in_bytes,
        })
    }

    pub fn push(&mut self, statement: S) {
        self.size_in_bytes += statement.estimated_size_in_bytes();
        self.statements.push(statement);
    }
}

impl<S> Batch<S> {
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn is_singleton(&self) -> bool {
        self.statements.len() == 1
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    pub fn statements(&self) -> &[S] {
        &self.statements
    }

    pub fn into_statements(self) -> Vec<S> {
        self.statements
    }
}

impl<S: BulkStatement> BulkStatement for Batch<S> {
    fn routing_token(&self) -> Option<Token> {
        self.statements.first().and_then(BulkStatement::routing_token)
    }

    fn routing_key(&self) -> Option<Bytes> {
        self.statements.first().and_then(BulkStatement::routing_key)
    }

    fn estimated_size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }
}
