use std::collections::HashMap;

use common::statement::{Batch, BulkStatement};

use crate::grouping_key::GroupingKey;

/// Open batches, one per grouping key, kept in the order keys were first
/// seen. Only the stage consuming the input mutates it.
pub(crate) struct Accumulators<S> {
    max_statements: Option<usize>,
    max_bytes: Option<usize>,
    index: HashMap<GroupingKey, usize>,
    open: Vec<Batch<S>>,
}

impl<S: BulkStatement> Accumulators<S> {
    pub(crate) fn new(max_statements: Option<usize>, max_bytes: Option<usize>) -> Accumulators<S> {
        Accumulators {
            max_statements,
            max_bytes,
            index: HashMap::new(),
            open: Vec::new(),
        }
    }

    /// Adds a statement, returning the batch it displaced when the open
    /// batch for its key could not take it. Statements without a key are
    /// returned straight away as singletons.
    pub(crate) fn push(&mut self, key: Option<GroupingKey>, statement: S) -> Option<Batch<S>> {
        let Some(key) = key else {
            return Some(Batch::new(statement));
        };
        match self.index.get(&key) {
            Some(&i) => {
                if self.fits(&self.open[i], &statement) {
                    self.open[i].push(statement);
                    None
                } else {
                    Some(std::mem::replace(&mut self.open[i], Batch::new(statement)))
                }
            }
            None => {
                self.index.insert(key, self.open.len());
                self.open.push(Batch::new(statement));
                None
            }
        }
    }

    fn fits(&self, batch: &Batch<S>, statement: &S) -> bool {
        let count_ok = self
            .max_statements
            .map_or(true, |max| batch.len() < max);
        let bytes_ok = self.max_bytes.map_or(true, |max| {
            batch.size_in_bytes() + statement.estimated_size_in_bytes() <= max
        });
        count_ok && bytes_ok
    }

    pub(crate) fn finish(self) -> Vec<Batch<S>> {
        self.open
    }
}
