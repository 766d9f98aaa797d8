use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::config::{BatchConfig, BatchMode};
use common::statement::{Batch, BulkStatement};
use common::topology::ReplicaLookup;
use futures::{stream, Stream, StreamExt};
use tracing::{debug, warn};

use crate::accumulator::Accumulators;
use crate::grouping_key::GroupingKey;

/// Groups statements into batches that share a partition or replica set,
/// within the configured count and size bounds.
///
/// Statements that carry no routing information can never be grouped and
/// are emitted on their own. Within one key, statements keep their input
/// order; across keys no order is promised.
#[derive(Clone)]
pub struct StatementBatcher {
    mode: BatchMode,
    max_statements: Option<usize>,
    max_bytes: Option<usize>,
    replica_lookup: Option<Arc<dyn ReplicaLookup>>,
    batches_emitted: Arc<AtomicU64>,
}

impl StatementBatcher {
    pub fn new(
        config: &BatchConfig,
        replica_lookup: Option<Arc<dyn ReplicaLookup>>,
    ) -> StatementBatcher {
        if config.mode == BatchMode::ReplicaSet && replica_lookup.is_none() {
            warn!("Replica set batching requested without cluster topology, falling back to partition batching.");
        }
        StatementBatcher {
            mode: config.mode,
            max_statements: config.max_statements(),
            max_bytes: config.max_bytes(),
            replica_lookup,
            batches_emitted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of batches handed out so far by this batcher and its clones.
    pub fn batches_emitted(&self) -> u64 {
        self.batches_emitted.load(Ordering::Relaxed)
    }

    /// The key `statement` is grouped by, or `None` if it is unroutable.
    pub fn grouping_key<S: BulkStatement>(&self, statement: &S) -> Option<GroupingKey> {
        match self.mode {
            BatchMode::Partition => partition_key(statement),
            BatchMode::ReplicaSet => self
                .replica_set_key(statement)
                .or_else(|| partition_key(statement)),
        }
    }

    fn replica_set_key<S: BulkStatement>(&self, statement: &S) -> Option<GroupingKey> {
        let lookup = self.replica_lookup.as_ref()?;
        let token = statement
            .routing_token()
            .or_else(|| statement.routing_key().and_then(|k| lookup.token_of_key(&k)))?;
        lookup
            .replicas_for_token(&token)
            .map(|replicas| GroupingKey::ReplicaSet(replicas.clone()))
    }

    /// Batches `statements` by grouping key.
    pub fn batch_by_grouping_key<S, St>(&self, statements: St) -> impl Stream<Item = Batch<S>>
    where
        S: BulkStatement,
        St: Stream<Item = S> + Send + 'static,
    {
        self.batch_stream(statements, false)
    }

    /// Batches `statements` without regard for routing, only honoring the
    /// bounds.
    pub fn batch_all<S, St>(&self, statements: St) -> impl Stream<Item = Batch<S>>
    where
        S: BulkStatement,
        St: Stream<Item = S> + Send + 'static,
    {
        self.batch_stream(statements, true)
    }

    pub fn batch_by_grouping_key_iter<S, I>(&self, statements: I) -> Vec<Batch<S>>
    where
        S: BulkStatement,
        I: IntoIterator<Item = S>,
    {
        self.batch_iter(statements, false)
    }

    pub fn batch_all_iter<S, I>(&self, statements: I) -> Vec<Batch<S>>
    where
        S: BulkStatement,
        I: IntoIterator<Item = S>,
    {
        self.batch_iter(statements, true)
    }

    fn key_for<S: BulkStatement>(&self, statement: &S, global: bool) -> Option<GroupingKey> {
        if global {
            Some(GroupingKey::Global)
        } else {
            self.grouping_key(statement)
        }
    }

    fn record(&self, batch: &Batch<impl BulkStatement>) {
        self.batches_emitted.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Emitting batch of {} statements ({} bytes).",
            batch.len(),
            batch.size_in_bytes()
        );
    }

    fn batch_iter<S, I>(&self, statements: I, global: bool) -> Vec<Batch<S>>
    where
        S: BulkStatement,
        I: IntoIterator<Item = S>,
    {
        let mut accumulators = Accumulators::new(self.max_statements, self.max_bytes);
        let mut batches = Vec::new();
        for statement in statements {
            let key = self.key_for(&statement, global);
            if let Some(batch) = accumulators.push(key, statement) {
                self.record(&batch);
                batches.push(batch);
            }
        }
        for batch in accumulators.finish() {
            self.record(&batch);
            batches.push(batch);
        }
        batches
    }

    fn batch_stream<S, St>(&self, statements: St, global: bool) -> impl Stream<Item = Batch<S>>
    where
        S: BulkStatement,
        St: Stream<Item = S> + Send + 'static,
    {
        let state = BatchingState {
            batcher: self.clone(),
            global,
            input: Box::pin(statements),
            accumulators: Some(Accumulators::new(self.max_statements, self.max_bytes)),
            ready: VecDeque::new(),
        };
        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(batch) = state.ready.pop_front() {
                    state.batcher.record(&batch);
                    return Some((batch, state));
                }
                // Input exhausted and every open batch flushed.
                if state.accumulators.is_none() {
                    return None;
                }
                match state.input.next().await {
                    Some(statement) => {
                        let key = state.batcher.key_for(&statement, state.global);
                        if let Some(accumulators) = state.accumulators.as_mut() {
                            if let Some(batch) = accumulators.push(key, statement) {
                                state.ready.push_back(batch);
                            }
                        }
                    }
                    None => {
                        if let Some(accumulators) = state.accumulators.take() {
                            state.ready.extend(accumulators.finish());
                        }
                    }
                }
            }
        })
    }
}

fn partition_key<S: BulkStatement>(statement: &S) -> Option<GroupingKey> {
    statement
        .routing_token()
        .map(GroupingKey::Token)
        .or_else(|| statement.routing_key().map(GroupingKey::RoutingKey))
}

struct BatchingState<S, St> {
    batcher: StatementBatcher,
    global: bool,
    input: std::pin::Pin<Box<St>>,
    accumulators: Option<Accumulators<S>>,
    ready: VecDeque<Batch<S>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use common::for_testing::{uniform_token_map, TestStatement};
    use common::token::{Partitioner, Token};

    fn config(mode: BatchMode, max_batch_statements: i64, max_size_in_bytes: i64) -> BatchConfig {
        BatchConfig {
            mode,
            max_batch_statements,
            max_size_in_bytes,
        }
    }

    #[test]
    fn token_takes_precedence_over_key() {
        let batcher = StatementBatcher::new(&BatchConfig::default(), None);
        let statement = TestStatement::new(1)
            .with_routing_key(b"k")
            .with_routing_token(Token::Murmur3(5));
        assert_eq!(
            batcher.grouping_key(&statement),
            Some(GroupingKey::Token(Token::Murmur3(5)))
        );
        assert_eq!(
            batcher.grouping_key(&TestStatement::new(2).with_routing_key(b"k")),
            Some(GroupingKey::RoutingKey(Bytes::from_static(b"k")))
        );
        assert_eq!(batcher.grouping_key(&TestStatement::new(3)), None);
    }

    #[test]
    fn replica_set_mode_groups_across_partitions() {
        let map = uniform_token_map(Partitioner::Murmur3, 4, 2);
        let first = map.ranges()[0].clone();
        let batcher = StatementBatcher::new(
            &config(BatchMode::ReplicaSet, -1, -1),
            Some(Arc::new(map)),
        );
        // Two different tokens owned by the same range.
        let a = TestStatement::new(1).with_routing_token(first.end().clone());
        let b = TestStatement::new(2)
            .with_routing_token(Partitioner::Murmur3.advance(first.end(), &(-1).into()));
        let key_a = batcher.grouping_key(&a);
        assert_eq!(
            key_a,
            Some(GroupingKey::ReplicaSet(first.replicas().clone()))
        );
        assert_eq!(key_a, batcher.grouping_key(&b));

        let batches = batcher.batch_by_grouping_key_iter(vec![a, b]);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[test]
    fn replica_set_mode_hashes_routing_keys() {
        let map = uniform_token_map(Partitioner::Murmur3, 3, 1);
        let token = Partitioner::Murmur3.token_of_key(b"user-42").unwrap();
        let replicas = map.replicas_for_token(&token).cloned();
        let batcher = StatementBatcher::new(
            &config(BatchMode::ReplicaSet, -1, -1),
            Some(Arc::new(map)),
        );
        assert_eq!(
            batcher.grouping_key(&TestStatement::new(1).with_routing_key(b"user-42")),
            replicas.map(GroupingKey::ReplicaSet)
        );
    }

    #[test]
    fn replica_set_mode_without_topology_falls_back() {
        let batcher = StatementBatcher::new(&config(BatchMode::ReplicaSet, -1, -1), None);
        assert_eq!(
            batcher.grouping_key(&TestStatement::new(1).with_routing_key(b"k")),
            Some(GroupingKey::RoutingKey(Bytes::from_static(b"k")))
        );
    }

    #[test]
    fn counts_emitted_batches() {
        let batcher = StatementBatcher::new(&config(BatchMode::Partition, 1, -1), None);
        let clone = batcher.clone();
        let batches = clone.batch_all_iter((0..5).map(TestStatement::new));
        assert_eq!(batches.len(), 5);
        assert_eq!(batcher.batches_emitted(), 5);
    }
}
