use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use batcher::batcher::StatementBatcher;
use common::config::{BatchConfig, BatchMode, ExecutionMode, ExecutorConfig};
use common::for_testing::TestStatement;
use executor::context::ExecutorStats;
use executor::error::Error;
use executor::executor::BulkExecutor;
use executor::for_testing::mock_session::MockSession;
use executor::retry::RetryTarget;
use executor::session::Write;
use futures::{stream, StreamExt};
use test_log::test;
use tokio::runtime::{Builder, Handle};

fn config(mode: ExecutionMode, max_in_flight: i64, max_retries: u32) -> ExecutorConfig {
    ExecutorConfig {
        max_retries,
        mode,
        max_in_flight,
        ..ExecutorConfig::default()
    }
}

fn singles(ids: std::ops::RangeInclusive<u32>) -> Vec<Write<TestStatement>> {
    ids.map(|id| Write::Single(TestStatement::new(id))).collect()
}

fn failed_ids<T>(items: &[Result<T, executor::result::WriteError<TestStatement>>]) -> Vec<u32> {
    items
        .iter()
        .filter_map(|item| item.as_ref().err())
        .map(|e| e.statement.statements()[0].id)
        .collect()
}

#[test(tokio::test)]
async fn fail_safe_yields_every_item() {
    let session = Arc::new(MockSession::new());
    session.fail_write(3, vec![Error::WriteFailure]);
    session.fail_write(7, vec![Error::InvalidStatement("bad".to_string())]);
    let executor = BulkExecutor::new(
        session.clone(),
        &config(ExecutionMode::FailSafe, 4, 5),
        Handle::current(),
    );

    let items: Vec<_> = executor
        .write_stream(stream::iter(singles(1..=10)))
        .collect()
        .await;

    assert_eq!(items.len(), 10);
    let mut failed = failed_ids(&items);
    failed.sort();
    assert_eq!(failed, vec![3, 7]);
    let written: BTreeSet<u32> = session.written().into_iter().collect();
    assert_eq!(written, BTreeSet::from([1, 2, 4, 5, 6, 8, 9, 10]));
    // Neither failure is retried.
    assert_eq!(session.attempts(), 10);

    let stats = executor.stats();
    assert_eq!(stats.successful_writes, 8);
    assert_eq!(stats.failed_writes, 2);
    assert_eq!(stats.in_flight, 0);
}

#[test(tokio::test)]
async fn fail_fast_stops_dispatching_after_first_failure() {
    let session = Arc::new(MockSession::new());
    session.fail_write(3, vec![Error::WriteFailure]);
    let executor = BulkExecutor::new(
        session.clone(),
        &config(ExecutionMode::FailFast, 1, 5),
        Handle::current(),
    );

    let items: Vec<_> = executor
        .write_stream(stream::iter(singles(1..=10)))
        .collect()
        .await;

    assert_eq!(items.len(), 3);
    assert!(items[0].is_ok() && items[1].is_ok());
    let failure = items[2].as_ref().unwrap_err();
    assert!(matches!(failure.cause, Error::WriteFailure));
    assert_eq!(failure.statement.statements()[0].id, 3);
    assert_eq!(session.written(), vec![1, 2]);
    assert_eq!(session.attempts(), 3);
}

async fn wait_until(done: impl Fn() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[test(tokio::test)]
async fn fail_fast_dispatches_nothing_after_a_concurrent_failure() {
    let session = Arc::new(MockSession::new().with_gate());
    session.fail_write(2, vec![Error::WriteFailure]);
    let executor = BulkExecutor::new(
        session.clone(),
        &config(ExecutionMode::FailFast, 2, 5),
        Handle::current(),
    );

    let mut items = Box::pin(executor.write_stream(stream::iter(singles(1..=10))));
    // Fills both in-flight slots.
    assert!(futures::poll!(items.next()).is_pending());
    wait_until(|| session.attempts() == 2).await;

    // Both writes finish before the stream is polled again, so the success
    // frees a slot while the failure is still unread.
    session.open_gate(10);
    wait_until(|| {
        let stats = executor.stats();
        stats.successful_writes == 1 && stats.failed_writes == 1
    })
    .await;

    let items: Vec<_> = items.collect().await;
    assert!(!items.is_empty() && items.len() <= 2);
    let failure = items.last().unwrap().as_ref().unwrap_err();
    assert!(matches!(failure.cause, Error::WriteFailure));
    assert_eq!(failure.statement.statements()[0].id, 2);
    assert_eq!(session.attempts(), 2);
    assert_eq!(session.written(), vec![1]);
    assert_eq!(executor.stats().in_flight, 0);
}

#[test(tokio::test)]
async fn fail_fast_outcome_carries_the_cause() {
    let session = Arc::new(MockSession::new());
    session.fail_write(2, vec![Error::Unavailable; 3]);
    let executor = BulkExecutor::new(
        session.clone(),
        &config(ExecutionMode::FailFast, 1, 2),
        Handle::current(),
    );

    let outcome = executor
        .write_all_async(stream::iter(singles(1..=5)))
        .await;

    assert_eq!(outcome.successes.len(), 1);
    assert_eq!(outcome.failures.len(), 1);
    assert!(matches!(outcome.interrupted, Some(Error::Unavailable)));
    assert!(!outcome.is_complete_success());
}

#[test(tokio::test)]
async fn transient_failures_are_retried() {
    let session = Arc::new(MockSession::new());
    session.fail_write(1, vec![Error::WriteTimeout, Error::WriteTimeout, Error::Unavailable]);
    let executor = BulkExecutor::new(
        session.clone(),
        &config(ExecutionMode::FailFast, 0, 3),
        Handle::current(),
    );

    let result = executor
        .write_async(Write::Single(TestStatement::new(1)))
        .await
        .unwrap();

    assert!(result.ack.applied);
    assert_eq!(
        session.targets(),
        vec![
            RetryTarget::Initial,
            RetryTarget::SameHost,
            RetryTarget::SameHost,
            RetryTarget::NextHost
        ]
    );
    assert_eq!(executor.stats().successful_writes, 1);
    assert_eq!(executor.stats().failed_writes, 0);
}

#[test(tokio::test)]
async fn retries_are_bounded() {
    let session = Arc::new(MockSession::new());
    session.fail_write(1, vec![Error::WriteTimeout; 10]);
    let executor = BulkExecutor::new(
        session.clone(),
        &config(ExecutionMode::FailSafe, 0, 4),
        Handle::current(),
    );

    let failure = executor
        .write_async(Write::Single(TestStatement::new(1)))
        .await
        .unwrap_err();

    assert!(matches!(failure.cause, Error::WriteTimeout));
    assert_eq!(session.attempts(), 5);
    assert_eq!(executor.stats().failed_writes, 1);
}

#[test(tokio::test)]
async fn in_flight_writes_are_bounded() {
    let session = Arc::new(MockSession::new().with_latency(Duration::from_millis(5)));
    let executor = BulkExecutor::new(
        session.clone(),
        &config(ExecutionMode::FailSafe, 4, 0),
        Handle::current(),
    );

    let outcome = executor
        .write_all_async(stream::iter(singles(1..=40)))
        .await;

    assert_eq!(outcome.successes.len(), 40);
    assert!(outcome.is_complete_success());
    assert!(session.peak_concurrent() <= 4);
    assert!(session.peak_concurrent() > 1);
    assert_eq!(executor.context().in_flight(), 0);
}

#[test(tokio::test)]
async fn batches_from_the_batcher_are_written_whole() {
    let session = Arc::new(MockSession::new());
    let executor = BulkExecutor::new(
        session.clone(),
        &config(ExecutionMode::FailFast, 8, 0),
        Handle::current(),
    );
    let batcher = StatementBatcher::new(
        &BatchConfig {
            mode: BatchMode::Partition,
            max_batch_statements: 3,
            max_size_in_bytes: -1,
        },
        None,
    );
    let keys: [&'static [u8]; 2] = [b"even", b"odd"];
    let statements =
        stream::iter((1..=10u32).map(move |id| TestStatement::new(id).with_routing_key(keys[(id % 2) as usize])));
    let writes = batcher.batch_by_grouping_key(statements).map(Write::Batch);

    let items: Vec<_> = executor.write_stream(writes).collect().await;

    assert_eq!(items.len(), 4);
    for item in &items {
        let result = item.as_ref().unwrap();
        let ids: Vec<u32> = result.statement.statements().iter().map(|s| s.id).collect();
        assert!(ids.iter().all(|id| id % 2 == ids[0] % 2));
    }
    let mut written = session.written();
    written.sort();
    assert_eq!(written, (1..=10).collect::<Vec<_>>());
    // Counted per dispatched batch.
    assert_eq!(executor.stats().successful_writes, 4);
}

#[test(tokio::test)]
async fn cancelled_executor_dispatches_nothing() {
    let session = Arc::new(MockSession::new());
    let executor = BulkExecutor::new(
        session.clone(),
        &config(ExecutionMode::FailSafe, 4, 0),
        Handle::current(),
    );
    executor.cancel();

    let items: Vec<_> = executor
        .write_stream(stream::iter(singles(1..=5)))
        .collect()
        .await;
    assert!(items.is_empty());
    assert_eq!(session.attempts(), 0);

    let failure = executor
        .write_async(Write::Single(TestStatement::new(6)))
        .await
        .unwrap_err();
    assert!(matches!(failure.cause, Error::Cancelled));
    assert_eq!(executor.stats(), ExecutorStats::default());
}

fn scripted_session() -> Arc<MockSession> {
    let session = Arc::new(MockSession::new());
    session.fail_write(2, vec![Error::WriteTimeout]);
    session.fail_write(4, vec![Error::WriteFailure]);
    session.fail_write(6, vec![Error::Unavailable; 5]);
    session
}

#[test]
fn call_conventions_agree() {
    let runtime = Builder::new_multi_thread().enable_all().build().unwrap();
    let config = config(ExecutionMode::FailSafe, 3, 2);

    let streamed = BulkExecutor::new(scripted_session(), &config, runtime.handle().clone());
    let items: Vec<_> = runtime.block_on(streamed.write_stream(stream::iter(singles(1..=8))).collect());
    assert_eq!(items.len(), 8);

    let future = BulkExecutor::new(scripted_session(), &config, runtime.handle().clone());
    let outcome = runtime.block_on(future.write_all_async(stream::iter(singles(1..=8))));
    assert_eq!(outcome.successes.len(), 6);

    let sync = BulkExecutor::new(scripted_session(), &config, runtime.handle().clone());
    let outcome = sync.write_all_sync(stream::iter(singles(1..=8))).unwrap();
    assert_eq!(outcome.failures.len(), 2);

    assert_eq!(streamed.stats(), future.stats());
    assert_eq!(future.stats(), sync.stats());
    assert_eq!(sync.stats().successful_writes, 6);
    assert_eq!(sync.stats().failed_writes, 2);
}

#[test]
fn sync_write_rethrows_the_cause() {
    let runtime = Builder::new_multi_thread().enable_all().build().unwrap();
    let session = Arc::new(MockSession::new());
    session.fail_write(1, vec![Error::WriteFailure]);
    let executor = BulkExecutor::new(
        session.clone(),
        &config(ExecutionMode::FailFast, 0, 3),
        runtime.handle().clone(),
    );

    assert!(matches!(
        executor.write_sync(Write::Single(TestStatement::new(1))),
        Err(Error::WriteFailure)
    ));
    assert!(executor.write_sync(Write::Single(TestStatement::new(2))).is_ok());
    assert!(matches!(
        executor.write_all_sync(stream::iter(vec![Write::Single(TestStatement::new(1).with_size(2))])),
        Ok(_)
    ));
}
