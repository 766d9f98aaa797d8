use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use common::config::{ExecutionMode, ExecutorConfig};
use futures::{future, stream, Stream, StreamExt};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::context::{ExecutorContext, ExecutorStats};
use crate::error::{BulkExecutionError, Error};
use crate::result::{BulkOutcome, ReadError, ReadResult, RowPosition, WriteError, WriteResult};
use crate::retry::RetryPolicy;
use crate::session::{Page, PagingOptions, Session, Write};

pub type WriteItem<S> = Result<WriteResult<S>, WriteError<S>>;
pub type ReadItem<S, R> = Result<ReadResult<S, R>, ReadError<S>>;

type Statement<Se> = <Se as Session>::Statement;
type Row<Se> = <Se as Session>::Row;

/// Runs reads and writes against a [Session] with bounded concurrency,
/// per-request retries and either fail-fast or fail-safe semantics.
///
/// Every operation is available as a lazy stream of per-statement results.
/// The `*_async` forms drive that stream on the executor's runtime and
/// resolve once it ends, and the `*_sync` forms block on the `*_async`
/// forms. The synchronous forms must not be called from within an async
/// context.
pub struct BulkExecutor<Se: Session> {
    inner: Arc<Inner<Se>>,
}

struct Inner<Se: Session> {
    session: Arc<Se>,
    retry_policy: RetryPolicy,
    mode: ExecutionMode,
    max_in_flight: Option<usize>,
    paging: PagingOptions,
    context: Arc<ExecutorContext>,
    cancellation: CancellationToken,
    runtime: Handle,
}

impl<Se: Session> Clone for BulkExecutor<Se> {
    fn clone(&self) -> Self {
        BulkExecutor {
            inner: self.inner.clone(),
        }
    }
}

impl<Se: Session> BulkExecutor<Se> {
    /// Creates an executor whose tasks run on `runtime`.
    pub fn new(session: Arc<Se>, config: &ExecutorConfig, runtime: Handle) -> BulkExecutor<Se> {
        BulkExecutor::with_cancellation_token(session, config, runtime, CancellationToken::new())
    }

    /// Like [BulkExecutor::new], but stops all operations once `token` is
    /// cancelled.
    pub fn with_cancellation_token(
        session: Arc<Se>,
        config: &ExecutorConfig,
        runtime: Handle,
        token: CancellationToken,
    ) -> BulkExecutor<Se> {
        info!(
            "Starting bulk executor in {} mode, max in flight {:?}, max retries {}.",
            config.mode,
            config.max_in_flight(),
            config.max_retries
        );
        BulkExecutor {
            inner: Arc::new(Inner {
                session,
                retry_policy: RetryPolicy::new(config.max_retries),
                mode: config.mode,
                max_in_flight: config.max_in_flight(),
                paging: PagingOptions::from_config(config),
                context: Arc::new(ExecutorContext::default()),
                cancellation: token,
                runtime,
            }),
        }
    }

    pub fn context(&self) -> &Arc<ExecutorContext> {
        &self.inner.context
    }

    pub fn stats(&self) -> ExecutorStats {
        self.inner.context.stats()
    }

    pub fn session(&self) -> &Arc<Se> {
        &self.inner.session
    }

    /// Stops issuing requests for every operation of this executor. Streams
    /// end without further items and requests already sent are abandoned.
    pub fn cancel(&self) {
        self.inner.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    pub fn write_stream<St>(
        &self,
        writes: St,
    ) -> impl Stream<Item = WriteItem<Statement<Se>>> + Send + 'static
    where
        St: Stream<Item = Write<Statement<Se>>> + Send + 'static,
    {
        self.dispatch_writes(writes.map(Arc::new))
    }

    pub fn read_stream(
        &self,
        statement: Statement<Se>,
    ) -> impl Stream<Item = ReadItem<Statement<Se>, Row<Se>>> + Send + 'static {
        self.read_shared(Arc::new(statement))
    }

    fn read_shared(
        &self,
        statement: Arc<Statement<Se>>,
    ) -> impl Stream<Item = ReadItem<Statement<Se>, Row<Se>>> + Send + 'static {
        self.stop_on_failure(read_pages(self.inner.clone(), statement, None))
    }

    /// Reads every statement, up to `max_in_flight` of them at once. Rows
    /// of different statements interleave; rows of one statement keep their
    /// order.
    pub fn read_all_stream<St>(
        &self,
        statements: St,
    ) -> impl Stream<Item = ReadItem<Statement<Se>, Row<Se>>> + Send + 'static
    where
        St: Stream<Item = Statement<Se>> + Send + 'static,
    {
        let inner = self.inner.clone();
        let failed = self.failure_trip();
        let trip = failed.clone();
        let reads = until_failed(statements, failed)
            .map(move |statement| {
                Box::pin(read_pages(inner.clone(), Arc::new(statement), trip.clone()))
            })
            .flatten_unordered(self.inner.max_in_flight);
        self.stop_on_failure(reads)
    }

    pub fn write_async(
        &self,
        write: Write<Statement<Se>>,
    ) -> ExecutionHandle<WriteItem<Statement<Se>>> {
        let write = Arc::new(write);
        let mut results = Box::pin(self.dispatch_writes(stream::once(future::ready(write.clone()))));
        let fallback = write.clone();
        self.spawn(
            async move {
                match results.next().await {
                    Some(result) => result,
                    None => Err(BulkExecutionError::new(write, Error::Cancelled)),
                }
            },
            move || Err(BulkExecutionError::new(fallback, Error::Cancelled)),
        )
    }

    pub fn write_all_async<St>(
        &self,
        writes: St,
    ) -> ExecutionHandle<BulkOutcome<WriteResult<Statement<Se>>, WriteError<Statement<Se>>>>
    where
        St: Stream<Item = Write<Statement<Se>>> + Send + 'static,
    {
        let results = self.write_stream(writes);
        self.spawn(self.collect_outcome(results), interrupted_outcome)
    }

    /// Resolves to every row of the read, or to the failure that ended it.
    pub fn read_async(
        &self,
        statement: Statement<Se>,
    ) -> ExecutionHandle<Result<Vec<ReadResult<Statement<Se>, Row<Se>>>, ReadError<Statement<Se>>>>
    {
        let statement = Arc::new(statement);
        let mut rows = Box::pin(self.read_shared(statement.clone()));
        let fallback = statement.clone();
        let token = self.inner.cancellation.clone();
        self.spawn(
            async move {
                let mut collected = Vec::new();
                while let Some(row) = rows.next().await {
                    collected.push(row?);
                }
                // The stream ends quietly on cancellation.
                if token.is_cancelled() {
                    return Err(BulkExecutionError::new(statement, Error::Cancelled));
                }
                Ok(collected)
            },
            move || Err(BulkExecutionError::new(fallback, Error::Cancelled)),
        )
    }

    pub fn read_all_async<St>(
        &self,
        statements: St,
    ) -> ExecutionHandle<BulkOutcome<ReadResult<Statement<Se>, Row<Se>>, ReadError<Statement<Se>>>>
    where
        St: Stream<Item = Statement<Se>> + Send + 'static,
    {
        let results = self.read_all_stream(statements);
        self.spawn(self.collect_outcome(results), interrupted_outcome)
    }

    pub fn write_sync(&self, write: Write<Statement<Se>>) -> Result<WriteResult<Statement<Se>>, Error> {
        futures::executor::block_on(self.write_async(write)).map_err(BulkExecutionError::into_cause)
    }

    /// Returns the outcome of every write. In fail-fast mode, and whenever
    /// the executor is cancelled, the cause that stopped the run is returned
    /// instead.
    pub fn write_all_sync<St>(
        &self,
        writes: St,
    ) -> Result<BulkOutcome<WriteResult<Statement<Se>>, WriteError<Statement<Se>>>, Error>
    where
        St: Stream<Item = Write<Statement<Se>>> + Send + 'static,
    {
        into_sync_result(futures::executor::block_on(self.write_all_async(writes)))
    }

    pub fn read_sync(
        &self,
        statement: Statement<Se>,
    ) -> Result<Vec<ReadResult<Statement<Se>, Row<Se>>>, Error> {
        futures::executor::block_on(self.read_async(statement)).map_err(BulkExecutionError::into_cause)
    }

    pub fn read_all_sync<St>(
        &self,
        statements: St,
    ) -> Result<BulkOutcome<ReadResult<Statement<Se>, Row<Se>>, ReadError<Statement<Se>>>, Error>
    where
        St: Stream<Item = Statement<Se>> + Send + 'static,
    {
        into_sync_result(futures::executor::block_on(self.read_all_async(statements)))
    }

    fn dispatch_writes<St>(
        &self,
        writes: St,
    ) -> impl Stream<Item = WriteItem<Statement<Se>>> + Send + 'static
    where
        St: Stream<Item = Arc<Write<Statement<Se>>>> + Send + 'static,
    {
        let inner = self.inner.clone();
        let limit = self.inner.max_in_flight.unwrap_or(usize::MAX);
        let failed = self.failure_trip();
        let trip = failed.clone();
        let results = until_failed(writes, failed)
            .map(move |write| {
                // Each write runs on its own task, so it completes even if
                // the stream is dropped after a failure.
                let task = inner
                    .runtime
                    .spawn(execute_write(inner.clone(), write.clone(), trip.clone()));
                let trip = trip.clone();
                async move {
                    match task.await {
                        Ok(result) => result,
                        Err(e) => {
                            trip_on_failure(trip.as_ref());
                            Err(BulkExecutionError::new(write, Error::Internal(Arc::new(e))))
                        }
                    }
                }
            })
            .buffer_unordered(limit);
        self.stop_on_failure(results)
    }

    /// In fail-fast mode, a token the operation's first terminal failure
    /// cancels. New work is only dispatched while it is not cancelled.
    fn failure_trip(&self) -> Option<CancellationToken> {
        (self.inner.mode == ExecutionMode::FailFast).then(CancellationToken::new)
    }

    /// Ends `results` when the executor is cancelled and, in fail-fast mode,
    /// right after the first failure. Once ended, upstream is never polled
    /// again, so nothing more gets dispatched.
    fn stop_on_failure<T, E, St>(&self, results: St) -> impl Stream<Item = Result<T, E>> + Send + 'static
    where
        T: Send + 'static,
        E: Send + 'static,
        St: Stream<Item = Result<T, E>> + Send + 'static,
    {
        let fail_fast = self.inner.mode == ExecutionMode::FailFast;
        let results = Box::pin(results.take_until(self.inner.cancellation.clone().cancelled_owned()));
        stream::unfold((results, false), move |(mut results, failed)| async move {
            if failed {
                debug!("Stopping after the first failure.");
                return None;
            }
            let item = results.next().await?;
            let failed = fail_fast && item.is_err();
            Some((item, (results, failed)))
        })
    }

    fn collect_outcome<T, X, St>(
        &self,
        results: St,
    ) -> impl Future<Output = BulkOutcome<T, BulkExecutionError<X>>> + Send + 'static
    where
        T: Send + 'static,
        X: std::fmt::Debug + Send + 'static,
        St: Stream<Item = Result<T, BulkExecutionError<X>>> + Send + 'static,
    {
        let fail_fast = self.inner.mode == ExecutionMode::FailFast;
        let token = self.inner.cancellation.clone();
        async move {
            let mut results = Box::pin(results);
            let mut outcome = BulkOutcome::new();
            while let Some(result) = results.next().await {
                match result {
                    Ok(success) => outcome.successes.push(success),
                    Err(failure) => {
                        if fail_fast {
                            outcome.interrupted = Some(failure.cause.clone());
                        }
                        outcome.failures.push(failure);
                    }
                }
            }
            if token.is_cancelled() && outcome.interrupted.is_none() {
                outcome.interrupted = Some(Error::Cancelled);
            }
            debug!(
                "Bulk operation finished with {} successes and {} failures.",
                outcome.successes.len(),
                outcome.failures.len()
            );
            outcome
        }
    }

    fn spawn<T, F>(&self, future: F, on_abort: impl FnOnce() -> T + Send + 'static) -> ExecutionHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        ExecutionHandle {
            task: self.inner.runtime.spawn(future),
            on_abort: Some(Box::new(on_abort)),
        }
    }
}

/// Ends `input` as soon as `failed` is cancelled. Checked each time the
/// consumer asks for the next item to dispatch.
fn until_failed<St: Stream>(
    input: St,
    failed: Option<CancellationToken>,
) -> impl Stream<Item = St::Item> {
    input.take_while(move |_| {
        let stop = failed.as_ref().is_some_and(CancellationToken::is_cancelled);
        if stop {
            debug!("Not dispatching after the first failure.");
        }
        future::ready(!stop)
    })
}

fn trip_on_failure(failed: Option<&CancellationToken>) {
    if let Some(failed) = failed {
        failed.cancel();
    }
}

fn interrupted_outcome<T, E>() -> BulkOutcome<T, E> {
    let mut outcome = BulkOutcome::new();
    outcome.interrupted = Some(Error::Cancelled);
    outcome
}

fn into_sync_result<T, E>(mut outcome: BulkOutcome<T, E>) -> Result<BulkOutcome<T, E>, Error> {
    match outcome.interrupted.take() {
        Some(cause) => Err(cause),
        None => Ok(outcome),
    }
}

/// The eventual result of an operation started by one of the `*_async`
/// methods. The operation runs whether or not the handle is polled.
pub struct ExecutionHandle<T> {
    task: JoinHandle<T>,
    on_abort: Option<Box<dyn FnOnce() -> T + Send>>,
}

impl<T> Future for ExecutionHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        match Pin::new(&mut this.task).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(value)) => Poll::Ready(value),
            Poll::Ready(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            // The runtime shut down before the operation finished.
            Poll::Ready(Err(_)) => match this.on_abort.take() {
                Some(on_abort) => Poll::Ready(on_abort()),
                None => Poll::Pending,
            },
        }
    }
}

#[instrument(skip_all, fields(statements = write.len()))]
async fn execute_write<Se: Session>(
    inner: Arc<Inner<Se>>,
    write: Arc<Write<Statement<Se>>>,
    failed: Option<CancellationToken>,
) -> WriteItem<Statement<Se>> {
    let _in_flight = inner.context.start_request();
    let session: &Se = &inner.session;
    let request: &Write<Statement<Se>> = &write;
    let outcome = inner
        .retry_policy
        .run(&inner.cancellation, |target| async move {
            match request {
                Write::Single(statement) => session.execute(statement, target).await,
                Write::Batch(batch) => session.execute_batch(batch, target).await,
            }
        })
        .await;
    match outcome {
        Ok(ack) => {
            inner.context.record_write(true);
            Ok(WriteResult {
                statement: write,
                ack,
            })
        }
        Err(cause) => {
            if !cause.is_cancelled() {
                trip_on_failure(failed.as_ref());
                inner.context.record_write(false);
                warn!("Write failed: {}", cause);
            }
            Err(BulkExecutionError::new(write, cause))
        }
    }
}

enum Cursor<P> {
    Start,
    More(P),
    Exhausted,
}

/// Progress of one paged read. Dropping it while the server still holds a
/// cursor releases that cursor in the background.
struct ReadState<Se: Session> {
    inner: Arc<Inner<Se>>,
    statement: Arc<Statement<Se>>,
    rows: std::vec::IntoIter<Row<Se>>,
    cursor: Cursor<Se::PagingState>,
    pages_read: u64,
    row_position: RowPosition,
    finished: bool,
    failed: Option<CancellationToken>,
}

impl<Se: Session> Drop for ReadState<Se> {
    fn drop(&mut self) {
        if let Cursor::More(paging_state) = std::mem::replace(&mut self.cursor, Cursor::Exhausted) {
            debug!("Releasing the paging state of an unfinished read.");
            let session = self.inner.session.clone();
            self.inner
                .runtime
                .spawn(async move { session.release_paging_state(paging_state).await });
        }
    }
}

/// Rows of one read, in page order. A page is only requested once every
/// row of the previous one has been consumed.
fn read_pages<Se: Session>(
    inner: Arc<Inner<Se>>,
    statement: Arc<Statement<Se>>,
    failed: Option<CancellationToken>,
) -> impl Stream<Item = ReadItem<Statement<Se>, Row<Se>>> + Send + 'static {
    let state = ReadState {
        inner,
        statement,
        rows: Vec::new().into_iter(),
        cursor: Cursor::Start,
        pages_read: 0,
        row_position: RowPosition { page: 0, index: 0 },
        finished: false,
        failed,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }
            if let Some(row) = state.rows.next() {
                let position = state.row_position;
                state.row_position.index += 1;
                let result = ReadResult {
                    statement: state.statement.clone(),
                    row,
                    position,
                };
                return Some((Ok(result), state));
            }
            let paging_state = match std::mem::replace(&mut state.cursor, Cursor::Exhausted) {
                Cursor::Exhausted => return None,
                Cursor::Start => None,
                Cursor::More(paging_state) => Some(paging_state),
            };
            let fetched = fetch_page(&state.inner, &state.statement, paging_state.clone()).await;
            match fetched {
                Ok(page) => {
                    state.inner.context.record_page(page.rows.len());
                    trace!(
                        "Fetched page {} with {} rows.",
                        state.pages_read,
                        page.rows.len()
                    );
                    state.row_position = RowPosition {
                        page: state.pages_read,
                        index: 0,
                    };
                    state.pages_read += 1;
                    state.rows = page.rows.into_iter();
                    match page.paging_state {
                        Some(next) => state.cursor = Cursor::More(next),
                        None => state.inner.context.record_read(true),
                    }
                }
                Err(cause) => {
                    if let Some(paging_state) = paging_state {
                        state.cursor = Cursor::More(paging_state);
                    }
                    state.finished = true;
                    if cause.is_cancelled() {
                        return None;
                    }
                    trip_on_failure(state.failed.as_ref());
                    state.inner.context.record_read(false);
                    warn!(
                        "Read failed after {} pages: {}",
                        state.pages_read, cause
                    );
                    let error = BulkExecutionError::new(state.statement.clone(), cause);
                    return Some((Err(error), state));
                }
            }
        }
    })
}

async fn fetch_page<Se: Session>(
    inner: &Inner<Se>,
    statement: &Statement<Se>,
    paging_state: Option<Se::PagingState>,
) -> Result<Page<Row<Se>, Se::PagingState>, Error> {
    let _in_flight = inner.context.start_request();
    let session: &Se = &inner.session;
    let options = &inner.paging;
    inner
        .retry_policy
        .run(&inner.cancellation, |target| {
            session.fetch_page(statement, paging_state.clone(), options, target)
        })
        .await
}
