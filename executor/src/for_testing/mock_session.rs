use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::for_testing::TestStatement;
use common::statement::Batch;
use tokio::sync::Semaphore;

use crate::error::Error;
use crate::retry::RetryTarget;
use crate::session::{Page, PagingOptions, Session, WriteAck};

/// A row of a mock read: the read's statement id and the row's index in the
/// whole result.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct MockRow {
    pub statement: u32,
    pub index: usize,
}

/// Cursor into a mock result: the offset of the next row to return.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MockPagingState {
    pub statement: u32,
    pub offset: usize,
}

/// In-memory session over [TestStatement]s. Reads of statement `id` return
/// the rows registered with [MockSession::with_rows]. Failures can be
/// scripted per statement and page; each attempt consumes one.
pub struct MockSession {
    rows: HashMap<u32, usize>,
    latency: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
    failures: Mutex<HashMap<(u32, u64), VecDeque<Error>>>,
    written: Mutex<Vec<u32>>,
    released: Mutex<Vec<MockPagingState>>,
    targets: Mutex<Vec<RetryTarget>>,
    attempts: AtomicUsize,
    requested: Mutex<Vec<u32>>,
    concurrent: AtomicUsize,
    peak_concurrent: AtomicUsize,
}

impl Default for MockSession {
    fn default() -> Self {
        MockSession::new()
    }
}

impl MockSession {
    pub fn new() -> MockSession {
        MockSession {
            rows: HashMap::new(),
            latency: None,
            gate: None,
            failures: Mutex::new(HashMap::new()),
            written: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            targets: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
            concurrent: AtomicUsize::new(0),
            peak_concurrent: AtomicUsize::new(0),
        }
    }

    pub fn with_rows(mut self, statement: u32, rows: usize) -> MockSession {
        self.rows.insert(statement, rows);
        self
    }

    /// Every request sleeps this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> MockSession {
        self.latency = Some(latency);
        self
    }

    /// Requests wait until [MockSession::open_gate] lets them through.
    pub fn with_gate(mut self) -> MockSession {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Lets `requests` more requests past the gate.
    pub fn open_gate(&self, requests: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(requests);
        }
    }

    /// Makes the next attempts to write `statement` fail with `errors`, in
    /// order. A batch fails when its first statement does.
    pub fn fail_write(&self, statement: u32, errors: Vec<Error>) {
        self.fail_page(statement, 0, errors);
    }

    /// Makes the next attempts to fetch page `page` of `statement` fail with
    /// `errors`, in order.
    pub fn fail_page(&self, statement: u32, page: u64, errors: Vec<Error>) {
        self.failures
            .lock()
            .unwrap()
            .entry((statement, page))
            .or_default()
            .extend(errors);
    }

    /// Ids of the statements written successfully, in completion order.
    pub fn written(&self) -> Vec<u32> {
        self.written.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<MockPagingState> {
        self.released.lock().unwrap().clone()
    }

    /// Where each attempt was sent, in order.
    pub fn targets(&self) -> Vec<RetryTarget> {
        self.targets.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The statement of each attempt, in order.
    pub fn requested(&self) -> Vec<u32> {
        self.requested.lock().unwrap().clone()
    }

    /// The most requests that were ever being served at the same time.
    pub fn peak_concurrent(&self) -> usize {
        self.peak_concurrent.load(Ordering::SeqCst)
    }

    async fn attempt(&self, statement: u32, page: u64, target: RetryTarget) -> Result<(), Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().unwrap().push(target);
        self.requested.lock().unwrap().push(statement);
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_concurrent.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&(statement, page))
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Session for MockSession {
    type Statement = TestStatement;
    type Row = MockRow;
    type PagingState = MockPagingState;

    async fn execute(&self, statement: &TestStatement, target: RetryTarget) -> Result<WriteAck, Error> {
        self.attempt(statement.id, 0, target).await?;
        self.written.lock().unwrap().push(statement.id);
        Ok(WriteAck::applied())
    }

    async fn execute_batch(
        &self,
        batch: &Batch<TestStatement>,
        target: RetryTarget,
    ) -> Result<WriteAck, Error> {
        let first = batch.statements()[0].id;
        self.attempt(first, 0, target).await?;
        self.written
            .lock()
            .unwrap()
            .extend(batch.statements().iter().map(|s| s.id));
        Ok(WriteAck::applied())
    }

    async fn fetch_page(
        &self,
        statement: &TestStatement,
        paging_state: Option<MockPagingState>,
        options: &PagingOptions,
        target: RetryTarget,
    ) -> Result<Page<MockRow, MockPagingState>, Error> {
        let total = self.rows.get(&statement.id).copied().unwrap_or(0);
        let page_size = options.page_size.max(1) as usize;
        let offset = paging_state.map_or(0, |p| p.offset);
        self.attempt(statement.id, (offset / page_size) as u64, target)
            .await?;
        let end = (offset + page_size).min(total);
        let rows = (offset..end)
            .map(|index| MockRow {
                statement: statement.id,
                index,
            })
            .collect();
        let paging_state = (end < total).then_some(MockPagingState {
            statement: statement.id,
            offset: end,
        });
        Ok(Page { rows, paging_state })
    }

    async fn release_paging_state(&self, paging_state: MockPagingState) {
        self.released.lock().unwrap().push(paging_state);
    }
}
