pub mod cassandra;

use std::fmt::Debug;

use bytes::Bytes;
use common::config::ExecutorConfig;
use common::statement::{Batch, BulkStatement};
use common::token::Token;

use crate::error::Error;
use crate::retry::RetryTarget;

/// Acknowledgement of a write.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WriteAck {
    /// False when a conditional write was not applied.
    pub applied: bool,
}

impl WriteAck {
    pub fn applied() -> WriteAck {
        WriteAck { applied: true }
    }
}

/// One unit of write work: a single statement or a batch of them.
#[derive(Clone, Debug, PartialEq)]
pub enum Write<S> {
    Single(S),
    Batch(Batch<S>),
}

impl<S: BulkStatement> Write<S> {
    pub fn len(&self) -> usize {
        match self {
            Write::Single(_) => 1,
            Write::Batch(batch) => batch.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The statements this write carries, in order.
    pub fn statements(&self) -> &[S] {
        match self {
            Write::Single(statement) => std::slice::from_ref(statement),
            Write::Batch(batch) => batch.statements(),
        }
    }
}

impl<S: BulkStatement> BulkStatement for Write<S> {
    fn routing_token(&self) -> Option<Token> {
        match self {
            Write::Single(statement) => statement.routing_token(),
            Write::Batch(batch) => batch.routing_token(),
        }
    }

    fn routing_key(&self) -> Option<Bytes> {
        match self {
            Write::Single(statement) => statement.routing_key(),
            Write::Batch(batch) => batch.routing_key(),
        }
    }

    fn estimated_size_in_bytes(&self) -> usize {
        match self {
            Write::Single(statement) => statement.estimated_size_in_bytes(),
            Write::Batch(batch) => batch.estimated_size_in_bytes(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PagingOptions {
    pub page_size: i32,
    /// Ask the server to push pages ahead of the client's requests when it
    /// supports it.
    pub continuous: bool,
}

impl PagingOptions {
    pub fn from_config(config: &ExecutorConfig) -> PagingOptions {
        PagingOptions {
            page_size: config.page_size,
            continuous: config.continuous_paging,
        }
    }
}

/// A page of rows and the cursor to the next one, if there is more.
#[derive(Debug)]
pub struct Page<R, P> {
    pub rows: Vec<R>,
    pub paging_state: Option<P>,
}

/// An asynchronous database session. Each call is a single attempt; retries
/// are driven by the caller, which tells the session where to send the
/// attempt through `target`.
pub trait Session: Send + Sync + 'static {
    type Statement: BulkStatement + Debug;
    type Row: Send + 'static;
    type PagingState: Clone + Send + Sync + 'static;

    fn execute(
        &self,
        statement: &Self::Statement,
        target: RetryTarget,
    ) -> impl std::future::Future<Output = Result<WriteAck, Error>> + Send;

    fn execute_batch(
        &self,
        batch: &Batch<Self::Statement>,
        target: RetryTarget,
    ) -> impl std::future::Future<Output = Result<WriteAck, Error>> + Send;

    /// Fetches the page starting at `paging_state`, or the first page when
    /// it is `None`.
    fn fetch_page(
        &self,
        statement: &Self::Statement,
        paging_state: Option<Self::PagingState>,
        options: &PagingOptions,
        target: RetryTarget,
    ) -> impl std::future::Future<Output = Result<Page<Self::Row, Self::PagingState>, Error>> + Send;

    /// Releases a server-side cursor that will not be read to the end.
    fn release_paging_state(
        &self,
        _paging_state: Self::PagingState,
    ) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }
}
