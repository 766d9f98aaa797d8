use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Operation counters of one executor, shared with every task it spawns.
/// Operations that are cancelled before completing are not counted as
/// either successes or failures.
#[derive(Debug, Default)]
pub struct ExecutorContext {
    in_flight: AtomicUsize,
    successful_writes: AtomicU64,
    failed_writes: AtomicU64,
    successful_reads: AtomicU64,
    failed_reads: AtomicU64,
    pages_fetched: AtomicU64,
    rows_received: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExecutorStats {
    pub in_flight: usize,
    pub successful_writes: u64,
    pub failed_writes: u64,
    pub successful_reads: u64,
    pub failed_reads: u64,
    pub pages_fetched: u64,
    pub rows_received: u64,
}

impl ExecutorContext {
    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            in_flight: self.in_flight.load(Ordering::Relaxed),
            successful_writes: self.successful_writes.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
            successful_reads: self.successful_reads.load(Ordering::Relaxed),
            failed_reads: self.failed_reads.load(Ordering::Relaxed),
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            rows_received: self.rows_received.load(Ordering::Relaxed),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Marks a request as in flight until the returned guard is dropped.
    pub(crate) fn start_request(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlight { context: self }
    }

    pub(crate) fn record_write(&self, succeeded: bool) {
        let counter = if succeeded {
            &self.successful_writes
        } else {
            &self.failed_writes
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self, succeeded: bool) {
        let counter = if succeeded {
            &self.successful_reads
        } else {
            &self.failed_reads
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_page(&self, rows: usize) {
        self.pages_fetched.fetch_add(1, Ordering::Relaxed);
        self.rows_received.fetch_add(rows as u64, Ordering::Relaxed);
    }
}

pub(crate) struct InFlight<'a> {
    context: &'a ExecutorContext,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.context.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
