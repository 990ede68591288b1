use super::errors::{RunResult, WorkerError};


/// How many worker loops a run keeps alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerSizing {
    /// `min(queue length at start, max_concurrency)` loops, fixed for the whole run.
    /// A run that starts with one item never gets more than one loop, no matter
    /// how much is enqueued later.
    #[default]
    AtStart,
    /// Starts like `AtStart`, then a worker that dequeues while items remain
    /// spawns a sibling loop until `max_concurrency` loops are alive.
    Rebalance,
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorMetrics {
    pub processed_items: usize,
    pub active_workers: usize,
    pub queued_items: usize,
    pub live_workers: usize,
    pub max_concurrency: usize,
}

impl ProcessorMetrics {
    pub fn utilization(&self) -> f64 {
        if self.max_concurrency == 0 {
            return 0.0;
        }
        self.active_workers as f64 / self.max_concurrency as f64
    }

    pub fn is_idle(&self) -> bool {
        self.active_workers == 0 && self.live_workers == 0
    }
}


/// Outcome of one run once every worker loop has returned.
#[derive(Debug)]
pub struct RunReport<E> {
    pub workers_spawned: usize,
    pub items_processed: usize,
    /// In the order the failing workers finished.
    pub failures: Vec<WorkerError<E>>,
}

impl<E> RunReport<E> {
    pub(crate) fn empty() -> Self {
        Self {
            workers_spawned: 0,
            items_processed: 0,
            failures: Vec::new(),
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// First failure wins, the rest are dropped.
    pub fn into_result(self) -> RunResult<E> {
        match self.failures.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
