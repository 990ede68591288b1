use super::{
    errors::{ConfigError, RunResult, WorkerError},
    handle::RunHandle,
    model::{
        ProcessorMetrics,
        RunReport,
        WorkerSizing,
    },
};
use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use futures::FutureExt;
use tokio::{
    sync::{mpsc, oneshot, Semaphore},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};


/// Конфигурация процессора
#[derive(Debug, Clone)]
pub struct Config {
    pub max_concurrency: usize,
    pub worker_sizing: WorkerSizing,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: num_cpus::get(),
            worker_sizing: WorkerSizing::AtStart,
        }
    }
}

impl Config {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            ..Default::default()
        }
    }

    pub fn cpu_bound() -> Self {
        Self::new(num_cpus::get())
    }

    pub fn io_bound() -> Self {
        Self::new(num_cpus::get() * 2)
    }

    pub fn with_worker_sizing(mut self, worker_sizing: WorkerSizing) -> Self {
        self.worker_sizing = worker_sizing;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::InvalidConfiguration {
                max_concurrency: self.max_concurrency,
            });
        }
        Ok(())
    }
}


pub type Processor<T> = Arc<BoundedWorkProcessor<T>>;

type Outcomes<E> = mpsc::UnboundedSender<RunResult<E>>;


/// Очередь с ограниченным числом одновременно работающих обработчиков.
///
/// Items are enqueued at any time; [`run`](Self::run) drains the queue with at most
/// `max_concurrency` handlers in flight. Counters are readable while a run is going.
///
/// Items enqueued after a run has finished stay queued until the next run.
/// The gate belongs to the processor, so overlapping runs share one bound.
pub struct BoundedWorkProcessor<T> {
    queue: SegQueue<T>,
    /// Held across pop + sequence assignment so numbers follow dequeue order.
    claim: Mutex<()>,
    gate: Semaphore,
    processed: AtomicUsize,
    active: AtomicUsize,
    live_workers: AtomicUsize,
    config: Config,
}

/// State shared by the worker loops of one run.
struct Run<F> {
    handler: F,
    /// Upper bound on loops alive at once.
    capacity: usize,
    sizing: WorkerSizing,
    live: AtomicUsize,
    spawned: AtomicUsize,
}

impl<F> Run<F> {
    /// Claims a slot for one more loop, if the run is below capacity.
    fn reserve_worker(&self) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.capacity).then_some(live + 1)
            })
            .is_ok()
    }
}

/// Counts a handler as active for as long as it is held.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    #[inline]
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Keeps both live-loop counters honest even if a worker task unwinds.
struct LiveGuard<'a> {
    run: &'a AtomicUsize,
    processor: &'a AtomicUsize,
}

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        self.run.fetch_sub(1, Ordering::AcqRel);
        self.processor.fetch_sub(1, Ordering::AcqRel);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

impl<T> BoundedWorkProcessor<T>
where
    T: Send + 'static,
{
    pub fn new(max_concurrency: usize) -> Result<Processor<T>, ConfigError> {
        Self::with_config(Config::new(max_concurrency))
    }

    pub fn with_config(config: Config) -> Result<Processor<T>, ConfigError> {
        config.validate()?;

        Ok(Arc::new(BoundedWorkProcessor {
            queue: SegQueue::new(),
            claim: Mutex::new(()),
            gate: Semaphore::new(config.max_concurrency),
            processed: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            live_workers: AtomicUsize::new(0),
            config,
        }))
    }

    #[inline]
    pub fn enqueue(&self, item: T) {
        self.queue.push(item);
    }

    pub fn enqueue_many<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        for item in items {
            self.queue.push(item);
        }
    }

    #[inline]
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Items dequeued over the processor's lifetime, across all runs.
    #[inline]
    pub fn processed_item_count(&self) -> usize {
        self.processed.load(Ordering::Acquire)
    }

    /// Handlers executing right now, i.e. holding a gate permit.
    #[inline]
    pub fn active_worker_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    #[inline]
    pub fn live_worker_count(&self) -> usize {
        self.live_workers.load(Ordering::Acquire)
    }

    #[inline]
    pub fn max_concurrency(&self) -> usize {
        self.config.max_concurrency
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.live_worker_count() == 0
    }

    #[inline]
    pub fn metrics(&self) -> ProcessorMetrics {
        ProcessorMetrics {
            processed_items: self.processed.load(Ordering::Acquire),
            active_workers: self.active.load(Ordering::Acquire),
            queued_items: self.queue.len(),
            live_workers: self.live_workers.load(Ordering::Acquire),
            max_concurrency: self.config.max_concurrency,
        }
    }

    /// Drains the queue and returns the first failure, after every worker loop has returned.
    ///
    /// The handler receives the item, its sequence number (starting at 1 for the
    /// first item this processor ever dequeued) and a handle to the processor it
    /// may use to enqueue more work.
    pub async fn run<F, Fut, E>(self: &Arc<Self>, handler: F) -> RunResult<E>
    where
        F: Fn(T, usize, Processor<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Send + 'static,
    {
        self.run_report(handler).await.into_result()
    }

    /// Like [`run`](Self::run), but keeps every failure.
    pub async fn run_report<F, Fut, E>(self: &Arc<Self>, handler: F) -> RunReport<E>
    where
        F: Fn(T, usize, Processor<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Send + 'static,
    {
        let queued = self.queue.len();
        let worker_count = queued.min(self.config.max_concurrency);

        if worker_count == 0 {
            debug!("run started on an empty queue, nothing to do");
            return RunReport::empty();
        }

        let capacity = match self.config.worker_sizing {
            WorkerSizing::AtStart => worker_count,
            WorkerSizing::Rebalance => self.config.max_concurrency,
        };

        debug!(queued, worker_count, capacity, sizing = ?self.config.worker_sizing, "run started");

        let run = Arc::new(Run {
            handler,
            capacity,
            sizing: self.config.worker_sizing,
            live: AtomicUsize::new(worker_count),
            spawned: AtomicUsize::new(0),
        });

        let processed_before = self.processed.load(Ordering::Acquire);
        let (tx, mut rx) = mpsc::unbounded_channel();

        for _ in 0..worker_count {
            self.spawn_worker(&run, &tx);
        }

        // The channel closes once the last worker, grown ones included, drops its sender.
        drop(tx);

        let mut failures = Vec::new();
        while let Some(outcome) = rx.recv().await {
            if let Err(err) = outcome {
                failures.push(err);
            }
        }

        let report = RunReport {
            workers_spawned: run.spawned.load(Ordering::Acquire),
            items_processed: self.processed.load(Ordering::Acquire).saturating_sub(processed_before),
            failures,
        };

        debug!(
            workers = report.workers_spawned,
            processed = report.items_processed,
            failed = report.failures.len(),
            "run finished"
        );

        report
    }

    /// Spawns the run onto the runtime and returns a handle to await it.
    pub fn start<F, Fut, E>(self: &Arc<Self>, handler: F) -> RunHandle<E>
    where
        F: Fn(T, usize, Processor<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let processor = Arc::clone(self);

        let driver = tokio::spawn(async move {
            let report = processor.run_report(handler).await;
            let _ = tx.send(report);
        });

        RunHandle::new(driver, rx)
    }

    /// The caller must already have counted the loop in `run.live`.
    fn spawn_worker<F, Fut, E>(self: &Arc<Self>, run: &Arc<Run<F>>, outcomes: &Outcomes<E>)
    where
        F: Fn(T, usize, Processor<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Send + 'static,
    {
        let worker_id = run.spawned.fetch_add(1, Ordering::AcqRel);
        self.live_workers.fetch_add(1, Ordering::AcqRel);

        let processor = Arc::clone(self);
        let run = Arc::clone(run);
        let outcomes = outcomes.clone();

        tokio::spawn(async move {
            let _live = LiveGuard {
                run: &run.live,
                processor: &processor.live_workers,
            };
            let result = processor.worker_loop(worker_id, &run, &outcomes).await;
            let _ = outcomes.send(result);
        });
    }

    /// Pops the next item and numbers it in one step.
    fn claim_next(&self) -> Option<(T, usize)> {
        let _claim = self.claim.lock();
        let item = self.queue.pop()?;
        let sequence = self.processed.fetch_add(1, Ordering::AcqRel) + 1;
        Some((item, sequence))
    }

    async fn worker_loop<F, Fut, E>(
        self: &Arc<Self>,
        worker_id: usize,
        run: &Arc<Run<F>>,
        outcomes: &Outcomes<E>,
    ) -> RunResult<E>
    where
        F: Fn(T, usize, Processor<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Send + 'static,
    {
        trace!(worker_id, "worker loop started");

        while let Some((item, sequence)) = self.claim_next() {
            trace!(worker_id, sequence, "item claimed");

            if run.sizing == WorkerSizing::Rebalance && !self.queue.is_empty() && run.reserve_worker() {
                trace!(worker_id, "queue still has work, growing the pool");
                self.spawn_worker(run, outcomes);
            }

            // Claimed before the permit: more items may be claimed than permits exist.
            let _permit = self.gate.acquire().await.map_err(|_| WorkerError::<E>::GateClosed)?;
            let _active = ActiveGuard::enter(&self.active);

            let handle = Arc::clone(self);
            let outcome = AssertUnwindSafe(async { (run.handler)(item, sequence, handle).await })
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(source)) => {
                    debug!(worker_id, sequence, "handler failed, worker loop stopping");
                    return Err(WorkerError::Handler { sequence, source });
                }
                Err(payload) => {
                    let message = panic_message(payload);
                    debug!(worker_id, sequence, %message, "handler panicked, worker loop stopping");
                    return Err(WorkerError::Panic { sequence, message });
                }
            }
        }

        trace!(worker_id, "queue empty, worker loop exiting");
        Ok(())
    }

    /// Периодически отдаёт снимок метрик в callback.
    /// Задача держит ссылку на процессор, пока токен не отменён.
    pub fn start_monitoring<C>(self: &Arc<Self>, interval: Duration, callback: C) -> CancellationToken
    where
        C: Fn(ProcessorMetrics) + Send + 'static,
    {
        let processor = Arc::clone(self);
        let token = CancellationToken::new();
        let token_clone = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        callback(processor.metrics());
                    }
                    _ = token_clone.cancelled() => {
                        drop(processor);
                        break;
                    }
                }
            }
        });

        token
    }

    /// Остановить мониторинг
    pub fn stop_monitoring(token: CancellationToken) {
        token.cancel();
    }
}
