//! Bounded worker pools and the queue accounting behind them.
//!
//! Each [`WorkerQueue`] runs on its own thread pool with an independent
//! concurrency limit; a global total applies across all queues. Slots are
//! acquired before a job is handed to a pool, so the pools themselves never
//! see more work than the limits allow.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread,
    time::{Duration, Instant},
};

use threadpool::ThreadPool;

use crate::{connection::CloseHandle, error::Error};

/// Cadence of the queue-availability and hop waits.
pub(crate) const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Threads backing a queue with no configured limit.
const UNBOUNDED_POOL_THREADS: usize = 512;

/// Identifies the worker pool a job runs on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkerQueue {
    Request,
    WebSocket,
    Custom(String),
}

impl WorkerQueue {
    pub fn custom(name: impl Into<String>) -> WorkerQueue {
        WorkerQueue::Custom(name.into())
    }

    pub(crate) fn label(&self) -> &str {
        match self {
            WorkerQueue::Request => "request",
            WorkerQueue::WebSocket => "websocket",
            WorkerQueue::Custom(name) => name,
        }
    }
}

/// Cooperative cancellation flag checked by workers at I/O boundaries and
/// between requests.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

struct ActiveWorker {
    token: CancelToken,
    close: Option<CloseHandle>,
}

pub(crate) struct Scheduler {
    active: Mutex<HashMap<WorkerQueue, usize>>,
    limits: Mutex<HashMap<WorkerQueue, i32>>,
    max_total: Mutex<i32>,
    pools: Mutex<HashMap<WorkerQueue, ThreadPool>>,
    wait_locks: Mutex<HashMap<WorkerQueue, Arc<Mutex<()>>>>,
    workers: Mutex<HashMap<u64, ActiveWorker>>,
    next_worker: AtomicU64,
    shutdown: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Scheduler {
    /// Limits must be > 0 or −1 (unbounded); the `request` queue always has
    /// an entry.
    pub(crate) fn new(mut limits: HashMap<WorkerQueue, i32>, max_total: i32) -> Scheduler {
        limits
            .entry(WorkerQueue::Request)
            .or_insert(UNBOUNDED_POOL_THREADS as i32);
        Scheduler {
            active: Mutex::new(HashMap::new()),
            limits: Mutex::new(limits),
            max_total: Mutex::new(max_total),
            pools: Mutex::new(HashMap::new()),
            wait_locks: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            next_worker: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub(crate) fn active_count(&self, queue: &WorkerQueue) -> usize {
        lock(&self.active).get(queue).copied().unwrap_or(0)
    }

    pub(crate) fn total_active(&self) -> usize {
        lock(&self.active).values().sum()
    }

    fn queue_limit(&self, queue: &WorkerQueue) -> i32 {
        lock(&self.limits).get(queue).copied().unwrap_or(-1)
    }

    /// Attempts to take a slot on `queue`; never blocks.
    pub(crate) fn try_acquire(&self, queue: &WorkerQueue) -> bool {
        let limit = self.queue_limit(queue);
        let max_total = *lock(&self.max_total);
        let mut active = lock(&self.active);

        let queue_count = active.get(queue).copied().unwrap_or(0);
        let total: usize = active.values().sum();

        let queue_ok = limit < 0 || queue_count < limit as usize;
        let total_ok = max_total < 0 || total < max_total as usize;
        if queue_ok && total_ok {
            *active.entry(queue.clone()).or_insert(0) += 1;
            true
        } else {
            false
        }
    }

    /// Blocks until a slot on `queue` is free, holding that queue's wait
    /// lock and re-checking on a 100 ms cadence. Aborts on shutdown or when
    /// the worker's token is cancelled.
    pub(crate) fn wait_for_queue(
        &self,
        queue: &WorkerQueue,
        token: Option<&CancelToken>,
    ) -> Result<(), Error> {
        let wait_lock = lock(&self.wait_locks)
            .entry(queue.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock(&wait_lock);

        loop {
            if self.is_shutdown() || token.map(CancelToken::is_cancelled).unwrap_or(false) {
                return Err(Error::ShutdownInProgress);
            }
            if self.try_acquire(queue) {
                return Ok(());
            }
            thread::sleep(QUEUE_POLL_INTERVAL);
        }
    }

    pub(crate) fn release(&self, queue: &WorkerQueue) {
        let mut active = lock(&self.active);
        if let Some(count) = active.get_mut(queue) {
            *count = count.saturating_sub(1);
        }
    }

    /// Runs `job` on the pool backing `queue`. The caller already holds a
    /// slot; pools are sized to the queue limit so jobs start immediately.
    pub(crate) fn execute(&self, queue: &WorkerQueue, job: impl FnOnce() + Send + 'static) {
        let pool = {
            let limit = self.queue_limit(queue);
            let mut pools = lock(&self.pools);
            pools
                .entry(queue.clone())
                .or_insert_with(|| {
                    let threads = if limit > 0 {
                        limit as usize
                    } else {
                        UNBOUNDED_POOL_THREADS
                    };
                    ThreadPool::new(threads)
                })
                .clone()
        };
        pool.execute(job);
    }

    pub(crate) fn register_worker(
        &self,
        token: CancelToken,
        close: Option<CloseHandle>,
    ) -> u64 {
        let id = self.next_worker.fetch_add(1, Ordering::Relaxed);
        lock(&self.workers).insert(id, ActiveWorker { token, close });
        id
    }

    pub(crate) fn deregister_worker(&self, id: u64) {
        lock(&self.workers).remove(&id);
    }

    /// Cancels every active worker, waits up to `stop_timeout` for them to
    /// drain, then force-closes the connections still held.
    pub(crate) fn stop_workers(&self, stop_timeout: Duration) {
        self.begin_shutdown();

        for worker in lock(&self.workers).values() {
            worker.token.cancel();
        }

        let deadline = Instant::now() + stop_timeout;
        while Instant::now() < deadline {
            if lock(&self.workers).is_empty() {
                return;
            }
            thread::sleep(Duration::from_millis(25));
        }

        let mut workers = lock(&self.workers);
        if !workers.is_empty() {
            log::warn!(
                "force closing {} connection(s) still held at shutdown",
                workers.len()
            );
        }
        for (_, worker) in workers.drain() {
            if let Some(close) = worker.close {
                close.close();
            }
        }
    }
}
