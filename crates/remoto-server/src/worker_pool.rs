//! Elastic worker pool
//!
//! Connections handed to the thread-pool server are served by long-lived
//! worker threads. The pool keeps at least `min_workers` threads alive, grows
//! on demand up to `max_workers`, and retires idle threads again once they have
//! been idle for `idle_timeout`.
//!
//! # Components
//!
//! - [`WorkerPool`]: the handle used by the server
//! - [`PoolConfig`]: size bounds and idle behaviour
//!
//! Every worker owns a private job channel. A worker that is idle sits in
//! `recv_timeout` on its channel; when the timeout fires it asks the pool to
//! shrink. Retiring a worker means sending it a `None` sentinel.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use remoto_common::{Config, RemotoError, Result};

/// A unit of work run by a worker thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Size bounds and idle behaviour of a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub idle_timeout: Duration,
    /// Queue jobs when saturated instead of refusing them
    pub queue: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for PoolConfig {
    fn from(config: &Config) -> Self {
        Self {
            min_workers: config.threadpool_size_min,
            max_workers: config.threadpool_size,
            idle_timeout: config.threadpool_idle_timeout,
            queue: config.threadpool_queue,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(RemotoError::Config("threadpool size must be at least 1".to_string()));
        }
        if self.min_workers > self.max_workers {
            return Err(RemotoError::Config(format!(
                "threadpool minimum size {} exceeds maximum {}",
                self.min_workers, self.max_workers
            )));
        }
        if self.idle_timeout.is_zero() {
            return Err(RemotoError::Config("threadpool idle timeout must be positive".to_string()));
        }
        Ok(())
    }
}

struct WorkerSlot {
    id: u64,
    jobs: Sender<Option<Job>>,
}

struct PoolState {
    idle: Vec<WorkerSlot>,
    busy: HashMap<u64, WorkerSlot>,
    backlog: VecDeque<Job>,
    last_shrink: Instant,
}

struct PoolShared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    idle_count: AtomicUsize,
    busy_count: AtomicUsize,
    closed: AtomicBool,
    next_worker_id: AtomicU64,
}

/// Elastic pool of worker threads.
///
/// # Example
///
/// ```
/// use remoto_server::worker_pool::{PoolConfig, WorkerPool};
/// use std::sync::mpsc;
///
/// let pool = WorkerPool::new(PoolConfig::default()).unwrap();
/// let (tx, rx) = mpsc::channel();
/// pool.process(Box::new(move || tx.send(42).unwrap())).unwrap();
/// assert_eq!(rx.recv().unwrap(), 42);
/// pool.close();
/// ```
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Creates the pool and starts `min_workers` idle workers.
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let min = config.min_workers;
        let shared = Arc::new(PoolShared {
            config,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                busy: HashMap::new(),
                backlog: VecDeque::new(),
                last_shrink: Instant::now(),
            }),
            idle_count: AtomicUsize::new(0),
            busy_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            next_worker_id: AtomicU64::new(1),
        });

        {
            let mut state = shared.state.lock();
            for _ in 0..min {
                let slot = PoolShared::spawn_worker(&shared)?;
                state.idle.push(slot);
                shared.idle_count.fetch_add(1, Ordering::SeqCst);
            }
        }

        tracing::debug!(min = min, max = shared.config.max_workers, "worker pool started");
        Ok(Self { shared })
    }

    /// Hands a job to an idle worker, growing the pool if none is idle.
    ///
    /// # Errors
    ///
    /// Returns `NoFreeWorkers` when every worker is busy, the pool is at its
    /// maximum size and queueing is disabled, or when the pool is closed.
    pub fn process(&self, job: Job) -> Result<()> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(RemotoError::NoFreeWorkers("worker pool is closed".to_string()));
        }

        let mut state = shared.state.lock();
        let mut job = job;
        while let Some(slot) = state.idle.pop() {
            shared.idle_count.fetch_sub(1, Ordering::SeqCst);
            match slot.jobs.send(Some(job)) {
                Ok(()) => {
                    shared.busy_count.fetch_add(1, Ordering::SeqCst);
                    state.busy.insert(slot.id, slot);
                    return Ok(());
                }
                // worker thread is gone; try the next one
                Err(err) => {
                    job = err.0.ok_or_else(|| RemotoError::Protocol("lost job".to_string()))?;
                }
            }
        }

        let size = state.idle.len() + state.busy.len();
        if size < shared.config.max_workers {
            let slot = PoolShared::spawn_worker(shared)?;
            slot.jobs
                .send(Some(job))
                .map_err(|_| RemotoError::NoFreeWorkers("new worker exited".to_string()))?;
            shared.busy_count.fetch_add(1, Ordering::SeqCst);
            state.busy.insert(slot.id, slot);
            return Ok(());
        }

        if shared.config.queue {
            state.backlog.push_back(job);
            return Ok(());
        }

        Err(RemotoError::NoFreeWorkers(format!(
            "all {} workers are busy",
            shared.config.max_workers
        )))
    }

    /// Adds an idle worker if none is idle and the pool has room.
    pub fn grow_if_needed(&self) -> bool {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) || shared.idle_count.load(Ordering::SeqCst) > 0 {
            return false;
        }
        let mut state = shared.state.lock();
        if !state.idle.is_empty() || state.idle.len() + state.busy.len() >= shared.config.max_workers {
            return false;
        }
        match PoolShared::spawn_worker(shared) {
            Ok(slot) => {
                state.idle.push(slot);
                shared.idle_count.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(e) => {
                tracing::warn!("could not grow worker pool: {}", e);
                false
            }
        }
    }

    /// Retires idle workers beyond the minimum; returns how many were told to stop.
    pub fn shrink(&self) -> usize {
        self.shared.shrink()
    }

    /// Total number of workers.
    pub fn size(&self) -> usize {
        let state = self.shared.state.lock();
        state.idle.len() + state.busy.len()
    }

    pub fn num_idle(&self) -> usize {
        self.shared.idle_count.load(Ordering::SeqCst)
    }

    pub fn num_busy(&self) -> usize {
        self.shared.busy_count.load(Ordering::SeqCst)
    }

    /// Jobs waiting for a worker.
    pub fn backlog(&self) -> usize {
        self.shared.state.lock().backlog.len()
    }

    /// Stops all workers once they finish their current job.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = shared.state.lock();
        let dropped = state.backlog.len();
        state.backlog.clear();
        for slot in state.idle.drain(..) {
            let _ = slot.jobs.send(None);
        }
        for (_, slot) in state.busy.drain() {
            let _ = slot.jobs.send(None);
        }
        shared.idle_count.store(0, Ordering::SeqCst);
        shared.busy_count.store(0, Ordering::SeqCst);
        if dropped > 0 {
            tracing::warn!(dropped = dropped, "worker pool closed with queued jobs");
        }
        tracing::debug!("worker pool closed");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl PoolShared {
    fn spawn_worker(shared: &Arc<PoolShared>) -> Result<WorkerSlot> {
        let id = shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded();
        let worker_shared = Arc::clone(shared);
        thread::Builder::new()
            .name(format!("remoto-worker-{}", id))
            .spawn(move || worker_loop(worker_shared, id, rx))?;
        Ok(WorkerSlot { id, jobs: tx })
    }

    /// Called by a worker after finishing a job. Returns the next queued job,
    /// or marks the worker idle.
    fn job_done(&self, id: u64) -> Option<Job> {
        let mut state = self.state.lock();
        if let Some(job) = state.backlog.pop_front() {
            return Some(job);
        }
        if let Some(slot) = state.busy.remove(&id) {
            self.busy_count.fetch_sub(1, Ordering::SeqCst);
            state.idle.push(slot);
            self.idle_count.fetch_add(1, Ordering::SeqCst);
        }
        None
    }

    fn shrink(&self) -> usize {
        let min = self.config.min_workers;
        if self.idle_count.load(Ordering::SeqCst) <= min {
            return 0;
        }
        let mut state = self.state.lock();
        if state.idle.len() <= min || state.last_shrink.elapsed() < self.config.idle_timeout {
            return 0;
        }
        let excess = state.idle.len() - min;
        let retired: Vec<WorkerSlot> = state.idle.drain(..excess).collect();
        self.idle_count.fetch_sub(excess, Ordering::SeqCst);
        state.last_shrink = Instant::now();
        drop(state);

        for slot in retired {
            let _ = slot.jobs.send(None);
        }
        tracing::debug!(retired = excess, "worker pool shrunk");
        excess
    }
}

fn worker_loop(shared: Arc<PoolShared>, id: u64, jobs: Receiver<Option<Job>>) {
    tracing::trace!(worker = id, "worker started");
    loop {
        match jobs.recv_timeout(shared.config.idle_timeout) {
            Ok(Some(job)) => {
                let mut next = Some(job);
                while let Some(job) = next.take() {
                    run_job(id, job);
                    if shared.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    next = shared.job_done(id);
                }
                shared.shrink();
            }
            Ok(None) => break,
            Err(RecvTimeoutError::Timeout) => {
                shared.shrink();
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::trace!(worker = id, "worker stopped");
}

fn run_job(worker: u64, job: Job) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
        tracing::error!(worker = worker, "job panicked: {}", panic_message(panic.as_ref()));
    }
}

/// Text of a panic payload, if it has one.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
