//! Adaptive worker pool with an eager-spawn scheduling policy.
//!
//! The classical pool fills its core workers, then queues, and only grows
//! toward the ceiling once the queue is full. This pool inverts that, the
//! way Tomcat's executor does: whenever a task arrives and no worker is
//! idle, a new worker is spawned up to the ceiling; tasks queue only once
//! the ceiling is reached, and are rejected once the queue is also full.
//!
//! Tasks are ordered by (priority desc, submission seq asc) via a binary
//! heap of [`PriorityTask`] wrappers, so user code never implements any
//! ordering itself. Workers carry stable `{pool}-{seq}` thread names, catch
//! panicking tasks and keep running. Idle workers above the core count
//! retire after the keep-alive interval.
//!
//! An optional sampler (used by the hybrid engine) adjusts the effective
//! ceiling between `core` and `max`: utilization above 0.8 with a backlog
//! grows it by `scale_step`, utilization below 0.3 with an empty queue
//! shrinks it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::deferred::Deferred;

/// Pool configuration; see [`crate::EngineConfig`] for the engine-level knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Name prefix for worker threads.
    pub name: String,
    /// Workers kept alive even when idle.
    pub core: usize,
    /// Hard ceiling on worker count.
    pub max: usize,
    /// Queue capacity once the ceiling is reached.
    pub queue_capacity: usize,
    /// Idle lifetime of workers above the core count.
    pub keep_alive: Duration,
    /// Ceiling adjustment step of the sampler.
    pub scale_step: usize,
    /// Enables the resize sampler.
    pub adaptive: bool,
    /// Sampler interval.
    pub sample_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            core: 8,
            max: 200,
            queue_capacity: 100,
            keep_alive: Duration::from_secs(60),
            scale_step: 4,
            adaptive: false,
            sample_interval: Duration::from_secs(5),
        }
    }
}

/// Submission failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// Workers at the ceiling and the queue full.
    #[error("pool saturated: workers and queue at capacity")]
    Saturated,

    /// The pool is no longer accepting tasks.
    #[error("pool is shut down")]
    ShutDown,
}

/// Completion handle returned by [`WorkerPool::submit`].
///
/// Resolves with `Ok(())` when the task ran to completion, or with an error
/// message if it panicked or the pool was torn down before running it.
pub type TaskHandle = Deferred<Result<(), String>>;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A submitted task plus the metadata that defines its ordering.
struct PriorityTask {
    priority: i32,
    seq: u64,
    job: Job,
    handle: crate::deferred::Completer<Result<(), String>>,
}

impl PartialEq for PriorityTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PriorityTask {}

impl PartialOrd for PriorityTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // max-heap: higher priority first, then earlier submission first
        self.priority.cmp(&other.priority).then(other.seq.cmp(&self.seq))
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Live worker threads.
    pub workers: usize,
    /// Workers currently waiting for a task.
    pub idle: usize,
    /// Workers currently running a task.
    pub active: usize,
    /// Queued tasks.
    pub queued: usize,
    /// Effective ceiling the sampler currently allows.
    pub ceiling: usize,
}

struct PoolState {
    queue: std::collections::BinaryHeap<PriorityTask>,
    worker_count: usize,
    idle_count: usize,
    /// Dynamic ceiling between `core` and `max`; only gates spawning.
    current_max: usize,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
    task_seq: AtomicU64,
    worker_seq: AtomicU64,
    shutdown: AtomicBool,
}

/// The adaptive worker pool.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    sampler_stop: Option<Sender<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("WorkerPool").field("name", &self.inner.config.name).field("stats", &stats).finish()
    }
}

impl WorkerPool {
    /// Creates a pool; the sampler thread starts only if `adaptive` is set.
    pub fn new(config: PoolConfig) -> Self {
        let core = config.core.max(1);
        let max = config.max.max(core);
        let config = PoolConfig { core, max, ..config };

        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                queue: std::collections::BinaryHeap::new(),
                worker_count: 0,
                idle_count: 0,
                current_max: max,
            }),
            available: Condvar::new(),
            task_seq: AtomicU64::new(0),
            worker_seq: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            config,
        });

        let sampler_stop = if inner.config.adaptive {
            inner.state.lock().current_max = inner.config.core;
            Some(spawn_sampler(Arc::clone(&inner)))
        } else {
            None
        };

        Self { inner, sampler_stop }
    }

    /// Submits a task with the given priority (higher runs earlier).
    ///
    /// # Errors
    ///
    /// - [`PoolError::Saturated`] when workers are at the ceiling and the
    ///   queue is full; the caller owns the fallback (503, drop, ...)
    /// - [`PoolError::ShutDown`] after shutdown began
    pub fn submit<F>(&self, priority: i32, job: F) -> Result<TaskHandle, PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(PoolError::ShutDown);
        }

        let (handle, completer) = Deferred::channel();
        let task = PriorityTask {
            priority,
            seq: self.inner.task_seq.fetch_add(1, Ordering::Relaxed),
            job: Box::new(job),
            handle: completer,
        };

        let spawn_needed = {
            let mut state = self.inner.state.lock();

            // eager policy: grow before queueing whenever nobody is idle
            if state.idle_count == 0 && state.worker_count < state.current_max {
                state.worker_count += 1;
                state.queue.push(task);
                true
            } else if state.idle_count > 0 || state.queue.len() < self.inner.config.queue_capacity {
                state.queue.push(task);
                false
            } else {
                return Err(PoolError::Saturated);
            }
        };

        if spawn_needed {
            spawn_worker(Arc::clone(&self.inner));
        }
        self.inner.available.notify_one();

        Ok(handle)
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            workers: state.worker_count,
            idle: state.idle_count,
            active: state.worker_count - state.idle_count,
            queued: state.queue.len(),
            ceiling: state.current_max,
        }
    }

    /// Current utilization in `[0, 1]`; used by metrics snapshots.
    pub fn utilization(&self) -> f64 {
        let state = self.inner.state.lock();
        if state.worker_count == 0 {
            return 0.0;
        }
        (state.worker_count - state.idle_count) as f64 / state.worker_count as f64
    }

    /// Stops intake, drains running workers and joins them within `grace`.
    ///
    /// Queued tasks that never ran are failed through their handles rather
    /// than dropped silently. Idempotent.
    pub fn shutdown(&self, grace: Duration) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.available.notify_all();

        if let Some(stop) = &self.sampler_stop {
            let _ = stop.send(());
        }

        let deadline = Instant::now() + grace;
        loop {
            {
                let state = self.inner.state.lock();
                if state.worker_count == 0 {
                    break;
                }
            }
            if Instant::now() >= deadline {
                warn!(pool = %self.inner.config.name, "shutdown grace elapsed with workers still running");
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        // fail whatever never got to run
        let leftovers: Vec<PriorityTask> = {
            let mut state = self.inner.state.lock();
            state.queue.drain().collect()
        };
        for task in leftovers {
            task.handle.complete(Err("pool shut down before task ran".to_string()));
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(1));
    }
}

fn spawn_worker(inner: Arc<PoolInner>) {
    let seq = inner.worker_seq.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-{}", inner.config.name, seq);
    let builder = thread::Builder::new().name(name.clone());

    let spawn_result = builder.spawn({
        let inner = Arc::clone(&inner);
        move || worker_loop(inner)
    });
    if let Err(e) = spawn_result {
        error!(worker = %name, "failed to spawn worker thread: {e}");
        inner.state.lock().worker_count -= 1;
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    trace!("worker started");
    loop {
        let task = {
            let mut state = inner.state.lock();
            loop {
                if let Some(task) = state.queue.pop() {
                    break Some(task);
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    break None;
                }

                state.idle_count += 1;
                let timed_out = inner.available.wait_for(&mut state, inner.config.keep_alive).timed_out();
                state.idle_count -= 1;

                // idle workers above the core count retire on timeout
                if timed_out
                    && state.queue.is_empty()
                    && state.worker_count > inner.config.core.min(state.current_max)
                {
                    break None;
                }
            }
        };

        match task {
            Some(task) => run_task(task),
            None => break,
        }
    }

    let mut state = inner.state.lock();
    state.worker_count -= 1;
    trace!(remaining = state.worker_count, "worker exiting");
}

fn run_task(task: PriorityTask) {
    let PriorityTask { job, handle, .. } = task;
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
        Ok(()) => handle.complete(Ok(())),
        Err(payload) => {
            let reason = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            error!("task panicked: {reason}");
            handle.complete(Err(reason));
        }
    }
}

fn spawn_sampler(inner: Arc<PoolInner>) -> Sender<()> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let interval = inner.config.sample_interval;

    let builder = thread::Builder::new().name(format!("{}-sampler", inner.config.name));
    let spawn_result = builder.spawn(move || loop {
        match stop_rx.recv_timeout(interval) {
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                resample(&inner);
            }
            // stop requested, or the pool is gone
            _ => break,
        }
    });
    if let Err(e) = spawn_result {
        error!("failed to spawn pool sampler: {e}");
    }

    stop_tx
}

fn resample(inner: &PoolInner) {
    let mut state = inner.state.lock();
    if state.current_max == 0 {
        return;
    }

    let active = state.worker_count - state.idle_count;
    let utilization = active as f64 / state.current_max as f64;
    let queued = state.queue.len();

    if utilization > 0.8 && queued > 0 {
        let grown = (state.current_max + inner.config.scale_step).min(inner.config.max);
        if grown != state.current_max {
            debug!(from = state.current_max, to = grown, "growing pool ceiling");
            state.current_max = grown;
        }
    } else if utilization < 0.3 && queued == 0 && state.current_max > inner.config.core {
        let shrunk = state.current_max.saturating_sub(inner.config.scale_step).max(inner.config.core);
        debug!(from = state.current_max, to = shrunk, "shrinking pool ceiling");
        state.current_max = shrunk;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn small_pool(core: usize, max: usize, queue: usize) -> WorkerPool {
        WorkerPool::new(PoolConfig {
            name: "test".to_string(),
            core,
            max,
            queue_capacity: queue,
            keep_alive: Duration::from_millis(50),
            ..Default::default()
        })
    }

    #[test]
    fn runs_submitted_tasks() {
        let pool = small_pool(2, 4, 8);
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.submit(0, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.wait(Duration::from_secs(5)), Some(Ok(())));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn eager_spawn_creates_workers_before_queueing() {
        let pool = small_pool(1, 8, 100);

        // park `k` tasks so every worker is busy; the eager policy must
        // answer each submission with a fresh worker, not the queue
        let k = 5;
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        let started = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..k)
            .map(|_| {
                let release_rx = Arc::clone(&release_rx);
                let started = Arc::clone(&started);
                pool.submit(0, move || {
                    started.fetch_add(1, Ordering::SeqCst);
                    let guard = release_rx.lock();
                    let _ = guard.recv_timeout(Duration::from_secs(5));
                })
                .unwrap()
            })
            .collect();

        // all k tasks must be running concurrently: k workers, empty queue
        let deadline = Instant::now() + Duration::from_secs(5);
        while started.load(Ordering::SeqCst) < k {
            assert!(Instant::now() < deadline, "workers were not spawned eagerly");
            thread::sleep(Duration::from_millis(5));
        }
        let stats = pool.stats();
        assert_eq!(stats.workers, k);
        assert_eq!(stats.queued, 0);

        for _ in 0..k {
            release_tx.send(()).unwrap();
        }
        for handle in handles {
            assert_eq!(handle.wait(Duration::from_secs(5)), Some(Ok(())));
        }
    }

    #[test]
    fn saturated_pool_rejects() {
        let pool = small_pool(1, 1, 1);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));

        // occupy the single worker
        let blocker = {
            let release_rx = Arc::clone(&release_rx);
            pool.submit(0, move || {
                let guard = release_rx.lock();
                let _ = guard.recv_timeout(Duration::from_secs(5));
            })
            .unwrap()
        };

        // wait until the worker picked the task up
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.stats().queued > 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }

        // fill the queue, then the next submit must be rejected
        let queued = pool.submit(0, || {}).unwrap();
        let rejected = pool.submit(0, || {});
        assert!(matches!(rejected, Err(PoolError::Saturated)));

        release_tx.send(()).unwrap();
        assert_eq!(blocker.wait(Duration::from_secs(5)), Some(Ok(())));
        assert_eq!(queued.wait(Duration::from_secs(5)), Some(Ok(())));
    }

    #[test]
    fn priority_orders_queued_tasks() {
        let pool = small_pool(1, 1, 16);
        let order: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));

        // hold the only worker so later submissions pile up in the queue
        let blocker = {
            let release_rx = Arc::clone(&release_rx);
            pool.submit(0, move || {
                let guard = release_rx.lock();
                let _ = guard.recv_timeout(Duration::from_secs(5));
            })
            .unwrap()
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.stats().queued > 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }

        let mut handles = Vec::new();
        for (priority, tag) in [(0, 1), (10, 2), (10, 3), (5, 4)] {
            let order = Arc::clone(&order);
            handles.push(
                pool.submit(priority, move || {
                    order.lock().push(tag);
                })
                .unwrap(),
            );
        }

        release_tx.send(()).unwrap();
        assert_eq!(blocker.wait(Duration::from_secs(5)), Some(Ok(())));
        for handle in handles {
            assert_eq!(handle.wait(Duration::from_secs(5)), Some(Ok(())));
        }

        // priority desc, then submission order among equals
        assert_eq!(&*order.lock(), &[2, 3, 4, 1]);
    }

    #[test]
    fn panicking_task_fails_its_handle_and_worker_survives() {
        let pool = small_pool(1, 1, 8);

        let exploding = pool.submit(0, || panic!("kaboom")).unwrap();
        let result = exploding.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(result, Err("kaboom".to_string()));

        // the pool still runs tasks afterwards
        let follow_up = pool.submit(0, || {}).unwrap();
        assert_eq!(follow_up.wait(Duration::from_secs(5)), Some(Ok(())));
    }

    #[test]
    fn shutdown_fails_unran_tasks() {
        let pool = small_pool(1, 1, 8);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));

        let blocker = {
            let release_rx = Arc::clone(&release_rx);
            pool.submit(0, move || {
                let guard = release_rx.lock();
                let _ = guard.recv_timeout(Duration::from_secs(5));
            })
            .unwrap()
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.stats().queued > 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }

        let stranded = pool.submit(0, || {}).unwrap();

        release_tx.send(()).unwrap();
        pool.shutdown(Duration::from_secs(2));

        assert_eq!(blocker.wait(Duration::from_secs(1)), Some(Ok(())));
        let stranded_result = stranded.wait(Duration::from_secs(1));
        assert!(matches!(stranded_result, Some(Err(_)) | Some(Ok(()))));

        assert!(matches!(pool.submit(0, || {}), Err(PoolError::ShutDown)));
    }
}
