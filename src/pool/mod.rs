//! Worker-thread pool (component J).
//!
//! Implements a core/max-size admission algorithm: `execute`
//! (1) starts a fresh worker running the job directly while under
//! `core_pool_size`, (2) starts a fresh worker up to `max_pool_size`
//! instead of queueing if the queue already looks saturated, (3)
//! otherwise queues the job non-blockingly, or (4) hands the job to the
//! configured [`RejectionPolicy`] if none of the above admits it.
//!
//! Step (2) is ordered ahead of the queue attempt rather than after it:
//! Rust's `Queue::offer` consumes its value even on refusal (there is
//! no by-reference "still have it, just wasn't accepted" state to
//! retry from), so the saturation check has to happen *before* risking
//! the job on an offer that might fail, not after. A task refused for
//! this reason reaches [`RejectionPolicy`] with the job intact, same as any other
//! rejection.
//!
//! A worker above `core_pool_size` retires itself once
//! `queue.poll_timeout(keep_alive)` comes back empty.

mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::error::{JunctureError, Result, TaskFailure};
use crate::future::{JoinHandle, Task};
use crate::policy::{AbortPolicy, CallerRunsPolicy, RejectionPolicy};
use crate::queue::Queue;

use worker::run_worker;

pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// Spawns and names the OS threads backing a pool's workers (component
/// J "ThreadFactory"). Swappable so an embedder can set thread
/// priority, pin to a core, or install a panic hook before the pool's
/// own wrapper runs.
pub trait ThreadFactory: Send + Sync {
    fn spawn(
        &self,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> std::io::Result<std::thread::JoinHandle<()>>;
}

/// Names threads `"{prefix}-{n}"` in spawn order; the default factory
/// every pool uses unless one is supplied.
pub struct DefaultThreadFactory {
    prefix: String,
    next_id: AtomicU64,
}

impl DefaultThreadFactory {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next_id: AtomicU64::new(0),
        }
    }
}

impl ThreadFactory for DefaultThreadFactory {
    fn spawn(
        &self,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> std::io::Result<std::thread::JoinHandle<()>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        std::thread::Builder::new()
            .name(format!("{}-{id}", self.prefix))
            .spawn(body)
    }
}

/// Lifecycle hooks a pool invokes around every task (component J
/// "beforeExecute/afterExecute/terminated"). Default no-op
/// implementations mean most callers only override what they need.
pub trait PoolObserver: Send + Sync {
    fn before_execute(&self, _worker_name: &str) {}
    fn after_execute(&self, _worker_name: &str, _failure: Option<&TaskFailure>) {}
    fn terminated(&self) {}
}

pub struct NoopObserver;
impl PoolObserver for NoopObserver {}

/// A point-in-time snapshot of pool activity, analogous to the
/// original's `getPoolSize`/`getActiveCount`/`getCompletedTaskCount`
/// family of accessors, gathered into one struct instead of several
/// separate racy reads.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub pool_size: usize,
    pub largest_pool_size: usize,
    pub active_count: usize,
    pub queued_tasks: usize,
    pub submitted_tasks: u64,
    pub completed_tasks: u64,
    pub rejected_tasks: u64,
}

struct PoolState {
    pool_size: usize,
    largest_pool_size: usize,
    active_count: usize,
    running: bool,
    terminated: bool,
}

pub(crate) struct Shared {
    pub(crate) core_pool_size: usize,
    pub(crate) max_pool_size: usize,
    pub(crate) keep_alive: Duration,
    pub(crate) queue: Box<dyn Queue<Job>>,
    pub(crate) thread_factory: Box<dyn ThreadFactory>,
    pub(crate) observer: Box<dyn PoolObserver>,
    rejection_policy: Box<dyn RejectionPolicy<Job>>,
    state: Mutex<PoolState>,
    termination: Condvar,
    submitted_tasks: AtomicU64,
    completed_tasks: AtomicU64,
    rejected_tasks: AtomicU64,
}

impl Shared {
    pub(crate) fn note_active(&self, delta: isize) {
        let mut state = self.state.lock();
        if delta > 0 {
            state.active_count += delta as usize;
        } else {
            state.active_count -= (-delta) as usize;
        }
    }

    pub(crate) fn note_completed(&self) {
        self.completed_tasks.fetch_add(1, Ordering::Relaxed);
    }

    /// Called by a retiring worker. The last worker to retire after a
    /// shutdown was requested flips the pool to `terminated` and fires
    /// the [`PoolObserver::terminated`] hook exactly once.
    pub(crate) fn note_retired(&self) {
        let mut state = self.state.lock();
        state.pool_size -= 1;
        if state.pool_size == 0 && !state.running {
            state.terminated = true;
            drop(state);
            self.observer.terminated();
            self.termination.notify_all();
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.lock().running
    }
}

/// Construction parameters (spec §6 "Pool configuration"), validated
/// once up front rather than letting an invalid combination surface as
/// a confusing runtime deadlock later.
pub struct PoolConfig {
    pub core_pool_size: usize,
    pub max_pool_size: usize,
    pub keep_alive: Duration,
    pub work_queue: Box<dyn Queue<Job>>,
    pub thread_factory: Box<dyn ThreadFactory>,
    pub observer: Box<dyn PoolObserver>,
    pub rejection_policy: Box<dyn RejectionPolicy<Job>>,
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.core_pool_size > self.max_pool_size {
            return Err(JunctureError::InvalidArgument(
                "core_pool_size must not exceed max_pool_size".into(),
            ));
        }
        if self.max_pool_size == 0 {
            return Err(JunctureError::InvalidArgument(
                "max_pool_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// A fixed-size or core/max-elastic pool of worker threads pulling from
/// one shared [`Queue`] of boxed jobs.
pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            core_pool_size: config.core_pool_size,
            max_pool_size: config.max_pool_size,
            keep_alive: config.keep_alive,
            queue: config.work_queue,
            thread_factory: config.thread_factory,
            observer: config.observer,
            rejection_policy: config.rejection_policy,
            state: Mutex::new(PoolState {
                pool_size: 0,
                largest_pool_size: 0,
                active_count: 0,
                running: true,
                terminated: false,
            }),
            termination: Condvar::new(),
            submitted_tasks: AtomicU64::new(0),
            completed_tasks: AtomicU64::new(0),
            rejected_tasks: AtomicU64::new(0),
        });
        Ok(Self { shared })
    }

    /// A fixed-size pool backed by an unbounded [`crate::queue::TransferQueue`]
    /// and the [`AbortPolicy`], the configuration most callers reach for
    /// first.
    pub fn fixed(size: usize) -> Result<Self> {
        Self::new(PoolConfig {
            core_pool_size: size,
            max_pool_size: size,
            keep_alive: Duration::from_secs(60),
            work_queue: Box::new(crate::queue::TransferQueue::new()),
            thread_factory: Box::new(DefaultThreadFactory::new("juncture-pool")),
            observer: Box::new(NoopObserver),
            rejection_policy: Box::new(AbortPolicy),
        })
    }

    /// As [`ThreadPool::fixed`], but saturated submissions run on the
    /// caller's own thread instead of failing fast: wires up a
    /// [`CallerRunsPolicy`] bound to this pool's own job-execution
    /// closure, so the caller never has to build that closure itself.
    pub fn fixed_with_caller_runs(size: usize) -> Result<Self> {
        Self::new(PoolConfig {
            core_pool_size: size,
            max_pool_size: size,
            keep_alive: Duration::from_secs(60),
            work_queue: Box::new(crate::queue::TransferQueue::new()),
            thread_factory: Box::new(DefaultThreadFactory::new("juncture-pool")),
            observer: Box::new(NoopObserver),
            rejection_policy: Box::new(CallerRunsPolicy::new(|job: Job| job())),
        })
    }

    fn spawn_worker(state: &mut PoolState, shared: &Arc<Shared>, first_task: Option<Job>) -> bool {
        if state.pool_size >= shared.max_pool_size {
            return false;
        }
        let worker_shared = shared.clone();
        let name = format!("worker-{}", state.pool_size);
        let spawned = shared.thread_factory.spawn(Box::new(move || {
            run_worker(worker_shared, name, first_task);
        }));
        match spawned {
            Ok(_handle) => {
                state.pool_size += 1;
                state.largest_pool_size = state.largest_pool_size.max(state.pool_size);
                true
            }
            Err(_) => false,
        }
    }

    fn execute(&self, job: Job) -> Result<()> {
        self.shared.submitted_tasks.fetch_add(1, Ordering::Relaxed);
        let mut state = self.shared.state.lock();
        if !state.running {
            drop(state);
            warn!("rejecting task: pool is shut down");
            self.shared.rejected_tasks.fetch_add(1, Ordering::Relaxed);
            return self
                .shared
                .rejection_policy
                .reject(job, self.shared.queue.as_ref(), true);
        }

        if state.pool_size < self.shared.core_pool_size {
            if Self::spawn_worker(&mut state, &self.shared, Some(job)) {
                trace!(pool_size = state.pool_size, "admitted task onto a new core worker");
                return Ok(());
            }
            drop(state);
            warn!("rejecting task: failed to spawn a core worker");
            self.shared.rejected_tasks.fetch_add(1, Ordering::Relaxed);
            return Err(JunctureError::Rejected);
        }

        if self.shared.queue.remaining_capacity() == 0
            && state.pool_size < self.shared.max_pool_size
        {
            if Self::spawn_worker(&mut state, &self.shared, Some(job)) {
                trace!(pool_size = state.pool_size, "admitted task onto a new overflow worker");
                return Ok(());
            }
            drop(state);
            warn!("rejecting task: failed to spawn an overflow worker");
            self.shared.rejected_tasks.fetch_add(1, Ordering::Relaxed);
            return Err(JunctureError::Rejected);
        }

        if self.shared.queue.remaining_capacity() == 0 {
            drop(state);
            warn!("rejecting task: queue full and pool already at max_pool_size");
            self.shared.rejected_tasks.fetch_add(1, Ordering::Relaxed);
            return self
                .shared
                .rejection_policy
                .reject(job, self.shared.queue.as_ref(), false);
        }
        drop(state);

        match self.shared.queue.offer(job) {
            Ok(true) => {
                let mut state = self.shared.state.lock();
                if state.pool_size == 0 {
                    Self::spawn_worker(&mut state, &self.shared, None);
                }
                trace!("admitted task onto the work queue");
                Ok(())
            }
            Ok(false) => {
                // Lost a race against other submitters between the
                // capacity check above and this offer; the job was
                // already dropped inside the failed `offer`, so the
                // policy cannot be consulted with it.
                warn!("rejecting task: lost the race for the last queue slot");
                self.shared.rejected_tasks.fetch_add(1, Ordering::Relaxed);
                Err(JunctureError::Rejected)
            }
            Err(e) => Err(e),
        }
    }

    /// Submits a plain, no-result job (fire-and-forget `execute`).
    pub fn execute_fn(&self, f: impl FnOnce() + Send + 'static) -> Result<()> {
        self.execute(Box::new(f))
    }

    /// Submits a job and returns a [`JoinHandle`] to observe its result.
    pub fn submit<T, F>(&self, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let callable: Box<dyn FnOnce() -> std::result::Result<T, TaskFailure> + Send> =
            Box::new(move || Ok(f()));
        let task = Arc::new(Task::new(callable));
        let handle = task.handle();
        self.execute(Box::new(move || task.run()))?;
        Ok(handle)
    }

    /// Like [`ThreadPool::submit`], but for a callable that can itself
    /// fail; its `Err` surfaces through the handle as
    /// [`JunctureError::ExecutionFailure`] rather than as a panic.
    pub fn submit_fallible<T, E, F>(&self, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let callable: Box<dyn FnOnce() -> std::result::Result<T, TaskFailure> + Send> =
            Box::new(move || f().map_err(|e| TaskFailure::Error(Box::new(e))));
        let task = Arc::new(Task::new(callable));
        let handle = task.handle();
        self.execute(Box::new(move || task.run()))?;
        Ok(handle)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            pool_size: state.pool_size,
            largest_pool_size: state.largest_pool_size,
            active_count: state.active_count,
            queued_tasks: self.shared.queue.len(),
            submitted_tasks: self.shared.submitted_tasks.load(Ordering::Relaxed),
            completed_tasks: self.shared.completed_tasks.load(Ordering::Relaxed),
            rejected_tasks: self.shared.rejected_tasks.load(Ordering::Relaxed),
        }
    }

    /// Stops admitting new work; queued and in-flight tasks still run
    /// to completion. Idle workers above `core_pool_size` continue to
    /// retire on their own keep-alive timer; every worker retires once
    /// the queue is observed empty after `running` goes false.
    pub fn shutdown(&self) {
        debug!("shutdown requested: draining queue, no new admissions");
        let mut state = self.shared.state.lock();
        state.running = false;
        if state.pool_size == 0 {
            state.terminated = true;
            drop(state);
            self.shared.observer.terminated();
            self.shared.termination.notify_all();
        }
    }

    /// As [`ThreadPool::shutdown`], but also drains and returns every
    /// task still sitting in the queue, unrun. Cannot forcibly stop a
    /// task already running on a worker thread — Rust has no
    /// thread-kill primitive — so a caller that needs that has to build
    /// its own tasks cooperative about a shared
    /// [`crate::cancel::CancelToken`] and check it from inside.
    pub fn shutdown_now(&self) -> Vec<Job> {
        debug!("immediate shutdown requested: every worker will be interrupted");
        let mut state = self.shared.state.lock();
        state.running = false;
        let mut drained = Vec::new();
        self.shared
            .queue
            .drain_to(&mut |job| drained.push(job), usize::MAX);
        debug!(drained = drained.len(), "drained undequeued tasks");
        if state.pool_size == 0 {
            state.terminated = true;
            drop(state);
            self.shared.observer.terminated();
            self.shared.termination.notify_all();
        }
        drained
    }

    /// Blocks until every worker has retired, or `timeout` elapses
    /// first. Returns `true` iff termination was observed.
    pub fn await_termination(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.shared.state.lock();
        match timeout {
            None => {
                while !state.terminated {
                    self.shared.termination.wait(&mut state);
                }
                true
            }
            Some(timeout) => {
                let deadline = crate::time::Deadline::after(timeout);
                while !state.terminated {
                    let remaining = deadline.remaining();
                    if remaining.is_zero() && deadline.has_elapsed() {
                        return state.terminated;
                    }
                    self.shared.termination.wait_for(&mut state, remaining);
                }
                true
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        !self.shared.is_running()
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.state.lock().terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn fixed_pool_runs_every_submitted_job() {
        let pool = ThreadPool::fixed(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let counter = counter.clone();
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    1
                })
                .unwrap()
            })
            .collect();
        for h in handles {
            h.get().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        pool.shutdown();
        assert!(pool.await_termination(Some(Duration::from_secs(5))));
    }

    #[test]
    fn submit_fallible_surfaces_the_error_through_the_handle() {
        let pool = ThreadPool::fixed(1).unwrap();
        let handle = pool
            .submit_fallible::<(), _, _>(|| Err(std::io::Error::other("boom")))
            .unwrap();
        let result = handle.get();
        assert!(matches!(result, Err(JunctureError::ExecutionFailure(_))));
        pool.shutdown();
        pool.await_termination(Some(Duration::from_secs(5)));
    }

    #[test]
    fn a_panicking_task_does_not_kill_its_worker() {
        let pool = ThreadPool::fixed(1).unwrap();
        let panicking = pool.submit::<(), _>(|| panic!("boom")).unwrap();
        assert!(panicking.get().is_err());
        let followup = pool.submit(|| 99).unwrap();
        assert_eq!(followup.get().unwrap(), 99);
        pool.shutdown();
        pool.await_termination(Some(Duration::from_secs(5)));
    }

    /// End-to-end scenario 5 from spec §8: a submitted future is
    /// cancelled before the pool ever runs it, and a graceful shutdown
    /// still reaches termination.
    #[test]
    fn cancel_before_run_then_graceful_shutdown() {
        let pool = ThreadPool::new(PoolConfig {
            core_pool_size: 0,
            max_pool_size: 1,
            keep_alive: Duration::from_millis(50),
            work_queue: Box::new(crate::queue::ArrayBlockingQueue::new(4).unwrap()),
            thread_factory: Box::new(DefaultThreadFactory::new("cancel-scenario")),
            observer: Box::new(NoopObserver),
            rejection_policy: Box::new(AbortPolicy),
        })
        .unwrap();

        let blocker_started = Arc::new(std::sync::Barrier::new(2));
        let b2 = blocker_started.clone();
        let _blocker = pool
            .submit(move || {
                b2.wait();
                std::thread::sleep(Duration::from_millis(100));
            })
            .unwrap();
        blocker_started.wait();

        let handle = pool.submit(|| 1234).unwrap();
        assert!(handle.cancel(false));
        assert!(handle.is_cancelled());

        pool.shutdown();
        assert!(pool.await_termination(Some(Duration::from_secs(5))));
    }

    #[test]
    fn shutdown_now_drains_unstarted_jobs() {
        let pool = ThreadPool::new(PoolConfig {
            core_pool_size: 0,
            max_pool_size: 1,
            keep_alive: Duration::from_millis(50),
            work_queue: Box::new(crate::queue::ArrayBlockingQueue::new(4).unwrap()),
            thread_factory: Box::new(DefaultThreadFactory::new("drain-scenario")),
            observer: Box::new(NoopObserver),
            rejection_policy: Box::new(AbortPolicy),
        })
        .unwrap();
        pool.shared.queue.offer(Box::new(|| {})).unwrap();
        pool.shared.queue.offer(Box::new(|| {})).unwrap();
        let drained = pool.shutdown_now();
        assert_eq!(drained.len(), 2);
    }

    #[test]
    fn rejects_invalid_config() {
        let result = ThreadPool::new(PoolConfig {
            core_pool_size: 4,
            max_pool_size: 1,
            keep_alive: Duration::from_secs(1),
            work_queue: Box::new(crate::queue::ArrayBlockingQueue::new(1).unwrap()),
            thread_factory: Box::new(DefaultThreadFactory::new("bad-config")),
            observer: Box::new(NoopObserver),
            rejection_policy: Box::new(AbortPolicy),
        });
        assert!(matches!(result, Err(JunctureError::InvalidArgument(_))));
    }

    #[test]
    fn stats_track_submitted_completed_and_largest_pool_size() {
        let pool = ThreadPool::fixed(3).unwrap();
        let handles: Vec<_> = (0..12).map(|i| pool.submit(move || i).unwrap()).collect();
        for h in handles {
            h.get().unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.submitted_tasks, 12);
        assert_eq!(stats.completed_tasks, 12);
        assert_eq!(stats.largest_pool_size, 3);
        pool.shutdown();
        assert!(pool.await_termination(Some(Duration::from_secs(5))));
    }
}
