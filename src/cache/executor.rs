//! Background task executors
//!
//! The manager owns no threads. Free-memory and migrate work is handed to an
//! [`Executor`] supplied by the embedding application. Submission may be
//! refused; callers then roll back their state and retry on a later request.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Unit of background work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs background jobs
pub trait Executor: Send + Sync {
    /// Queue `job`; returns whether it was accepted
    fn submit(&self, job: Job) -> bool;
}

// =============================================================================
// TokioExecutor
// =============================================================================

/// Runs jobs on a tokio runtime's blocking pool
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioExecutor {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Executor bound to the runtime of the calling thread, if any
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl Executor for TokioExecutor {
    fn submit(&self, job: Job) -> bool {
        self.handle.spawn_blocking(job);
        true
    }
}

// =============================================================================
// WorkerPool
// =============================================================================

/// Fixed pool of worker threads fed through a channel
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> std::io::Result<Self> {
        let (sender, receiver) = channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads.max(1));
        for index in 0..threads.max(1) {
            let receiver = receiver.clone();
            let worker = std::thread::Builder::new()
                .name(format!("cache-worker-{index}"))
                .spawn(move || {
                    for job in receiver.iter() {
                        job();
                    }
                    debug!(worker = index, "Cache worker exiting");
                })?;
            workers.push(worker);
        }
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Stop accepting jobs and wait for queued ones to finish
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                warn!("Cache worker panicked");
            }
        }
    }
}

impl Executor for WorkerPool {
    fn submit(&self, job: Job) -> bool {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// ManualExecutor
// =============================================================================

/// Queues jobs until the owner runs them
///
/// Used where task execution must be deterministic, and to simulate an
/// executor that refuses work.
#[derive(Default)]
pub struct ManualExecutor {
    queue: Mutex<VecDeque<Job>>,
    refusing: AtomicBool,
}

impl ManualExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (true) or accept (false) further submissions
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::Relaxed);
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run queued jobs, including ones they queue, until the queue is empty
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = self.queue.lock().pop_front();
            match job {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl Executor for ManualExecutor {
    fn submit(&self, job: Job) -> bool {
        if self.refusing.load(Ordering::Relaxed) {
            return false;
        }
        self.queue.lock().push_back(job);
        true
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_manual_executor_runs_on_demand() {
        let executor = ManualExecutor::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            assert!(executor.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })));
        }
        assert_eq!(executor.pending(), 3);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        assert_eq!(executor.run_pending(), 3);
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_manual_executor_refuses() {
        let executor = ManualExecutor::new();
        executor.set_refusing(true);
        assert!(!executor.submit(Box::new(|| {})));
        assert_eq!(executor.pending(), 0);
    }

    #[test]
    fn test_worker_pool_runs_jobs() {
        let pool = WorkerPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            assert!(pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::Relaxed), 10);
        assert!(!pool.submit(Box::new(|| {})));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_executor() {
        let executor = TokioExecutor::current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        assert!(executor.submit(Box::new(move || {
            let _ = tx.send(42);
        })));
        assert_eq!(rx.await.unwrap(), 42);
    }
}
