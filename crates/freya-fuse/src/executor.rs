//! Bounded worker pool for file content operations.
//!
//! In multi-threaded mode, FUSE callbacks that may run the codec (open,
//! create, flush, ...) hand their work to this pool and return at once; the
//! worker sends the reply. Admission is reject-fast: when the queue is full
//! the job is run immediately on the caller's thread with an error, so it
//! can answer `EAGAIN` with the reply it owns.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

/// A queued unit of work. It receives whether it was admitted.
type Job = Box<dyn FnOnce(Result<(), SubmitError>) + Send + 'static>;

/// Error when submitting to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// Queue is full; the request should be rejected with EAGAIN.
    #[error("worker queue full (capacity: {capacity})")]
    QueueFull { capacity: usize },
    /// Pool has been shut down.
    #[error("worker pool has been shut down")]
    Shutdown,
}

impl SubmitError {
    pub fn to_errno(self) -> i32 {
        match self {
            SubmitError::QueueFull { .. } => libc::EAGAIN,
            SubmitError::Shutdown => libc::ESHUTDOWN,
        }
    }
}

/// Statistics for the pool.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub jobs_submitted: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub jobs_rejected: AtomicU64,
}

impl PoolStats {
    pub fn record_submit(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_complete(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reject(&self) {
        self.jobs_rejected.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fixed-size thread pool with a bounded queue.
pub struct WorkerPool {
    submit_tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<PoolStats>,
    capacity: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.workers.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Start `threads` workers sharing a queue of `capacity` jobs.
    ///
    /// # Errors
    ///
    /// Fails if a worker thread cannot be spawned.
    pub fn new(threads: usize, capacity: usize) -> io::Result<Self> {
        let (submit_tx, submit_rx) = bounded::<Job>(capacity);
        let stats = Arc::new(PoolStats::default());

        let mut workers = Vec::with_capacity(threads);
        for worker_id in 0..threads {
            let rx = submit_rx.clone();
            let stats = Arc::clone(&stats);
            let handle = thread::Builder::new()
                .name(format!("freyafs-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &rx, &stats))?;
            workers.push(handle);
        }

        info!(threads, capacity, "Worker pool started");
        Ok(Self {
            submit_tx: Some(submit_tx),
            workers,
            stats,
            capacity,
        })
    }

    /// Queue `job`. If it cannot be queued, it runs right away on the
    /// calling thread with the reason.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce(Result<(), SubmitError>) + Send + 'static,
    {
        let Some(tx) = &self.submit_tx else {
            job(Err(SubmitError::Shutdown));
            return;
        };

        match tx.try_send(Box::new(job)) {
            Ok(()) => {
                self.stats.record_submit();
                trace!("Job submitted to worker pool");
            }
            Err(TrySendError::Full(rejected)) => {
                self.stats.record_reject();
                warn!(capacity = self.capacity, "Worker queue full, rejecting request");
                rejected(Err(SubmitError::QueueFull {
                    capacity: self.capacity,
                }));
            }
            Err(TrySendError::Disconnected(rejected)) => {
                rejected(Err(SubmitError::Shutdown));
            }
        }
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting work, let queued jobs finish, and join the workers.
    pub fn shutdown(&mut self) {
        if self.submit_tx.take().is_none() {
            return;
        }
        debug!("Waiting for pool workers to finish");
        for handle in std::mem::take(&mut self.workers) {
            let _ = handle.join();
        }
        info!("Worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker_id: usize, rx: &Receiver<Job>, stats: &PoolStats) {
    debug!(worker_id, "Pool worker started");
    // recv fails once every sender is gone
    while let Ok(job) = rx.recv() {
        job(Ok(()));
        stats.record_complete();
    }
    debug!(worker_id, "Pool worker exiting");
}
