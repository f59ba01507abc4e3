//! Bounded worker pool for service methods.
//!
//! Methods are plain blocking functions, so each job runs on tokio's
//! blocking thread pool. A fixed number of worker tasks pull jobs from a
//! bounded queue and wait for each job to finish before taking the next,
//! which caps concurrently executing methods at the worker count and the
//! backlog at the queue size. Submission never waits: a full queue is
//! reported to the caller, which answers the request as busy.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// A unit of work handed to the pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    queue: mpsc::Sender<Job>,
    stop: watch::Sender<bool>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Starts `workers` tasks sharing a queue of `queue_size` jobs.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(workers: usize, queue_size: usize) -> Self {
        let (queue, rx) = mpsc::channel::<Job>(queue_size.max(1));
        let (stop, _) = watch::channel(false);
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|id| tokio::spawn(run_worker(id, rx.clone(), stop.subscribe())))
            .collect();

        Self {
            queue,
            stop,
            workers: std::sync::Mutex::new(handles),
            size: workers.max(1),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues `job`, or hands it back if the queue is full or the pool has
    /// stopped.
    pub fn try_submit(&self, job: Job) -> std::result::Result<(), Job> {
        if *self.stop.borrow() {
            return Err(job);
        }
        self.queue.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => job,
        })
    }

    /// Stops taking jobs. Jobs already running finish; queued ones are dropped.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);
        let handles = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            let _ = handle.await;
        }
        debug!(workers = self.size, "worker pool stopped");
    }
}

async fn run_worker(id: usize, queue: Arc<Mutex<mpsc::Receiver<Job>>>, mut stop: watch::Receiver<bool>) {
    loop {
        let job = {
            let mut queue = queue.lock().await;
            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => break,
                job = queue.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            }
        };

        if let Err(e) = tokio::task::spawn_blocking(job).await {
            // panics are caught inside the job; this only fires on runtime shutdown
            error!(worker = id, error = %e, "worker job did not complete");
        }
    }
}
