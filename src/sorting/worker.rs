use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use once_cell::sync::OnceCell;

use crate::sorting::error::SortError;
use crate::sorting::pca::PcaJob;

/// Single background thread that runs PCA jobs one after another, in
/// submission order, so spike ingestion never waits on covariance/SVD work.
#[derive(Debug)]
pub struct PcaWorker {
    queue: Mutex<Option<Sender<PcaJob>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    finished: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
}

impl PcaWorker {
    pub fn spawn() -> Result<Self, SortError> {
        let (tx, rx) = mpsc::channel::<PcaJob>();
        let finished = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let handle = {
            let finished = Arc::clone(&finished);
            let failed = Arc::clone(&failed);
            thread::Builder::new().name("pca".into()).spawn(move || {
                log::debug!("PCA worker started");
                // Ends once every sender is gone and the queue is drained.
                for job in rx {
                    match job.run() {
                        Ok(()) => finished.fetch_add(1, Ordering::SeqCst),
                        Err(_) => failed.fetch_add(1, Ordering::SeqCst),
                    };
                }
                log::debug!("PCA worker stopped");
            })?
        };
        Ok(Self {
            queue: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            finished,
            failed,
        })
    }

    /// Process-wide worker that every electrode can share.
    pub fn shared() -> Result<Arc<PcaWorker>, SortError> {
        static WORKER: OnceCell<Arc<PcaWorker>> = OnceCell::new();
        WORKER
            .get_or_try_init(|| PcaWorker::spawn().map(Arc::new))
            .map(Arc::clone)
    }

    /// Queues a job behind any already waiting. Returns false when the worker
    /// has shut down; the job is dropped and its subscriber sees a failure.
    pub fn submit(&self, job: PcaJob) -> bool {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        match queue.as_ref() {
            Some(tx) => match tx.send(job) {
                Ok(()) => true,
                Err(_) => {
                    log::warn!("PCA worker thread is gone, dropping job");
                    false
                }
            },
            None => false,
        }
    }

    pub fn jobs_finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn jobs_failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Closes the queue and waits for the jobs already queued.
    pub fn shutdown(&self) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("PCA worker thread panicked");
            }
        }
    }
}

impl Drop for PcaWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
