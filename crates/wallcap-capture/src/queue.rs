//! Serial sample handler queue.
//!
//! Every native delivery of an engine is processed on one dedicated thread,
//! in the order it was enqueued. Enqueueing never blocks.

use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::CaptureError;
use crate::CaptureResult;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    sender: Mutex<Option<Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    label: String,
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Closing the sender ends the worker loop once queued jobs ran.
        self.sender.lock().take();

        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if thread::current().id() == self.thread_id {
            // Last reference dropped by a job on the queue itself.
            return;
        }
        if handle.join().is_err() {
            warn!(queue = %self.label, "Sample queue thread panicked");
        }
    }
}

/// Handle to an engine's sample handler thread. Cheap to clone.
#[derive(Clone)]
pub struct SampleQueue {
    worker: Arc<Worker>,
}

impl SampleQueue {
    /// Spawn the queue thread.
    pub fn new(label: &str) -> CaptureResult<Self> {
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = crossbeam_channel::unbounded();

        let handle = thread::Builder::new()
            .name(label.to_string())
            .spawn(move || {
                for job in receiver.iter() {
                    job();
                }
            })
            .map_err(|e| CaptureError::QueueUnavailable(e.to_string()))?;

        debug!(queue = label, "Sample queue started");

        Ok(Self {
            worker: Arc::new(Worker {
                sender: Mutex::new(Some(sender)),
                thread_id: handle.thread().id(),
                handle: Mutex::new(Some(handle)),
                label: label.to_string(),
            }),
        })
    }

    /// Run `job` on the queue after everything enqueued before it.
    ///
    /// Returns false if the queue has shut down; the job is dropped.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) -> bool {
        match self.worker.sender.lock().as_ref() {
            Some(sender) => sender.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// True when called from the queue thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.worker.thread_id
    }
}

impl std::fmt::Debug for SampleQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleQueue")
            .field("label", &self.worker.label)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn test_jobs_run_in_order_on_queue_thread() {
        let queue = SampleQueue::new("test.sample-queue").unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        for i in 0..100 {
            let tx = tx.clone();
            let q = queue.clone();
            assert!(queue.dispatch(move || {
                assert!(q.is_current());
                tx.send(i).unwrap();
            }));
        }
        drop(tx);

        let seen: Vec<i32> = rx.iter().collect();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        assert!(!queue.is_current());
    }

    #[test]
    fn test_drop_drains_pending_jobs() {
        let queue = SampleQueue::new("test.drain").unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        queue.dispatch(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            flag.store(true, Ordering::SeqCst);
        });
        drop(queue);

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_last_reference_dropped_on_queue_thread() {
        let queue = SampleQueue::new("test.self-drop").unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);

        let inner = queue.clone();
        drop(queue);
        // `inner` is the last handle; it is dropped inside its own job.
        let keep = inner.clone();
        keep.dispatch(move || {
            drop(inner);
            tx.send(()).unwrap();
        });
        drop(keep);

        assert!(rx.recv_timeout(std::time::Duration::from_secs(1)).is_ok());
    }
}
