//! Strictly serialized work queue for one connection's lifecycle.
//!
//! Jobs run one at a time in submission order. Each job runs in its own
//! task so a panicking job is logged and the queue keeps going.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Serialized job queue.
pub struct LifecycleQueue {
    /// Job submission.
    tx: mpsc::UnboundedSender<Job>,
    /// Jobs submitted and not yet finished, including the running one.
    pending: Arc<AtomicUsize>,
    /// Signalled whenever the queue drains.
    idle: Arc<Notify>,
}

impl LifecycleQueue {
    /// Create a queue and start its worker.
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let pending = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(Notify::new());

        let worker_pending = pending.clone();
        let worker_idle = idle.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(e) = tokio::spawn(job).await {
                    error!("Lifecycle job for {} failed: {}", label, e);
                }
                if worker_pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                    worker_idle.notify_waiters();
                }
            }
            debug!("Lifecycle queue for {} closed", label);
        });

        Self { tx, pending, idle }
    }

    /// Append a job.
    pub fn push<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(Box::pin(job)).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Jobs submitted and not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Wait until every submitted job has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_jobs_run_in_order_one_at_a_time() {
        let queue = LifecycleQueue::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        for (i, delay) in [(1, 30u64), (2, 0), (3, 10)] {
            let log = log.clone();
            queue.push(async move {
                log.lock().unwrap().push(format!("start {}", i));
                tokio::time::sleep(Duration::from_millis(delay)).await;
                log.lock().unwrap().push(format!("end {}", i));
            });
        }
        queue.wait_idle().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["start 1", "end 1", "start 2", "end 2", "start 3", "end 3"]
        );
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_queue() {
        let queue = LifecycleQueue::new("test");
        let ran = Arc::new(AtomicUsize::new(0));

        queue.push(async { panic!("boom") });
        let counter = ran.clone();
        queue.push(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        queue.wait_idle().await;

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_idle_on_empty_queue() {
        let queue = LifecycleQueue::new("test");
        queue.wait_idle().await;
    }
}
