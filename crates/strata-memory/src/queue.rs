//! Supervised background queue for post-response work.
//!
//! A bounded channel feeds a fixed pool of workers. Every job runs under a
//! timeout; its outcome is logged and counted in
//! `background_jobs_total{kind, outcome}` and never reaches the submitter.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::{MemoryError, Result};

/// A queued unit of work.
pub type JobFuture = BoxFuture<'static, Result<()>>;

struct Job {
    kind: &'static str,
    future: JobFuture,
}

/// How a job ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Returned `Ok`.
    Succeeded,
    /// Returned an error.
    Failed,
    /// Ran past the timeout.
    TimedOut,
    /// Panicked.
    Panicked,
    /// Rejected because the queue was full.
    Dropped,
}

impl JobOutcome {
    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Panicked => "panicked",
            Self::Dropped => "dropped",
        }
    }
}

fn record(kind: &'static str, outcome: JobOutcome) {
    metrics::counter!("background_jobs_total", "kind" => kind, "outcome" => outcome.as_str())
        .increment(1);
}

#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

impl Pending {
    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Bounded worker pool for fire-and-forget jobs.
pub struct BackgroundQueue {
    tx: parking_lot::Mutex<Option<mpsc::Sender<Job>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<Pending>,
}

impl BackgroundQueue {
    /// Start `workers` workers behind a channel of `capacity`, each job
    /// bounded by `timeout`.
    pub fn start(capacity: usize, workers: usize, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let pending = Arc::new(Pending::default());

        let handles = (0..workers.max(1))
            .map(|id| tokio::spawn(worker(id, rx.clone(), pending.clone(), timeout)))
            .collect();

        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            workers: parking_lot::Mutex::new(handles),
            pending,
        }
    }

    /// Queue a job without waiting.
    ///
    /// Returns `false` when the queue is full and the job was dropped.
    pub fn try_submit<F>(&self, kind: &'static str, job: F) -> Result<bool>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(MemoryError::QueueClosed)?;
        let _ = self.pending.count.fetch_add(1, Ordering::AcqRel);
        match tx.try_send(Job {
            kind,
            future: job.boxed(),
        }) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.pending.finish();
                warn!(kind = job.kind, "background queue full, job dropped");
                record(job.kind, JobOutcome::Dropped);
                Ok(false)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.pending.finish();
                Err(MemoryError::QueueClosed)
            }
        }
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.pending.count.load(Ordering::Acquire)
    }

    /// Wait until no job is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.pending.idle.notified();
            tokio::pin!(notified);
            let _ = notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting jobs, drain the queue and join the workers.
    pub async fn shutdown(&self) {
        drop(self.tx.lock().take());
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background worker exited abnormally");
            }
        }
        debug!("background queue stopped");
    }
}

async fn worker(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    pending: Arc<Pending>,
    timeout: Duration,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(Job { kind, future }) = next else {
            break;
        };

        let outcome = match tokio::time::timeout(timeout, AssertUnwindSafe(future).catch_unwind()).await {
            Ok(Ok(Ok(()))) => JobOutcome::Succeeded,
            Ok(Ok(Err(e))) => {
                warn!(worker = id, kind, error = %e, "background job failed");
                JobOutcome::Failed
            }
            Ok(Err(_)) => {
                warn!(worker = id, kind, "background job panicked");
                JobOutcome::Panicked
            }
            Err(_) => {
                warn!(
                    worker = id,
                    kind,
                    timeout_secs = timeout.as_secs(),
                    "background job timed out"
                );
                JobOutcome::TimedOut
            }
        };
        record(kind, outcome);
        pending.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicU32;

    fn done() -> Result<()> {
        Ok(())
    }

    fn boom() -> Result<()> {
        panic!("boom")
    }

    #[tokio::test]
    async fn runs_jobs_and_waits_idle() {
        let queue = BackgroundQueue::start(8, 2, Duration::from_secs(5));
        let count = Arc::new(AtomicU32::new(0));
        for _ in 0..5 {
            let count = count.clone();
            assert!(queue
                .try_submit("test", async move {
                    let _ = count.fetch_add(1, Ordering::SeqCst);
                    done()
                })
                .unwrap());
        }
        queue.wait_idle().await;
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_job_times_out_and_worker_survives() {
        let queue = BackgroundQueue::start(4, 1, Duration::from_secs(30));
        let _ = queue
            .try_submit("slow", async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                done()
            })
            .unwrap();
        let ran = Arc::new(AtomicU32::new(0));
        let flag = ran.clone();
        let _ = queue
            .try_submit("after", async move {
                let _ = flag.fetch_add(1, Ordering::SeqCst);
                done()
            })
            .unwrap();
        queue.wait_idle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_and_panics_are_contained() {
        let queue = BackgroundQueue::start(4, 1, Duration::from_secs(5));
        let _ = queue
            .try_submit("fails", async { Err::<(), _>(MemoryError::EmptyText) })
            .unwrap();
        let _ = queue
            .try_submit("panics", async { boom() })
            .unwrap();
        let ran = Arc::new(AtomicU32::new(0));
        let flag = ran.clone();
        let _ = queue
            .try_submit("ok", async move {
                let _ = flag.fetch_add(1, Ordering::SeqCst);
                done()
            })
            .unwrap();
        queue.wait_idle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn full_queue_drops_and_closed_queue_rejects() {
        let queue = BackgroundQueue::start(1, 1, Duration::from_secs(5));
        let gate = Arc::new(tokio::sync::Notify::new());
        let started = Arc::new(tokio::sync::Notify::new());
        let (g, s) = (gate.clone(), started.clone());
        assert!(queue
            .try_submit("blocker", async move {
                s.notify_one();
                g.notified().await;
                done()
            })
            .unwrap());
        started.notified().await;
        assert!(queue.try_submit("queued", async { done() }).unwrap());
        assert!(!queue.try_submit("overflow", async { done() }).unwrap());

        gate.notify_one();
        queue.wait_idle().await;
        queue.shutdown().await;
        assert_matches!(
            queue.try_submit("late", async { done() }),
            Err(MemoryError::QueueClosed)
        );
    }
}
