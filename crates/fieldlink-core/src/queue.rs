// ── Request serializer ──
//
// FIFO queue of async jobs with at most one job in flight. Every caller
// sharing a `RequestQueue` is serialized behind a single worker task, so
// the medium behind it (a BACnet network, a database) sees one request
// at a time. Jobs may push continuations onto the tail via `Requeue`.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::CoreError;

/// Every this-many-th dispatch, the worker yields to the scheduler
/// before running the job.
pub const FAIRNESS_BATCH: usize = 20;

type Job = Box<dyn FnOnce(Requeue) -> BoxFuture<'static, ()> + Send>;

// ── RequestQueue ────────────────────────────────────────────────────

/// Cheaply cloneable handle to a serialized job queue.
///
/// The worker task exits once every handle is dropped and the queue
/// has drained.
#[derive(Clone)]
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl RequestQueue {
    /// Spawn the worker task. Must be called within a Tokio runtime.
    pub fn new(name: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let requeue = tx.downgrade();
        tokio::spawn(worker(name.to_owned(), rx, requeue));
        Self { tx }
    }

    /// Append a job and wait for its output.
    ///
    /// The job receives a [`Requeue`] handle for scheduling
    /// continuations at the tail of the queue.
    pub async fn submit<F, Fut, T>(&self, job: F) -> Result<T, CoreError>
    where
        F: FnOnce(Requeue) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let boxed: Job = Box::new(move |requeue| {
            Box::pin(async move {
                let output = job(requeue).await;
                let _ = done_tx.send(output);
            })
        });
        self.tx.send(boxed).map_err(|_| CoreError::QueueClosed)?;
        done_rx.await.map_err(|_| CoreError::QueueClosed)
    }

    /// Append a job without waiting for it.
    pub fn enqueue<F, Fut>(&self, job: F) -> Result<(), CoreError>
    where
        F: FnOnce(Requeue) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tx
            .send(Box::new(move |requeue| Box::pin(job(requeue))))
            .map_err(|_| CoreError::QueueClosed)
    }
}

// ── Requeue ─────────────────────────────────────────────────────────

/// Handed to each running job; pushes continuations onto the tail.
pub struct Requeue {
    tx: mpsc::WeakUnboundedSender<Job>,
}

impl Requeue {
    /// Schedule `job` after everything currently queued.
    pub fn push<F, Fut>(&self, job: F) -> Result<(), CoreError>
    where
        F: FnOnce(Requeue) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let tx = self.tx.upgrade().ok_or(CoreError::QueueClosed)?;
        tx.send(Box::new(move |requeue| Box::pin(job(requeue))))
            .map_err(|_| CoreError::QueueClosed)
    }
}

async fn worker(
    name: String,
    mut rx: mpsc::UnboundedReceiver<Job>,
    requeue: mpsc::WeakUnboundedSender<Job>,
) {
    let mut fairness = Fairness::default();

    while let Some(job) = rx.recv().await {
        if fairness.dispatch() {
            tokio::task::yield_now().await;
        }

        trace!(queue = %name, "dispatching queued operation");
        let handle = Requeue {
            tx: requeue.clone(),
        };
        if AssertUnwindSafe(job(handle)).catch_unwind().await.is_err() {
            warn!(queue = %name, "queued operation panicked; continuing with next");
        }
    }

    debug!(queue = %name, "queue execution suspended, all handles dropped");
}

/// Counts dispatches since the last yield.
#[derive(Debug, Default)]
struct Fairness {
    since_break: usize,
}

impl Fairness {
    /// Record a dispatch. Returns `true` when it should yield first.
    fn dispatch(&mut self) -> bool {
        self.since_break += 1;
        if self.since_break >= FAIRNESS_BATCH {
            self.since_break = 0;
            return true;
        }
        false
    }
}

// ── Bounded retry ───────────────────────────────────────────────────

/// Outcome of [`submit_with_retry`] when the operation did not succeed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
    /// An attempt failed with a non-retryable error.
    Failed(E),
    /// The queue shut down before an attempt could run.
    Closed,
}

/// Run `op` through the queue, resubmitting it at the tail while it
/// fails with a retryable error, up to `max_attempts` runs in total.
///
/// Each retry re-enters behind work queued in the meantime, so one
/// unresponsive device never blocks its neighbours.
pub async fn submit_with_retry<Op, Fut, T, E, R>(
    queue: &RequestQueue,
    max_attempts: u32,
    op: Op,
    is_retryable: R,
) -> Result<T, RetryError<E>>
where
    Op: Fn(u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    R: Fn(&E) -> bool,
{
    let op = Arc::new(op);
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let run = Arc::clone(&op);
        let result = queue
            .submit(move |_| run(attempt))
            .await
            .map_err(|_| RetryError::Closed)?;

        match result {
            Ok(value) => return Ok(value),
            Err(e) if is_retryable(&e) => {
                if attempt >= max_attempts {
                    return Err(RetryError::Exhausted { attempts: attempt, last: e });
                }
                debug!(attempt, max_attempts, "retryable failure, requeueing at tail");
            }
            Err(e) => return Err(RetryError::Failed(e)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct JobLog {
        log: Mutex<Vec<u32>>,
        running: AtomicBool,
        overlapped: AtomicBool,
    }

    impl JobLog {
        async fn run(&self, id: u32) {
            if self.running.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.log.lock().unwrap().push(id);
            self.running.store(false, Ordering::SeqCst);
        }
    }

    fn chain(jobs: Arc<JobLog>, k: u32, last: u32, done: Arc<tokio::sync::Notify>, requeue: &Requeue) {
        let next = Arc::clone(&jobs);
        requeue
            .push(move |rq| async move {
                next.run(k).await;
                if k < last {
                    chain(Arc::clone(&next), k + 1, last, done, &rq);
                } else {
                    done.notify_one();
                }
            })
            .unwrap();
    }

    #[test]
    fn yields_on_every_batch_boundary() {
        let mut fairness = Fairness::default();
        let yields: Vec<usize> = (1..=2 * FAIRNESS_BATCH + 5)
            .filter(|_| fairness.dispatch())
            .collect();
        assert_eq!(yields, vec![FAIRNESS_BATCH, 2 * FAIRNESS_BATCH]);
    }

    #[tokio::test]
    async fn self_requeued_chain_runs_in_order_without_overlap() {
        let queue = RequestQueue::new("test");
        let jobs = Arc::new(JobLog::default());
        let done = Arc::new(tokio::sync::Notify::new());

        let (p, d) = (Arc::clone(&jobs), Arc::clone(&done));
        queue
            .submit(move |rq| async move {
                p.run(0).await;
                chain(Arc::clone(&p), 1, 49, d, &rq);
            })
            .await
            .unwrap();

        done.notified().await;
        let log = jobs.log.lock().unwrap().clone();
        assert_eq!(log, (0..50).collect::<Vec<_>>());
        assert!(!jobs.overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn concurrent_submissions_never_overlap() {
        let queue = RequestQueue::new("test");
        let jobs = Arc::new(JobLog::default());

        let tasks: Vec<_> = (0..30)
            .map(|id| {
                let q = queue.clone();
                let p = Arc::clone(&jobs);
                tokio::spawn(async move { q.submit(move |_| async move { p.run(id).await }).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(jobs.log.lock().unwrap().len(), 30);
        assert!(!jobs.overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn requeued_work_lands_behind_already_queued_work() {
        let queue = RequestQueue::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));

        let (o1, o2) = (Arc::clone(&order), Arc::clone(&order));
        let first = queue.submit(move |rq| async move {
            o1.lock().unwrap().push("first");
            let o = Arc::clone(&o1);
            rq.push(move |_| async move { o.lock().unwrap().push("continuation") })
                .unwrap();
        });
        let second = queue.submit(move |_| async move { o2.lock().unwrap().push("second") });
        let (a, b) = tokio::join!(first, second);
        a.unwrap();
        b.unwrap();

        let o3 = Arc::clone(&order);
        queue
            .submit(move |_| async move { o3.lock().unwrap().push("third") })
            .await
            .unwrap();

        assert_eq!(
            *order.lock().unwrap(),
            vec!["first", "second", "continuation", "third"]
        );
    }

    #[tokio::test]
    async fn panicking_job_does_not_stall_the_queue() {
        let queue = RequestQueue::new("test");
        queue
            .enqueue(|_| async { panic!("job blew up") })
            .unwrap();
        let value = queue.submit(|_| async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let queue = RequestQueue::new("test");
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);

        let result: Result<(), RetryError<&str>> = submit_with_retry(
            &queue,
            5,
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err("timeout") }
            },
            |e| *e == "timeout",
        )
        .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 5, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn retry_stops_on_non_retryable_error() {
        let queue = RequestQueue::new("test");
        let result: Result<(), RetryError<&str>> =
            submit_with_retry(&queue, 5, |_| async { Err("protocol") }, |e| *e == "timeout").await;
        assert!(matches!(result, Err(RetryError::Failed("protocol"))));
    }

    #[tokio::test]
    async fn retry_succeeds_on_later_attempt() {
        let queue = RequestQueue::new("test");
        let result: Result<u32, RetryError<&str>> = submit_with_retry(
            &queue,
            5,
            |attempt| async move { if attempt < 3 { Err("timeout") } else { Ok(attempt) } },
            |e| *e == "timeout",
        )
        .await;
        assert_eq!(result.unwrap(), 3);
    }
}
