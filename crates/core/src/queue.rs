//! Bounded worker pool with FIFO admission.
//!
//! Jobs enter an unbounded channel and a single dispatcher admits them in
//! arrival order, each behind a semaphore permit, so admission order is
//! strict FIFO even though execution overlaps up to the concurrency limit.
//! Cancelling the shared token stops admission immediately; jobs already
//! running get a bounded grace period before they are aborted outright.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct CountGuard(Arc<AtomicUsize>);

impl CountGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for CountGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct QueuedTask {
    label: String,
    // decrements `pending` on every exit path, including drops of tasks
    // that were never admitted
    guard: CountGuard,
    future: BoxFuture<'static, ()>,
}

/// A cancellable pool running at most `concurrency` jobs at once.
pub struct TaskQueue {
    name: &'static str,
    jobs: mpsc::UnboundedSender<QueuedTask>,
    cancel: CancellationToken,
    pending: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    running: Arc<Mutex<Vec<JoinHandle<()>>>>,
    dispatcher: JoinHandle<()>,
}

impl TaskQueue {
    pub fn new(name: &'static str, concurrency: usize, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(Mutex::new(Vec::new()));

        let dispatcher = tokio::spawn(dispatch(
            name,
            rx,
            Arc::new(Semaphore::new(concurrency.max(1))),
            cancel.clone(),
            active.clone(),
            running.clone(),
        ));

        Self {
            name,
            jobs: tx,
            cancel,
            pending,
            active,
            running,
            dispatcher,
        }
    }

    /// Queue a job. Returns false when the pool is shutting down and the
    /// job will never run.
    pub fn enqueue<F>(&self, label: impl Into<String>, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return false;
        }

        let task = QueuedTask {
            label: label.into(),
            guard: CountGuard::new(&self.pending),
            future: Box::pin(job),
        };
        // a send failure means the dispatcher is gone; the dropped guard
        // keeps the pending count honest
        self.jobs.send(task).is_ok()
    }

    /// Jobs enqueued but not yet finished, admitted or not.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Jobs currently executing.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for every queued job to finish. Callers stop enqueueing first.
    pub async fn drain(&self) {
        while self.pending() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Cancel admission, give running jobs `grace` to observe the token,
    /// then abort whatever is still going.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();

        let mut tasks: Vec<_> = std::mem::take(&mut *self.running.lock());
        let deadline = Instant::now() + grace;
        let mut aborted = 0usize;

        for task in &mut tasks {
            let left = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(left, &mut *task).await.is_err() {
                task.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!(pool = self.name, aborted, "Jobs exceeded the abort grace period");
        }

        // aborted tasks release their guards as they unwind
        while self.pending() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch(
    name: &'static str,
    mut rx: mpsc::UnboundedReceiver<QueuedTask>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    active: Arc<AtomicUsize>,
    running: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            task = rx.recv() => task,
        };
        let Some(task) = next else { break };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(pool = name, task = %task.label, "Skipping queued job, pool cancelled");
                break;
            }
            permit = semaphore.clone().acquire_owned() => {
                let Ok(permit) = permit else { break };
                permit
            }
        };

        debug!(pool = name, task = %task.label, "Admitting job");
        let active = active.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            let _active = CountGuard::new(&active);
            let _pending = task.guard;
            task.future.await;
        });
        running.lock().push(handle);
    }
    // dropping the receiver drops queued jobs, releasing their guards
    debug!(pool = name, "Dispatcher stopped");
}
