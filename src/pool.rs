//! Bounded worker pool.
//!
//! A fixed set of long-lived worker tasks pulls boxed futures from one
//! bounded queue. Blocking submits backpressure producers when the queue is
//! full; non-blocking submits fail fast. Task panics are contained per task
//! and never take a worker down.

use crate::error::WsError;
use futures_util::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::{
    any::Any,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio_util::task::TaskTracker;
use tracing::error;

type Task = BoxFuture<'static, ()>;

/// Callback invoked with the payload of a panicking task.
pub type PanicHandler = Arc<dyn Fn(Box<dyn Any + Send>) + Send + Sync>;

/// Fixed-capacity task executor with a bounded queue.
///
/// Built with [`Pool::builder`]. Dropping the pool does not stop the
/// workers; call [`Pool::release`] to drain and shut down.
pub struct Pool {
    cap: usize,
    non_blocking: bool,
    running: Arc<AtomicUsize>,
    queue: Mutex<Option<flume::Sender<Task>>>,
    workers: TaskTracker,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("cap", &self.cap)
            .field("running", &self.running())
            .field("closed", &self.queue.lock().is_none())
            .finish_non_exhaustive()
    }
}

/// Configuration for a [`Pool`].
pub struct PoolBuilder {
    size: usize,
    queue_size: Option<usize>,
    non_blocking: bool,
    panic_handler: Option<PanicHandler>,
}

impl std::fmt::Debug for PoolBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("size", &self.size)
            .field("queue_size", &self.queue_size)
            .field("non_blocking", &self.non_blocking)
            .finish_non_exhaustive()
    }
}

impl PoolBuilder {
    /// Capacity of the task queue. Defaults to the worker count.
    pub fn queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = Some(queue_size);
        self
    }

    /// Make [`Pool::submit`] fail with [`WsError::Full`] instead of waiting
    /// when the queue is full.
    pub fn non_blocking(mut self, non_blocking: bool) -> Self {
        self.non_blocking = non_blocking;
        self
    }

    /// Callback invoked with the panic payload when a task panics. Without
    /// one, panics are logged.
    pub fn panic_handler(
        mut self,
        handler: impl Fn(Box<dyn Any + Send>) + Send + Sync + 'static,
    ) -> Self {
        self.panic_handler = Some(Arc::new(handler));
        self
    }

    /// Spawn the workers. Must be called within a tokio runtime.
    pub fn build(self) -> Pool {
        let queue_size = match self.queue_size {
            Some(size) if size > 0 => size,
            _ => self.size,
        };
        let (sender, receiver) = flume::bounded::<Task>(queue_size);

        let running = Arc::new(AtomicUsize::new(0));
        let workers = TaskTracker::new();
        for _ in 0..self.size {
            workers.spawn(worker_loop(
                receiver.clone(),
                running.clone(),
                self.panic_handler.clone(),
            ));
        }

        Pool {
            cap: self.size,
            non_blocking: self.non_blocking,
            running,
            queue: Mutex::new(Some(sender)),
            workers,
        }
    }
}

impl Pool {
    /// Start configuring a pool of `size` workers.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn builder(size: usize) -> PoolBuilder {
        assert!(size > 0, "pool size must be positive");
        PoolBuilder {
            size,
            queue_size: None,
            non_blocking: false,
            panic_handler: None,
        }
    }

    /// Queue a task for execution.
    ///
    /// In blocking mode (the default) this waits for a queue slot. In
    /// non-blocking mode a full queue fails with [`WsError::Full`]. After
    /// [`Pool::release`] every submit fails with [`WsError::Closed`].
    pub async fn submit<F>(&self, task: F) -> Result<(), WsError>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let sender = match self.queue.lock().as_ref() {
            Some(sender) => sender.clone(),
            None => return Err(WsError::Closed),
        };
        let task: Task = Box::pin(task);

        if self.non_blocking {
            match sender.try_send(task) {
                Ok(()) => Ok(()),
                Err(flume::TrySendError::Full(_)) => Err(WsError::Full),
                Err(flume::TrySendError::Disconnected(_)) => Err(WsError::Closed),
            }
        } else {
            sender.send_async(task).await.map_err(|_| WsError::Closed)
        }
    }

    /// Close the queue and wait for the workers to drain outstanding tasks
    /// and exit. Idempotent.
    pub async fn release(&self) {
        drop(self.queue.lock().take());
        self.workers.close();
        self.workers.wait().await;
    }

    /// Number of tasks currently executing (not queued).
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    /// Configured worker count.
    pub fn cap(&self) -> usize {
        self.cap
    }
}

async fn worker_loop(
    queue: flume::Receiver<Task>,
    running: Arc<AtomicUsize>,
    panic_handler: Option<PanicHandler>,
) {
    while let Ok(task) = queue.recv_async().await {
        running.fetch_add(1, Ordering::Relaxed);
        if let Err(payload) = std::panic::AssertUnwindSafe(task).catch_unwind().await {
            match &panic_handler {
                Some(handler) => handler(payload),
                None => error!(panic = panic_message(&payload), "worker task panicked"),
            }
        }
        running.fetch_sub(1, Ordering::Relaxed);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::atomic::AtomicBool, time::Duration};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn runs_every_submitted_task() {
        let pool = Pool::builder(10).build();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let count = count.clone();
            pool.submit(async move {
                count.fetch_add(1, Ordering::Relaxed);
            })
            .await
            .unwrap();
        }

        pool.release().await;
        assert_eq!(count.load(Ordering::Relaxed), 100);
    }

    #[tokio::test]
    async fn non_blocking_submit_fails_when_saturated() {
        let pool = Pool::builder(1).queue_size(1).non_blocking(true).build();

        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel::<()>();

        // Occupy the single worker.
        pool.submit(async move {
            let _ = ready_tx.send(());
            let _ = done_rx.await;
        })
        .await
        .unwrap();
        ready_rx.await.unwrap();

        // Fill the single queue slot.
        pool.submit(async {}).await.unwrap();

        // Queue full now.
        assert!(matches!(pool.submit(async {}).await, Err(WsError::Full)));

        let _ = done_tx.send(());
        pool.release().await;
        assert!(matches!(pool.submit(async {}).await, Err(WsError::Closed)));
    }

    #[tokio::test]
    async fn release_drains_queued_tasks() {
        let pool = Pool::builder(5).queue_size(64).build();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let count = count.clone();
            pool.submit(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                count.fetch_add(1, Ordering::Relaxed);
            })
            .await
            .unwrap();
        }

        pool.release().await;
        assert_eq!(count.load(Ordering::Relaxed), 50);
    }

    #[tokio::test]
    async fn panic_is_contained_and_reported() {
        let panicked = Arc::new(AtomicBool::new(false));
        let seen = panicked.clone();
        let pool = Pool::builder(1)
            .panic_handler(move |_| seen.store(true, Ordering::Relaxed))
            .build();

        pool.submit(async { panic!("oops") }).await.unwrap();

        // The worker survives the panic and keeps serving.
        let (tx, rx) = oneshot::channel();
        pool.submit(async move {
            let _ = tx.send(());
        })
        .await
        .unwrap();
        rx.await.unwrap();

        assert!(panicked.load(Ordering::Relaxed));
        pool.release().await;
    }

    #[tokio::test]
    async fn running_never_exceeds_cap() {
        let pool = Pool::builder(2).queue_size(16).build();
        let (done_tx, done_rx) = tokio::sync::watch::channel(false);

        for _ in 0..8 {
            let mut done = done_rx.clone();
            pool.submit(async move {
                let _ = done.wait_for(|finished| *finished).await;
            })
            .await
            .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pool.running() <= pool.cap());
        assert_eq!(pool.running(), 2);

        let _ = done_tx.send(true);
        pool.release().await;
    }
}
