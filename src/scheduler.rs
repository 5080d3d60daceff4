//! Scheduler: a small task queue for connection-management work.
//!
//! [`Scheduler::schedule`] appends a future to an unbounded queue drained by
//! a fixed number of workers (one by default, so tasks run one after the
//! other). With `auto_scale` the pool grows up to `max_workers` while the
//! queue backs up. With a `task_timeout`, a task running longer is abandoned,
//! counted and logged.
//!
//! The network uses it for participant cleanup after a disconnect, so that
//! registry bookkeeping never runs on a participant's own I/O tasks.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::SchedulerConfig;
use crate::utils::Metrics;

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Pool {
    config: SchedulerConfig,
    metrics: Arc<Metrics>,
    rx: Mutex<mpsc::UnboundedReceiver<Task>>,
    workers: AtomicUsize,
    pending: AtomicUsize,
    cancel: CancellationToken,
}

impl Pool {
    async fn worker(self: Arc<Self>, id: usize) {
        trace!(worker = id, "Scheduler worker started");
        loop {
            let task = {
                let mut rx = self.rx.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    task = rx.recv() => task,
                }
            };
            let Some(task) = task else {
                break;
            };
            match self.config.task_timeout {
                Some(limit) => {
                    if tokio::time::timeout(limit, task).await.is_err() {
                        self.metrics.scheduler_task_timeout();
                        warn!(worker = id, ?limit, "Scheduled task timed out");
                    } else {
                        self.metrics.scheduler_task_executed();
                    }
                }
                None => {
                    task.await;
                    self.metrics.scheduler_task_executed();
                }
            }
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        self.workers.fetch_sub(1, Ordering::AcqRel);
        trace!(worker = id, "Scheduler worker stopped");
    }

    fn spawn_worker(self: &Arc<Self>) {
        let id = self.workers.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(self.clone().worker(id));
    }
}

/// Task queue with a worker pool. Must be created inside a tokio runtime.
pub struct Scheduler {
    pool: Arc<Pool>,
    tx: mpsc::UnboundedSender<Task>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, metrics: Arc<Metrics>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let workers = config.workers.max(1);
        let pool = Arc::new(Pool {
            config,
            metrics,
            rx: Mutex::new(rx),
            workers: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
        });
        for _ in 0..workers {
            pool.spawn_worker();
        }
        debug!(workers, auto_scale = pool.config.auto_scale, "Scheduler started");
        Self { pool, tx }
    }

    /// Queue `task`; `false` after shutdown.
    pub fn schedule<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.pool.cancel.is_cancelled() {
            return false;
        }
        let pending = self.pool.pending.fetch_add(1, Ordering::AcqRel) + 1;
        if self.tx.send(Box::pin(task)).is_err() {
            self.pool.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        self.pool.metrics.scheduler_task_queued();

        let workers = self.pool.workers.load(Ordering::Acquire);
        if self.pool.config.auto_scale
            && pending > workers
            && workers < self.pool.config.max_workers
        {
            debug!(workers = workers + 1, pending, "Scheduler scaling up");
            self.pool.spawn_worker();
        }
        true
    }

    /// Tasks queued or running.
    pub fn pending(&self) -> usize {
        self.pool.pending.load(Ordering::Acquire)
    }

    pub fn workers(&self) -> usize {
        self.pool.workers.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> u64 {
        self.pool.metrics.scheduler_queued.load(Ordering::Relaxed)
    }

    pub fn executed(&self) -> u64 {
        self.pool.metrics.scheduler_executed.load(Ordering::Relaxed)
    }

    /// Tasks abandoned after the task timeout.
    pub fn timeout_count(&self) -> u64 {
        self.pool.metrics.scheduler_timeouts.load(Ordering::Relaxed)
    }

    /// Stop the workers. Tasks still queued are dropped; running tasks are
    /// finished.
    pub fn shutdown(&self) {
        self.pool.cancel.cancel();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.pool.cancel.cancel();
    }
}
