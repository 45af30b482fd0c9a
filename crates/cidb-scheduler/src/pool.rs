//! Fixed-size worker pool.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{SchedulerError, SchedulerResult};
use crate::queue::TaskQueue;

/// Runs tasks on a fixed number of concurrent tokio workers.
///
/// Workers share nothing but the queue they drain and whatever the handler
/// captures (usually an `Arc<dyn Cidb>`).
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `handler` over every task and return the results in submission
    /// order.
    pub async fn run<T, R, F, Fut>(&self, tasks: Vec<T>, handler: F) -> SchedulerResult<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let total = tasks.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let workers = self.workers.min(total);
        info!(tasks = total, workers, "Starting worker pool");

        let mut queue = TaskQueue::bounded(total);
        let handler = Arc::new(handler);
        let (results_tx, mut results_rx) = mpsc::unbounded_channel::<(usize, R)>();

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let consumer = queue.consumer();
            let handler = handler.clone();
            let results = results_tx.clone();
            handles.push(tokio::spawn(async move {
                let mut handled = 0usize;
                while let Some((index, task)) = consumer.pop().await {
                    let result = (*handler)(task).await;
                    handled += 1;
                    if results.send((index, result)).is_err() {
                        break;
                    }
                }
                debug!(worker_id, handled, "Worker drained queue");
            }));
        }
        drop(results_tx);

        for (index, task) in tasks.into_iter().enumerate() {
            if queue.push((index, task)).await.is_err() {
                return Err(SchedulerError::QueueClosed(total - index));
            }
        }
        queue.close();

        for joined in futures::future::join_all(handles).await {
            joined.map_err(|e| SchedulerError::Worker(e.to_string()))?;
        }

        let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
        while let Some((index, result)) = results_rx.recv().await {
            slots[index] = Some(result);
        }
        slots
            .into_iter()
            .collect::<Option<Vec<R>>>()
            .ok_or_else(|| SchedulerError::Worker("a task produced no result".into()))
    }
}
