//! Task queue shared by the workers of a [`WorkerPool`](crate::WorkerPool).

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

/// A bounded multi-consumer queue.
///
/// Producers push through the sender half; any number of workers pop from
/// the shared receiver until the queue is closed and drained.
pub struct TaskQueue<T> {
    sender: Option<mpsc::Sender<T>>,
    receiver: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> TaskQueue<T> {
    pub fn bounded(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender: Some(sender),
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Enqueue a task, waiting for room. Returns the task back if the queue
    /// was already closed.
    pub async fn push(&self, task: T) -> Result<(), T> {
        match &self.sender {
            Some(sender) => sender.send(task).await.map_err(|e| e.0),
            None => Err(task),
        }
    }

    /// Stop accepting tasks. Workers drain what is left and then see `None`.
    pub fn close(&mut self) {
        self.sender = None;
    }

    /// A handle workers use to pop tasks.
    pub fn consumer(&self) -> TaskConsumer<T> {
        TaskConsumer {
            receiver: self.receiver.clone(),
        }
    }
}

/// The receiving side of a [`TaskQueue`], cloneable across workers.
pub struct TaskConsumer<T> {
    receiver: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for TaskConsumer<T> {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
        }
    }
}

impl<T> TaskConsumer<T> {
    /// Next task, or `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<T> {
        self.receiver.lock().await.recv().await
    }
}
