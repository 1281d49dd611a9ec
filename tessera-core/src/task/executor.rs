//! Executors decide which thread a task or continuation runs on.

use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender, TryRecvError, unbounded};

/// A unit of work handed to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run tasks, now or later, on some thread.
pub trait Executor: Send + Sync {
    /// Queues the task for execution.
    fn execute(&self, task: Task);
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, task: Task) {
        (**self).execute(task);
    }
}

/// Runs tasks on the tokio blocking pool. All background actors live here.
#[derive(Clone)]
pub struct WorkerExecutor {
    handle: tokio::runtime::Handle,
}

impl WorkerExecutor {
    /// Creates a worker executor backed by the given runtime.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }
}

impl Executor for WorkerExecutor {
    fn execute(&self, task: Task) {
        // The join handle is not needed, completion is observed through futures.
        drop(self.handle.spawn_blocking(task));
    }
}

/// Runs tasks immediately on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateExecutor;

impl Executor for ImmediateExecutor {
    fn execute(&self, task: Task) {
        task();
    }
}

/// The queue feeding the main coordination loop.
///
/// Any thread may post work through a [`MainThreadHandle`]; only the owner of the
/// [`MainThreadQueue`] runs it, from inside the tick.
pub struct MainThreadQueue {
    receiver: Receiver<Task>,
    handle: MainThreadHandle,
}

/// A cloneable handle posting work onto the main coordination loop.
#[derive(Clone)]
pub struct MainThreadHandle {
    sender: Sender<Task>,
}

impl MainThreadQueue {
    /// Creates an empty main-thread queue.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            receiver,
            handle: MainThreadHandle { sender },
        }
    }

    /// Returns a handle for posting work.
    #[must_use]
    pub fn handle(&self) -> MainThreadHandle {
        self.handle.clone()
    }

    /// Runs a single queued task. Returns false if the queue was empty.
    pub fn run_one(&self) -> bool {
        match self.receiver.try_recv() {
            Ok(task) => {
                task();
                true
            }
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => false,
        }
    }

    /// Runs queued tasks until the queue is empty, including tasks queued while draining.
    /// Returns the number of tasks run.
    pub fn run_all(&self) -> usize {
        let mut count = 0;
        while self.run_one() {
            count += 1;
        }
        count
    }

    /// Returns the number of tasks waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Returns true if nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Default for MainThreadQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for MainThreadHandle {
    fn execute(&self, task: Task) {
        // The receiver only disappears on shutdown, at which point the work is moot.
        if self.sender.send(task).is_err() {
            log::debug!("Main thread queue closed, dropping task");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn main_queue_runs_nested_tasks_in_order() {
        let queue = MainThreadQueue::new();
        let handle = queue.handle();
        let counter = Arc::new(AtomicUsize::new(0));

        let inner_handle = handle.clone();
        let c = counter.clone();
        handle.execute(Box::new(move || {
            assert_eq!(c.fetch_add(1, Ordering::SeqCst), 0);
            let c = c.clone();
            inner_handle.execute(Box::new(move || {
                assert_eq!(c.fetch_add(1, Ordering::SeqCst), 1);
            }));
        }));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.run_all(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty());
    }
}
