//! Sequential actors.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crossbeam::queue::SegQueue;

use super::executor::{Executor, Task};

/// A strictly sequential message processor.
///
/// Tasks told to the mailbox run one after another, never concurrently, on the wrapped
/// executor. A mailbox is scheduled on its executor only while it has work; telling a
/// mailbox from inside one of its own tasks just queues the task.
pub struct ProcessorMailbox {
    name: &'static str,
    queue: SegQueue<Task>,
    scheduled: AtomicBool,
    closed: AtomicBool,
    executor: Arc<dyn Executor>,
}

impl ProcessorMailbox {
    /// Creates a mailbox running on `executor`.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>, name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            queue: SegQueue::new(),
            scheduled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            executor,
        })
    }

    /// The mailbox name, used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queues a task.
    pub fn tell(self: &Arc<Self>, task: Task) {
        if self.closed.load(Ordering::Acquire) {
            log::debug!("Dropping task sent to closed mailbox {}", self.name);
            return;
        }
        self.queue.push(task);
        self.register_for_execution();
    }

    /// Returns the number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if no task is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Stops accepting tasks. Already queued tasks still run.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn register_for_execution(self: &Arc<Self>) {
        if self.queue.is_empty() {
            return;
        }
        if self
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let this = self.clone();
            self.executor.execute(Box::new(move || this.run()));
        }
    }

    fn run(self: Arc<Self>) {
        while let Some(task) = self.queue.pop() {
            task();
        }
        self.scheduled.store(false, Ordering::Release);
        // A task may have been pushed after the last pop but before the flag was cleared.
        self.register_for_execution();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, Instant},
    };

    use super::*;
    use crate::task::executor::{ImmediateExecutor, WorkerExecutor};

    #[test]
    fn nested_tell_does_not_recurse() {
        let mailbox = ProcessorMailbox::new(Arc::new(ImmediateExecutor), "test");
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let inner = mailbox.clone();
        let o = order.clone();
        mailbox.tell(Box::new(move || {
            o.lock().push(1);
            let o2 = o.clone();
            inner.tell(Box::new(move || o2.lock().push(3)));
            o.lock().push(2);
        }));

        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn tasks_never_overlap_on_worker_pool() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .build()
            .expect("runtime");
        let mailbox = ProcessorMailbox::new(
            Arc::new(WorkerExecutor::new(runtime.handle().clone())),
            "worker",
        );
        let running = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let mut threads = Vec::new();
        for _ in 0..4 {
            let mailbox = mailbox.clone();
            let running = running.clone();
            let finished = finished.clone();
            threads.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let running = running.clone();
                    let finished = finished.clone();
                    mailbox.tell(Box::new(move || {
                        assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                        std::thread::yield_now();
                        running.fetch_sub(1, Ordering::SeqCst);
                        finished.fetch_add(1, Ordering::SeqCst);
                    }));
                }
            }));
        }
        for thread in threads {
            thread.join().expect("sender thread panicked");
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while finished.load(Ordering::SeqCst) < 200 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(finished.load(Ordering::SeqCst), 200);
    }
}
