//! Priority re-dispatch in front of sequential actors.
//!
//! Every actor owns one [`TilePriorityQueue`] and one [`ProcessorMailbox`]. The sorter hands
//! the mailbox exactly one task at a time: the wrapper it tells the mailbox runs the task
//! and then polls the queue again. An actor with nothing runnable goes to sleep and is only
//! woken by [`TaskSorter::submit`] or [`TaskSorter::release`].

use std::{fmt, sync::Arc};

use rustc_hash::FxHashMap;
use tessera_utils::{TilePos, locks::SyncMutex};

use super::{
    executor::{Executor, Task},
    mailbox::ProcessorMailbox,
    priority_queue::{Popped, QueuedTask, TilePriorityQueue},
};

/// The named destinations work is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskActor {
    /// Procedural generation stages.
    Worldgen,
    /// Storage loads and saves.
    Io,
    /// The light engine.
    Light,
    /// The main coordination loop.
    Main,
    /// Debounced player ticket insertion.
    TicketThrottler,
}

impl fmt::Display for TaskActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Worldgen => "worldgen",
            Self::Io => "io",
            Self::Light => "light",
            Self::Main => "main",
            Self::TicketThrottler => "ticket-throttler",
        };
        f.write_str(name)
    }
}

struct ActorSlot {
    mailbox: Arc<ProcessorMailbox>,
    queue: TilePriorityQueue<Task>,
    sleeping: bool,
}

/// Routes tile-keyed work to actors in priority order.
pub struct TaskSorter {
    actors: SyncMutex<FxHashMap<TaskActor, ActorSlot>>,
    level_count: usize,
}

impl TaskSorter {
    /// Creates a sorter whose queues have `level_count` urgency buckets.
    #[must_use]
    pub fn new(level_count: usize) -> Arc<Self> {
        Arc::new(Self {
            actors: SyncMutex::new(FxHashMap::default()),
            level_count,
        })
    }

    /// Registers an actor. Re-registering replaces the previous mailbox and drops its queue.
    pub fn register(&self, actor: TaskActor, mailbox: Arc<ProcessorMailbox>, max_acquired: usize) {
        self.actors.lock().insert(
            actor,
            ActorSlot {
                mailbox,
                queue: TilePriorityQueue::new(self.level_count, max_acquired),
                sleeping: true,
            },
        );
    }

    /// Queues `task` for `actor` at the level `level_provider` reports now.
    pub fn submit<L>(self: &Arc<Self>, actor: TaskActor, pos: TilePos, level_provider: L, task: Task)
    where
        L: FnOnce() -> u8,
    {
        self.enqueue(actor, pos, level_provider, vec![QueuedTask::Run(task)]);
    }

    /// Queues `task` followed by an acquire marker for `pos`. The tile stays acquired, counting
    /// against the actor's limit, until [`TaskSorter::release`] is called for it.
    pub fn submit_acquire<L>(
        self: &Arc<Self>,
        actor: TaskActor,
        pos: TilePos,
        level_provider: L,
        task: Task,
    ) where
        L: FnOnce() -> u8,
    {
        self.enqueue(
            actor,
            pos,
            level_provider,
            vec![QueuedTask::Run(task), QueuedTask::Acquire],
        );
    }

    fn enqueue<L>(self: &Arc<Self>, actor: TaskActor, pos: TilePos, level_provider: L, entries: Vec<QueuedTask<Task>>)
    where
        L: FnOnce() -> u8,
    {
        let dispatch = {
            let mut actors = self.actors.lock();
            let Some(slot) = actors.get_mut(&actor) else {
                log::error!("Task submitted for {pos} to unregistered actor {actor}");
                return;
            };
            let level = level_provider();
            for entry in entries {
                slot.queue.submit(pos.key(), level, entry);
            }
            if slot.sleeping {
                slot.sleeping = false;
                Self::next_locked(slot)
            } else {
                None
            }
        };
        if let Some((mailbox, task)) = dispatch {
            self.dispatch(actor, &mailbox, task);
        }
    }

    /// Moves queued entries for `pos` from the bucket `old_level` reports to `new_level` on
    /// every actor, then stores `new_level` through `level_setter`.
    ///
    /// Both callbacks run under the sorter lock and must not call back into the sorter.
    pub fn on_level_change<G, S>(&self, pos: TilePos, old_level: G, new_level: u8, level_setter: S)
    where
        G: FnOnce() -> u8,
        S: FnOnce(u8),
    {
        let mut actors = self.actors.lock();
        let old = old_level();
        if old != new_level {
            for slot in actors.values_mut() {
                slot.queue.resort(old, pos.key(), new_level);
            }
        }
        level_setter(new_level);
    }

    /// Releases `pos` on `actor`, waking the actor if it was sleeping, then runs `then` on the
    /// calling thread.
    pub fn release<F>(self: &Arc<Self>, actor: TaskActor, pos: TilePos, clear_pending: bool, then: F)
    where
        F: FnOnce(),
    {
        let dispatch = {
            let mut actors = self.actors.lock();
            match actors.get_mut(&actor) {
                Some(slot) => {
                    slot.queue.release(pos.key(), clear_pending);
                    if slot.sleeping {
                        slot.sleeping = false;
                        Self::next_locked(slot)
                    } else {
                        None
                    }
                }
                None => {
                    log::error!("Release of {pos} on unregistered actor {actor}");
                    None
                }
            }
        };
        if let Some((mailbox, task)) = dispatch {
            self.dispatch(actor, &mailbox, task);
        }
        then();
    }

    /// Number of entries queued for `actor`, not counting the one in flight.
    #[must_use]
    pub fn pending(&self, actor: TaskActor) -> usize {
        self.actors
            .lock()
            .get(&actor)
            .map_or(0, |slot| slot.queue.len())
    }

    /// Returns true if `actor` has nothing queued and nothing in flight.
    #[must_use]
    pub fn is_idle(&self, actor: TaskActor) -> bool {
        self.actors
            .lock()
            .get(&actor)
            .is_none_or(|slot| slot.sleeping && slot.queue.is_empty())
    }

    /// Closes every registered mailbox.
    pub fn close(&self) {
        for slot in self.actors.lock().values() {
            slot.mailbox.close();
        }
    }

    /// Pops the next runnable task, marking the actor as sleeping when there is none.
    fn next_locked(slot: &mut ActorSlot) -> Option<(Arc<ProcessorMailbox>, Task)> {
        loop {
            match slot.queue.pop() {
                Some(Popped::Run(_, task)) => return Some((slot.mailbox.clone(), task)),
                Some(Popped::Acquired(_)) => {}
                None => {
                    slot.sleeping = true;
                    return None;
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, actor: TaskActor, mailbox: &Arc<ProcessorMailbox>, task: Task) {
        let sorter = self.clone();
        mailbox.tell(Box::new(move || {
            task();
            sorter.poll(actor);
        }));
    }

    fn poll(self: &Arc<Self>, actor: TaskActor) {
        let dispatch = {
            let mut actors = self.actors.lock();
            actors.get_mut(&actor).and_then(Self::next_locked)
        };
        if let Some((mailbox, task)) = dispatch {
            self.dispatch(actor, &mailbox, task);
        }
    }
}

/// An [`Executor`] that routes continuations through a sorter actor at the current level of
/// one tile.
#[derive(Clone)]
pub struct SorterExecutor<L> {
    sorter: Arc<TaskSorter>,
    actor: TaskActor,
    pos: TilePos,
    level_provider: L,
}

impl<L> SorterExecutor<L>
where
    L: Fn() -> u8 + Send + Sync,
{
    /// Creates an executor submitting to `actor` for `pos`.
    pub fn new(sorter: Arc<TaskSorter>, actor: TaskActor, pos: TilePos, level_provider: L) -> Self {
        Self {
            sorter,
            actor,
            pos,
            level_provider,
        }
    }
}

impl<L> Executor for SorterExecutor<L>
where
    L: Fn() -> u8 + Send + Sync,
{
    fn execute(&self, task: Task) {
        self.sorter
            .submit(self.actor, self.pos, || (self.level_provider)(), task);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, Instant},
    };

    use super::*;
    use crate::task::executor::{ImmediateExecutor, MainThreadQueue, WorkerExecutor};

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn runs_most_urgent_first() {
        let main = MainThreadQueue::new();
        let sorter = TaskSorter::new(16);
        sorter.register(
            TaskActor::Main,
            ProcessorMailbox::new(Arc::new(main.handle()), "main"),
            usize::MAX,
        );

        let order = Arc::new(SyncMutex::new(Vec::new()));
        for (x, level) in [(0, 9u8), (1, 2), (2, 9), (3, 5)] {
            let order = order.clone();
            sorter.submit(
                TaskActor::Main,
                TilePos::new(x, 0),
                move || level,
                Box::new(move || order.lock().push(x)),
            );
        }
        main.run_all();

        // The first submission woke the sleeping actor and was dispatched straight away.
        assert_eq!(*order.lock(), vec![0, 1, 3, 2]);
        assert!(sorter.is_idle(TaskActor::Main));
    }

    #[test]
    fn level_change_reorders_pending_work() {
        let main = MainThreadQueue::new();
        let sorter = TaskSorter::new(16);
        sorter.register(
            TaskActor::Main,
            ProcessorMailbox::new(Arc::new(main.handle()), "main"),
            usize::MAX,
        );

        let order = Arc::new(SyncMutex::new(Vec::new()));
        let push = |x: i32| {
            let order = order.clone();
            Box::new(move || order.lock().push(x)) as Task
        };
        sorter.submit(TaskActor::Main, TilePos::new(0, 0), || 1, push(0));
        sorter.submit(TaskActor::Main, TilePos::new(1, 0), || 8, push(1));
        sorter.submit(TaskActor::Main, TilePos::new(2, 0), || 4, push(2));

        let stored = Arc::new(AtomicUsize::new(8));
        let s = stored.clone();
        sorter.on_level_change(
            TilePos::new(1, 0),
            || stored.load(Ordering::SeqCst) as u8,
            2,
            move |level| s.store(usize::from(level), Ordering::SeqCst),
        );
        assert_eq!(stored.load(Ordering::SeqCst), 2);

        main.run_all();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn acquired_tiles_hold_the_actor_until_released() {
        let sorter = TaskSorter::new(8);
        sorter.register(
            TaskActor::TicketThrottler,
            ProcessorMailbox::new(Arc::new(ImmediateExecutor), "throttler"),
            1,
        );

        let ran = Arc::new(AtomicUsize::new(0));
        for x in 0..3 {
            let ran = ran.clone();
            sorter.submit_acquire(
                TaskActor::TicketThrottler,
                TilePos::new(x, 0),
                || 0,
                Box::new(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        let released = Arc::new(AtomicUsize::new(0));
        let r = released.clone();
        sorter.release(TaskActor::TicketThrottler, TilePos::new(0, 0), false, move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn one_task_in_flight_per_actor() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .build()
            .expect("runtime");
        let sorter = TaskSorter::new(8);
        sorter.register(
            TaskActor::Worldgen,
            ProcessorMailbox::new(
                Arc::new(WorkerExecutor::new(runtime.handle().clone())),
                "worldgen",
            ),
            usize::MAX,
        );

        let running = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..4)
            .map(|t| {
                let sorter = sorter.clone();
                let running = running.clone();
                let overlaps = overlaps.clone();
                let finished = finished.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let running = running.clone();
                        let overlaps = overlaps.clone();
                        let finished = finished.clone();
                        sorter.submit(
                            TaskActor::Worldgen,
                            TilePos::new(t, i),
                            move || (i % 8) as u8,
                            Box::new(move || {
                                if running.fetch_add(1, Ordering::SeqCst) != 0 {
                                    overlaps.fetch_add(1, Ordering::SeqCst);
                                }
                                std::thread::yield_now();
                                running.fetch_sub(1, Ordering::SeqCst);
                                finished.fetch_add(1, Ordering::SeqCst);
                            }),
                        );
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().expect("submitter panicked");
        }

        assert!(wait_for(|| finished.load(Ordering::SeqCst) == 400));
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(wait_for(|| sorter.is_idle(TaskActor::Worldgen)));
    }
}
