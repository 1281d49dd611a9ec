//! Background work: executors, futures, sequential actors and the priority sorter in front
//! of them.

pub mod executor;
pub mod future;
pub mod mailbox;
pub mod priority_queue;
pub mod sorter;

pub use executor::{Executor, ImmediateExecutor, MainThreadHandle, MainThreadQueue, Task, WorkerExecutor};
pub use future::CompletableFuture;
pub use mailbox::ProcessorMailbox;
pub use sorter::{SorterExecutor, TaskActor, TaskSorter};
