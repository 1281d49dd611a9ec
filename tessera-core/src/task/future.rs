//! A completable, shareable future with explicit continuation executors.
//!
//! Values are published once with [`CompletableFuture::complete`]. Continuations registered
//! with the plain combinators run on whichever thread completes the future; the `_async`
//! variants hand the continuation to an [`Executor`], which is how work is marshalled onto
//! a specific actor (the main loop, the worldgen mailbox, ...).

use std::{
    fmt, mem,
    sync::Arc,
    time::{Duration, Instant},
};

use smallvec::SmallVec;
use tessera_utils::locks::{SyncCondvar, SyncMutex};

use super::executor::Executor;

type Callback<T> = Box<dyn FnOnce(&T) + Send + 'static>;

enum State<T> {
    Pending(SmallVec<[Callback<T>; 2]>),
    Done(T),
}

struct Inner<T> {
    state: SyncMutex<State<T>>,
    done: SyncCondvar,
}

/// A future that is completed explicitly and can be observed from any thread.
///
/// Cloning is cheap and every clone observes the same value.
pub struct CompletableFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for CompletableFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for CompletableFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = matches!(*self.inner.state.lock(), State::Done(_));
        f.debug_struct("CompletableFuture").field("done", &done).finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for CompletableFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> CompletableFuture<T> {
    /// Creates a pending future.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: SyncMutex::new(State::Pending(SmallVec::new())),
                done: SyncCondvar::new(),
            }),
        }
    }

    /// Creates an already completed future.
    #[must_use]
    pub fn completed(value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: SyncMutex::new(State::Done(value)),
                done: SyncCondvar::new(),
            }),
        }
    }

    /// Completes the future, running every registered callback on the calling thread.
    ///
    /// Returns false if the future was already completed; the value is then dropped.
    pub fn complete(&self, value: T) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock();
            match mem::replace(&mut *state, State::Done(value.clone())) {
                State::Done(previous) => {
                    *state = State::Done(previous);
                    return false;
                }
                State::Pending(callbacks) => callbacks,
            }
        };
        self.inner.done.notify_all();
        for callback in callbacks {
            callback(&value);
        }
        true
    }

    /// Returns true once a value has been published.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Done(_))
    }

    /// Returns the value if the future is complete.
    #[must_use]
    pub fn now(&self) -> Option<T> {
        match &*self.inner.state.lock() {
            State::Done(value) => Some(value.clone()),
            State::Pending(_) => None,
        }
    }

    /// Returns true if both handles point at the same future.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Runs `callback` with the value once available; immediately if already complete.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let value = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                State::Done(value) => value.clone(),
            }
        };
        callback(&value);
    }

    /// Runs `callback` on `executor` once the value is available.
    pub fn on_complete_async<F, E>(&self, executor: E, callback: F)
    where
        F: FnOnce(&T) + Send + 'static,
        E: Executor + 'static,
    {
        self.on_complete(move |value| {
            let value = value.clone();
            executor.execute(Box::new(move || callback(&value)));
        });
    }

    /// Maps the value on the completing thread.
    #[must_use]
    pub fn map<U, F>(&self, f: F) -> CompletableFuture<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let result = CompletableFuture::new();
        let out = result.clone();
        self.on_complete(move |value| {
            out.complete(f(value));
        });
        result
    }

    /// Maps the value on `executor`.
    #[must_use]
    pub fn map_async<U, F, E>(&self, executor: E, f: F) -> CompletableFuture<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
        E: Executor + 'static,
    {
        let result = CompletableFuture::new();
        let out = result.clone();
        self.on_complete_async(executor, move |value| {
            out.complete(f(value));
        });
        result
    }

    /// Chains another future-producing step, run on `executor`.
    #[must_use]
    pub fn then_compose_async<U, F, E>(&self, executor: E, f: F) -> CompletableFuture<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> CompletableFuture<U> + Send + 'static,
        E: Executor + 'static,
    {
        let result = CompletableFuture::new();
        let out = result.clone();
        self.on_complete_async(executor, move |value| {
            f(value).on_complete(move |next| {
                out.complete(next.clone());
            });
        });
        result
    }

    /// Completes once every future has completed, with the values in input order.
    #[must_use]
    pub fn join_all(futures: Vec<CompletableFuture<T>>) -> CompletableFuture<Vec<T>> {
        let result = CompletableFuture::new();
        if futures.is_empty() {
            result.complete(Vec::new());
            return result;
        }

        let total = futures.len();
        let slots = Arc::new(SyncMutex::new((vec![None; total], total)));
        for (index, future) in futures.into_iter().enumerate() {
            let slots = slots.clone();
            let out = result.clone();
            future.on_complete(move |value| {
                let finished = {
                    let mut guard = slots.lock();
                    let (values, remaining) = &mut *guard;
                    values[index] = Some(value.clone());
                    *remaining -= 1;
                    if *remaining == 0 {
                        Some(values.iter_mut().filter_map(Option::take).collect::<Vec<_>>())
                    } else {
                        None
                    }
                };
                if let Some(values) = finished {
                    out.complete(values);
                }
            });
        }
        result
    }

    /// Blocks the calling thread until the value is available or the timeout elapses.
    ///
    /// Never call this from an actor the future depends on.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while matches!(&*state, State::Pending(_)) {
            if self.inner.done.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        match &*state {
            State::Done(value) => Some(value.clone()),
            State::Pending(_) => None,
        }
    }
}
