//! Lock aliases so the lock implementation can be swapped in one place.

/// A synchronous mutex.
pub type SyncMutex<T> = parking_lot::Mutex<T>;
/// A synchronous read-write lock.
pub type SyncRwLock<T> = parking_lot::RwLock<T>;
/// A condition variable paired with [`SyncMutex`].
pub type SyncCondvar = parking_lot::Condvar;
