//! Per-actor priority queue of tile-keyed work.
//!
//! Entries are bucketed by urgency level (lower = more urgent) and ordered by arrival
//! sequence within a bucket, the same ordering the block tick scheduler used for equal
//! trigger ticks.

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

/// What an entry in the queue does once popped.
pub enum QueuedTask<T> {
    /// Hand the payload to the actor.
    Run(T),
    /// Mark the tile as acquired. Acquired tiles count against the queue's limit until released.
    Acquire,
}

/// The result of [`TilePriorityQueue::pop`].
pub enum Popped<T> {
    /// A task for the given tile key.
    Run(i64, T),
    /// The tile key was acquired.
    Acquired(i64),
}

struct Entry<T> {
    pos: i64,
    task: QueuedTask<T>,
}

/// A leveled FIFO queue keyed by tile.
pub struct TilePriorityQueue<T> {
    buckets: Vec<BTreeMap<u64, Entry<T>>>,
    /// Every (bucket, sequence) pair holding an entry for a tile key.
    positions: FxHashMap<i64, SmallVec<[(usize, u64); 4]>>,
    first_bucket: usize,
    next_sequence: u64,
    acquired: FxHashSet<i64>,
    max_acquired: usize,
}

impl<T> TilePriorityQueue<T> {
    /// Creates a queue with `level_count` buckets and a limit on simultaneously acquired tiles.
    #[must_use]
    pub fn new(level_count: usize, max_acquired: usize) -> Self {
        let level_count = level_count.max(1);
        Self {
            buckets: (0..level_count).map(|_| BTreeMap::new()).collect(),
            positions: FxHashMap::default(),
            first_bucket: level_count,
            next_sequence: 0,
            acquired: FxHashSet::default(),
            max_acquired,
        }
    }

    fn bucket_for(&self, level: u8) -> usize {
        usize::from(level).min(self.buckets.len() - 1)
    }

    /// Adds an entry for `pos` at the given level.
    pub fn submit(&mut self, pos: i64, level: u8, task: QueuedTask<T>) {
        let bucket = self.bucket_for(level);
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        self.buckets[bucket].insert(sequence, Entry { pos, task });
        self.positions.entry(pos).or_default().push((bucket, sequence));
        self.first_bucket = self.first_bucket.min(bucket);
    }

    /// Pops the most urgent entry, or `None` if the queue is empty or the acquire limit is reached.
    pub fn pop(&mut self) -> Option<Popped<T>> {
        if self.acquired.len() >= self.max_acquired {
            return None;
        }
        self.skip_empty_buckets();
        let bucket = self.buckets.get_mut(self.first_bucket)?;
        let (sequence, entry) = bucket.pop_first()?;
        self.forget(entry.pos, self.first_bucket, sequence);
        self.skip_empty_buckets();

        Some(match entry.task {
            QueuedTask::Run(task) => Popped::Run(entry.pos, task),
            QueuedTask::Acquire => {
                self.acquired.insert(entry.pos);
                Popped::Acquired(entry.pos)
            }
        })
    }

    /// Moves every entry of `pos` queued at `old_level` to `new_level`, keeping arrival order.
    pub fn resort(&mut self, old_level: u8, pos: i64, new_level: u8) {
        let old_bucket = self.bucket_for(old_level);
        let new_bucket = self.bucket_for(new_level);
        if old_bucket == new_bucket {
            return;
        }
        let Some(slots) = self.positions.get_mut(&pos) else {
            return;
        };

        let mut moved = false;
        for (bucket, sequence) in slots.iter_mut() {
            if *bucket != old_bucket {
                continue;
            }
            if let Some(entry) = self.buckets[old_bucket].remove(sequence) {
                self.buckets[new_bucket].insert(*sequence, entry);
                *bucket = new_bucket;
                moved = true;
            }
        }
        if moved {
            self.first_bucket = self.first_bucket.min(new_bucket);
            self.skip_empty_buckets();
        }
    }

    /// Drops the acquisition of `pos`. With `clear_pending`, every queued entry of `pos` is
    /// dropped as well; otherwise only its pending acquire markers are.
    pub fn release(&mut self, pos: i64, clear_pending: bool) {
        if let Some(slots) = self.positions.remove(&pos) {
            let mut kept = SmallVec::new();
            for (bucket, sequence) in slots {
                let drop_entry = clear_pending
                    || matches!(
                        self.buckets[bucket].get(&sequence),
                        Some(Entry {
                            task: QueuedTask::Acquire,
                            ..
                        })
                    );
                if drop_entry {
                    self.buckets[bucket].remove(&sequence);
                } else {
                    kept.push((bucket, sequence));
                }
            }
            if !kept.is_empty() {
                self.positions.insert(pos, kept);
            }
        }
        self.acquired.remove(&pos);
        self.skip_empty_buckets();
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(BTreeMap::len).sum()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first_bucket >= self.buckets.len()
    }

    /// Number of tiles currently acquired.
    #[must_use]
    pub fn acquired_count(&self) -> usize {
        self.acquired.len()
    }

    fn forget(&mut self, pos: i64, bucket: usize, sequence: u64) {
        if let Some(slots) = self.positions.get_mut(&pos) {
            slots.retain(|slot| *slot != (bucket, sequence));
            if slots.is_empty() {
                self.positions.remove(&pos);
            }
        }
    }

    fn skip_empty_buckets(&mut self) {
        while self.first_bucket < self.buckets.len() && self.buckets[self.first_bucket].is_empty() {
            self.first_bucket += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pop_run(queue: &mut TilePriorityQueue<&'static str>) -> Option<&'static str> {
        match queue.pop()? {
            Popped::Run(_, task) => Some(task),
            Popped::Acquired(_) => None,
        }
    }

    #[test]
    fn lower_levels_first_then_fifo() {
        let mut queue = TilePriorityQueue::new(10, usize::MAX);
        queue.submit(1, 5, QueuedTask::Run("a"));
        queue.submit(2, 3, QueuedTask::Run("b"));
        queue.submit(3, 5, QueuedTask::Run("c"));
        queue.submit(4, 3, QueuedTask::Run("d"));

        assert_eq!(pop_run(&mut queue), Some("b"));
        assert_eq!(pop_run(&mut queue), Some("d"));
        assert_eq!(pop_run(&mut queue), Some("a"));
        assert_eq!(pop_run(&mut queue), Some("c"));
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn resort_moves_entries_without_reordering_them() {
        let mut queue = TilePriorityQueue::new(10, usize::MAX);
        queue.submit(1, 8, QueuedTask::Run("far-1"));
        queue.submit(2, 4, QueuedTask::Run("near"));
        queue.submit(1, 8, QueuedTask::Run("far-2"));

        queue.resort(8, 1, 2);
        assert_eq!(pop_run(&mut queue), Some("far-1"));
        assert_eq!(pop_run(&mut queue), Some("far-2"));
        assert_eq!(pop_run(&mut queue), Some("near"));
    }

    #[test]
    fn levels_past_the_end_share_the_last_bucket() {
        let mut queue = TilePriorityQueue::new(4, usize::MAX);
        queue.submit(1, 200, QueuedTask::Run("x"));
        queue.submit(2, 3, QueuedTask::Run("y"));
        assert_eq!(pop_run(&mut queue), Some("x"));
        assert_eq!(pop_run(&mut queue), Some("y"));
    }

    #[test]
    fn acquire_limit_blocks_until_release() {
        let mut queue = TilePriorityQueue::new(4, 1);
        queue.submit(1, 0, QueuedTask::Run("first"));
        queue.submit(1, 0, QueuedTask::Acquire);
        queue.submit(2, 0, QueuedTask::Run("second"));

        assert_eq!(pop_run(&mut queue), Some("first"));
        assert!(matches!(queue.pop(), Some(Popped::Acquired(1))));
        assert!(queue.pop().is_none(), "limit reached");
        assert_eq!(queue.acquired_count(), 1);

        queue.release(1, false);
        assert_eq!(pop_run(&mut queue), Some("second"));
    }

    #[test]
    fn release_with_clear_drops_pending_entries() {
        let mut queue = TilePriorityQueue::new(4, usize::MAX);
        queue.submit(7, 1, QueuedTask::Run("dropped"));
        queue.submit(7, 1, QueuedTask::Acquire);
        queue.submit(8, 2, QueuedTask::Run("kept"));

        queue.release(7, true);
        assert_eq!(queue.len(), 1);
        assert_eq!(pop_run(&mut queue), Some("kept"));
    }

    #[test]
    fn release_without_clear_keeps_tasks() {
        let mut queue = TilePriorityQueue::new(4, usize::MAX);
        queue.submit(7, 1, QueuedTask::Acquire);
        queue.submit(7, 1, QueuedTask::Run("kept"));

        queue.release(7, false);
        assert_eq!(queue.len(), 1);
        assert_eq!(pop_run(&mut queue), Some("kept"));
    }
}
