//! Incremental min-fixed-point propagation over a sparse grid graph.
//!
//! Every tracked node settles at `min(source(node), min(edge(n, node) for n in neighbors))`.
//! Changes are queued per node and drained lowest level first. Lowering a level pushes the
//! new value outward. Raising a level first resets the node to "absent" and makes every
//! neighbour that derived its level through it re-derive from its own neighbourhood, so the
//! cost of removing a source stays proportional to the area it influenced.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// The virtual node every source edge starts from.
pub const SOURCE: i64 = i64::MAX;

/// A list of neighbour keys. Large enough for the 26-neighbourhood without allocating.
pub type Neighbors = SmallVec<[i64; 26]>;

/// Storage and topology for one instantiation of the graph.
pub trait LevelPropagator {
    /// Returns true for the sentinel node that only ever contributes source edges.
    fn is_source(&self, node: i64) -> bool {
        node == SOURCE
    }

    /// The level the node would have from its own sources alone.
    fn level_from_source(&self, node: i64) -> u8;

    /// Every node adjacent to `node`.
    fn neighbors(&self, node: i64) -> Neighbors;

    /// The current settled level. Untracked nodes report the absent level.
    fn level(&self, node: i64) -> u8;

    /// Stores a settled level.
    fn set_level(&mut self, node: i64, level: u8);

    /// The level `to` would receive from a neighbour settled at `from_level`.
    fn level_from_neighbor(&self, _from: i64, _to: i64, from_level: u8) -> u8 {
        from_level.saturating_add(1)
    }
}

/// One level of the queue: nodes in the order they were first queued.
#[derive(Debug, Default)]
struct Bucket {
    order: BTreeMap<u64, i64>,
    sequences: FxHashMap<i64, u64>,
}

impl Bucket {
    fn insert(&mut self, node: i64, sequence: u64) -> bool {
        if self.sequences.contains_key(&node) {
            return false;
        }
        self.sequences.insert(node, sequence);
        self.order.insert(sequence, node);
        true
    }

    fn remove(&mut self, node: i64) {
        if let Some(sequence) = self.sequences.remove(&node) {
            self.order.remove(&sequence);
        }
    }

    fn pop_first(&mut self) -> Option<i64> {
        let (_, node) = self.order.pop_first()?;
        self.sequences.remove(&node);
        Some(node)
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Pending nodes bucketed by level, first in first out within a level.
#[derive(Debug)]
pub struct LeveledPriorityQueue {
    buckets: Vec<Bucket>,
    first_queued_level: usize,
    next_sequence: u64,
}

impl LeveledPriorityQueue {
    /// Creates a queue with `level_count` buckets.
    #[must_use]
    pub fn new(level_count: usize) -> Self {
        Self {
            buckets: (0..level_count).map(|_| Bucket::default()).collect(),
            first_queued_level: level_count,
            next_sequence: 0,
        }
    }

    /// Queues `node` at `level`. A node already queued at that level keeps its place.
    pub fn enqueue(&mut self, node: i64, level: usize) {
        if self.buckets[level].insert(node, self.next_sequence) {
            self.next_sequence += 1;
        }
        self.first_queued_level = self.first_queued_level.min(level);
    }

    /// Removes `node` from the bucket at `level`.
    pub fn dequeue(&mut self, node: i64, level: usize) {
        let bucket = &mut self.buckets[level];
        bucket.remove(node);
        if bucket.is_empty() && self.first_queued_level == level {
            self.advance();
        }
    }

    /// Removes and returns the earliest queued node of the lowest non-empty bucket.
    pub fn pop_first(&mut self) -> Option<i64> {
        let bucket = self.buckets.get_mut(self.first_queued_level)?;
        let node = bucket.pop_first();
        if bucket.is_empty() {
            self.advance();
        }
        node
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first_queued_level >= self.buckets.len()
    }

    /// Number of queued nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    fn advance(&mut self) {
        while self.first_queued_level < self.buckets.len()
            && self.buckets[self.first_queued_level].is_empty()
        {
            self.first_queued_level += 1;
        }
    }
}

/// The propagation engine. Node storage lives in the [`LevelPropagator`] passed to each call.
#[derive(Debug)]
pub struct DynamicGraph {
    level_count: u8,
    queue: LeveledPriorityQueue,
    /// Pending target levels of queued nodes.
    computed_levels: FxHashMap<i64, u8>,
}

impl DynamicGraph {
    /// Creates a graph whose levels range over `0..level_count`. `level_count - 1` is absent.
    #[must_use]
    pub fn new(level_count: u8) -> Self {
        debug_assert!(level_count >= 2, "a graph needs at least one present level");
        Self {
            level_count,
            queue: LeveledPriorityQueue::new(usize::from(level_count)),
            computed_levels: FxHashMap::default(),
        }
    }

    /// Number of distinct levels, including the absent level.
    #[must_use]
    pub const fn level_count(&self) -> u8 {
        self.level_count
    }

    /// The level meaning "not tracked".
    #[must_use]
    pub const fn absent_level(&self) -> u8 {
        self.level_count - 1
    }

    /// Returns true if updates are pending.
    #[must_use]
    pub fn has_work(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Number of nodes waiting to be settled.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn priority(&self, level: u8, computed: u8) -> usize {
        usize::from(level.min(computed).min(self.absent_level()))
    }

    /// Drops a pending update for `node`.
    pub fn remove_from_queue<P: LevelPropagator>(&mut self, propagator: &P, node: i64) {
        if let Some(computed) = self.computed_levels.remove(&node) {
            let priority = self.priority(propagator.level(node), computed);
            self.queue.dequeue(node, priority);
        }
    }

    /// Re-derives `node` from its sources and every neighbour.
    pub fn check_node<P: LevelPropagator>(&mut self, propagator: &P, node: i64) {
        self.check_edge(propagator, node, node, self.absent_level(), false);
    }

    /// Applies a change of the source edge of `node`.
    pub fn update<P: LevelPropagator>(&mut self, propagator: &P, node: i64, level: u8, decreasing: bool) {
        self.check_edge(propagator, SOURCE, node, level, decreasing);
    }

    /// Applies a change of the edge `from -> to`, which now offers `new_level`.
    pub fn check_edge<P: LevelPropagator>(
        &mut self,
        propagator: &P,
        from: i64,
        to: i64,
        new_level: u8,
        decreasing: bool,
    ) {
        let computed = self.computed_levels.get(&to).copied();
        self.check_edge_with(
            propagator,
            from,
            to,
            new_level,
            propagator.level(to),
            computed,
            decreasing,
        );
    }

    #[allow(clippy::too_many_arguments)] // check_edge with the lookups already done
    fn check_edge_with<P: LevelPropagator>(
        &mut self,
        propagator: &P,
        from: i64,
        to: i64,
        new_level: u8,
        level: u8,
        computed: Option<u8>,
        decreasing: bool,
    ) {
        if propagator.is_source(to) {
            return;
        }
        let absent = self.absent_level();
        let new_level = new_level.min(absent);
        let (was_queued, computed) = match computed {
            Some(computed) => (true, computed),
            None => (false, level),
        };

        let new_computed = if decreasing {
            computed.min(new_level)
        } else {
            self.computed_level(propagator, to, from, new_level)
                .min(absent)
        };

        let old_priority = self.priority(level, computed);
        if level != new_computed {
            let new_priority = self.priority(level, new_computed);
            if was_queued && old_priority != new_priority {
                self.queue.dequeue(to, old_priority);
            }
            self.queue.enqueue(to, new_priority);
            self.computed_levels.insert(to, new_computed);
        } else if was_queued {
            self.queue.dequeue(to, old_priority);
            self.computed_levels.remove(&to);
        }
    }

    /// Best level for `node` over its sources and neighbours, ignoring the edge from
    /// `excluded` and starting from `level`.
    fn computed_level<P: LevelPropagator>(&self, propagator: &P, node: i64, excluded: i64, level: u8) -> u8 {
        let mut best = level;
        if !propagator.is_source(excluded) {
            best = best.min(propagator.level_from_source(node));
        }
        if best == 0 {
            return 0;
        }
        for neighbor in propagator.neighbors(node) {
            if neighbor == excluded || neighbor == node {
                continue;
            }
            let offered = propagator.level_from_neighbor(neighbor, node, propagator.level(neighbor));
            best = best.min(offered);
            if best == 0 {
                break;
            }
        }
        best
    }

    fn check_neighbor<P: LevelPropagator>(
        &mut self,
        propagator: &P,
        from: i64,
        to: i64,
        source_level: u8,
        decreasing: bool,
    ) {
        let absent = self.absent_level();
        let computed = self.computed_levels.get(&to).copied();
        let offered = propagator
            .level_from_neighbor(from, to, source_level)
            .min(absent);
        if decreasing {
            self.check_edge_with(propagator, from, to, offered, propagator.level(to), computed, true);
            return;
        }

        let current = match computed {
            Some(computed) => computed,
            None => propagator.level(to).min(absent),
        };
        // Only neighbours that took their level through `from` need to re-derive.
        if offered == current {
            let level = if computed.is_none() {
                current
            } else {
                propagator.level(to)
            };
            self.check_edge_with(propagator, from, to, absent, level, computed, false);
        }
    }

    fn check_neighbors_after_update<P: LevelPropagator>(
        &mut self,
        propagator: &P,
        node: i64,
        level: u8,
        decreasing: bool,
    ) {
        if decreasing && usize::from(level) + 2 >= usize::from(self.level_count) {
            return;
        }
        for neighbor in propagator.neighbors(node) {
            if neighbor != node {
                self.check_neighbor(propagator, node, neighbor, level, decreasing);
            }
        }
    }

    /// Settles up to `budget` queued nodes and returns the unused budget.
    pub fn run_updates<P: LevelPropagator>(&mut self, propagator: &mut P, mut budget: usize) -> usize {
        let absent = self.absent_level();
        while budget > 0 {
            let Some(node) = self.queue.pop_first() else {
                break;
            };
            budget -= 1;

            let computed = self
                .computed_levels
                .remove(&node)
                .unwrap_or(absent)
                .min(absent);
            let level = propagator.level(node);
            if computed < level {
                propagator.set_level(node, computed);
                self.check_neighbors_after_update(propagator, node, computed, true);
            } else if computed > level {
                propagator.set_level(node, absent);
                if computed != absent {
                    let priority = self.priority(absent, computed);
                    self.queue.enqueue(node, priority);
                    self.computed_levels.insert(node, computed);
                }
                self.check_neighbors_after_update(propagator, node, level, false);
            }
        }
        budget
    }
}

/// A graph bundled with the storage it propagates over.
#[derive(Debug)]
pub struct LevelTracker<S> {
    graph: DynamicGraph,
    state: S,
}

impl<S: LevelPropagator> LevelTracker<S> {
    /// Creates a tracker with `level_count` levels over `state`.
    #[must_use]
    pub fn new(level_count: u8, state: S) -> Self {
        Self {
            graph: DynamicGraph::new(level_count),
            state,
        }
    }

    /// The level meaning "not tracked".
    #[must_use]
    pub const fn absent_level(&self) -> u8 {
        self.graph.absent_level()
    }

    /// Read access to the node storage.
    #[must_use]
    pub const fn state(&self) -> &S {
        &self.state
    }

    /// Write access to the node storage. Changing sources must be followed by [`Self::update`].
    pub const fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// The settled level of `node`.
    #[must_use]
    pub fn level(&self, node: i64) -> u8 {
        self.state.level(node)
    }

    /// See [`DynamicGraph::update`].
    pub fn update(&mut self, node: i64, level: u8, decreasing: bool) {
        self.graph.update(&self.state, node, level, decreasing);
    }

    /// See [`DynamicGraph::check_node`].
    pub fn check_node(&mut self, node: i64) {
        self.graph.check_node(&self.state, node);
    }

    /// See [`DynamicGraph::remove_from_queue`].
    pub fn remove_from_queue(&mut self, node: i64) {
        self.graph.remove_from_queue(&self.state, node);
    }

    /// See [`DynamicGraph::run_updates`].
    pub fn run_updates(&mut self, budget: usize) -> usize {
        self.graph.run_updates(&mut self.state, budget)
    }

    /// Settles every pending update.
    pub fn run_all_updates(&mut self) {
        while self.graph.has_work() {
            self.graph.run_updates(&mut self.state, usize::MAX);
        }
    }

    /// Returns true if updates are pending.
    #[must_use]
    pub fn has_work(&self) -> bool {
        self.graph.has_work()
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use rustc_hash::FxHashMap;
    use tessera_utils::TilePos;

    use super::*;

    /// An 8-neighbour grid with explicit source levels.
    struct Grid {
        absent: u8,
        sources: FxHashMap<i64, u8>,
        levels: FxHashMap<i64, u8>,
    }

    impl Grid {
        fn new(absent: u8) -> Self {
            Self {
                absent,
                sources: FxHashMap::default(),
                levels: FxHashMap::default(),
            }
        }
    }

    impl LevelPropagator for Grid {
        fn level_from_source(&self, node: i64) -> u8 {
            self.sources.get(&node).copied().unwrap_or(self.absent)
        }

        fn neighbors(&self, node: i64) -> Neighbors {
            let pos = TilePos::from_key(node);
            pos.square(1)
                .filter(|n| *n != pos)
                .map(TilePos::key)
                .collect()
        }

        fn level(&self, node: i64) -> u8 {
            self.levels.get(&node).copied().unwrap_or(self.absent)
        }

        fn set_level(&mut self, node: i64, level: u8) {
            if level >= self.absent {
                self.levels.remove(&node);
            } else {
                self.levels.insert(node, level);
            }
        }
    }

    fn set_source(tracker: &mut LevelTracker<Grid>, pos: TilePos, level: Option<u8>) {
        let old = tracker.state().level_from_source(pos.key());
        match level {
            Some(level) => tracker.state_mut().sources.insert(pos.key(), level),
            None => tracker.state_mut().sources.remove(&pos.key()),
        };
        let new = tracker.state().level_from_source(pos.key());
        tracker.update(pos.key(), new, new < old);
    }

    /// The closed-form answer: each source spreads one level per Chebyshev step.
    fn brute_force(grid: &Grid) -> FxHashMap<i64, u8> {
        let mut expected = FxHashMap::default();
        for (&node, &source) in &grid.sources {
            let center = TilePos::from_key(node);
            let reach = i32::from(grid.absent - source) - 1;
            for pos in center.square(reach) {
                let level = source + center.distance(pos) as u8;
                let entry = expected.entry(pos.key()).or_insert(grid.absent);
                *entry = (*entry).min(level);
            }
        }
        expected
    }

    #[test]
    fn single_source_spreads_by_distance() {
        let mut tracker = LevelTracker::new(10, Grid::new(9));
        set_source(&mut tracker, TilePos::ZERO, Some(5));
        tracker.run_all_updates();

        assert_eq!(tracker.level(TilePos::ZERO.key()), 5);
        assert_eq!(tracker.level(TilePos::new(3, -2).key()), 8);
        assert_eq!(tracker.level(TilePos::new(4, 0).key()), 9, "past the reach is absent");
        assert_eq!(tracker.state().levels.len(), 49);
    }

    #[test]
    fn removing_a_source_only_touches_its_area() {
        let mut tracker = LevelTracker::new(10, Grid::new(9));
        set_source(&mut tracker, TilePos::ZERO, Some(6));
        set_source(&mut tracker, TilePos::new(2, 0), Some(4));
        tracker.run_all_updates();
        assert_eq!(tracker.level(TilePos::ZERO.key()), 6);
        assert_eq!(tracker.level(TilePos::new(1, 0).key()), 5);

        set_source(&mut tracker, TilePos::new(2, 0), None);
        tracker.run_all_updates();
        assert_eq!(tracker.level(TilePos::new(1, 0).key()), 7);
        assert_eq!(tracker.level(TilePos::new(2, 0).key()), 8);
        assert_eq!(tracker.level(TilePos::new(5, 0).key()), 9);
        assert_eq!(tracker.state().levels, brute_force(tracker.state()));
    }

    #[test]
    fn budget_is_respected() {
        let mut tracker = LevelTracker::new(12, Grid::new(11));
        set_source(&mut tracker, TilePos::ZERO, Some(0));
        assert_eq!(tracker.run_updates(3), 0);
        assert!(tracker.has_work());
        tracker.run_all_updates();
        assert!(!tracker.has_work());
        assert_eq!(tracker.state().levels, brute_force(tracker.state()));
    }

    #[test]
    fn random_sources_reach_the_fixed_point() {
        let mut rng = StdRng::seed_from_u64(0x7e55e7a);
        let mut tracker = LevelTracker::new(12, Grid::new(11));
        let mut placed = Vec::new();

        for round in 0..300 {
            if placed.is_empty() || rng.random_bool(0.6) {
                let pos = TilePos::new(rng.random_range(-12..12), rng.random_range(-12..12));
                set_source(&mut tracker, pos, Some(rng.random_range(0..11)));
                placed.push(pos);
            } else {
                let index = rng.random_range(0..placed.len());
                let pos = placed.swap_remove(index);
                set_source(&mut tracker, pos, None);
            }

            if round % 7 == 0 {
                tracker.run_all_updates();
                assert_eq!(
                    tracker.state().levels,
                    brute_force(tracker.state()),
                    "mismatch after round {round}"
                );
            }
        }
        tracker.run_all_updates();
        assert_eq!(tracker.state().levels, brute_force(tracker.state()));
    }

    #[test]
    fn queue_pops_lowest_level_first() {
        let mut queue = LeveledPriorityQueue::new(5);
        queue.enqueue(10, 3);
        queue.enqueue(11, 1);
        queue.enqueue(12, 3);
        queue.dequeue(12, 3);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_first(), Some(11));
        assert_eq!(queue.pop_first(), Some(10));
        assert_eq!(queue.pop_first(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn queue_keeps_arrival_order_within_a_level() {
        let mut queue = LeveledPriorityQueue::new(4);
        queue.enqueue(30, 2);
        queue.enqueue(-7, 2);
        queue.enqueue(12, 2);
        queue.enqueue(30, 2);
        queue.dequeue(-7, 2);
        queue.enqueue(-7, 2);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_first(), Some(30));
        assert_eq!(queue.pop_first(), Some(12));
        assert_eq!(queue.pop_first(), Some(-7));
        assert!(queue.is_empty());
    }
}
