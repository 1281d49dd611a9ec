//! Per-tick context handed down from the main loop.

use std::time::{Duration, Instant};

/// The tick being run and how long it may take.
#[derive(Debug, Clone, Copy)]
pub struct TickContext {
    /// The tick number.
    pub current_tick: u64,
    /// Optional work stops once this passes.
    pub deadline: Instant,
}

impl TickContext {
    /// A context for `current_tick` whose optional work may use `budget`.
    #[must_use]
    pub fn new(current_tick: u64, budget: Duration) -> Self {
        Self {
            current_tick,
            deadline: Instant::now() + budget,
        }
    }

    /// Returns true while the deadline has not passed.
    #[must_use]
    pub fn has_more_time(&self) -> bool {
        Instant::now() < self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_budget_has_no_time() {
        let ctx = TickContext::new(7, Duration::ZERO);
        assert!(!ctx.has_more_time());
        assert!(TickContext::new(7, Duration::from_secs(60)).has_more_time());
    }
}
