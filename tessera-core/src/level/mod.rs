//! Ticket levels: the distance graph, tickets and the manager deriving levels from them.

pub mod distance_manager;
pub mod graph;
pub mod ticket;
pub mod tile_tracker;

pub use distance_manager::{DistanceManager, ThrottleReleaser};
pub use graph::{DynamicGraph, LevelPropagator, LevelTracker};
pub use ticket::{Ticket, TicketKind, TicketTimeouts};
pub use tile_tracker::{LevelChange, PlayerDistanceTracker, TicketTracker, TickingTracker};
