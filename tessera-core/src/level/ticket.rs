//! Tickets: claims that a tile must stay at or below some level.

use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize};
use tessera_utils::TilePos;

/// Why a ticket exists. Decides its timeout and whether it also drives simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketKind {
    /// Pins the spawn area.
    Start,
    /// View-distance interest of a viewer.
    Player,
    /// Pinned by an operator.
    Forced,
    /// Keeps a tile resident while it is lit.
    Light,
    /// Transient teleport target.
    Portal,
    /// Transient hold after a teleport.
    PostTeleport,
    /// Eager synchronous requests.
    Unknown,
}

impl TicketKind {
    /// Every kind, in ordering order.
    pub const ALL: [Self; 7] = [
        Self::Start,
        Self::Player,
        Self::Forced,
        Self::Light,
        Self::Portal,
        Self::PostTeleport,
        Self::Unknown,
    ];

    /// The name used in logs and dumps.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Player => "player",
            Self::Forced => "forced",
            Self::Light => "light",
            Self::Portal => "portal",
            Self::PostTeleport => "post_teleport",
            Self::Unknown => "unknown",
        }
    }

    /// Ticks after which a ticket of this kind expires, `None` for never.
    #[must_use]
    pub const fn default_timeout(self) -> Option<u64> {
        match self {
            Self::Portal => Some(300),
            Self::PostTeleport => Some(5),
            Self::Unknown => Some(1),
            Self::Start | Self::Player | Self::Forced | Self::Light => None,
        }
    }

    /// Whether tickets of this kind also keep their area simulated.
    #[must_use]
    pub const fn simulates(self) -> bool {
        matches!(self, Self::Start | Self::Forced)
    }
}

impl fmt::Display for TicketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A claim on one tile.
///
/// Equality and ordering only look at level, kind and payload, so re-adding an equal ticket
/// refreshes its creation tick instead of stacking a duplicate.
#[derive(Debug, Clone, Copy)]
pub struct Ticket {
    /// Why the ticket exists.
    pub kind: TicketKind,
    /// The level required at the ticket's tile.
    pub level: u8,
    /// Distinguishes tickets of the same kind and level.
    pub payload: TilePos,
    /// The tick the ticket was (last) added on.
    pub created_at_tick: u64,
}

impl Ticket {
    /// Creates a ticket. The creation tick is stamped when it is added to a manager.
    #[must_use]
    pub const fn new(kind: TicketKind, level: u8, payload: TilePos) -> Self {
        Self {
            kind,
            level,
            payload,
            created_at_tick: 0,
        }
    }

    /// Returns true if the ticket outlived `timeout` at `current_tick`.
    #[must_use]
    pub fn is_expired(&self, current_tick: u64, timeout: Option<u64>) -> bool {
        timeout.is_some_and(|timeout| current_tick.saturating_sub(self.created_at_tick) > timeout)
    }

    fn sort_key(&self) -> (u8, TicketKind, TilePos) {
        (self.level, self.kind, self.payload)
    }
}

impl PartialEq for Ticket {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for Ticket {}

impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ticket {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ticket[{} {} ({})] at {}",
            self.kind, self.level, self.payload, self.created_at_tick
        )
    }
}

/// Per-kind timeout overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketTimeouts {
    /// Overrides for individual kinds. `0` disables expiry for that kind.
    pub overrides: Vec<(TicketKind, u64)>,
}

impl TicketTimeouts {
    /// The effective timeout of `kind`.
    #[must_use]
    pub fn timeout(&self, kind: TicketKind) -> Option<u64> {
        match self.overrides.iter().rev().find(|(k, _)| *k == kind) {
            Some((_, 0)) => None,
            Some((_, ticks)) => Some(*ticks),
            None => kind.default_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn lowest_level_sorts_first() {
        let mut set = BTreeSet::new();
        set.insert(Ticket::new(TicketKind::Forced, 31, TilePos::ZERO));
        set.insert(Ticket::new(TicketKind::Player, 33, TilePos::ZERO));
        set.insert(Ticket::new(TicketKind::Unknown, 22, TilePos::ZERO));

        assert_eq!(set.first().map(|t| t.kind), Some(TicketKind::Unknown));
    }

    #[test]
    fn readding_refreshes_creation_tick() {
        let mut set = BTreeSet::new();
        let mut ticket = Ticket::new(TicketKind::Portal, 30, TilePos::new(1, 1));
        ticket.created_at_tick = 3;
        set.insert(ticket);
        ticket.created_at_tick = 9;
        set.replace(ticket);

        assert_eq!(set.len(), 1);
        assert_eq!(set.first().map(|t| t.created_at_tick), Some(9));
    }

    #[test]
    fn expiry_uses_strict_comparison() {
        let mut ticket = Ticket::new(TicketKind::Unknown, 33, TilePos::ZERO);
        ticket.created_at_tick = 10;
        let timeout = TicketKind::Unknown.default_timeout();
        assert!(!ticket.is_expired(11, timeout));
        assert!(ticket.is_expired(12, timeout));
        assert!(!ticket.is_expired(1_000, TicketKind::Forced.default_timeout()));
    }

    #[test]
    fn overrides_replace_defaults() {
        let timeouts = TicketTimeouts {
            overrides: vec![(TicketKind::Portal, 20), (TicketKind::Unknown, 0)],
        };
        assert_eq!(timeouts.timeout(TicketKind::Portal), Some(20));
        assert_eq!(timeouts.timeout(TicketKind::Unknown), None);
        assert_eq!(timeouts.timeout(TicketKind::PostTeleport), Some(5));
    }
}
