use crate::geometry::{range, Point};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One physical robot tracked by its marker
#[derive(Clone, Debug, Serialize)]
pub struct Agent {
    /// Marker id (never changes)
    pub id: u32,

    pub name: String,

    /// Broker address of the agent's controller (never changes)
    pub address: String,

    /// Last known pose; stale while `missed_ticks > 0`
    pub pose: Point,

    /// Consecutive ticks the marker was not seen
    pub missed_ticks: u32,

    /// Centre of the paired home base
    pub home: Point,

    pub home_base: u32,

    pub team: String,

    /// Colour code the agent lights up with
    pub colour: String,

    pub last_seen: DateTime<Utc>,
}

impl Agent {
    /// True iff the agent is within `tolerance` (inclusive) of its home point
    pub fn is_home(&self, tolerance: f64) -> bool {
        range(&self.pose, &self.home) <= tolerance
    }

    /// Seen this tick
    pub fn is_fresh(&self) -> bool {
        self.missed_ticks == 0
    }

    /// Missing for more than `max_missed_ticks` consecutive ticks
    pub fn is_lost(&self, max_missed_ticks: u32) -> bool {
        self.missed_ticks > max_missed_ticks
    }
}

/// A static home-position marker
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Base {
    pub id: u32,
    pub point: Point,
    pub team: String,
    pub colour: String,
}
