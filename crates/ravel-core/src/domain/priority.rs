//! Priority ranks and named bands.
//!
//! A priority is a rank in `[0, 255]`. Five ranks have names; everything
//! else is a custom rank. Queues order their waiting lists by rank,
//! highest first.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The five named bands, plus `Custom` for every other rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Unimportant,
    Low,
    Medium,
    High,
    Critical,
    Custom(u8),
}

impl Band {
    /// The rank this band sits at.
    pub fn rank(self) -> u8 {
        match self {
            Band::Unimportant => 0,
            Band::Low => 64,
            Band::Medium => 128,
            Band::High => 192,
            Band::Critical => 255,
            Band::Custom(rank) => rank,
        }
    }
}

/// Ranks of the named bands, ascending. `increase`/`decrease` step along
/// this ladder.
const LADDER: [u8; 5] = [0, 64, 128, 192, 255];

/// A task's rank in the pick order. Total order by the integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const UNIMPORTANT: Priority = Priority(0);
    pub const LOW: Priority = Priority(64);
    pub const MEDIUM: Priority = Priority(128);
    pub const HIGH: Priority = Priority(192);
    pub const CRITICAL: Priority = Priority(255);

    pub fn new(rank: u8) -> Self {
        Priority(rank)
    }

    pub fn rank(self) -> u8 {
        self.0
    }

    /// The named band at this exact rank, or `Custom`.
    pub fn band(self) -> Band {
        match self.0 {
            0 => Band::Unimportant,
            64 => Band::Low,
            128 => Band::Medium,
            192 => Band::High,
            255 => Band::Critical,
            rank => Band::Custom(rank),
        }
    }

    /// Move to the next named band strictly above the current rank.
    /// Saturates at the top: returns whether the rank changed.
    pub fn increase(&mut self) -> bool {
        match LADDER.iter().find(|&&rank| rank > self.0) {
            Some(&rank) => {
                self.0 = rank;
                true
            }
            None => false,
        }
    }

    /// Mirror of [`increase`]: the next named band strictly below,
    /// saturating at zero.
    ///
    /// [`increase`]: Priority::increase
    pub fn decrease(&mut self) -> bool {
        match LADDER.iter().rev().find(|&&rank| rank < self.0) {
            Some(&rank) => {
                self.0 = rank;
                true
            }
            None => false,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::MEDIUM
    }
}

impl From<Band> for Priority {
    fn from(band: Band) -> Self {
        Priority(band.rank())
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.band() {
            Band::Unimportant => write!(f, "unimportant"),
            Band::Low => write!(f, "low"),
            Band::Medium => write!(f, "medium"),
            Band::High => write!(f, "high"),
            Band::Critical => write!(f, "critical"),
            Band::Custom(rank) => write!(f, "custom({rank})"),
        }
    }
}
