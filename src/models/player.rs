use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PlayerId;

/// Upper bound of a player's mana pool.
pub const MANA_CAP: i64 = 1000;

/// The game profile of an account.
///
/// Crystals and xp are never negative and mana stays within `0..=MANA_CAP`.
/// Mana is stored together with the instant it was last brought up to date;
/// everything after that instant is regenerated lazily by the
/// [`crate::accumulator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub crystals: i64,
    pub xp: i64,
    pub mana: i64,
    /// Reference instant for mana regeneration.
    pub mana_updated_at: DateTime<Utc>,
}

impl Player {
    /// Check the domain constraints, returning a description of the first
    /// one that is violated.
    pub fn validate(&self) -> Result<(), String> {
        if self.crystals < 0 {
            return Err(format!("crystals must be >= 0, got {}", self.crystals));
        }
        if self.xp < 0 {
            return Err(format!("xp must be >= 0, got {}", self.xp));
        }
        if !(0..=MANA_CAP).contains(&self.mana) {
            return Err(format!("mana must be within 0..={}, got {}", MANA_CAP, self.mana));
        }
        Ok(())
    }
}

/// Input for creating a player profile. Profiles are normally created by the
/// REST tier; the core only needs this for bootstrapping and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePlayerInput {
    pub id: PlayerId,
    pub crystals: i64,
    pub xp: i64,
    pub mana: i64,
    pub now: DateTime<Utc>,
}

/// Aggregated multiplayer statistics of a player.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub player_id: PlayerId,
    pub games_played: i64,
    pub games_won: i64,
    pub damage_dealt: i64,
    pub damage_taken: i64,
    pub mana_spent: i64,
    pub spell_casts: i64,
    pub gems_won: i64,
    pub gems_lost: i64,
}
