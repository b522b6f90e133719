use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BattleId, PlayerId};

/// A move submitted by a battle participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BattleAction {
    /// Deal damage to an opponent's altar.
    Attack { target: PlayerId, damage: i64 },
    /// Cast a spell, paid from the caster's mana.
    CastSpell { spell: String, mana_cost: i64 },
    /// Relay opaque client state to one opponent or, without a target, to all.
    Forward {
        #[serde(default)]
        target: Option<PlayerId>,
        data: serde_json::Value,
    },
}

/// The lifecycle state of a battle session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BattleState {
    Matchmaking,
    Active,
    Resolving,
    Closed,
}

impl BattleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Matchmaking => "matchmaking",
            Self::Active => "active",
            Self::Resolving => "resolving",
            Self::Closed => "closed",
        }
    }
}

/// Why a battle ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    AltarDestroyed,
    /// A participant stayed disconnected past the grace period.
    Disconnected,
    /// A participant left voluntarily.
    Left,
    TimeUp,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AltarDestroyed => "altar_destroyed",
            Self::Disconnected => "disconnected",
            Self::Left => "left",
            Self::TimeUp => "time_up",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchResult {
    Won,
    Lost,
    Draw,
}

impl MatchResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Won => "won",
            Self::Lost => "lost",
            Self::Draw => "draw",
        }
    }
}

/// Rewards and statistics of one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantResult {
    pub player_id: PlayerId,
    pub result: MatchResult,
    pub forfeited: bool,
    pub xp_awarded: i64,
    pub crystals_awarded: i64,
    pub mana_spent: i64,
    /// Mana balance after the spend, as of `ended_at`. Filled in right before
    /// the outcome is committed.
    pub mana_after: i64,
    pub spell_casts: i64,
    pub damage_dealt: i64,
    pub damage_taken: i64,
}

/// Final summary of a battle, the only battle state that is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleOutcome {
    pub battle_id: BattleId,
    pub winner: Option<PlayerId>,
    pub reason: EndReason,
    pub participants: Vec<ParticipantResult>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Per-participant part of a [`BattleView`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantView {
    pub player_id: PlayerId,
    pub altar_hp: i64,
    pub mana_left: i64,
    pub connected: bool,
    pub eliminated: bool,
}

/// Authoritative battle state broadcast to all participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleView {
    pub battle_id: BattleId,
    pub state: BattleState,
    /// Sequence number of the last accepted action.
    pub seq: u64,
    pub participants: Vec<ParticipantView>,
    pub ends_at: DateTime<Utc>,
}
