//! Typed messages exchanged over a player's persistent channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    BattleAction, BattleId, BattleView, BlueprintId, ChatMessage, EndReason, FailedTask, GemId,
    ParticipantResult, Placeable, PlaceableId, Player, PlayerId, Task, TaskId, VisitRequest,
};
use crate::error::ErrorKind;

/// Client actions delivered by the channel gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum InboundEvent {
    Build {
        blueprint_id: BlueprintId,
        x: i32,
        z: i32,
        #[serde(default)]
        rotation: u8,
    },
    Upgrade {
        placeable_id: PlaceableId,
    },
    MineStart {
        placeable_id: PlaceableId,
    },
    MineCollect {
        placeable_id: PlaceableId,
    },
    CancelTask {
        task_id: TaskId,
    },
    DismissFailed {
        task_id: TaskId,
    },
    /// Attach a gem to a building of the island, or detach it with `None`.
    EquipGem {
        gem_id: GemId,
        #[serde(default)]
        building_id: Option<PlaceableId>,
    },
    Sync,
    BattleEnqueue,
    BattleAction(BattleAction),
    BattleLeave,
    IslandVisit {
        target: PlayerId,
        request: VisitRequest,
    },
    /// Opaque state relayed to the other side of the current visit.
    VisitForward {
        data: serde_json::Value,
    },
    Chat {
        message: String,
    },
}

impl InboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Build { .. } => "build",
            Self::Upgrade { .. } => "upgrade",
            Self::MineStart { .. } => "mine_start",
            Self::MineCollect { .. } => "mine_collect",
            Self::CancelTask { .. } => "cancel_task",
            Self::DismissFailed { .. } => "dismiss_failed",
            Self::EquipGem { .. } => "equip_gem",
            Self::Sync => "sync",
            Self::BattleEnqueue => "battle_enqueue",
            Self::BattleAction(_) => "battle_action",
            Self::BattleLeave => "battle_leave",
            Self::IslandVisit { .. } => "island_visit",
            Self::VisitForward { .. } => "visit_forward",
            Self::Chat { .. } => "chat",
        }
    }
}

/// Events pushed to a player's channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum OutboundEvent {
    TaskScheduled {
        task: Task,
    },
    TaskCompleted {
        task_id: TaskId,
        placeable_id: PlaceableId,
        kind: String,
        level: i32,
    },
    TaskFailed {
        task_id: TaskId,
        placeable_id: PlaceableId,
        reason: String,
    },
    ResourceUpdate {
        crystals: i64,
        xp: i64,
        mana: i64,
    },
    IslandState(IslandSnapshot),
    BattleMatched {
        battle_id: BattleId,
        participants: Vec<PlayerId>,
        ends_at: DateTime<Utc>,
    },
    BattleState {
        view: BattleView,
        /// The action that produced this state, absent for lifecycle changes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        actor: Option<PlayerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<BattleAction>,
    },
    BattleEnded {
        battle_id: BattleId,
        winner: Option<PlayerId>,
        reason: EndReason,
        /// False when the outcome could not be persisted.
        committed: bool,
        results: Vec<ParticipantResult>,
    },
    IslandVisit {
        sender: PlayerId,
        request: VisitRequest,
    },
    VisitForwarded {
        sender: PlayerId,
        data: serde_json::Value,
    },
    ChatMessage(ChatMessage),
    Error {
        kind: ErrorKind,
        message: String,
        action: String,
    },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskScheduled { .. } => "task_scheduled",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::ResourceUpdate { .. } => "resource_update",
            Self::IslandState(_) => "island_state",
            Self::BattleMatched { .. } => "battle_matched",
            Self::BattleState { .. } => "battle_state",
            Self::BattleEnded { .. } => "battle_ended",
            Self::IslandVisit { .. } => "island_visit",
            Self::VisitForwarded { .. } => "visit_forwarded",
            Self::ChatMessage(_) => "chat_message",
            Self::Error { .. } => "error",
        }
    }
}

/// A placeable with the lazily derived values a client needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceableSnapshot {
    #[serde(flatten)]
    pub placeable: Placeable,
    /// Crystals waiting to be collected, for mines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_yield: Option<i64>,
}

/// Everything a client needs to render an island at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IslandSnapshot {
    pub player: Player,
    pub placeables: Vec<PlaceableSnapshot>,
    pub tasks: Vec<Task>,
    pub failed_tasks: Vec<FailedTask>,
    pub taken_at: DateTime<Utc>,
}
