use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{PlaceableId, PlayerId, TaskId};

/// A timed operation on a placeable.
///
/// A task is created by a player action, waits until `started_at + duration`
/// and is then completed by the progression engine, which commits its effect
/// and removes it. Only one unfinished task can exist per placeable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Owner of the island (and thereby of the placeable).
    pub owner: PlayerId,
    pub placeable_id: PlaceableId,
    pub kind: TaskKind,
    /// Crystals spent to start the task. Not refunded on cancel.
    pub used_crystals: i64,
    /// Level the placeable reaches when the task is applied.
    pub to_level: i32,
    pub started_at: DateTime<Utc>,
    pub duration_secs: i64,
    pub status: TaskStatus,
    /// Failed attempts at committing the completion.
    pub attempts: u32,
}

impl Task {
    pub fn completes_at(&self) -> DateTime<Utc> {
        self.started_at + Duration::seconds(self.duration_secs)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.completes_at() <= now
    }
}

/// The type of a task with its type specific payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Initial construction of a placeable.
    Build,
    /// Raise a building to `to_level`.
    Upgrade,
    /// A deep dig on a mine that credits `yield_amount` crystals on completion.
    Mine { yield_amount: i64 },
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Upgrade => "upgrade",
            Self::Mine { .. } => "mine",
        }
    }
}

/// The lifecycle state of a task.
///
/// - `Pending`: Waiting for its completion time
/// - `Completing`: Claimed by a sweep; the effect is being committed or the
///   commit is waiting for a retry
/// - `Applied`: Effect committed (terminal)
/// - `Cancelled`: Removed without effect (terminal)
/// - `Failed`: Commit retries exhausted (terminal, surfaced to the owner)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completing,
    Applied,
    Cancelled,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completing => "completing",
            Self::Applied => "applied",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completing" => Some(Self::Completing),
            "applied" => Some(Self::Applied),
            "cancelled" => Some(Self::Cancelled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the task still occupies its placeable.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Completing)
    }
}

/// Parameters of a new task, validated by the scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TaskParams {
    pub owner: PlayerId,
    pub used_crystals: i64,
    pub to_level: i32,
    pub started_at: DateTime<Utc>,
}

/// Result of committing a completion to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Applied,
    /// The completion ledger already held this task; nothing changed.
    AlreadyApplied,
}

/// A task whose completion could not be committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTask {
    pub task: Task,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}
