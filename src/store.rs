//! The persistence adapter consumed by the core.
//!
//! The durable store enforces the domain constraints (levels >= 0, mana within
//! bounds, one island per player, ...) and reports violations as structured
//! [`StoreError`]s. The core trusts values it reads back as already valid.
//!
//! Writes that must be atomic across several entities (spending crystals while
//! starting a task, crediting a completion, committing a battle outcome) are
//! single methods so the implementation can run them in one transaction.
//! Crystals and xp are only ever changed relative to what is stored, never
//! overwritten from a copy read earlier, because battle commits and island
//! actions of the same player run concurrently.

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::*;

pub type StoreResult<T> = Result<T, StoreError>;

pub trait PersistenceAdapter: Send + Sync {
    fn read_player(&self, id: PlayerId) -> StoreResult<Player>;

    fn write_player(&self, player: &Player) -> StoreResult<()>;

    fn read_placeable(&self, id: PlaceableId) -> StoreResult<Placeable>;

    fn write_placeable(&self, placeable: &Placeable) -> StoreResult<()>;

    fn island_placeables(&self, owner: PlayerId) -> StoreResult<Vec<Placeable>>;

    fn read_blueprint(&self, id: BlueprintId) -> StoreResult<Blueprint>;

    /// Gems currently attached to a building.
    fn building_gems(&self, building: PlaceableId) -> StoreResult<Vec<Gem>>;

    fn read_gem(&self, id: GemId) -> StoreResult<Gem>;

    /// Place a new placeable, charge `task.used_crystals` to `task.owner` and
    /// record its build task, atomically. Returns the stored placeable, the
    /// task carrying the new placeable id, and the charged player.
    ///
    /// The charge is applied as a guarded decrement of the stored balance, so
    /// credits committed concurrently are kept. A balance below the cost is
    /// reported as [`StoreError::Validation`].
    fn commit_build(
        &self,
        placeable: &NewPlaceable,
        task: &Task,
    ) -> StoreResult<(Placeable, Task, Player)>;

    /// Charge `task.used_crystals` to `task.owner` and record a task on an
    /// existing placeable, atomically. Returns the charged player.
    fn commit_task_start(&self, task: &Task) -> StoreResult<Player>;

    /// Remove a task row without applying it.
    fn delete_task(&self, id: TaskId) -> StoreResult<()>;

    /// Persist the retry bookkeeping of a task.
    fn update_task_status(&self, id: TaskId, status: TaskStatus, attempts: u32) -> StoreResult<()>;

    /// Every task that has not been applied or cancelled.
    fn load_tasks(&self) -> StoreResult<Vec<Task>>;

    /// Commit the effect of a completed task and remove it, atomically.
    ///
    /// A `settlement` closes the production window of the mine whose level
    /// the task raises and is written in the same transaction. Applying a
    /// task that was already applied changes nothing and returns
    /// [`CompletionOutcome::AlreadyApplied`].
    fn apply_completion(
        &self,
        task: &Task,
        xp_per_level: i64,
        settlement: Option<&MineSettlement>,
    ) -> StoreResult<CompletionOutcome>;

    /// Credit collected crystals, empty the mine's bank and move its
    /// accumulation origin, atomically.
    fn commit_collect(
        &self,
        owner: PlayerId,
        mine: PlaceableId,
        amount: i64,
        new_origin: DateTime<Utc>,
    ) -> StoreResult<Player>;

    /// Attach an unstaked gem of `owner` to `building`, or detach it, and
    /// write the settlements of the mines whose rate changes, atomically.
    fn commit_gem_move(
        &self,
        owner: PlayerId,
        gem: GemId,
        building: Option<PlaceableId>,
        settlements: &[MineSettlement],
    ) -> StoreResult<Gem>;

    /// Apply rewards, mana spend, statistics and stake transfers of a closed
    /// battle and store its summary, atomically.
    fn commit_battle_outcome(&self, outcome: &BattleOutcome) -> StoreResult<()>;

    fn save_chat_message(&self, message: &NewChatMessage) -> StoreResult<ChatMessage>;
}

/// Maps a channel token to the player it was issued to.
///
/// Tokens are issued by the account service; the core only asks whether one
/// is valid at a given instant.
pub trait IdentityResolver: Send + Sync {
    /// The player `token` belongs to, or `None` if it is unknown or expired.
    fn resolve(&self, token: &str, now: DateTime<Utc>) -> StoreResult<Option<PlayerId>>;
}
