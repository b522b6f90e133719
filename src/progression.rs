//! Progression Engine.
//!
//! Runs player actions on islands (build, upgrade, mine, collect, cancel) and
//! the sweep that completes due tasks. Every mutation of an island happens
//! under that island's lock; islands never contend with each other.
//!
//! A task on an existing placeable is first tracked in memory and then
//! written to the store together with the crystals spent on it. If that write
//! fails the in-memory schedule is reverted, so memory never holds a task the
//! store does not. Build tasks need the id of the new placeable and are
//! tracked only after the store has committed them. Spending is checked
//! against a fresh read for a clear error, but the store decides: it applies
//! the spend as a decrement of the stored balance.
//!
//! Whenever a mine's rate is about to change (its level through a completed
//! task, its gems through [`ProgressionEngine::equip_gem`]) its production so
//! far is settled at the old rate in the same store write.
//!
//! Completing a task commits its effect through
//! [`PersistenceAdapter::apply_completion`], which is idempotent. Transient
//! store failures are retried with backoff; once the retry policy is
//! exhausted, or on a permanent failure, the task is marked failed and
//! surfaced to its owner until dismissed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::accumulator::ResourceAccumulator;
use crate::clock::Clock;
use crate::config::{CoreConfig, RetryPolicy};
use crate::error::{CoreError, CoreResult, StoreError};
use crate::models::*;
use crate::registry::SessionRegistry;
use crate::scheduler::{RetryDecision, TaskScheduler};
use crate::store::PersistenceAdapter;

/// Counts of what one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub applied: usize,
    /// Completions the store had already recorded.
    pub already_applied: usize,
    pub retried: usize,
    pub failed: usize,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.applied += other.applied;
        self.already_applied += other.already_applied;
        self.retried += other.retried;
        self.failed += other.failed;
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Result of collecting a mine.
#[derive(Debug, Clone, PartialEq)]
pub struct Collected {
    pub amount: i64,
    pub player: Player,
}

pub struct ProgressionEngine {
    store: Arc<dyn PersistenceAdapter>,
    clock: Arc<dyn Clock>,
    registry: Arc<SessionRegistry>,
    scheduler: TaskScheduler,
    accumulator: ResourceAccumulator,
    retry: RetryPolicy,
    islands: Mutex<HashMap<PlayerId, Arc<Mutex<()>>>>,
}

impl ProgressionEngine {
    pub fn new(
        store: Arc<dyn PersistenceAdapter>,
        clock: Arc<dyn Clock>,
        registry: Arc<SessionRegistry>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            store,
            clock,
            registry,
            scheduler: TaskScheduler::new(),
            accumulator: ResourceAccumulator::new(config.progression.clone()),
            retry: config.retry.clone(),
            islands: Mutex::new(HashMap::new()),
        }
    }

    /// Load persisted tasks into the scheduler.
    pub fn start(&self) -> CoreResult<usize> {
        let tasks = self.store.load_tasks()?;
        let loaded = self.scheduler.load(tasks);
        tracing::info!(loaded, "Progression engine started");
        Ok(loaded)
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn accumulator(&self) -> &ResourceAccumulator {
        &self.accumulator
    }

    fn island_lock(&self, owner: PlayerId) -> Arc<Mutex<()>> {
        let mut islands = self.islands.lock().expect("island table lock poisoned");
        islands.entry(owner).or_default().clone()
    }

    // ============================================================
    // Player actions
    // ============================================================

    /// Place a new placeable and start its build task.
    pub fn build(
        &self,
        owner: PlayerId,
        blueprint_id: BlueprintId,
        x: i32,
        z: i32,
        rotation: u8,
    ) -> CoreResult<(Placeable, Task)> {
        validate_cell(x, z).map_err(CoreError::Validation)?;
        let rotation = Rotation::try_from(rotation).map_err(CoreError::Validation)?;

        let lock = self.island_lock(owner);
        let _guard = lock.lock().expect("island lock poisoned");
        let now = self.clock.now();

        let blueprint = self.store.read_blueprint(blueprint_id)?;
        self.ensure_affordable(owner, blueprint.cost)?;

        let build_time = Duration::seconds(blueprint.buildtime_secs);
        let placeable = NewPlaceable {
            owner,
            blueprint_id,
            x,
            z,
            rotation,
            // a mine starts producing once it is built
            kind: PlaceableKind::for_blueprint(blueprint.kind, now + build_time),
        };
        let task = Task {
            id: TaskId::new(),
            owner,
            placeable_id: PlaceableId(0),
            kind: TaskKind::Build,
            used_crystals: blueprint.cost,
            to_level: 1,
            started_at: now,
            duration_secs: blueprint.buildtime_secs,
            status: TaskStatus::Pending,
            attempts: 0,
        };

        let (placeable, task, player) = self.store.commit_build(&placeable, &task)?;
        self.scheduler.track(task.clone())?;

        tracing::info!(
            player_id = %owner,
            placeable_id = %placeable.id,
            task_id = %task.id,
            blueprint = %blueprint.name,
            "Build started"
        );
        self.notify(owner, OutboundEvent::TaskScheduled { task: task.clone() });
        self.notify_resources(&player, now);

        // props with no build time are done right away
        self.sweep_island_locked(owner, now);

        Ok((placeable, task))
    }

    /// Start raising a building one level.
    pub fn upgrade(&self, owner: PlayerId, placeable_id: PlaceableId) -> CoreResult<Task> {
        let lock = self.island_lock(owner);
        let _guard = lock.lock().expect("island lock poisoned");
        let now = self.clock.now();

        let placeable = self.owned_placeable(owner, placeable_id)?;
        if !placeable.is_building() {
            return Err(CoreError::validation(format!(
                "placeable {} is not a building and cannot be upgraded",
                placeable_id
            )));
        }
        self.ensure_built(&placeable)?;

        let blueprint = self.store.read_blueprint(placeable.blueprint_id)?;
        let to_level = placeable.level + 1;
        let cost = blueprint.cost_for_level(to_level);

        self.ensure_affordable(owner, cost)?;

        let (task, player) = self.start_task(
            placeable_id,
            TaskKind::Upgrade,
            Duration::seconds(blueprint.buildtime_for_level(to_level)),
            TaskParams {
                owner,
                used_crystals: cost,
                to_level,
                started_at: now,
            },
        )?;

        tracing::info!(
            player_id = %owner,
            placeable_id = %placeable_id,
            task_id = %task.id,
            to_level,
            "Upgrade started"
        );
        self.notify(owner, OutboundEvent::TaskScheduled { task: task.clone() });
        self.notify_resources(&player, now);
        Ok(task)
    }

    /// Start a deep dig on a mine. The lump yield is fixed when the dig starts.
    pub fn mine_start(&self, owner: PlayerId, placeable_id: PlaceableId) -> CoreResult<Task> {
        let lock = self.island_lock(owner);
        let _guard = lock.lock().expect("island lock poisoned");
        let now = self.clock.now();

        let placeable = self.owned_placeable(owner, placeable_id)?;
        if placeable.mine().is_none() {
            return Err(CoreError::validation(format!(
                "placeable {} is not a mine",
                placeable_id
            )));
        }
        self.ensure_built(&placeable)?;

        let gems = self.store.building_gems(placeable_id)?;
        let yield_amount = self.accumulator.mine_task_yield(placeable.level, &gems);

        let (task, _) = self.start_task(
            placeable_id,
            TaskKind::Mine { yield_amount },
            Duration::seconds(self.accumulator.config().mine_task_secs),
            TaskParams {
                owner,
                used_crystals: 0,
                to_level: placeable.level,
                started_at: now,
            },
        )?;

        tracing::info!(
            player_id = %owner,
            placeable_id = %placeable_id,
            task_id = %task.id,
            yield_amount,
            "Mining started"
        );
        self.notify(owner, OutboundEvent::TaskScheduled { task: task.clone() });
        Ok(task)
    }

    /// Credit the crystals a mine produced since its last collection.
    pub fn collect(&self, owner: PlayerId, placeable_id: PlaceableId) -> CoreResult<Collected> {
        let lock = self.island_lock(owner);
        let _guard = lock.lock().expect("island lock poisoned");
        let now = self.clock.now();

        // a due upgrade changes the rate at its completion time, not at ours
        self.sweep_island_locked(owner, now);

        let placeable = self.owned_placeable(owner, placeable_id)?;
        let gems = self.store.building_gems(placeable_id)?;
        let collection = self
            .accumulator
            .collect(&placeable, &gems, now)
            .ok_or_else(|| CoreError::validation(format!("placeable {} is not a mine", placeable_id)))?;

        let player = if collection.amount > 0 {
            self.store
                .commit_collect(owner, placeable_id, collection.amount, collection.new_origin)?
        } else {
            self.store.read_player(owner)?
        };

        tracing::debug!(
            player_id = %owner,
            placeable_id = %placeable_id,
            amount = collection.amount,
            "Mine collected"
        );
        self.notify_resources(&player, now);
        Ok(Collected {
            amount: collection.amount,
            player,
        })
    }

    /// Attach a gem to one of the owner's buildings, or detach it with `None`.
    ///
    /// Mines losing or gaining the gem are settled first so their new rate
    /// only counts from now on.
    pub fn equip_gem(
        &self,
        owner: PlayerId,
        gem_id: GemId,
        building: Option<PlaceableId>,
    ) -> CoreResult<Gem> {
        let lock = self.island_lock(owner);
        let _guard = lock.lock().expect("island lock poisoned");
        let now = self.clock.now();
        self.sweep_island_locked(owner, now);

        let gem = self.store.read_gem(gem_id)?;
        if gem.owner != owner {
            return Err(CoreError::not_found(format!("gem {}", gem_id)));
        }
        if gem.staked && building.is_some() {
            return Err(CoreError::validation(format!(
                "gem {} is staked and cannot be attached to a building",
                gem_id
            )));
        }
        if gem.building_id == building {
            return Ok(gem);
        }

        let mut settlements = Vec::new();
        for id in [gem.building_id, building].into_iter().flatten() {
            let placeable = self.owned_placeable(owner, id)?;
            if !placeable.is_building() {
                return Err(CoreError::validation(format!(
                    "placeable {} is not a building",
                    id
                )));
            }
            let gems = self.store.building_gems(id)?;
            settlements.extend(self.accumulator.settle(&placeable, &gems, now));
        }

        let gem = self
            .store
            .commit_gem_move(owner, gem_id, building, &settlements)?;
        tracing::info!(
            player_id = %owner,
            gem_id = %gem_id,
            building_id = ?building,
            settled = settlements.len(),
            "Gem moved"
        );
        Ok(gem)
    }

    /// Cancel an unfinished task. Spent crystals are not refunded.
    pub fn cancel_task(&self, owner: PlayerId, task_id: TaskId) -> CoreResult<Task> {
        let lock = self.island_lock(owner);
        let _guard = lock.lock().expect("island lock poisoned");

        match self.scheduler.get(task_id) {
            Some(task) if task.owner == owner => {}
            _ => return Err(CoreError::not_found(format!("task {}", task_id))),
        }

        let cancelled = self.scheduler.cancel(task_id)?;
        match self.store.delete_task(task_id) {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => {
                if let Err(restore) = self.scheduler.restore(cancelled.clone()) {
                    tracing::error!(task_id = %task_id, error = %restore, "Failed to restore task after store error");
                }
                return Err(e.into());
            }
        }

        tracing::info!(player_id = %owner, task_id = %task_id, "Task cancelled");
        Ok(cancelled)
    }

    /// Acknowledge a failed task so it is no longer surfaced.
    pub fn dismiss_failed(&self, owner: PlayerId, task_id: TaskId) -> CoreResult<()> {
        let lock = self.island_lock(owner);
        let _guard = lock.lock().expect("island lock poisoned");

        if !self
            .scheduler
            .failed_for(owner)
            .iter()
            .any(|f| f.task.id == task_id)
        {
            return Err(CoreError::not_found(format!("failed task {}", task_id)));
        }
        match self.store.delete_task(task_id) {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.scheduler.dismiss_failed(owner, task_id)?;
        Ok(())
    }

    /// Complete whatever is due on the island, then describe it.
    pub fn sync(&self, owner: PlayerId) -> CoreResult<IslandSnapshot> {
        let lock = self.island_lock(owner);
        let _guard = lock.lock().expect("island lock poisoned");
        let now = self.clock.now();

        self.sweep_island_locked(owner, now);
        self.snapshot_locked(owner, now)
    }

    /// Everything a client needs to render the island, without sweeping.
    pub fn snapshot(&self, owner: PlayerId) -> CoreResult<IslandSnapshot> {
        let lock = self.island_lock(owner);
        let _guard = lock.lock().expect("island lock poisoned");
        self.snapshot_locked(owner, self.clock.now())
    }

    /// Current mana of a player, regeneration included.
    pub fn mana_of(&self, owner: PlayerId) -> CoreResult<i64> {
        let player = self.store.read_player(owner)?;
        Ok(self.accumulator.mana_at(&player, self.clock.now()))
    }

    // ============================================================
    // Sweeps
    // ============================================================

    /// Complete every task due at `now` across all islands.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        for task in self.scheduler.due_tasks(now) {
            let lock = self.island_lock(task.owner);
            let _guard = lock.lock().expect("island lock poisoned");
            report.merge(self.complete_one(task.id, now));
        }
        if !report.is_empty() {
            tracing::debug!(?report, "Sweep finished");
        }
        report
    }

    /// Complete every task due at `now` on one island.
    pub fn sweep_island(&self, owner: PlayerId, now: DateTime<Utc>) -> SweepReport {
        let lock = self.island_lock(owner);
        let _guard = lock.lock().expect("island lock poisoned");
        self.sweep_island_locked(owner, now)
    }

    fn sweep_island_locked(&self, owner: PlayerId, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        for task in self.scheduler.due_tasks_for(owner, now) {
            report.merge(self.complete_one(task.id, now));
        }
        report
    }

    /// Claim and commit one due task. The caller holds the island lock.
    fn complete_one(&self, task_id: TaskId, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let Some(task) = self.scheduler.claim(task_id, now) else {
            return report;
        };

        let xp_per_level = self.accumulator.config().xp_per_level;
        let committed = self.level_settlement(&task).and_then(|settlement| {
            self.store
                .apply_completion(&task, xp_per_level, settlement.as_ref())
        });
        match committed {
            Ok(outcome) => {
                self.scheduler.complete(task_id);
                match outcome {
                    CompletionOutcome::Applied => report.applied += 1,
                    CompletionOutcome::AlreadyApplied => {
                        tracing::debug!(task_id = %task_id, "Completion was already applied");
                        report.already_applied += 1;
                    }
                }
                tracing::info!(
                    player_id = %task.owner,
                    placeable_id = %task.placeable_id,
                    task_id = %task_id,
                    kind = task.kind.as_str(),
                    "Task applied"
                );
                self.notify(
                    task.owner,
                    OutboundEvent::TaskCompleted {
                        task_id,
                        placeable_id: task.placeable_id,
                        kind: task.kind.as_str().to_string(),
                        level: task.to_level,
                    },
                );
                match self.store.read_player(task.owner) {
                    Ok(player) => self.notify_resources(&player, now),
                    Err(e) => tracing::warn!(player_id = %task.owner, error = %e, "Could not read player after completion"),
                }
            }
            Err(e) if e.is_transient() => {
                let reason = e.to_string();
                match self.scheduler.retry_later(task_id, &reason, now, &self.retry) {
                    Some(RetryDecision::Retry { at, attempts }) => {
                        tracing::warn!(
                            task_id = %task_id,
                            attempts,
                            retry_at = %at,
                            error = %e,
                            "Completion failed, will retry"
                        );
                        self.persist_status(task_id, TaskStatus::Completing, attempts);
                        report.retried += 1;
                    }
                    Some(RetryDecision::Failed(failed)) => {
                        self.persist_status(task_id, TaskStatus::Failed, failed.task.attempts);
                        self.notify_failed(&failed);
                        report.failed += 1;
                    }
                    None => {}
                }
            }
            Err(e) => {
                if let Some(failed) = self.scheduler.fail(task_id, &e.to_string(), now) {
                    self.persist_status(task_id, TaskStatus::Failed, failed.task.attempts);
                    self.notify_failed(&failed);
                    report.failed += 1;
                }
            }
        }
        report
    }

    // ============================================================
    // Helpers
    // ============================================================

    fn owned_placeable(&self, owner: PlayerId, id: PlaceableId) -> CoreResult<Placeable> {
        let placeable = self.store.read_placeable(id)?;
        if placeable.owner != owner {
            return Err(CoreError::not_found(format!("placeable {}", id)));
        }
        Ok(placeable)
    }

    fn ensure_built(&self, placeable: &Placeable) -> CoreResult<()> {
        if let Some(task) = self.scheduler.for_placeable(placeable.id) {
            return Err(CoreError::conflict(format!(
                "placeable {} already has active task {}",
                placeable.id, task.id
            )));
        }
        if placeable.level < 1 {
            return Err(CoreError::validation(format!(
                "placeable {} is not built yet",
                placeable.id
            )));
        }
        Ok(())
    }

    /// Fail early with the current balance when a spend cannot succeed.
    fn ensure_affordable(&self, owner: PlayerId, cost: i64) -> CoreResult<()> {
        if cost < 0 {
            return Err(CoreError::validation(format!("cost must be >= 0, got {}", cost)));
        }
        let player = self.store.read_player(owner)?;
        if player.crystals < cost {
            return Err(CoreError::validation(format!(
                "not enough crystals: need {}, have {}",
                cost, player.crystals
            )));
        }
        Ok(())
    }

    /// Settlement of the mine a build or upgrade task is about to raise,
    /// taken at the task's completion time.
    fn level_settlement(&self, task: &Task) -> Result<Option<MineSettlement>, StoreError> {
        if matches!(task.kind, TaskKind::Mine { .. }) {
            return Ok(None);
        }
        let placeable = self.store.read_placeable(task.placeable_id)?;
        if placeable.mine().is_none() || placeable.level >= task.to_level {
            return Ok(None);
        }
        let gems = self.store.building_gems(placeable.id)?;
        Ok(self.accumulator.settle(&placeable, &gems, task.completes_at()))
    }

    /// Schedule in memory, then persist together with the spend. The schedule
    /// is reverted if the store rejects the write.
    fn start_task(
        &self,
        placeable_id: PlaceableId,
        kind: TaskKind,
        duration: Duration,
        params: TaskParams,
    ) -> CoreResult<(Task, Player)> {
        let task_id = self.scheduler.schedule(placeable_id, kind, duration, params)?;
        let task = self
            .scheduler
            .get(task_id)
            .ok_or_else(|| CoreError::not_found(format!("task {}", task_id)))?;

        match self.store.commit_task_start(&task) {
            Ok(player) => Ok((task, player)),
            Err(e) => {
                self.scheduler.remove(task_id);
                tracing::warn!(task_id = %task_id, error = %e, "Task start not persisted, reverted");
                Err(e.into())
            }
        }
    }

    fn snapshot_locked(&self, owner: PlayerId, now: DateTime<Utc>) -> CoreResult<IslandSnapshot> {
        let mut player = self.store.read_player(owner)?;
        self.accumulator.settle_mana(&mut player, now);

        let mut placeables = Vec::new();
        for placeable in self.store.island_placeables(owner)? {
            let pending_yield = match placeable.mine() {
                Some(_) => {
                    let gems = self.store.building_gems(placeable.id)?;
                    Some(self.accumulator.mine_yield_since(&placeable, &gems, now))
                }
                None => None,
            };
            placeables.push(PlaceableSnapshot {
                placeable,
                pending_yield,
            });
        }

        Ok(IslandSnapshot {
            player,
            placeables,
            tasks: self.scheduler.active_for(owner),
            failed_tasks: self.scheduler.failed_for(owner),
            taken_at: now,
        })
    }

    fn persist_status(&self, task_id: TaskId, status: TaskStatus, attempts: u32) {
        if let Err(e) = self.store.update_task_status(task_id, status, attempts) {
            tracing::warn!(task_id = %task_id, status = status.as_str(), error = %e, "Could not persist task status");
        }
    }

    fn notify(&self, owner: PlayerId, event: OutboundEvent) {
        self.registry.send(owner, event);
    }

    fn notify_failed(&self, failed: &FailedTask) {
        self.notify(
            failed.task.owner,
            OutboundEvent::TaskFailed {
                task_id: failed.task.id,
                placeable_id: failed.task.placeable_id,
                reason: failed.reason.clone(),
            },
        );
    }

    fn notify_resources(&self, player: &Player, now: DateTime<Utc>) {
        self.notify(
            player.id,
            OutboundEvent::ResourceUpdate {
                crystals: player.crystals,
                xp: player.xp,
                mana: self.accumulator.mana_at(player, now),
            },
        );
    }
}
