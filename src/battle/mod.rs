//! Battle Coordinator.
//!
//! Owns every battle session from matchmaking until its outcome is
//! committed. Players are paired first-in first-out. While a battle is
//! active, the coordinator is the only sequencer of actions: each accepted
//! action gets the next sequence number of its session in arrival order, and
//! the resulting state is broadcast to all participants.
//!
//! A participant that disconnects has `grace_secs` to come back before it is
//! eliminated. The last participant standing wins; a battle that reaches the
//! match duration, or in which nobody is left, is a draw.
//!
//! Timers are not spawned per battle. [`BattleCoordinator::tick`] is called
//! at a fixed cadence and checks grace deadlines, match timers and pending
//! commit retries against the clock.
//!
//! An outcome is committed without holding its session lock; the session
//! sits in `Resolving` meanwhile and rejects further actions.
//!
//! The coordinator also tracks island visits, so a player is never visiting
//! and battling at the same time.
//!
//! Lock order: the coordinator's table lock is never acquired while a
//! session lock is held.

mod visit;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::accumulator::ResourceAccumulator;
use crate::clock::Clock;
use crate::config::{BattleConfig, CoreConfig, RetryPolicy};
use crate::error::{CoreError, CoreResult};
use crate::models::*;
use crate::registry::SessionRegistry;
use crate::store::PersistenceAdapter;

/// Where a player currently is, as far as the real-time core knows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Offline,
    Online,
    InQueue,
    InBattle,
    Visiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Waiting for opponents; `position` is 1-based.
    Queued { position: usize },
    Matched(BattleId),
}

/// What one call to [`BattleCoordinator::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Participants eliminated because their grace period ran out.
    pub forfeits: usize,
    /// Battles that reached `Closed`.
    pub closed: usize,
    pub commit_retries: usize,
}

#[derive(Debug, Clone)]
struct Participant {
    player_id: PlayerId,
    altar_hp: i64,
    /// Mana available for spells, sampled when the battle started.
    mana_budget: i64,
    mana_spent: i64,
    spell_casts: i64,
    damage_dealt: i64,
    damage_taken: i64,
    connected: bool,
    grace_deadline: Option<DateTime<Utc>>,
    eliminated: bool,
    forfeited: bool,
}

impl Participant {
    fn is_live(&self) -> bool {
        !self.eliminated
    }

    fn view(&self) -> ParticipantView {
        ParticipantView {
            player_id: self.player_id,
            altar_hp: self.altar_hp,
            mana_left: self.mana_budget - self.mana_spent,
            connected: self.connected,
            eliminated: self.eliminated,
        }
    }
}

#[derive(Debug)]
struct BattleSession {
    id: BattleId,
    state: BattleState,
    seq: u64,
    participants: Vec<Participant>,
    started_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    /// Set on entering `Resolving`.
    outcome: Option<BattleOutcome>,
    commit_attempts: u32,
    next_commit_at: Option<DateTime<Utc>>,
    /// A commit of the outcome is in flight.
    committing: bool,
}

impl BattleSession {
    fn participant(&self, player: PlayerId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.player_id == player)
    }

    fn participant_mut(&mut self, player: PlayerId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.player_id == player)
    }

    fn live(&self) -> Vec<PlayerId> {
        self.participants
            .iter()
            .filter(|p| p.is_live())
            .map(|p| p.player_id)
            .collect()
    }

    fn player_ids(&self) -> Vec<PlayerId> {
        self.participants.iter().map(|p| p.player_id).collect()
    }

    fn view(&self) -> BattleView {
        BattleView {
            battle_id: self.id,
            state: self.state,
            seq: self.seq,
            participants: self.participants.iter().map(Participant::view).collect(),
            ends_at: self.ends_at,
        }
    }
}

type SharedSession = Arc<Mutex<BattleSession>>;

#[derive(Default)]
struct Tables {
    queue: VecDeque<PlayerId>,
    player_battles: HashMap<PlayerId, BattleId>,
    sessions: HashMap<BattleId, SharedSession>,
    /// Accepted visits, keyed by both host and guest.
    visits: HashMap<PlayerId, Visit>,
    /// Open visit requests as `(guest, host)`.
    visit_requests: HashSet<(PlayerId, PlayerId)>,
}

impl Tables {
    /// Fail unless `player` is neither queued, battling nor visiting.
    fn ensure_idle(&self, player: PlayerId) -> CoreResult<()> {
        if self.queue.contains(&player) {
            return Err(CoreError::AlreadyQueued(player));
        }
        if self.player_battles.contains_key(&player) {
            return Err(CoreError::AlreadyInBattle(player));
        }
        if self.visits.contains_key(&player) {
            return Err(CoreError::conflict(format!("player {} is on an island visit", player)));
        }
        Ok(())
    }
}

pub struct BattleCoordinator {
    store: Arc<dyn PersistenceAdapter>,
    clock: Arc<dyn Clock>,
    registry: Arc<SessionRegistry>,
    accumulator: ResourceAccumulator,
    config: BattleConfig,
    retry: RetryPolicy,
    tables: Mutex<Tables>,
}

impl BattleCoordinator {
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
            accumulator: ResourceAccumulator::new(config.progression.clone()),
            config: config.battle.clone(),
            retry: config.retry.clone(),
            tables: Mutex::new(Tables::default()),
        }
    }

    // ============================================================
    // Matchmaking
    // ============================================================

    /// Queue a connected player. Pairs the oldest waiting players as soon as
    /// enough are queued.
    pub fn enqueue(&self, player: PlayerId) -> CoreResult<EnqueueOutcome> {
        if !self.registry.is_online(player) {
            return Err(CoreError::validation(format!(
                "player {} must be connected to join a battle",
                player
            )));
        }

        let needed = self.config.players_per_battle.max(2);
        let (position, group) = {
            let mut tables = self.tables.lock().expect("battle table lock poisoned");
            tables.ensure_idle(player)?;
            tables.queue.push_back(player);
            let position = tables.queue.len();

            if tables.queue.len() >= needed {
                let battle_id = BattleId::new();
                let group: Vec<PlayerId> = tables.queue.drain(..needed).collect();
                for p in &group {
                    tables.player_battles.insert(*p, battle_id);
                }
                (position, Some((battle_id, group)))
            } else {
                (position, None)
            }
        };

        let Some((battle_id, group)) = group else {
            tracing::info!(player_id = %player, position, "Queued for battle");
            return Ok(EnqueueOutcome::Queued { position });
        };

        match self.open_session(battle_id, &group) {
            Ok(()) => Ok(EnqueueOutcome::Matched(battle_id)),
            Err(e) => {
                // Put the group back where it was, in order.
                let mut tables = self.tables.lock().expect("battle table lock poisoned");
                for p in group.iter().rev() {
                    tables.player_battles.remove(p);
                    tables.queue.push_front(*p);
                }
                tracing::warn!(battle_id = %battle_id, error = %e, "Could not start battle");
                Err(e)
            }
        }
    }

    fn open_session(&self, battle_id: BattleId, group: &[PlayerId]) -> CoreResult<()> {
        let now = self.clock.now();
        let mut participants = Vec::with_capacity(group.len());
        for &player_id in group {
            let player = self.store.read_player(player_id)?;
            participants.push(Participant {
                player_id,
                altar_hp: self.config.altar_hp,
                mana_budget: self.accumulator.mana_at(&player, now),
                mana_spent: 0,
                spell_casts: 0,
                damage_dealt: 0,
                damage_taken: 0,
                connected: self.registry.is_online(player_id),
                grace_deadline: None,
                eliminated: false,
                forfeited: false,
            });
        }
        for p in participants.iter_mut().filter(|p| !p.connected) {
            p.grace_deadline = Some(now + self.config.grace());
        }

        let session = BattleSession {
            id: battle_id,
            state: BattleState::Active,
            seq: 0,
            participants,
            started_at: now,
            ends_at: now + self.config.match_duration(),
            outcome: None,
            commit_attempts: 0,
            next_commit_at: None,
            committing: false,
        };
        let ends_at = session.ends_at;

        let session = Arc::new(Mutex::new(session));
        self.tables
            .lock()
            .expect("battle table lock poisoned")
            .sessions
            .insert(battle_id, session.clone());

        // A channel that came or went while the session was being built found
        // no session to update. From here on connection changes reach it.
        let view = {
            let mut session = session.lock().expect("battle session lock poisoned");
            for p in session.participants.iter_mut() {
                let online = self.registry.is_online(p.player_id);
                if online && !p.connected {
                    p.connected = true;
                    p.grace_deadline = None;
                } else if !online && p.connected {
                    p.connected = false;
                    p.grace_deadline = Some(now + self.config.grace());
                    tracing::info!(battle_id = %battle_id, player_id = %p.player_id, "Participant left before the battle opened");
                }
            }
            session.view()
        };

        tracing::info!(battle_id = %battle_id, participants = ?group, "Battle matched");
        for &p in group {
            self.registry.send(
                p,
                OutboundEvent::BattleMatched {
                    battle_id,
                    participants: group.to_vec(),
                    ends_at,
                },
            );
            self.registry.send(
                p,
                OutboundEvent::BattleState {
                    view: view.clone(),
                    actor: None,
                    action: None,
                },
            );
        }
        Ok(())
    }

    // ============================================================
    // Active battle
    // ============================================================

    /// Validate and apply an action. Returns the sequence number it was
    /// given.
    pub fn submit_action(&self, player: PlayerId, action: BattleAction) -> CoreResult<u64> {
        let session = self
            .session_of(player)
            .ok_or_else(|| CoreError::not_found(format!("player {} is not in a battle", player)))?;
        let now = self.clock.now();

        let (seq, resolved) = {
            let mut session = session.lock().expect("battle session lock poisoned");
            if session.state != BattleState::Active {
                return Err(CoreError::conflict(format!(
                    "battle {} is {}",
                    session.id,
                    session.state.as_str()
                )));
            }
            match session.participant(player) {
                Some(p) if p.is_live() => {}
                Some(_) => {
                    return Err(CoreError::validation(format!(
                        "player {} is eliminated",
                        player
                    )))
                }
                None => return Err(CoreError::not_found(format!("player {} is not in this battle", player))),
            }

            let recipients = self.apply_action(&mut session, player, &action)?;
            session.seq += 1;
            let seq = session.seq;

            let event = OutboundEvent::BattleState {
                view: session.view(),
                actor: Some(player),
                action: Some(action),
            };
            for p in recipients {
                self.registry.send(p, event.clone());
            }

            let resolved = match session.live().as_slice() {
                [winner] => self.resolve(&mut session, Some(*winner), EndReason::AltarDestroyed, now),
                [] => self.resolve(&mut session, None, EndReason::AltarDestroyed, now),
                _ => false,
            };
            (seq, resolved)
        };

        if resolved {
            self.commit_and_discard(&session, now);
        }
        Ok(seq)
    }

    /// Check legality against the session and apply the action. Returns who
    /// should see the resulting state.
    fn apply_action(
        &self,
        session: &mut BattleSession,
        player: PlayerId,
        action: &BattleAction,
    ) -> CoreResult<Vec<PlayerId>> {
        match action {
            BattleAction::Attack { target, damage } => {
                self.live_opponent(session, player, *target)?;
                if *damage <= 0 || *damage > self.config.max_damage_per_action {
                    return Err(CoreError::validation(format!(
                        "damage must be within 1..={}, got {}",
                        self.config.max_damage_per_action, damage
                    )));
                }

                let battle_id = session.id;
                let dealt = {
                    let target = session
                        .participant_mut(*target)
                        .ok_or_else(|| CoreError::not_found(format!("player {}", target)))?;
                    let dealt = (*damage).min(target.altar_hp);
                    target.altar_hp -= dealt;
                    target.damage_taken += dealt;
                    if target.altar_hp == 0 {
                        target.eliminated = true;
                        tracing::info!(battle_id = %battle_id, player_id = %target.player_id, "Altar destroyed");
                    }
                    dealt
                };
                if let Some(attacker) = session.participant_mut(player) {
                    attacker.damage_dealt += dealt;
                }
                Ok(session.player_ids())
            }
            BattleAction::CastSpell { spell, mana_cost } => {
                if spell.trim().is_empty() {
                    return Err(CoreError::validation("spell name must not be empty"));
                }
                let caster = session
                    .participant_mut(player)
                    .ok_or_else(|| CoreError::not_found(format!("player {}", player)))?;
                let left = caster.mana_budget - caster.mana_spent;
                if *mana_cost < 0 || *mana_cost > left {
                    return Err(CoreError::validation(format!(
                        "spell {} costs {} mana, {} left",
                        spell, mana_cost, left
                    )));
                }
                caster.mana_spent += mana_cost;
                caster.spell_casts += 1;
                Ok(session.player_ids())
            }
            BattleAction::Forward { target, .. } => match target {
                Some(target) => {
                    self.live_opponent(session, player, *target)?;
                    Ok(vec![*target])
                }
                None => Ok(session
                    .participants
                    .iter()
                    .filter(|p| p.player_id != player && p.is_live())
                    .map(|p| p.player_id)
                    .collect()),
            },
        }
    }

    fn live_opponent(&self, session: &BattleSession, player: PlayerId, target: PlayerId) -> CoreResult<()> {
        if target == player {
            return Err(CoreError::validation("cannot target yourself"));
        }
        match session.participant(target) {
            Some(p) if p.is_live() => Ok(()),
            Some(_) => Err(CoreError::validation(format!("player {} is eliminated", target))),
            None => Err(CoreError::validation(format!("player {} is not in this battle", target))),
        }
    }

    /// Leave the queue, or forfeit the current battle.
    pub fn leave(&self, player: PlayerId) -> CoreResult<()> {
        {
            let mut tables = self.tables.lock().expect("battle table lock poisoned");
            if let Some(pos) = tables.queue.iter().position(|p| *p == player) {
                tables.queue.remove(pos);
                tracing::info!(player_id = %player, "Left battle queue");
                return Ok(());
            }
        }

        let session = self
            .session_of(player)
            .ok_or_else(|| CoreError::not_found(format!("player {} is not queued or in a battle", player)))?;
        let now = self.clock.now();

        let resolved = {
            let mut session = session.lock().expect("battle session lock poisoned");
            if session.state != BattleState::Active {
                return Err(CoreError::conflict(format!(
                    "battle {} is {}",
                    session.id,
                    session.state.as_str()
                )));
            }
            let Some(p) = session.participant_mut(player).filter(|p| p.is_live()) else {
                return Err(CoreError::validation(format!("player {} is eliminated", player)));
            };
            p.eliminated = true;
            p.forfeited = true;
            tracing::info!(battle_id = %session.id, player_id = %player, "Participant left, forfeit");

            self.after_elimination(&mut session, EndReason::Left, now)
        };

        if resolved {
            self.commit_and_discard(&session, now);
        }
        Ok(())
    }

    // ============================================================
    // Lifecycle signals
    // ============================================================

    /// A player's channel went away. Ends a visit, drops a queue entry and
    /// starts the grace period of an active participant.
    pub fn handle_disconnect(&self, player: PlayerId) {
        self.drop_visits(player);
        {
            let mut tables = self.tables.lock().expect("battle table lock poisoned");
            if let Some(pos) = tables.queue.iter().position(|p| *p == player) {
                tables.queue.remove(pos);
                tracing::info!(player_id = %player, "Disconnected, removed from battle queue");
                return;
            }
        }

        let Some(session) = self.session_of(player) else {
            return;
        };
        let now = self.clock.now();
        let mut session = session.lock().expect("battle session lock poisoned");
        if session.state != BattleState::Active {
            return;
        }
        let deadline = now + self.config.grace();
        let battle_id = session.id;
        match session.participant_mut(player) {
            Some(p) if p.is_live() && p.connected => {
                p.connected = false;
                p.grace_deadline = Some(deadline);
            }
            _ => return,
        }
        tracing::info!(battle_id = %battle_id, player_id = %player, grace_until = %deadline, "Participant disconnected");
        self.broadcast_state(&session);
    }

    /// A player (re)connected. Cancels a running grace period and resyncs the
    /// battle state.
    pub fn handle_connect(&self, player: PlayerId) {
        let Some(session) = self.session_of(player) else {
            return;
        };
        let mut session = session.lock().expect("battle session lock poisoned");
        if session.state != BattleState::Active {
            return;
        }
        let battle_id = session.id;
        match session.participant_mut(player) {
            Some(p) if p.is_live() => {
                p.connected = true;
                p.grace_deadline = None;
            }
            _ => return,
        }
        tracing::info!(battle_id = %battle_id, player_id = %player, "Participant reconnected");
        self.broadcast_state(&session);
    }

    /// Enforce grace deadlines and match timers, and retry pending commits.
    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let sessions: Vec<SharedSession> = {
            let tables = self.tables.lock().expect("battle table lock poisoned");
            tables.sessions.values().cloned().collect()
        };

        let mut report = TickReport::default();
        let mut closed = Vec::new();
        let mut due = Vec::new();
        for shared in sessions {
            let mut session = shared.lock().expect("battle session lock poisoned");
            match session.state {
                BattleState::Active => {
                    let mut expired = 0;
                    for p in session.participants.iter_mut() {
                        if p.is_live() && p.grace_deadline.is_some_and(|d| d <= now) {
                            p.eliminated = true;
                            p.forfeited = true;
                            p.grace_deadline = None;
                            expired += 1;
                        }
                    }
                    let resolved = if expired > 0 {
                        tracing::info!(battle_id = %session.id, expired, "Grace period expired, forfeit");
                        report.forfeits += expired;
                        self.after_elimination(&mut session, EndReason::Disconnected, now)
                    } else if now >= session.ends_at {
                        tracing::info!(battle_id = %session.id, "Match time is up");
                        self.resolve(&mut session, None, EndReason::TimeUp, now)
                    } else {
                        false
                    };
                    if resolved {
                        due.push(shared.clone());
                    }
                }
                BattleState::Resolving => {
                    if !session.committing && session.next_commit_at.is_some_and(|at| at <= now) {
                        report.commit_retries += 1;
                        due.push(shared.clone());
                    }
                }
                BattleState::Closed => closed.push((session.id, session.player_ids())),
                BattleState::Matchmaking => {}
            }
        }

        // sessions are unlocked again; commits touch the store
        for shared in due {
            if let Some(done) = self.commit_pending(&shared, now) {
                closed.push(done);
            }
        }

        report.closed = closed.len();
        for (battle_id, players) in closed {
            self.discard(battle_id, &players);
        }
        report
    }

    // ============================================================
    // Resolution
    // ============================================================

    /// End the battle if at most one participant is left. Returns whether it
    /// entered `Resolving`.
    fn after_elimination(&self, session: &mut BattleSession, reason: EndReason, now: DateTime<Utc>) -> bool {
        match session.live().as_slice() {
            [winner] => self.resolve(session, Some(*winner), reason, now),
            [] => self.resolve(session, None, reason, now),
            _ => {
                self.broadcast_state(session);
                false
            }
        }
    }

    /// Enter `Resolving` and compute rewards. The caller commits them with
    /// [`Self::commit_pending`] once the session lock is released.
    fn resolve(
        &self,
        session: &mut BattleSession,
        winner: Option<PlayerId>,
        reason: EndReason,
        now: DateTime<Utc>,
    ) -> bool {
        session.state = BattleState::Resolving;

        let participants = session
            .participants
            .iter()
            .map(|p| {
                let result = match winner {
                    Some(w) if w == p.player_id => MatchResult::Won,
                    Some(_) => MatchResult::Lost,
                    None => MatchResult::Draw,
                };
                let (xp_awarded, crystals_awarded) = match result {
                    MatchResult::Won => (self.config.win_xp, self.config.win_crystals),
                    MatchResult::Lost => (self.config.loss_xp, 0),
                    MatchResult::Draw => (self.config.draw_xp, 0),
                };
                ParticipantResult {
                    player_id: p.player_id,
                    result,
                    forfeited: p.forfeited,
                    xp_awarded,
                    crystals_awarded,
                    mana_spent: p.mana_spent,
                    mana_after: 0,
                    spell_casts: p.spell_casts,
                    damage_dealt: p.damage_dealt,
                    damage_taken: p.damage_taken,
                }
            })
            .collect();

        session.outcome = Some(BattleOutcome {
            battle_id: session.id,
            winner,
            reason,
            participants,
            started_at: session.started_at,
            ended_at: now,
        });
        tracing::info!(
            battle_id = %session.id,
            winner = ?winner,
            reason = reason.as_str(),
            "Battle resolving"
        );
        session.next_commit_at = Some(now);
        self.broadcast_state(session);
        true
    }

    fn commit_and_discard(&self, session: &SharedSession, now: DateTime<Utc>) {
        if let Some((battle_id, players)) = self.commit_pending(session, now) {
            self.discard(battle_id, &players);
        }
    }

    /// Persist the outcome of a resolving session whose commit is due. The
    /// session lock is released while the store is written. On a transient
    /// failure the commit is retried from [`Self::tick`] with backoff; once
    /// retries are exhausted the battle closes uncommitted.
    ///
    /// Returns the battle and its players if the session reached `Closed`.
    fn commit_pending(
        &self,
        session: &SharedSession,
        now: DateTime<Utc>,
    ) -> Option<(BattleId, Vec<PlayerId>)> {
        let mut outcome = {
            let mut session = session.lock().expect("battle session lock poisoned");
            let due = session.next_commit_at.is_some_and(|at| at <= now);
            if session.state != BattleState::Resolving || session.committing || !due {
                return None;
            }
            let outcome = session.outcome.clone()?;
            session.committing = true;
            outcome
        };

        let result = self.fill_mana(&mut outcome).and_then(|()| {
            self.store
                .commit_battle_outcome(&outcome)
                .map_err(CoreError::from)
        });

        let mut session = session.lock().expect("battle session lock poisoned");
        session.committing = false;
        let closed = match result {
            Ok(()) => {
                tracing::info!(battle_id = %session.id, "Battle outcome committed");
                session.outcome = Some(outcome);
                self.close(&mut session, true);
                true
            }
            Err(CoreError::Persistence(e)) if e.is_transient() => {
                session.commit_attempts += 1;
                if self.retry.exhausted(session.commit_attempts) {
                    tracing::error!(
                        battle_id = %session.id,
                        attempts = session.commit_attempts,
                        error = %e,
                        "Battle outcome could not be committed, giving up"
                    );
                    self.close(&mut session, false);
                    true
                } else {
                    let at = now + self.retry.backoff(session.commit_attempts);
                    session.next_commit_at = Some(at);
                    tracing::warn!(
                        battle_id = %session.id,
                        attempts = session.commit_attempts,
                        retry_at = %at,
                        error = %e,
                        "Battle outcome commit failed, will retry"
                    );
                    false
                }
            }
            Err(e) => {
                tracing::error!(battle_id = %session.id, error = %e, "Battle outcome rejected by store");
                self.close(&mut session, false);
                true
            }
        };
        closed.then(|| (session.id, session.player_ids()))
    }

    fn fill_mana(&self, outcome: &mut BattleOutcome) -> CoreResult<()> {
        for p in outcome.participants.iter_mut() {
            let player = self.store.read_player(p.player_id)?;
            let mana = self.accumulator.mana_at(&player, outcome.ended_at);
            p.mana_after = (mana - p.mana_spent).clamp(0, MANA_CAP);
        }
        Ok(())
    }

    fn close(&self, session: &mut BattleSession, committed: bool) {
        session.state = BattleState::Closed;
        session.next_commit_at = None;
        let Some(outcome) = &session.outcome else {
            return;
        };
        let event = OutboundEvent::BattleEnded {
            battle_id: session.id,
            winner: outcome.winner,
            reason: outcome.reason,
            committed,
            results: outcome.participants.clone(),
        };
        for p in session.player_ids() {
            self.registry.send(p, event.clone());
        }
    }

    /// Forget a closed session.
    fn discard(&self, battle_id: BattleId, players: &[PlayerId]) {
        let mut tables = self.tables.lock().expect("battle table lock poisoned");
        tables.sessions.remove(&battle_id);
        for p in players {
            if tables.player_battles.get(p) == Some(&battle_id) {
                tables.player_battles.remove(p);
            }
        }
        tracing::debug!(battle_id = %battle_id, "Battle session discarded");
    }

    fn broadcast_state(&self, session: &BattleSession) {
        let event = OutboundEvent::BattleState {
            view: session.view(),
            actor: None,
            action: None,
        };
        for p in session.player_ids() {
            self.registry.send(p, event.clone());
        }
    }

    // ============================================================
    // Queries
    // ============================================================

    fn session_of(&self, player: PlayerId) -> Option<SharedSession> {
        let tables = self.tables.lock().expect("battle table lock poisoned");
        let battle_id = tables.player_battles.get(&player)?;
        tables.sessions.get(battle_id).cloned()
    }

    pub fn battle_of(&self, player: PlayerId) -> Option<BattleId> {
        let tables = self.tables.lock().expect("battle table lock poisoned");
        tables.player_battles.get(&player).copied()
    }

    pub fn view(&self, battle_id: BattleId) -> Option<BattleView> {
        let session = {
            let tables = self.tables.lock().expect("battle table lock poisoned");
            tables.sessions.get(&battle_id).cloned()
        }?;
        let session = session.lock().expect("battle session lock poisoned");
        Some(session.view())
    }

    pub fn queue_len(&self) -> usize {
        self.tables.lock().expect("battle table lock poisoned").queue.len()
    }

    pub fn active_battles(&self) -> usize {
        self.tables.lock().expect("battle table lock poisoned").sessions.len()
    }

    pub fn presence(&self, player: PlayerId) -> Presence {
        {
            let tables = self.tables.lock().expect("battle table lock poisoned");
            if tables.player_battles.contains_key(&player) {
                return Presence::InBattle;
            }
            if tables.queue.contains(&player) {
                return Presence::InQueue;
            }
            if tables.visits.contains_key(&player) {
                return Presence::Visiting;
            }
        }
        if self.registry.is_online(player) {
            Presence::Online
        } else {
            Presence::Offline
        }
    }
}
