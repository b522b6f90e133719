//! Process-wide wiring of the real-time core.
//!
//! [`GameRuntime`] owns the session registry, the progression engine, the
//! battle coordinator and the chat relay, routes inbound channel events to
//! them and drives the clock-based background loops. Core operations are synchronous; the async
//! side calls them through `spawn_blocking`.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::battle::{BattleCoordinator, Presence};
use crate::chat::ChatRelay;
use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::error::CoreResult;
use crate::models::*;
use crate::progression::ProgressionEngine;
use crate::registry::{ChannelHandle, SessionRegistry};
use crate::store::PersistenceAdapter;

pub struct GameRuntime {
    config: CoreConfig,
    clock: Arc<dyn Clock>,
    registry: Arc<SessionRegistry>,
    progression: ProgressionEngine,
    battles: BattleCoordinator,
    chat: ChatRelay,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl GameRuntime {
    pub fn new(config: CoreConfig, store: Arc<dyn PersistenceAdapter>, clock: Arc<dyn Clock>) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.outbox_capacity));
        let progression =
            ProgressionEngine::new(store.clone(), clock.clone(), registry.clone(), &config);
        let battles =
            BattleCoordinator::new(store.clone(), clock.clone(), registry.clone(), &config);
        let chat = ChatRelay::new(store, clock.clone(), registry.clone());
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            clock,
            registry,
            progression,
            battles,
            chat,
            shutdown,
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn progression(&self) -> &ProgressionEngine {
        &self.progression
    }

    pub fn battles(&self) -> &BattleCoordinator {
        &self.battles
    }

    pub fn chat(&self) -> &ChatRelay {
        &self.chat
    }

    /// Bring the core up without background loops: open the registry and
    /// restore persisted tasks.
    pub fn open(&self) -> CoreResult<()> {
        self.registry.start();
        self.progression.start()?;
        Ok(())
    }

    /// [`Self::open`], then spawn the sweep and battle timer loops.
    pub fn start(self: &Arc<Self>) -> CoreResult<()> {
        self.open()?;
        let _ = self.shutdown.send(false);

        let sweep = self.spawn_loop("sweep", self.config.sweep_interval(), |rt| {
            let now = rt.clock.now();
            rt.progression.sweep(now);
        });
        let battle_tick = self.spawn_loop("battle tick", self.config.battle_tick(), |rt| {
            let now = rt.clock.now();
            rt.battles.tick(now);
        });

        let mut loops = self.loops.lock().expect("runtime lock poisoned");
        loops.push(sweep);
        loops.push(battle_tick);
        tracing::info!(
            sweep_interval = ?self.config.sweep_interval(),
            battle_tick = ?self.config.battle_tick(),
            "Runtime started"
        );
        Ok(())
    }

    /// Stop the background loops and close every channel.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let loops: Vec<JoinHandle<()>> = {
            let mut loops = self.loops.lock().expect("runtime lock poisoned");
            loops.drain(..).collect()
        };
        for handle in loops {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background loop ended abnormally");
            }
        }
        self.registry.stop();
        tracing::info!("Runtime stopped");
    }

    fn spawn_loop<F>(self: &Arc<Self>, name: &'static str, period: StdDuration, step: F) -> JoinHandle<()>
    where
        F: Fn(&GameRuntime) + Send + Sync + Clone + 'static,
    {
        let runtime = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let rt = runtime.clone();
                        let step = step.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || step(rt.as_ref())).await {
                            tracing::error!(task = name, error = %e, "Background step panicked");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(task = name, "Background loop stopped");
        })
    }

    // ============================================================
    // Channel lifecycle
    // ============================================================

    /// Register a new channel for `player` and resync it: island state, and
    /// battle state if a battle is running.
    pub fn connect(&self, player: PlayerId) -> ChannelHandle {
        let handle = self.registry.connect(player);
        self.battles.handle_connect(player);
        match self.progression.sync(player) {
            Ok(snapshot) => {
                handle.send(OutboundEvent::IslandState(snapshot));
            }
            Err(e) => tracing::warn!(player_id = %player, error = %e, "Initial island sync failed"),
        }
        handle
    }

    /// Drop the channel of `player` if it is still `connection_id`.
    pub fn disconnect(&self, player: PlayerId, connection_id: Uuid) {
        if self.registry.unregister_connection(player, connection_id) {
            self.battles.handle_disconnect(player);
        }
    }

    /// Route one inbound event. A failure is also reported to the
    /// initiating channel as an `error` event.
    pub fn dispatch(&self, player: PlayerId, event: InboundEvent) -> CoreResult<()> {
        let action = event.name();
        tracing::debug!(player_id = %player, action, "Inbound event");

        let result = self.route(player, event);
        if let Err(e) = &result {
            tracing::debug!(player_id = %player, action, error = %e, "Action rejected");
            self.registry.send(
                player,
                OutboundEvent::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                    action: action.to_string(),
                },
            );
        }
        result
    }

    fn route(&self, player: PlayerId, event: InboundEvent) -> CoreResult<()> {
        match event {
            InboundEvent::Build {
                blueprint_id,
                x,
                z,
                rotation,
            } => {
                self.progression.build(player, blueprint_id, x, z, rotation)?;
            }
            InboundEvent::Upgrade { placeable_id } => {
                self.progression.upgrade(player, placeable_id)?;
            }
            InboundEvent::MineStart { placeable_id } => {
                self.progression.mine_start(player, placeable_id)?;
            }
            InboundEvent::MineCollect { placeable_id } => {
                self.progression.collect(player, placeable_id)?;
            }
            InboundEvent::CancelTask { task_id } => {
                self.progression.cancel_task(player, task_id)?;
                self.send_island(player)?;
            }
            InboundEvent::DismissFailed { task_id } => {
                self.progression.dismiss_failed(player, task_id)?;
                self.send_island(player)?;
            }
            InboundEvent::EquipGem {
                gem_id,
                building_id,
            } => {
                self.progression.equip_gem(player, gem_id, building_id)?;
                self.send_island(player)?;
            }
            InboundEvent::Sync => {
                let snapshot = self.progression.sync(player)?;
                self.registry.send(player, OutboundEvent::IslandState(snapshot));
            }
            InboundEvent::BattleEnqueue => {
                self.battles.enqueue(player)?;
            }
            InboundEvent::BattleAction(action) => {
                self.battles.submit_action(player, action)?;
            }
            InboundEvent::BattleLeave => {
                self.battles.leave(player)?;
            }
            InboundEvent::IslandVisit { target, request } => {
                self.battles.visit(player, target, request)?;
            }
            InboundEvent::VisitForward { data } => {
                self.battles.visit_forward(player, data)?;
            }
            InboundEvent::Chat { message } => {
                self.chat.post(player, &message)?;
            }
        }
        Ok(())
    }

    fn send_island(&self, player: PlayerId) -> CoreResult<()> {
        let snapshot = self.progression.snapshot(player)?;
        self.registry.send(player, OutboundEvent::IslandState(snapshot));
        Ok(())
    }

    pub fn presence(&self, player: PlayerId) -> Presence {
        self.battles.presence(player)
    }
}
