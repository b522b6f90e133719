use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use island_realtime::battle::EnqueueOutcome;
use island_realtime::clock::{Clock, ManualClock};
use island_realtime::config::CoreConfig;
use island_realtime::db::Database;
use island_realtime::error::{CoreError, StoreError};
use island_realtime::models::*;
use island_realtime::runtime::GameRuntime;
use island_realtime::store::{PersistenceAdapter, StoreResult};

const A: PlayerId = PlayerId(1);
const B: PlayerId = PlayerId(2);
const TOWER: BlueprintId = BlueprintId(3);

type Hook = Box<dyn FnOnce() + Send>;

/// Store that runs a one-shot callback at a chosen point of a call, before
/// the call reaches the database. Used to interleave other work at exactly
/// that point.
struct HookStore {
    inner: Database,
    before_build: Mutex<Option<Hook>>,
    on_read_player: Mutex<Option<(PlayerId, Hook)>>,
    during_battle_commit: Mutex<Option<Hook>>,
}

impl HookStore {
    fn new(inner: Database) -> Self {
        Self {
            inner,
            before_build: Mutex::new(None),
            on_read_player: Mutex::new(None),
            during_battle_commit: Mutex::new(None),
        }
    }

    fn before_build(&self, hook: impl FnOnce() + Send + 'static) {
        *self.before_build.lock().unwrap() = Some(Box::new(hook));
    }

    fn on_read_player(&self, player: PlayerId, hook: impl FnOnce() + Send + 'static) {
        *self.on_read_player.lock().unwrap() = Some((player, Box::new(hook)));
    }

    fn during_battle_commit(&self, hook: impl FnOnce() + Send + 'static) {
        *self.during_battle_commit.lock().unwrap() = Some(Box::new(hook));
    }
}

fn fire(slot: &Mutex<Option<Hook>>) {
    let hook = slot.lock().unwrap().take();
    if let Some(hook) = hook {
        hook();
    }
}

impl PersistenceAdapter for HookStore {
    fn read_player(&self, id: PlayerId) -> StoreResult<Player> {
        let hook = {
            let mut slot = self.on_read_player.lock().unwrap();
            match slot.take() {
                Some((player, hook)) if player == id => Some(hook),
                other => {
                    *slot = other;
                    None
                }
            }
        };
        if let Some(hook) = hook {
            hook();
        }
        self.inner.read_player(id)
    }

    fn write_player(&self, player: &Player) -> StoreResult<()> {
        self.inner.write_player(player)
    }

    fn read_placeable(&self, id: PlaceableId) -> StoreResult<Placeable> {
        self.inner.read_placeable(id)
    }

    fn write_placeable(&self, placeable: &Placeable) -> StoreResult<()> {
        self.inner.write_placeable(placeable)
    }

    fn island_placeables(&self, owner: PlayerId) -> StoreResult<Vec<Placeable>> {
        self.inner.island_placeables(owner)
    }

    fn read_blueprint(&self, id: BlueprintId) -> StoreResult<Blueprint> {
        self.inner.read_blueprint(id)
    }

    fn building_gems(&self, building: PlaceableId) -> StoreResult<Vec<Gem>> {
        self.inner.building_gems(building)
    }

    fn read_gem(&self, id: GemId) -> StoreResult<Gem> {
        self.inner.read_gem(id)
    }

    fn commit_build(&self, placeable: &NewPlaceable, task: &Task) -> StoreResult<(Placeable, Task, Player)> {
        fire(&self.before_build);
        self.inner.commit_build(placeable, task)
    }

    fn commit_task_start(&self, task: &Task) -> StoreResult<Player> {
        self.inner.commit_task_start(task)
    }

    fn delete_task(&self, id: TaskId) -> StoreResult<()> {
        self.inner.delete_task(id)
    }

    fn update_task_status(&self, id: TaskId, status: TaskStatus, attempts: u32) -> StoreResult<()> {
        self.inner.update_task_status(id, status, attempts)
    }

    fn load_tasks(&self) -> StoreResult<Vec<Task>> {
        self.inner.load_tasks()
    }

    fn apply_completion(
        &self,
        task: &Task,
        xp_per_level: i64,
        settlement: Option<&MineSettlement>,
    ) -> StoreResult<CompletionOutcome> {
        self.inner.apply_completion(task, xp_per_level, settlement)
    }

    fn commit_collect(&self, owner: PlayerId, mine: PlaceableId, amount: i64, new_origin: DateTime<Utc>) -> StoreResult<Player> {
        self.inner.commit_collect(owner, mine, amount, new_origin)
    }

    fn commit_gem_move(
        &self,
        owner: PlayerId,
        gem: GemId,
        building: Option<PlaceableId>,
        settlements: &[MineSettlement],
    ) -> StoreResult<Gem> {
        self.inner.commit_gem_move(owner, gem, building, settlements)
    }

    fn commit_battle_outcome(&self, outcome: &BattleOutcome) -> StoreResult<()> {
        fire(&self.during_battle_commit);
        self.inner.commit_battle_outcome(outcome)
    }

    fn save_chat_message(&self, message: &NewChatMessage) -> StoreResult<ChatMessage> {
        self.inner.save_chat_message(message)
    }
}

struct Fixture {
    db: Database,
    store: Arc<HookStore>,
    clock: Arc<ManualClock>,
    runtime: Arc<GameRuntime>,
}

impl Fixture {
    fn new(players: i64) -> Self {
        let db = Database::open_memory().expect("Failed to create database");
        db.migrate().expect("Failed to migrate");
        for id in 1..=players {
            db.create_player(CreatePlayerInput {
                id: PlayerId(id),
                crystals: 10_000,
                xp: 0,
                mana: 500,
                now: DateTime::<Utc>::UNIX_EPOCH,
            })
            .expect("Failed to create player");
        }

        let store = Arc::new(HookStore::new(db.clone()));
        let clock = Arc::new(ManualClock::at_epoch());
        let runtime = Arc::new(GameRuntime::new(CoreConfig::default(), store.clone(), clock.clone()));
        runtime.open().expect("Failed to open runtime");
        Self {
            db,
            store,
            clock,
            runtime,
        }
    }

    fn duel(&self) -> BattleId {
        self.runtime.battles().enqueue(A).unwrap();
        match self.runtime.battles().enqueue(B).unwrap() {
            EnqueueOutcome::Matched(id) => id,
            other => panic!("expected a match, got {:?}", other),
        }
    }
}

mod balances {
    use super::*;

    #[test]
    fn battle_reward_during_a_build_is_kept() {
        let fx = Fixture::new(2);
        let _a = fx.runtime.connect(A);
        let _b = fx.runtime.connect(B);
        fx.duel();

        // B walks out while A's build is between its balance check and its commit
        let runtime = fx.runtime.clone();
        fx.store.before_build(move || {
            runtime.battles().leave(B).unwrap();
        });
        fx.runtime.progression().build(A, TOWER, 0, 0, 0).unwrap();

        let player = fx.db.read_player(A).unwrap();
        assert_eq!(player.crystals, 10_000 + 250 - 200);
        assert_eq!(player.xp, 100);
    }

    #[test]
    fn build_is_refused_below_the_stored_balance() {
        let fx = Fixture::new(2);
        let mut poor = fx.db.read_player(A).unwrap();
        poor.crystals = 150;
        fx.db.write_player(&poor).unwrap();

        let err = fx.runtime.progression().build(A, TOWER, 0, 0, 0).unwrap_err();

        assert!(matches!(err, CoreError::Validation(_)));
        assert_eq!(fx.db.read_player(A).unwrap().crystals, 150);
    }
}

mod matching {
    use super::*;

    #[test]
    fn disconnect_while_the_battle_opens_starts_the_grace_period() {
        let fx = Fixture::new(2);
        let a = fx.runtime.connect(A);
        let _b = fx.runtime.connect(B);

        // A's connection state was already sampled when B's player row is read
        let runtime = fx.runtime.clone();
        let connection = a.connection_id;
        fx.store.on_read_player(B, move || runtime.disconnect(A, connection));
        let battle_id = fx.duel();

        let view = fx.runtime.battles().view(battle_id).unwrap();
        let a_view = view.participants.iter().find(|p| p.player_id == A).unwrap();
        assert!(!a_view.connected);

        fx.clock.advance_secs(30);
        fx.runtime.battles().tick(fx.clock.now());

        let outcome = fx.db.get_battle_outcome(battle_id).unwrap().unwrap();
        assert_eq!(outcome.winner, Some(B));
        assert_eq!(outcome.reason, EndReason::Disconnected);
    }
}

mod commits {
    use super::*;

    #[test]
    fn battle_stays_readable_while_its_outcome_is_written() {
        let fx = Fixture::new(2);
        let _a = fx.runtime.connect(A);
        let _b = fx.runtime.connect(B);
        let battle_id = fx.duel();

        let seen = Arc::new(Mutex::new(None));
        let runtime = fx.runtime.clone();
        let record = seen.clone();
        fx.store.during_battle_commit(move || {
            let (tx, rx) = mpsc::channel();
            let reader = runtime.clone();
            thread::spawn(move || {
                let _ = tx.send(reader.battles().view(battle_id));
            });
            *record.lock().unwrap() = Some(rx.recv_timeout(Duration::from_secs(1)));
        });

        fx.runtime.battles().leave(B).unwrap();

        let seen = seen.lock().unwrap().take().expect("commit ran");
        let view = seen.expect("view blocked behind the commit").expect("battle exists");
        assert_eq!(view.state, BattleState::Resolving);
        assert_eq!(fx.runtime.battles().battle_of(A), None);
    }

    #[test]
    fn parallel_sweeps_apply_each_completion_once() {
        const PLAYERS: i64 = 4;
        const TOWERS: i32 = 3;
        let fx = Fixture::new(PLAYERS);
        for id in 1..=PLAYERS {
            for x in 0..TOWERS {
                fx.runtime.progression().build(PlayerId(id), TOWER, x, 0, 0).unwrap();
            }
        }

        fx.clock.advance_secs(60);
        let now = fx.clock.now();
        let reports: Vec<_> = thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| fx.runtime.progression().sweep(now)))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let applied: usize = reports.iter().map(|r| r.applied).sum();
        let already: usize = reports.iter().map(|r| r.already_applied).sum();
        assert_eq!(applied, (PLAYERS * TOWERS as i64) as usize);
        assert_eq!(already, 0);
        assert!(fx.runtime.progression().scheduler().is_empty());
        for id in 1..=PLAYERS {
            let player = fx.db.read_player(PlayerId(id)).unwrap();
            assert_eq!(player.xp, 10 * TOWERS as i64);
            assert_eq!(player.crystals, 10_000 - 200 * TOWERS as i64);
        }
    }
}

#[test]
fn hook_store_passes_errors_through() {
    let fx = Fixture::new(1);
    let err = fx.store.read_player(PlayerId(9)).unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}
