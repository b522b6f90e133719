use std::sync::Arc;

use chrono::{DateTime, Utc};
use island_realtime::battle::Presence;
use island_realtime::clock::{Clock, ManualClock};
use island_realtime::config::CoreConfig;
use island_realtime::db::Database;
use island_realtime::error::{CoreError, ErrorKind};
use island_realtime::models::*;
use island_realtime::registry::ChannelHandle;
use island_realtime::runtime::GameRuntime;

const A: PlayerId = PlayerId(1);
const B: PlayerId = PlayerId(2);

fn setup() -> (Arc<GameRuntime>, Arc<ManualClock>) {
    let db = Database::open_memory().expect("Failed to create database");
    db.migrate().expect("Failed to migrate");
    for id in [A, B] {
        db.create_player(CreatePlayerInput {
            id,
            crystals: 1000,
            xp: 0,
            mana: 0,
            now: DateTime::<Utc>::UNIX_EPOCH,
        })
        .expect("Failed to create player");
    }

    let clock = Arc::new(ManualClock::at_epoch());
    let runtime = Arc::new(GameRuntime::new(CoreConfig::default(), Arc::new(db), clock.clone()));
    runtime.open().expect("Failed to open runtime");
    (runtime, clock)
}

fn names(handle: &ChannelHandle) -> Vec<&'static str> {
    handle.outbox.drain().iter().map(|e| e.name()).collect()
}

fn parse(json: &str) -> InboundEvent {
    serde_json::from_str(json).expect("Failed to parse inbound event")
}

mod channel {
    use super::*;

    #[test]
    fn connect_sends_the_island() {
        let (runtime, _) = setup();

        let handle = runtime.connect(A);

        let snapshot = match handle.outbox.try_recv().unwrap() {
            OutboundEvent::IslandState(snapshot) => snapshot,
            other => panic!("expected island_state, got {}", other.name()),
        };
        assert_eq!(snapshot.player.id, A);
        assert_eq!(snapshot.player.crystals, 1000);
        assert_eq!(runtime.presence(A), Presence::Online);
    }

    #[test]
    fn reconnect_replaces_the_old_channel() {
        let (runtime, _) = setup();
        let old = runtime.connect(A);
        let new = runtime.connect(A);

        assert!(old.outbox.is_closed());

        // the replaced connection going away must not take the new one down
        runtime.disconnect(A, old.connection_id);
        assert_eq!(runtime.presence(A), Presence::Online);

        runtime.disconnect(A, new.connection_id);
        assert_eq!(runtime.presence(A), Presence::Offline);
    }
}

mod dispatch {
    use super::*;

    #[test]
    fn build_is_announced() {
        let (runtime, _) = setup();
        let handle = runtime.connect(A);
        handle.outbox.drain();

        runtime
            .dispatch(
                A,
                parse(r#"{"action":"build","payload":{"blueprint_id":3,"x":1,"z":2}}"#),
            )
            .unwrap();

        assert_eq!(names(&handle), vec!["task_scheduled", "resource_update"]);
        assert_eq!(runtime.progression().scheduler().len(), 1);
    }

    #[test]
    fn failures_are_reported_to_the_sender() {
        let (runtime, _) = setup();
        let handle = runtime.connect(A);
        handle.outbox.drain();

        let err = runtime
            .dispatch(
                A,
                InboundEvent::Upgrade {
                    placeable_id: PlaceableId(999),
                },
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::Persistence(_)));

        let events = handle.outbox.drain();
        assert_eq!(events.len(), 1);
        match &events[0] {
            OutboundEvent::Error { kind, action, .. } => {
                assert_eq!(*kind, ErrorKind::NotFound);
                assert_eq!(action, "upgrade");
            }
            other => panic!("expected error, got {}", other.name()),
        }
    }

    #[test]
    fn sync_returns_the_island() {
        let (runtime, _) = setup();
        let handle = runtime.connect(A);
        handle.outbox.drain();

        runtime.dispatch(A, parse(r#"{"action":"sync"}"#)).unwrap();

        assert_eq!(names(&handle), vec!["island_state"]);
    }

    #[test]
    fn cancel_resends_the_island() {
        let (runtime, _) = setup();
        let handle = runtime.connect(A);
        let (_, task) = runtime.progression().build(A, BlueprintId(3), 0, 0, 0).unwrap();
        handle.outbox.drain();

        runtime
            .dispatch(A, InboundEvent::CancelTask { task_id: task.id })
            .unwrap();

        let events = handle.outbox.drain();
        let Some(OutboundEvent::IslandState(snapshot)) = events.last() else {
            panic!("expected island_state");
        };
        assert!(snapshot.tasks.is_empty());
        // no refund
        assert_eq!(snapshot.player.crystals, 800);
    }

    #[test]
    fn battle_actions_reach_the_coordinator() {
        let (runtime, _) = setup();
        let a = runtime.connect(A);
        let b = runtime.connect(B);

        runtime.dispatch(A, parse(r#"{"action":"battle_enqueue"}"#)).unwrap();
        runtime.dispatch(B, InboundEvent::BattleEnqueue).unwrap();
        assert_eq!(runtime.presence(A), Presence::InBattle);
        a.outbox.drain();
        b.outbox.drain();

        runtime
            .dispatch(
                A,
                parse(r#"{"action":"battle_action","payload":{"type":"attack","target":2,"damage":50}}"#),
            )
            .unwrap();
        assert_eq!(names(&b), vec!["battle_state"]);

        let err = runtime.dispatch(A, InboundEvent::BattleEnqueue).unwrap_err();
        assert_eq!(err, CoreError::AlreadyInBattle(A));
        let events = a.outbox.drain();
        assert!(matches!(
            events.last(),
            Some(OutboundEvent::Error { kind: ErrorKind::Conflict, .. })
        ));

        runtime.dispatch(B, InboundEvent::BattleLeave).unwrap();
        assert!(names(&a).contains(&"battle_ended"));
        assert_eq!(runtime.presence(A), Presence::Online);
    }

    #[test]
    fn dropped_participant_forfeits_after_grace() {
        let (runtime, clock) = setup();
        let a = runtime.connect(A);
        let b = runtime.connect(B);
        runtime.battles().enqueue(A).unwrap();
        runtime.battles().enqueue(B).unwrap();
        a.outbox.drain();

        runtime.disconnect(B, b.connection_id);
        clock.advance_secs(30);
        runtime.battles().tick(runtime.clock().now());

        let ended = a.outbox.drain().into_iter().find_map(|e| match e {
            OutboundEvent::BattleEnded { winner, reason, .. } => Some((winner, reason)),
            _ => None,
        });
        assert_eq!(ended, Some((Some(A), EndReason::Disconnected)));
    }
}

mod social {
    use super::*;

    #[test]
    fn chat_reaches_every_channel() {
        let (runtime, _) = setup();
        let a = runtime.connect(A);
        let b = runtime.connect(B);
        a.outbox.drain();
        b.outbox.drain();

        runtime
            .dispatch(A, parse(r#"{"action":"chat","payload":{"message":"  gg  "}}"#))
            .unwrap();

        for handle in [&a, &b] {
            let events = handle.outbox.drain();
            assert!(matches!(
                &events[..],
                [OutboundEvent::ChatMessage(m)] if m.sender == A && m.message == "gg"
            ));
        }
    }

    #[test]
    fn visits_are_negotiated_over_the_channel() {
        let (runtime, _) = setup();
        let a = runtime.connect(A);
        let b = runtime.connect(B);
        a.outbox.drain();
        b.outbox.drain();

        runtime
            .dispatch(A, parse(r#"{"action":"island_visit","payload":{"target":2,"request":"request"}}"#))
            .unwrap();
        assert_eq!(names(&b), vec!["island_visit"]);

        runtime
            .dispatch(B, parse(r#"{"action":"island_visit","payload":{"target":1,"request":"accept"}}"#))
            .unwrap();
        assert_eq!(names(&a), vec!["island_visit"]);
        assert_eq!(runtime.presence(A), Presence::Visiting);
        assert_eq!(runtime.presence(B), Presence::Visiting);

        runtime
            .dispatch(A, parse(r#"{"action":"visit_forward","payload":{"data":{"camera":[1,2]}}}"#))
            .unwrap();
        let events = b.outbox.drain();
        assert!(matches!(
            &events[..],
            [OutboundEvent::VisitForwarded { sender, .. }] if *sender == A
        ));

        runtime.disconnect(A, a.connection_id);
        assert_eq!(runtime.presence(B), Presence::Online);
    }

    #[test]
    fn equip_gem_reports_an_unknown_gem() {
        let (runtime, _) = setup();
        let handle = runtime.connect(A);
        handle.outbox.drain();

        let err = runtime
            .dispatch(A, parse(r#"{"action":"equip_gem","payload":{"gem_id":77,"building_id":1}}"#))
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(matches!(
            handle.outbox.drain().last(),
            Some(OutboundEvent::Error { action, .. }) if action == "equip_gem"
        ));
    }
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn start_and_stop() {
        let (runtime, _) = setup();
        runtime.start().unwrap();
        let handle = runtime.connect(A);

        runtime.stop().await;

        assert!(handle.outbox.is_closed());
        assert!(!runtime.registry().is_running());
    }
}
