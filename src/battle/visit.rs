//! Island visits.
//!
//! A guest asks a host for a visit; once the host accepts, both are in an
//! untimed session that lasts until the guest leaves, the host kicks the
//! guest, or either of them disconnects. While it lasts, state either side
//! forwards is relayed to the other.

use super::{BattleCoordinator, Tables};
use crate::error::{CoreError, CoreResult};
use crate::models::*;

impl BattleCoordinator {
    /// Handle one step of the visit handshake from `sender` to `target`. The
    /// step is relayed to `target` once accepted.
    pub fn visit(&self, sender: PlayerId, target: PlayerId, request: VisitRequest) -> CoreResult<()> {
        if sender == target {
            return Err(CoreError::validation("cannot visit your own island"));
        }
        if matches!(request, VisitRequest::Request | VisitRequest::Accept)
            && !self.registry.is_online(target)
        {
            return Err(CoreError::not_found(format!("player {} is not online", target)));
        }

        {
            let mut tables = self.tables.lock().expect("battle table lock poisoned");
            match request {
                VisitRequest::Request => {
                    tables.ensure_idle(sender)?;
                    tables.visit_requests.insert((sender, target));
                }
                VisitRequest::Decline => {
                    if !tables.visit_requests.remove(&(target, sender)) {
                        return Err(no_request(target));
                    }
                }
                VisitRequest::Accept => {
                    if !tables.visit_requests.contains(&(target, sender)) {
                        return Err(no_request(target));
                    }
                    tables.ensure_idle(sender)?;
                    tables.ensure_idle(target)?;
                    // the guest's other requests lapse with this visit
                    tables.visit_requests.retain(|(guest, _)| *guest != target);

                    let visit = Visit {
                        host: sender,
                        guest: target,
                    };
                    tables.visits.insert(sender, visit);
                    tables.visits.insert(target, visit);
                    tracing::info!(host = %sender, guest = %target, "Island visit started");
                }
                VisitRequest::Leave | VisitRequest::Kick => {
                    let visit = current_visit(&tables, sender, target)?;
                    let allowed = match request {
                        VisitRequest::Leave => visit.guest == sender,
                        _ => visit.host == sender,
                    };
                    if !allowed {
                        return Err(CoreError::validation(match request {
                            VisitRequest::Leave => "only the guest can leave a visit",
                            _ => "only the host can end a visit with kick",
                        }));
                    }
                    tables.visits.remove(&visit.host);
                    tables.visits.remove(&visit.guest);
                    tracing::info!(host = %visit.host, guest = %visit.guest, "Island visit ended");
                }
            }
        }

        self.registry
            .send(target, OutboundEvent::IslandVisit { sender, request });
        Ok(())
    }

    /// Relay opaque state to the other side of `sender`'s visit.
    pub fn visit_forward(&self, sender: PlayerId, data: serde_json::Value) -> CoreResult<()> {
        let partner = {
            let tables = self.tables.lock().expect("battle table lock poisoned");
            tables
                .visits
                .get(&sender)
                .and_then(|visit| visit.partner_of(sender))
        }
        .ok_or_else(|| CoreError::not_found(format!("player {} is not on an island visit", sender)))?;

        self.registry
            .send(partner, OutboundEvent::VisitForwarded { sender, data });
        Ok(())
    }

    /// The visit `player` takes part in, if any.
    pub fn visit_of(&self, player: PlayerId) -> Option<Visit> {
        let tables = self.tables.lock().expect("battle table lock poisoned");
        tables.visits.get(&player).copied()
    }

    /// End the visit of a player whose channel went away and forget its
    /// pending requests. The partner is told the player left.
    pub(super) fn drop_visits(&self, player: PlayerId) {
        let partner = {
            let mut tables = self.tables.lock().expect("battle table lock poisoned");
            tables
                .visit_requests
                .retain(|(guest, host)| *guest != player && *host != player);
            let visit = tables.visits.remove(&player);
            let partner = visit.and_then(|v| v.partner_of(player));
            if let Some(partner) = partner {
                tables.visits.remove(&partner);
            }
            partner
        };

        if let Some(partner) = partner {
            tracing::info!(player_id = %player, partner = %partner, "Disconnected, island visit ended");
            self.registry.send(
                partner,
                OutboundEvent::IslandVisit {
                    sender: player,
                    request: VisitRequest::Leave,
                },
            );
        }
    }
}

fn no_request(guest: PlayerId) -> CoreError {
    CoreError::not_found(format!("no visit request from player {}", guest))
}

fn current_visit(tables: &Tables, sender: PlayerId, target: PlayerId) -> CoreResult<Visit> {
    tables
        .visits
        .get(&sender)
        .copied()
        .filter(|visit| visit.partner_of(sender) == Some(target))
        .ok_or_else(|| {
            CoreError::not_found(format!(
                "player {} is not on an island visit with player {}",
                sender, target
            ))
        })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::battle::Presence;
    use crate::clock::ManualClock;
    use crate::config::CoreConfig;
    use crate::db::Database;
    use crate::registry::{ChannelHandle, SessionRegistry};

    const HOST: PlayerId = PlayerId(1);
    const GUEST: PlayerId = PlayerId(2);

    fn coordinator() -> (BattleCoordinator, Arc<SessionRegistry>) {
        let db = Database::open_memory().unwrap();
        db.migrate().unwrap();
        let registry = Arc::new(SessionRegistry::new(16));
        registry.start();
        let battles = BattleCoordinator::new(
            Arc::new(db),
            Arc::new(ManualClock::at_epoch()),
            registry.clone(),
            &CoreConfig::default(),
        );
        (battles, registry)
    }

    fn last_visit_event(handle: &ChannelHandle) -> Option<(PlayerId, VisitRequest)> {
        handle.outbox.drain().into_iter().rev().find_map(|e| match e {
            OutboundEvent::IslandVisit { sender, request } => Some((sender, request)),
            _ => None,
        })
    }

    fn start_visit(battles: &BattleCoordinator) {
        battles.visit(GUEST, HOST, VisitRequest::Request).unwrap();
        battles.visit(HOST, GUEST, VisitRequest::Accept).unwrap();
    }

    #[test]
    fn request_and_accept_start_a_visit() {
        let (battles, registry) = coordinator();
        let host = registry.connect(HOST);
        let guest = registry.connect(GUEST);

        battles.visit(GUEST, HOST, VisitRequest::Request).unwrap();
        assert_eq!(last_visit_event(&host), Some((GUEST, VisitRequest::Request)));

        battles.visit(HOST, GUEST, VisitRequest::Accept).unwrap();
        assert_eq!(last_visit_event(&guest), Some((HOST, VisitRequest::Accept)));
        assert_eq!(
            battles.visit_of(GUEST),
            Some(Visit {
                host: HOST,
                guest: GUEST
            })
        );
        assert_eq!(battles.presence(HOST), Presence::Visiting);
        assert_eq!(battles.presence(GUEST), Presence::Visiting);
    }

    #[test]
    fn accept_needs_a_request() {
        let (battles, registry) = coordinator();
        let _host = registry.connect(HOST);
        let _guest = registry.connect(GUEST);

        let err = battles.visit(HOST, GUEST, VisitRequest::Accept).unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        assert_eq!(battles.visit_of(GUEST), None);
    }

    #[test]
    fn declined_request_cannot_be_accepted() {
        let (battles, registry) = coordinator();
        let _host = registry.connect(HOST);
        let guest = registry.connect(GUEST);

        battles.visit(GUEST, HOST, VisitRequest::Request).unwrap();
        battles.visit(HOST, GUEST, VisitRequest::Decline).unwrap();
        assert_eq!(last_visit_event(&guest), Some((HOST, VisitRequest::Decline)));

        assert!(battles.visit(HOST, GUEST, VisitRequest::Accept).is_err());
    }

    #[test]
    fn offline_hosts_cannot_be_asked() {
        let (battles, registry) = coordinator();
        let _guest = registry.connect(GUEST);

        let err = battles.visit(GUEST, HOST, VisitRequest::Request).unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn only_the_guest_leaves_and_only_the_host_kicks() {
        let (battles, registry) = coordinator();
        let host = registry.connect(HOST);
        let _guest = registry.connect(GUEST);
        start_visit(&battles);

        assert!(battles.visit(HOST, GUEST, VisitRequest::Leave).is_err());
        assert!(battles.visit(GUEST, HOST, VisitRequest::Kick).is_err());

        battles.visit(GUEST, HOST, VisitRequest::Leave).unwrap();
        assert_eq!(last_visit_event(&host), Some((GUEST, VisitRequest::Leave)));
        assert_eq!(battles.presence(HOST), Presence::Online);
        assert_eq!(battles.presence(GUEST), Presence::Online);
    }

    #[test]
    fn visitors_cannot_queue_for_battle() {
        let (battles, registry) = coordinator();
        let _host = registry.connect(HOST);
        let _guest = registry.connect(GUEST);
        start_visit(&battles);

        let err = battles.enqueue(GUEST).unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        assert_eq!(battles.queue_len(), 0);
    }

    #[test]
    fn queued_players_cannot_accept() {
        let (battles, registry) = coordinator();
        let _host = registry.connect(HOST);
        let _guest = registry.connect(GUEST);
        battles.visit(GUEST, HOST, VisitRequest::Request).unwrap();
        battles.enqueue(HOST).unwrap();

        let err = battles.visit(HOST, GUEST, VisitRequest::Accept).unwrap_err();
        assert_eq!(err, CoreError::AlreadyQueued(HOST));
    }

    #[test]
    fn forwarded_state_reaches_the_partner() {
        let (battles, registry) = coordinator();
        let host = registry.connect(HOST);
        let _guest = registry.connect(GUEST);
        start_visit(&battles);
        host.outbox.drain();

        battles
            .visit_forward(GUEST, serde_json::json!({"pos": [1, 2]}))
            .unwrap();

        match host.outbox.try_recv() {
            Some(OutboundEvent::VisitForwarded { sender, data }) => {
                assert_eq!(sender, GUEST);
                assert_eq!(data["pos"][1], 2);
            }
            other => panic!("expected visit_forwarded, got {:?}", other),
        }
        assert!(battles.visit_forward(PlayerId(3), serde_json::json!(null)).is_err());
    }

    #[test]
    fn disconnect_ends_the_visit() {
        let (battles, registry) = coordinator();
        let host = registry.connect(HOST);
        let _guest = registry.connect(GUEST);
        start_visit(&battles);

        registry.unregister(GUEST);
        battles.handle_disconnect(GUEST);

        assert_eq!(last_visit_event(&host), Some((GUEST, VisitRequest::Leave)));
        assert_eq!(battles.visit_of(HOST), None);
        assert_eq!(battles.presence(HOST), Presence::Online);
    }
}
