//! Global chat.
//!
//! A message is bound to the identity of the channel that sent it, stored
//! through the persistence adapter and then broadcast to every connected
//! player, the sender included. A message the store rejects is not broadcast.

use std::sync::Arc;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::models::*;
use crate::registry::SessionRegistry;
use crate::store::PersistenceAdapter;

pub struct ChatRelay {
    store: Arc<dyn PersistenceAdapter>,
    clock: Arc<dyn Clock>,
    registry: Arc<SessionRegistry>,
}

impl ChatRelay {
    pub fn new(
        store: Arc<dyn PersistenceAdapter>,
        clock: Arc<dyn Clock>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            store,
            clock,
            registry,
        }
    }

    pub fn post(&self, sender: PlayerId, text: &str) -> CoreResult<ChatMessage> {
        let message =
            NewChatMessage::new(sender, text, self.clock.now()).map_err(CoreError::Validation)?;
        let stored = self.store.save_chat_message(&message)?;

        let delivered = self
            .registry
            .broadcast(&OutboundEvent::ChatMessage(stored.clone()));
        tracing::debug!(player_id = %sender, message_id = stored.id, delivered, "Chat message sent");
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::clock::ManualClock;
    use crate::db::Database;

    fn relay() -> (ChatRelay, Database, Arc<SessionRegistry>) {
        let db = Database::open_memory().unwrap();
        db.migrate().unwrap();
        for id in 1..=2 {
            db.create_player(CreatePlayerInput {
                id: PlayerId(id),
                crystals: 0,
                xp: 0,
                mana: 0,
                now: DateTime::<Utc>::UNIX_EPOCH,
            })
            .unwrap();
        }
        let registry = Arc::new(SessionRegistry::new(8));
        registry.start();
        let relay = ChatRelay::new(
            Arc::new(db.clone()),
            Arc::new(ManualClock::at_epoch()),
            registry.clone(),
        );
        (relay, db, registry)
    }

    #[test]
    fn messages_are_stored_and_broadcast() {
        let (relay, db, registry) = relay();
        let a = registry.connect(PlayerId(1));
        let b = registry.connect(PlayerId(2));

        let sent = relay.post(PlayerId(1), " gg ").unwrap();

        assert_eq!(sent.message, "gg");
        assert_eq!(a.outbox.drain(), vec![OutboundEvent::ChatMessage(sent.clone())]);
        assert_eq!(b.outbox.drain(), vec![OutboundEvent::ChatMessage(sent.clone())]);
        assert_eq!(db.chat_history(10).unwrap(), vec![sent]);
    }

    #[test]
    fn invalid_messages_go_nowhere() {
        let (relay, db, registry) = relay();
        let b = registry.connect(PlayerId(2));

        let err = relay.post(PlayerId(1), "   ").unwrap_err();

        assert!(matches!(err, CoreError::Validation(_)));
        assert!(b.outbox.is_empty());
        assert!(db.chat_history(10).unwrap().is_empty());
    }

    #[test]
    fn unknown_senders_are_rejected_by_the_store() {
        let (relay, _db, registry) = relay();
        let b = registry.connect(PlayerId(2));

        let err = relay.post(PlayerId(99), "hello").unwrap_err();

        assert!(matches!(err, CoreError::Persistence(_)));
        assert!(b.outbox.is_empty());
    }
}
