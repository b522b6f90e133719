//! Session Registry.
//!
//! Maps each connected identity to its live channel. Exactly one channel per
//! identity is authoritative: registering again replaces (and closes) the
//! previous one.
//!
//! Events for a channel go through its [`Outbox`], a bounded queue that drops
//! the oldest event when a slow client lets it fill up. Producers never wait
//! on a client.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::Notify;
use uuid::Uuid;

use crate::models::{OutboundEvent, PlayerId};

/// Bounded per-connection queue of outbound events.
#[derive(Debug)]
pub struct Outbox {
    queue: Mutex<VecDeque<OutboundEvent>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue an event. Returns `false` if the outbox is closed.
    pub fn push(&self, event: OutboundEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        {
            let mut queue = self.queue.lock().expect("outbox lock poisoned");
            if queue.len() >= self.capacity {
                if let Some(oldest) = queue.pop_front() {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        event = oldest.name(),
                        dropped,
                        "Outbox full, dropping oldest event"
                    );
                }
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
        true
    }

    pub fn try_recv(&self) -> Option<OutboundEvent> {
        self.queue.lock().expect("outbox lock poisoned").pop_front()
    }

    /// Wait for the next event. Returns `None` once the outbox is closed and
    /// drained.
    pub async fn recv(&self) -> Option<OutboundEvent> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Everything queued right now.
    pub fn drain(&self) -> Vec<OutboundEvent> {
        self.queue
            .lock()
            .expect("outbox lock poisoned")
            .drain(..)
            .collect()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("outbox lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The live channel of one connection.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    pub connection_id: Uuid,
    pub outbox: Arc<Outbox>,
}

impl ChannelHandle {
    pub fn new(outbox: Arc<Outbox>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            outbox,
        }
    }

    pub fn send(&self, event: OutboundEvent) -> bool {
        self.outbox.push(event)
    }
}

pub struct SessionRegistry {
    channels: RwLock<HashMap<PlayerId, ChannelHandle>>,
    outbox_capacity: usize,
    running: AtomicBool,
}

impl SessionRegistry {
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            outbox_capacity,
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
        tracing::info!("Session registry started");
    }

    /// Close every channel and forget all identities.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let drained: Vec<ChannelHandle> = {
            let mut channels = self.channels.write().expect("registry lock poisoned");
            channels.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &drained {
            handle.outbox.close();
        }
        tracing::info!(closed = drained.len(), "Session registry stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Register a fresh channel for `identity`, replacing any previous one.
    pub fn connect(&self, identity: PlayerId) -> ChannelHandle {
        let handle = ChannelHandle::new(Arc::new(Outbox::new(self.outbox_capacity)));
        self.register(identity, handle.clone());
        handle
    }

    /// Make `handle` the authoritative channel of `identity`. The replaced
    /// channel, if any, is closed and returned.
    pub fn register(&self, identity: PlayerId, handle: ChannelHandle) -> Option<ChannelHandle> {
        let connection_id = handle.connection_id;
        let previous = {
            let mut channels = self.channels.write().expect("registry lock poisoned");
            channels.insert(identity, handle)
        };

        match &previous {
            Some(old) => {
                old.outbox.close();
                tracing::info!(
                    player_id = %identity,
                    %connection_id,
                    replaced = %old.connection_id,
                    "Channel replaced"
                );
            }
            None => tracing::info!(player_id = %identity, %connection_id, "Channel registered"),
        }
        previous
    }

    /// Remove the channel of `identity`, whatever connection it belongs to.
    pub fn unregister(&self, identity: PlayerId) -> Option<ChannelHandle> {
        let removed = self
            .channels
            .write()
            .expect("registry lock poisoned")
            .remove(&identity);
        if let Some(handle) = &removed {
            handle.outbox.close();
            tracing::info!(player_id = %identity, connection_id = %handle.connection_id, "Channel unregistered");
        }
        removed
    }

    /// Remove the channel of `identity` only if it still is `connection_id`.
    /// A connection that was replaced must not take its successor down with it.
    pub fn unregister_connection(&self, identity: PlayerId, connection_id: Uuid) -> bool {
        let removed = {
            let mut channels = self.channels.write().expect("registry lock poisoned");
            match channels.get(&identity) {
                Some(handle) if handle.connection_id == connection_id => channels.remove(&identity),
                _ => None,
            }
        };
        match removed {
            Some(handle) => {
                handle.outbox.close();
                tracing::info!(player_id = %identity, %connection_id, "Channel unregistered");
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, identity: PlayerId) -> Option<ChannelHandle> {
        self.channels
            .read()
            .expect("registry lock poisoned")
            .get(&identity)
            .cloned()
    }

    pub fn is_online(&self, identity: PlayerId) -> bool {
        self.channels
            .read()
            .expect("registry lock poisoned")
            .contains_key(&identity)
    }

    /// Push an event to `identity` if connected. Returns whether it was queued.
    pub fn send(&self, identity: PlayerId, event: OutboundEvent) -> bool {
        match self.lookup(identity) {
            Some(handle) => handle.send(event),
            None => {
                tracing::debug!(player_id = %identity, event = event.name(), "Recipient offline, event not delivered");
                false
            }
        }
    }

    /// Push an event to every connected identity. Returns how many queued it.
    pub fn broadcast(&self, event: &OutboundEvent) -> usize {
        let handles: Vec<ChannelHandle> = self
            .channels
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        handles
            .iter()
            .filter(|handle| handle.send(event.clone()))
            .count()
    }

    pub fn online_count(&self) -> usize {
        self.channels.read().expect("registry lock poisoned").len()
    }
}
