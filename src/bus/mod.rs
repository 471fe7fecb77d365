//! In-process event bus
//!
//! A typed pub/sub hub with one topic per mutable entity kind. The store
//! publishes a `{Created|Updated|Deleted, snapshot}` event after every
//! commit; UIs subscribe to drive refresh. Subscribers must drain
//! promptly: each topic is a `tokio::sync::broadcast` channel, so a slow
//! subscriber lags and drops events rather than stalling publishers.

use crate::message::Message;
use crate::permission::PermissionRequest;
use crate::session::{FileVersion, Session};
use tokio::sync::broadcast;

/// Per-topic channel capacity.
const TOPIC_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

/// A committed mutation, carrying the entity snapshot as of the commit.
#[derive(Debug, Clone)]
pub struct Event<T> {
    pub kind: EventKind,
    pub payload: T,
}

/// One entity kind's broadcast channel.
pub struct Topic<T> {
    tx: broadcast::Sender<Event<T>>,
}

impl<T: Clone> Topic<T> {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(TOPIC_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event<T>> {
        self.tx.subscribe()
    }

    /// Publish to all current subscribers. Returns the number of
    /// receivers; with no subscribers the event is silently dropped.
    pub fn publish(&self, kind: EventKind, payload: T) -> usize {
        self.tx.send(Event { kind, payload }).unwrap_or(0)
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// The hub: one topic per entity kind. Events within a topic are FIFO per
/// entity; there is no cross-topic ordering.
pub struct Bus {
    pub sessions: Topic<Session>,
    pub messages: Topic<Message>,
    pub permissions: Topic<PermissionRequest>,
    pub files: Topic<FileVersion>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            sessions: Topic::new(),
            messages: Topic::new(),
            permissions: Topic::new(),
            files: Topic::new(),
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = Bus::new();
        let mut rx = bus.sessions.subscribe();

        let session = Session::new(None);
        let delivered = bus.sessions.publish(EventKind::Created, session.clone());
        assert_eq!(delivered, 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Created);
        assert_eq!(event.payload.id, session.id);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = Bus::new();
        let delivered = bus.sessions.publish(EventKind::Updated, Session::new(None));
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn events_are_fifo_per_topic() {
        let bus = Bus::new();
        let mut rx = bus.messages.subscribe();

        let mut msg = Message::user("s1", "one");
        bus.messages.publish(EventKind::Created, msg.clone());
        msg.append_text(" two");
        bus.messages.publish(EventKind::Updated, msg.clone());

        assert_eq!(rx.recv().await.unwrap().kind, EventKind::Created);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, EventKind::Updated);
        assert_eq!(second.payload.text(), "one two");
    }

    #[tokio::test]
    async fn topics_are_independent() {
        let bus = Bus::new();
        let mut sessions = bus.sessions.subscribe();
        bus.messages.publish(EventKind::Created, Message::user("s1", "hi"));
        assert!(matches!(
            sessions.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
