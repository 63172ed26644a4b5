//! Listener registry and the channel-backed listener.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;

use crate::types::{Event, Message, Presence, Status};

/// Receives events from a [`SubscriptionManager`](crate::SubscriptionManager).
///
/// Callbacks run on the dispatch task, one listener at a time. A slow listener
/// delays the others but never the long-poll loop (up to the delivery queue
/// capacity). Every method defaults to a no-op.
pub trait Listener: Send + Sync {
    fn on_status(&self, _status: Arc<Status>) {}
    fn on_message(&self, _message: Arc<Message>) {}
    fn on_presence(&self, _presence: Arc<Presence>) {}
}

/// Identity of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

type Listeners = BTreeMap<ListenerId, Arc<dyn Listener>>;

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Listeners>,
}

impl ListenerRegistry {
    pub(crate) fn add(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write().insert(id, listener);
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        self.write().remove(&id).is_some()
    }

    pub(crate) fn remove_all(&self) {
        self.write().clear();
    }

    /// Registered listeners in registration order.
    pub(crate) fn ids(&self) -> Vec<ListenerId> {
        self.read().keys().copied().collect()
    }

    pub(crate) fn announce_status(&self, status: Arc<Status>) {
        for listener in self.snapshot() {
            listener.on_status(Arc::clone(&status));
        }
    }

    pub(crate) fn announce_message(&self, message: Arc<Message>) {
        for listener in self.snapshot() {
            listener.on_message(Arc::clone(&message));
        }
    }

    pub(crate) fn announce_presence(&self, presence: Arc<Presence>) {
        for listener in self.snapshot() {
            listener.on_presence(Arc::clone(&presence));
        }
    }

    // Callbacks run without the lock held so listeners can add or remove
    // listeners from inside a callback.
    fn snapshot(&self) -> Vec<Arc<dyn Listener>> {
        self.read().values().cloned().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, Listeners> {
        self.listeners.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Listeners> {
        self.listeners.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Listener that forwards every event into an unbounded channel.
///
/// ```no_run
/// # async fn example(manager: pubnub_subscriber::SubscriptionManager) {
/// use pubnub_subscriber::{ChannelListener, Event};
///
/// let (listener, mut events) = ChannelListener::new();
/// manager.add_listener(listener);
/// while let Some(event) = events.next().await {
///     if let Event::Message(msg) = event {
///         println!("{}: {}", msg.channel, msg.message);
///     }
/// }
/// # }
/// ```
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), EventReceiver { rx })
    }

    fn forward(&self, event: Event) {
        // The receiver may have been dropped; the listener then goes quiet.
        let _ = self.tx.send(event);
    }
}

impl Listener for ChannelListener {
    fn on_status(&self, status: Arc<Status>) {
        self.forward(Event::Status(status));
    }

    fn on_message(&self, message: Arc<Message>) {
        self.forward(Event::Message(message));
    }

    fn on_presence(&self, presence: Arc<Presence>) {
        self.forward(Event::Presence(presence));
    }
}

/// Receiving half of a [`ChannelListener`].
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventReceiver {
    /// Receive the next event. Returns `None` once the listener is dropped by
    /// every registry holding it.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Receive an event if one is already queued.
    pub fn try_next(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}
