//! Public entry point: [`SubscriptionManager`].

use std::sync::{Arc, Weak};

use tokio::runtime::Handle;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::PayloadCodec;
use crate::config::Config;
use crate::connection::{LoopContext, run_subscribe_loop};
use crate::dispatch::{Announcer, run_dispatcher};
use crate::heartbeat::Heartbeat;
use crate::listener::{Listener, ListenerId, ListenerRegistry};
use crate::reconnection::{Backoff, ReconnectionEvent, ReconnectionPolicy, run_poller};
use crate::state::{Cursor, SharedState, SubscriptionSet};
use crate::transport::Transport;
use crate::types::{
    Error, Operation, StateOperation, Status, StatusCategory, SubscribeOperation,
    UnsubscribeOperation,
};

/// Handle to a subscribe session.
///
/// Mutations ([`subscribe`](Self::subscribe), [`unsubscribe`](Self::unsubscribe),
/// [`set_state`](Self::set_state)) update the subscription set and restart
/// the long-poll loop against it. Their outcome is reported to listeners as
/// [`Status`] events, never as a return value.
///
/// Clone is a cheap Arc refcount bump. The session is torn down by
/// [`destroy`](Self::destroy) or when the last clone is dropped.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

struct Inner {
    runtime: Handle,
    transport: Transport,
    state: SharedState,
    listeners: Arc<ListenerRegistry>,
    announcer: Announcer,
    heartbeat: Heartbeat,
    overflow_count: usize,
    suppress_leave_events: bool,
    /// `None` when the reconnection policy is `None`.
    backoff: Option<Backoff>,
    reconnection_tx: mpsc::UnboundedSender<ReconnectionEvent>,
    /// Parent of every loop, poller and leave request.
    session: CancellationToken,
    listener_exit: CancellationToken,
    reconnection_exit: CancellationToken,
    /// Held across stop/mutate/start so restarts never overlap.
    tasks: Mutex<Tasks>,
}

#[derive(Default)]
struct Tasks {
    subscribe_loop: Option<(CancellationToken, JoinHandle<()>)>,
    poller: Option<(CancellationToken, JoinHandle<()>)>,
    destroyed: bool,
}

impl SubscriptionManager {
    /// Create an idle session. Must be called from within a Tokio runtime;
    /// nothing is requested until the first [`subscribe`](Self::subscribe).
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| Error::Config(format!("no tokio runtime: {e}")))?;

        let transport = Transport::new(&config)?;
        let state = SharedState::default();
        let listeners = Arc::new(ListenerRegistry::default());
        let (delivery_tx, delivery_rx) = mpsc::channel(config.timing.delivery_queue_capacity);
        let announcer = Announcer::new(delivery_tx);
        let session = CancellationToken::new();
        let heartbeat = Heartbeat::new(
            transport.clone(),
            state.clone(),
            announcer.clone(),
            config.heartbeat_interval,
            config.timing.heartbeat_drift_threshold,
            config.heartbeat_enabled(),
            session.clone(),
        );
        let backoff = (config.reconnection_policy != ReconnectionPolicy::None).then(|| {
            Backoff::new(
                config.reconnection_policy,
                &config.timing,
                config.maximum_reconnection_retries,
            )
        });
        let (reconnection_tx, reconnection_rx) = mpsc::unbounded_channel();

        let listener_exit = CancellationToken::new();
        let reconnection_exit = CancellationToken::new();
        let codec = PayloadCodec::new(config.cipher.clone(), config.disable_pn_other_processing);
        runtime.spawn(run_dispatcher(
            delivery_rx,
            Arc::clone(&listeners),
            codec,
            listener_exit.clone(),
        ));

        let inner = Arc::new(Inner {
            runtime,
            transport,
            state,
            listeners,
            announcer,
            heartbeat,
            overflow_count: config.message_queue_overflow_count,
            suppress_leave_events: config.suppress_leave_events,
            backoff,
            reconnection_tx,
            session,
            listener_exit,
            reconnection_exit: reconnection_exit.clone(),
            tasks: Mutex::new(Tasks::default()),
        });
        inner.runtime.spawn(supervise(
            Arc::downgrade(&inner),
            reconnection_rx,
            reconnection_exit,
        ));

        tracing::info!(
            policy = ?config.reconnection_policy,
            heartbeat = config.heartbeat_enabled(),
            "subscription manager created"
        );
        Ok(Self { inner })
    }

    // -----------------------------------------------------------------------
    // Subscription operations
    // -----------------------------------------------------------------------

    /// Add channels and groups and restart the loop against the new set.
    pub async fn subscribe(&self, op: SubscribeOperation) {
        tracing::info!(
            channels = ?op.channels,
            groups = ?op.channel_groups,
            presence = op.presence_enabled,
            timetoken = ?op.timetoken,
            "subscribe"
        );
        self.mutate(|s| s.adapt_subscribe(&op)).await;
    }

    /// Remove channels and groups. The local update always succeeds; the
    /// server is notified with a best-effort leave request in the background.
    pub async fn unsubscribe(&self, op: UnsubscribeOperation) {
        tracing::info!(channels = ?op.channels, groups = ?op.channel_groups, "unsubscribe");
        if !self.mutate(|s| s.adapt_unsubscribe(&op)).await {
            return;
        }
        if op.channels.is_empty() && op.channel_groups.is_empty() {
            return;
        }
        self.spawn_leave(op);
    }

    /// Replace the state of subscribed channels and groups.
    pub async fn set_state(&self, op: StateOperation) {
        tracing::debug!(channels = ?op.channels, groups = ?op.channel_groups, "set state");
        self.mutate(|s| s.adapt_state(&op)).await;
    }

    /// Unsubscribe every data and presence channel and group.
    pub async fn unsubscribe_all(&self) {
        let (channels, channel_groups) = self
            .inner
            .state
            .read(|s| (s.prepare_channel_list(true), s.prepare_group_list(true)));
        self.unsubscribe(UnsubscribeOperation {
            channels,
            channel_groups,
        })
        .await;
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start (or restart) polling against the current subscription set.
    pub async fn connect(&self) {
        self.mutate(|_| {}).await;
    }

    /// Restart the loop, heartbeat and poller without changing the set.
    pub async fn reconnect(&self) {
        tracing::debug!("reconnect");
        self.mutate(|_| {}).await;
    }

    /// Unsubscribe from everything and stop all background activity. The
    /// session can be reused with a later [`subscribe`](Self::subscribe).
    pub async fn disconnect(&self) {
        tracing::info!("disconnect");
        self.unsubscribe_all().await;
        let mut tasks = self.inner.tasks.lock().await;
        self.inner.stop_tasks(&mut tasks).await;
    }

    /// Cancel the session and shut down every background task. Listeners
    /// receive everything announced up to and including the final
    /// `Cancelled` status. Further operations are ignored.
    pub async fn destroy(&self) {
        let mut tasks = self.inner.tasks.lock().await;
        if tasks.destroyed {
            return;
        }
        tasks.destroyed = true;
        tracing::info!("destroying subscription manager");

        self.inner.session.cancel();
        self.inner.stop_tasks(&mut tasks).await;
        self.inner.listener_exit.cancel();
        self.inner.reconnection_exit.cancel();
    }

    /// Fetch the server time as a timetoken.
    pub async fn time(&self) -> Result<u64, Error> {
        self.inner.transport.time(&self.inner.session).await
    }

    // -----------------------------------------------------------------------
    // Listeners and introspection
    // -----------------------------------------------------------------------

    pub fn add_listener(&self, listener: Arc<dyn Listener>) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    /// Returns false if the listener was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    pub fn remove_all_listeners(&self) {
        self.inner.listeners.remove_all();
    }

    pub fn listeners(&self) -> Vec<ListenerId> {
        self.inner.listeners.ids()
    }

    /// Subscribed data channels, without presence companions.
    pub fn subscribed_channels(&self) -> Vec<String> {
        self.inner.state.read(|s| s.prepare_channel_list(false))
    }

    /// Subscribed data groups, without presence companions.
    pub fn subscribed_groups(&self) -> Vec<String> {
        self.inner.state.read(|s| s.prepare_group_list(false))
    }

    pub fn cursor(&self) -> Cursor {
        self.inner.state.read(SubscriptionSet::cursor)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Stop every task, apply `f`, start again. Returns false once destroyed.
    async fn mutate(&self, f: impl FnOnce(&mut SubscriptionSet)) -> bool {
        let mut tasks = self.inner.tasks.lock().await;
        if tasks.destroyed {
            tracing::warn!("operation on a destroyed subscription manager ignored");
            return false;
        }
        self.inner.stop_tasks(&mut tasks).await;
        self.inner.state.write(f);
        self.inner.start_tasks(&mut tasks).await;
        true
    }

    fn spawn_leave(&self, op: UnsubscribeOperation) {
        let transport = self.inner.transport.clone();
        let announcer = self.inner.announcer.clone();
        let cancel = self.inner.session.clone();
        let suppress = self.inner.suppress_leave_events;
        self.inner.runtime.spawn(async move {
            let UnsubscribeOperation {
                channels,
                channel_groups,
            } = op;
            if !suppress {
                match transport.leave(&channels, &channel_groups, &cancel).await {
                    Ok(_) => {}
                    Err(Error::Cancelled) => return,
                    Err(e) => {
                        let status = Status::new(StatusCategory::BadRequest)
                            .operation(Operation::Unsubscribe)
                            .failure(&e)
                            .affected(&channels, &channel_groups);
                        announcer.status(status).await;
                        return;
                    }
                }
            }
            let status = Status::new(StatusCategory::Acknowledgment)
                .operation(Operation::Unsubscribe)
                .status_code(200)
                .uuid(transport.uuid())
                .affected(&channels, &channel_groups);
            announcer.status(status).await;
        });
    }

    async fn handle_reconnected(&self) {
        {
            let mut tasks = self.inner.tasks.lock().await;
            if tasks.destroyed {
                return;
            }
            self.inner.stop_tasks(&mut tasks).await;
            self.inner.state.write(SubscriptionSet::mark_announced);
            self.inner.start_tasks(&mut tasks).await;
        }
        let (channels, groups) = self
            .inner
            .state
            .read(|s| (s.prepare_channel_list(true), s.prepare_group_list(true)));
        let status = Status::new(StatusCategory::Reconnected)
            .operation(Operation::Subscribe)
            .affected(&channels, &groups);
        self.inner.announcer.status(status).await;
    }

    async fn handle_exhausted(&self) {
        let (channels, groups) = self
            .inner
            .state
            .read(|s| (s.prepare_channel_list(true), s.prepare_group_list(true)));
        let status = Status::new(StatusCategory::ReconnectionAttemptsExhausted)
            .operation(Operation::Subscribe)
            .affected(&channels, &groups);
        self.inner.announcer.status(status).await;
        self.disconnect().await;
    }
}

impl Inner {
    /// Stop the heartbeat, then cancel and join the loop and the poller.
    async fn stop_tasks(&self, tasks: &mut Tasks) {
        self.heartbeat.stop().await;
        let running = [tasks.subscribe_loop.take(), tasks.poller.take()];
        for (cancel, handle) in running.into_iter().flatten() {
            cancel.cancel();
            let _ = handle.await;
        }
    }

    /// Spawn a fresh loop and, when something is subscribed, the heartbeat
    /// and connectivity poller.
    async fn start_tasks(&self, tasks: &mut Tasks) {
        let subscribed = self.state.read(|s| !s.is_empty());
        if subscribed {
            self.heartbeat.start().await;
        }

        let cancel = self.session.child_token();
        let ctx = LoopContext {
            transport: self.transport.clone(),
            state: self.state.clone(),
            announcer: self.announcer.clone(),
            heartbeat: self.heartbeat.clone(),
            session: self.session.clone(),
            overflow_count: self.overflow_count,
        };
        let handle = self.runtime.spawn(run_subscribe_loop(ctx, cancel.clone()));
        tasks.subscribe_loop = Some((cancel, handle));

        if let Some(backoff) = self.backoff.as_ref().filter(|_| subscribed) {
            let cancel = self.session.child_token();
            let handle = self.runtime.spawn(run_poller(
                self.transport.clone(),
                backoff.clone(),
                self.reconnection_tx.clone(),
                cancel.clone(),
            ));
            tasks.poller = Some((cancel, handle));
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.session.cancel();
        self.listener_exit.cancel();
        self.reconnection_exit.cancel();
    }
}

/// Route connectivity events from the poller back into the session.
async fn supervise(
    weak: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<ReconnectionEvent>,
    exit: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = exit.cancelled() => return,
            event = events.recv() => event,
        };
        let (Some(event), Some(inner)) = (event, weak.upgrade()) else {
            return;
        };
        let manager = SubscriptionManager { inner };
        match event {
            ReconnectionEvent::Reconnected => manager.handle_reconnected().await,
            ReconnectionEvent::Exhausted => manager.handle_exhausted().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ChannelListener;
    use crate::types::Event;

    fn manager() -> SubscriptionManager {
        let mut config = Config::new("demo");
        // Nothing listens here; requests fail fast.
        config.origin = "127.0.0.1:9".into();
        config.secure = false;
        SubscriptionManager::new(config).unwrap()
    }

    #[test]
    fn new_requires_runtime() {
        let result = SubscriptionManager::new(Config::new("demo"));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let result = SubscriptionManager::new(Config::new(""));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn listener_management() {
        let manager = manager();
        let (listener, _events) = ChannelListener::new();
        let id = manager.add_listener(listener);
        assert_eq!(manager.listeners(), vec![id]);
        assert!(manager.remove_listener(id));
        assert!(manager.listeners().is_empty());

        let (listener, _events) = ChannelListener::new();
        manager.add_listener(listener);
        manager.remove_all_listeners();
        assert!(manager.listeners().is_empty());
        manager.destroy().await;
    }

    #[tokio::test]
    async fn introspection_reports_data_entities() {
        let manager = manager();
        manager
            .subscribe(SubscribeOperation {
                channels: vec!["b".into(), "a".into()],
                channel_groups: vec!["g".into()],
                ..Default::default()
            })
            .await;
        manager
            .subscribe(SubscribeOperation {
                channels: vec!["lobby".into()],
                presence_enabled: true,
                ..Default::default()
            })
            .await;
        assert_eq!(manager.subscribed_channels(), vec!["a", "b"]);
        assert_eq!(manager.subscribed_groups(), vec!["g"]);

        manager.unsubscribe_all().await;
        assert!(manager.subscribed_channels().is_empty());
        assert_eq!(manager.cursor(), Cursor::default());
        manager.destroy().await;
    }

    #[tokio::test]
    async fn operations_after_destroy_are_ignored() {
        let manager = manager();
        let (listener, mut events) = ChannelListener::new();
        manager.add_listener(listener);
        manager.destroy().await;
        manager.destroy().await;

        manager
            .subscribe(SubscribeOperation {
                channels: vec!["a".into()],
                ..Default::default()
            })
            .await;
        assert!(manager.subscribed_channels().is_empty());

        // The dispatcher has exited, so nothing more is delivered.
        while let Some(event) = events.try_next() {
            assert!(!matches!(event, Event::Message(_)));
        }
    }
}
