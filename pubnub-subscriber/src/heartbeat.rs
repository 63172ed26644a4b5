//! Presence heartbeat keepalive.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::dispatch::Announcer;
use crate::state::{SharedState, SubscriptionSet};
use crate::transport::Transport;
use crate::types::{Error, Operation, Status, StatusCategory};

/// Handle to the single heartbeat task of a session. Clone is a cheap Arc
/// refcount bump.
#[derive(Clone)]
pub(crate) struct Heartbeat {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Transport,
    state: SharedState,
    announcer: Announcer,
    interval: Duration,
    drift_threshold: Duration,
    enabled: bool,
    /// Session token; every ticker runs on a child of it.
    session: CancellationToken,
    /// Guarded separately from the subscription state so restarting the
    /// ticker never contends with state readers.
    slot: Mutex<Slot>,
}

#[derive(Default)]
struct Slot {
    task: Option<(CancellationToken, JoinHandle<()>)>,
    /// When the last long-poll carrying the presence timeout was sent.
    last_request_at: Option<Instant>,
}

impl Heartbeat {
    pub(crate) fn new(
        transport: Transport,
        state: SharedState,
        announcer: Announcer,
        interval: Duration,
        drift_threshold: Duration,
        enabled: bool,
        session: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                state,
                announcer,
                interval,
                drift_threshold,
                enabled,
                session,
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    /// Replace any running ticker with a fresh one.
    pub(crate) async fn start(&self) {
        self.stop().await;
        if !self.inner.enabled || self.inner.interval.is_zero() {
            return;
        }
        tracing::debug!(interval = ?self.inner.interval, "heartbeat: starting");
        let cancel = self.inner.session.child_token();
        let handle = tokio::spawn(run_heartbeat(Arc::clone(&self.inner), cancel.clone()));
        self.inner.slot().task = Some((cancel, handle));
    }

    /// Stop the ticker and wait for its task to finish. Stopping a stopped
    /// heartbeat is a no-op apart from clearing the request bookkeeping.
    pub(crate) async fn stop(&self) {
        let task = {
            let mut slot = self.inner.slot();
            slot.last_request_at = None;
            slot.task.take()
        };
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            let _ = handle.await;
            tracing::debug!("heartbeat: stopped");
        }
    }

    pub(crate) fn mark_request_sent(&self) {
        self.inner.slot().last_request_at = Some(Instant::now());
    }
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ticker(&self) -> Interval {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }
}

/// How long to postpone a heartbeat when a long-poll refreshed presence
/// `elapsed` ago. `None` when the skew is within `threshold`.
pub(crate) fn drift_delay(
    interval: Duration,
    elapsed: Duration,
    threshold: Duration,
) -> Option<Duration> {
    interval.checked_sub(elapsed).filter(|skew| *skew > threshold)
}

async fn run_heartbeat(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut ticker = inner.ticker();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let sent_at = inner.slot().last_request_at.take();
        if let Some(delay) = sent_at
            .and_then(|at| drift_delay(inner.interval, at.elapsed(), inner.drift_threshold))
        {
            tracing::debug!(?delay, "heartbeat: postponing after recent request");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            ticker = inner.ticker();
        }

        let Some((channels, groups, state)) = inner.state.read(|s: &SubscriptionSet| {
            s.has_non_presence_channels().then(|| {
                (
                    s.prepare_channel_list(false),
                    s.prepare_group_list(false),
                    s.create_state_payload(),
                )
            })
        }) else {
            tracing::debug!("heartbeat: no data channels left, stopping");
            return;
        };

        let status = match inner
            .transport
            .heartbeat(&channels, &groups, &state, &cancel)
            .await
        {
            Ok(code) => Status::new(StatusCategory::Unknown)
                .operation(Operation::Heartbeat)
                .status_code(code)
                .affected(&channels, &groups),
            Err(Error::Cancelled) => return,
            Err(e) => Status::new(StatusCategory::BadRequest)
                .operation(Operation::Heartbeat)
                .failure(&e)
                .affected(&channels, &groups),
        };
        inner.announcer.status(status).await;
    }
}
