//! Reconnection policy and the connectivity poller it drives.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::TimingConfig;
use crate::transport::Transport;
use crate::types::Error;

/// How the connectivity poller spaces its probes after failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReconnectionPolicy {
    /// Never reconnect automatically.
    #[default]
    None,
    /// Fixed delay between attempts.
    Linear,
    /// Delay doubles per attempt, up to a cap.
    Exponential,
}

/// Attempt counter plus delay schedule.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    policy: ReconnectionPolicy,
    linear_delay: Duration,
    min_delay: Duration,
    max_delay: Duration,
    max_retries: Option<u32>,
    attempts: u32,
}

impl Backoff {
    pub(crate) fn new(
        policy: ReconnectionPolicy,
        timing: &TimingConfig,
        max_retries: Option<u32>,
    ) -> Self {
        Self {
            policy,
            linear_delay: timing.linear_reconnection_delay,
            min_delay: timing.exponential_min_delay,
            max_delay: timing.exponential_max_delay,
            max_retries,
            attempts: 0,
        }
    }

    /// Delay before the next probe.
    pub(crate) fn delay(&self) -> Duration {
        match self.policy {
            ReconnectionPolicy::Exponential => {
                let factor = 1u32.checked_shl(self.attempts).unwrap_or(u32::MAX);
                self.min_delay.saturating_mul(factor).min(self.max_delay)
            }
            ReconnectionPolicy::None | ReconnectionPolicy::Linear => self.linear_delay,
        }
    }

    /// Count a failed probe. Returns true once the retry budget is spent.
    pub(crate) fn record_failure(&mut self) -> bool {
        self.attempts = self.attempts.saturating_add(1);
        self.max_retries.is_some_and(|max| self.attempts > max)
    }

    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Raised by the poller to the session supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReconnectionEvent {
    /// A probe succeeded after one or more failures.
    Reconnected,
    /// The retry budget ran out; the poller has stopped.
    Exhausted,
}

/// Probe connectivity with the time endpoint until cancelled or exhausted.
pub(crate) async fn run_poller(
    transport: Transport,
    mut backoff: Backoff,
    events: mpsc::UnboundedSender<ReconnectionEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff.delay()) => {}
        }

        match transport.time(&cancel).await {
            Ok(_) => {
                if backoff.attempts() > 0 {
                    tracing::info!(attempts = backoff.attempts(), "connectivity restored");
                    backoff.reset();
                    let _ = events.send(ReconnectionEvent::Reconnected);
                }
            }
            Err(Error::Cancelled) => return,
            Err(e) => {
                let exhausted = backoff.record_failure();
                tracing::warn!(attempt = backoff.attempts(), "connectivity probe failed: {e}");
                if exhausted {
                    tracing::warn!("reconnection attempts exhausted");
                    let _ = events.send(ReconnectionEvent::Exhausted);
                    return;
                }
            }
        }
    }
}
