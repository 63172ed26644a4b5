//! Client configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::codec::Cipher;
use crate::reconnection::ReconnectionPolicy;
use crate::types::Error;

pub(crate) const DEFAULT_ORIGIN: &str = "ps.pndsn.com";
pub(crate) const DEFAULT_PRESENCE_TIMEOUT: u32 = 300;
pub(crate) const DEFAULT_MESSAGE_QUEUE_OVERFLOW_COUNT: usize = 100;
pub(crate) const DEFAULT_MAXIMUM_RECONNECTION_RETRIES: u32 = 50;
pub(crate) const DEFAULT_DELIVERY_QUEUE_CAPACITY: usize = 1000;

/// Configuration for a [`SubscriptionManager`](crate::SubscriptionManager).
///
/// Build with [`Config::new`] and override individual fields.
pub struct Config {
    pub subscribe_key: String,
    /// Client identifier sent with every request.
    pub uuid: String,
    pub auth_key: Option<String>,
    /// Host (and optional port) of the service. Defaults to `"ps.pndsn.com"`.
    pub origin: String,
    /// Use `https` when true, `http` otherwise.
    pub secure: bool,
    /// Seconds the server keeps this client present without a heartbeat.
    pub presence_timeout: u32,
    /// Period of the heartbeat keepalive.
    pub heartbeat_interval: Duration,
    /// Skip the leave request on unsubscribe.
    pub suppress_leave_events: bool,
    pub filter_expression: Option<String>,
    /// Responses with more messages than this announce
    /// [`RequestMessageCountExceeded`](crate::StatusCategory::RequestMessageCountExceeded).
    pub message_queue_overflow_count: usize,
    pub cipher: Option<Arc<dyn Cipher>>,
    /// Pass structured payloads through untouched instead of decrypting their
    /// `pn_other` field.
    pub disable_pn_other_processing: bool,
    pub reconnection_policy: ReconnectionPolicy,
    /// `None` retries forever.
    pub maximum_reconnection_retries: Option<u32>,
    pub timing: TimingConfig,
}

/// Timeouts, delays and queue sizes.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Upper bound for one long-poll. Must exceed the server's hold time.
    pub subscribe_request_timeout: Duration,
    /// Timeout for heartbeat, leave and time requests.
    pub non_subscribe_request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Messages buffered between the subscribe loop and listener dispatch.
    pub delivery_queue_capacity: usize,
    pub linear_reconnection_delay: Duration,
    pub exponential_min_delay: Duration,
    pub exponential_max_delay: Duration,
    /// Heartbeat skew above which the next heartbeat is postponed.
    pub heartbeat_drift_threshold: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            subscribe_request_timeout: Duration::from_secs(310),
            non_subscribe_request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            delivery_queue_capacity: DEFAULT_DELIVERY_QUEUE_CAPACITY,
            linear_reconnection_delay: Duration::from_secs(3),
            exponential_min_delay: Duration::from_secs(1),
            exponential_max_delay: Duration::from_secs(32),
            heartbeat_drift_threshold: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn new(subscribe_key: impl Into<String>) -> Self {
        Self {
            subscribe_key: subscribe_key.into(),
            uuid: format!("pn-{}", uuid::Uuid::new_v4()),
            auth_key: None,
            origin: DEFAULT_ORIGIN.to_string(),
            secure: true,
            presence_timeout: DEFAULT_PRESENCE_TIMEOUT,
            heartbeat_interval: default_heartbeat_interval(DEFAULT_PRESENCE_TIMEOUT),
            suppress_leave_events: false,
            filter_expression: None,
            message_queue_overflow_count: DEFAULT_MESSAGE_QUEUE_OVERFLOW_COUNT,
            cipher: None,
            disable_pn_other_processing: false,
            reconnection_policy: ReconnectionPolicy::None,
            maximum_reconnection_retries: Some(DEFAULT_MAXIMUM_RECONNECTION_RETRIES),
            timing: TimingConfig::default(),
        }
    }

    /// Set the presence timeout and derive the matching heartbeat interval.
    pub fn set_presence_timeout(&mut self, seconds: u32) {
        self.presence_timeout = seconds;
        self.heartbeat_interval = default_heartbeat_interval(seconds);
    }

    /// Heartbeats are disabled when both the interval and the timeout are zero.
    pub fn heartbeat_enabled(&self) -> bool {
        !(self.presence_timeout == 0 && self.heartbeat_interval.is_zero())
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.subscribe_key.is_empty() {
            return Err(Error::Config("subscribe key is empty".to_string()));
        }
        if self.origin.is_empty() {
            return Err(Error::Config("origin is empty".to_string()));
        }
        if self.timing.delivery_queue_capacity == 0 {
            return Err(Error::Config(
                "delivery queue capacity must be positive".to_string(),
            ));
        }
        if self.heartbeat_enabled() && self.heartbeat_interval.is_zero() {
            return Err(Error::Config(format!(
                "heartbeat interval is zero with a presence timeout of {}s",
                self.presence_timeout
            )));
        }
        Ok(())
    }
}

/// Half the presence timeout, minus one second so the heartbeat lands first.
fn default_heartbeat_interval(presence_timeout: u32) -> Duration {
    Duration::from_secs(u64::from((presence_timeout / 2).saturating_sub(1)))
}
