//! Public types for the pubnub-subscriber crate.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

/// A boxed error type for pluggable collaborators (e.g. [`Cipher`](crate::Cipher)).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Category of a [`Status`] announced to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCategory {
    /// The first long-poll since the subscription set changed succeeded.
    Connected,
    /// The subscribe loop stopped because nothing is subscribed any more.
    Disconnected,
    /// Connectivity returned after a transport outage.
    Reconnected,
    /// A long-poll timed out; the loop retries immediately.
    Timeout,
    /// The session was cancelled; the loop will not retry.
    Cancelled,
    AccessDenied,
    BadRequest,
    /// Server-side routing failure (HTTP 530).
    NoStubMatched,
    /// One response carried more messages than the configured threshold.
    RequestMessageCountExceeded,
    ReconnectionAttemptsExhausted,
    Unknown,
    /// Confirmation of a leave/unsubscribe.
    Acknowledgment,
}

impl StatusCategory {
    /// Whether this category describes a failure.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            StatusCategory::Timeout
                | StatusCategory::AccessDenied
                | StatusCategory::BadRequest
                | StatusCategory::NoStubMatched
                | StatusCategory::ReconnectionAttemptsExhausted
                | StatusCategory::Unknown
        )
    }
}

/// The operation a [`Status`] relates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Subscribe,
    Unsubscribe,
    Heartbeat,
    Time,
}

/// A status event. One instance is shared by every listener.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub category: StatusCategory,
    pub operation: Option<Operation>,
    /// True when the status reports a failure.
    pub error: bool,
    /// Description of the underlying error, if any.
    pub error_data: Option<String>,
    /// HTTP status code of the request that produced this status.
    pub status_code: Option<u16>,
    pub affected_channels: Vec<String>,
    pub affected_channel_groups: Vec<String>,
    /// Client identifier, set on leave acknowledgments.
    pub uuid: Option<String>,
}

impl Status {
    pub(crate) fn new(category: StatusCategory) -> Self {
        Self {
            category,
            operation: None,
            error: false,
            error_data: None,
            status_code: None,
            affected_channels: Vec::new(),
            affected_channel_groups: Vec::new(),
            uuid: None,
        }
    }

    pub(crate) fn operation(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    pub(crate) fn failure(mut self, error: &Error) -> Self {
        self.error = true;
        self.error_data = Some(error.to_string());
        if let Error::Status { code, .. } = error {
            self.status_code = Some(*code);
        }
        self
    }

    pub(crate) fn status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    pub(crate) fn affected(mut self, channels: &[String], groups: &[String]) -> Self {
        self.affected_channels = channels.to_vec();
        self.affected_channel_groups = groups.to_vec();
        self
    }

    pub(crate) fn uuid(mut self, uuid: &str) -> Self {
        self.uuid = Some(uuid.to_string());
        self
    }
}

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Payload after the configured cipher has been applied.
    pub message: Value,
    /// Channel the message was published to, when it differs from the
    /// subscription that matched it (wildcards and groups). Empty otherwise.
    pub actual_channel: String,
    /// The subscribed name that matched: the channel itself, a wildcard or a group.
    pub subscribed_channel: String,
    pub channel: String,
    /// Subscription match, empty when it equals `channel`.
    pub subscription: String,
    /// Publish timetoken.
    pub timetoken: u64,
    /// Publisher's client id.
    pub publisher: String,
    pub user_metadata: Value,
}

/// A presence event (join, leave, timeout, state-change, interval).
#[derive(Debug, Clone, PartialEq)]
pub struct Presence {
    pub event: String,
    pub uuid: String,
    pub actual_channel: String,
    pub subscribed_channel: String,
    /// Channel name with the presence suffix removed.
    pub channel: String,
    /// Subscription match with the presence suffix removed, empty when it
    /// equals the channel.
    pub subscription: String,
    pub state: Value,
    pub timetoken: u64,
    pub occupancy: i64,
    pub timestamp: i64,
    pub here_now_refresh: bool,
}

/// Events delivered to a [`ChannelListener`](crate::ChannelListener).
#[derive(Debug, Clone)]
pub enum Event {
    Status(Arc<Status>),
    Message(Arc<Message>),
    Presence(Arc<Presence>),
}

/// Adds channels and groups to the subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOperation {
    pub channels: Vec<String>,
    pub channel_groups: Vec<String>,
    /// Subscribe to the presence companion instead of the data channel.
    pub presence_enabled: bool,
    /// Resume from this timetoken instead of "now". Applied once.
    pub timetoken: Option<u64>,
    /// Per-entity state keyed by channel or group name.
    pub state: BTreeMap<String, Value>,
}

/// Removes channels and groups from the subscription.
#[derive(Debug, Clone, Default)]
pub struct UnsubscribeOperation {
    pub channels: Vec<String>,
    pub channel_groups: Vec<String>,
}

/// Replaces the state of already-subscribed channels and groups.
#[derive(Debug, Clone, Default)]
pub struct StateOperation {
    pub channels: Vec<String>,
    pub channel_groups: Vec<String>,
    pub state: Value,
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid timetoken {value:?}: {source}")]
    Timetoken {
        value: String,
        source: std::num::ParseIntError,
    },

    #[error("response parsing error: {0}")]
    Parse(String),

    #[error("cipher error: {0}")]
    Cipher(BoxError),

    #[error("config error: {0}")]
    Config(String),

    #[error("request cancelled")]
    Cancelled,
}

impl Error {
    /// Map this error onto the status category announced to listeners.
    pub fn category(&self) -> StatusCategory {
        match self {
            Error::Http(e) if e.is_timeout() => StatusCategory::Timeout,
            Error::Cancelled => StatusCategory::Cancelled,
            Error::Status { code: 403, .. } => StatusCategory::AccessDenied,
            Error::Status { code: 400, .. } => StatusCategory::BadRequest,
            Error::Status { code: 530, .. } => StatusCategory::NoStubMatched,
            _ => StatusCategory::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_error(code: u16) -> Error {
        Error::Status {
            code,
            body: String::new(),
        }
    }

    #[test]
    fn category_from_http_status() {
        assert_eq!(status_error(403).category(), StatusCategory::AccessDenied);
        assert_eq!(status_error(400).category(), StatusCategory::BadRequest);
        assert_eq!(status_error(530).category(), StatusCategory::NoStubMatched);
        assert_eq!(status_error(502).category(), StatusCategory::Unknown);
    }

    #[test]
    fn category_for_cancellation_and_parse_errors() {
        assert_eq!(Error::Cancelled.category(), StatusCategory::Cancelled);
        assert_eq!(
            Error::Parse("bad".into()).category(),
            StatusCategory::Unknown
        );
    }

    #[test]
    fn failure_status_carries_code_and_message() {
        let status = Status::new(StatusCategory::AccessDenied)
            .operation(Operation::Subscribe)
            .failure(&status_error(403));
        assert!(status.error);
        assert_eq!(status.status_code, Some(403));
        assert_eq!(status.operation, Some(Operation::Subscribe));
        assert!(status.error_data.unwrap_or_default().contains("403"));
    }

    #[test]
    fn error_categories() {
        assert!(StatusCategory::BadRequest.is_error());
        assert!(StatusCategory::Timeout.is_error());
        assert!(!StatusCategory::Connected.is_error());
        assert!(!StatusCategory::Acknowledgment.is_error());
        assert!(!StatusCategory::Cancelled.is_error());
    }
}
