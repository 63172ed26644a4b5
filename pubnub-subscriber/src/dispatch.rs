//! Envelope dispatch: decodes subscribe messages and fans them out to
//! listeners on a dedicated task.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec::PayloadCodec;
use crate::listener::ListenerRegistry;
use crate::protocol::{self, PresencePayload, SubscribeMessage};
use crate::types::{Error, Message, Operation, Presence, Status, StatusCategory};

/// Item on the delivery queue. Statuses and messages share one queue so
/// listeners observe them in production order.
#[derive(Debug)]
pub(crate) enum Delivery {
    Status(Status),
    Message(Box<SubscribeMessage>),
}

/// Producer side of the delivery queue.
#[derive(Clone)]
pub(crate) struct Announcer {
    tx: mpsc::Sender<Delivery>,
}

impl Announcer {
    pub(crate) fn new(tx: mpsc::Sender<Delivery>) -> Self {
        Self { tx }
    }

    /// Queue a status for listeners. Waits while the queue is full.
    pub(crate) async fn status(&self, status: Status) {
        log_status(&status);
        if self.tx.send(Delivery::Status(status)).await.is_err() {
            tracing::debug!("delivery queue closed, status dropped");
        }
    }

    /// Queue a message. Returns false once the dispatcher has exited.
    pub(crate) async fn message(&self, message: SubscribeMessage) -> bool {
        self.tx
            .send(Delivery::Message(Box::new(message)))
            .await
            .is_ok()
    }
}

fn log_status(status: &Status) {
    if status.error {
        tracing::warn!(
            category = ?status.category,
            operation = ?status.operation,
            code = ?status.status_code,
            error = status.error_data.as_deref().unwrap_or_default(),
            "status"
        );
    } else {
        tracing::debug!(
            category = ?status.category,
            operation = ?status.operation,
            code = ?status.status_code,
            channels = ?status.affected_channels,
            "status"
        );
    }
}

/// A decoded subscribe message.
#[derive(Debug, PartialEq)]
pub(crate) enum Outcome {
    Message(Message),
    Presence(Presence),
}

/// Turn one wire message into a listener event. A decode problem yields a
/// status alongside a best-effort event rather than dropping the message.
pub(crate) fn decode_message(
    message: SubscribeMessage,
    codec: &PayloadCodec,
) -> (Outcome, Option<Status>) {
    let SubscribeMessage {
        shard,
        subscription_match,
        channel,
        issuing_client_id,
        subscribe_key,
        flags,
        payload,
        user_metadata,
        publish_metadata,
    } = message;
    tracing::trace!(
        %channel,
        %shard,
        %subscribe_key,
        flags,
        region = publish_metadata.region,
        "decoding message"
    );

    // Messages matched by the channel itself carry no separate subscription.
    let subscription = if subscription_match == channel {
        String::new()
    } else {
        subscription_match
    };
    let timetoken = protocol::parse_timetoken(&publish_metadata.timetoken).unwrap_or(0);

    if protocol::is_presence_name(&channel) {
        let (presence, status) = match PresencePayload::from_value(&payload) {
            Some(presence) => (presence, None),
            None => {
                let status = Status::new(StatusCategory::Unknown)
                    .operation(Operation::Subscribe)
                    .failure(&Error::Parse(format!(
                        "presence payload on {channel} is not an object"
                    )))
                    .affected(std::slice::from_ref(&channel), &[]);
                (PresencePayload::default(), Some(status))
            }
        };
        let (actual_channel, subscribed_channel) = if subscription.is_empty() {
            (String::new(), channel.clone())
        } else {
            (channel.clone(), subscription.clone())
        };
        let event = Presence {
            event: presence.action,
            uuid: presence.uuid,
            actual_channel,
            subscribed_channel,
            channel: protocol::base_name(&channel).to_string(),
            subscription: protocol::base_name(&subscription).to_string(),
            state: presence.data,
            timetoken,
            occupancy: presence.occupancy,
            timestamp: presence.timestamp,
            here_now_refresh: presence.here_now_refresh,
        };
        return (Outcome::Presence(event), status);
    }

    let (decoded, error) = codec.decode(payload);
    let status = error.map(|e| {
        Status::new(StatusCategory::BadRequest)
            .operation(Operation::Subscribe)
            .failure(&e)
            .affected(std::slice::from_ref(&channel), &[])
    });
    let (actual_channel, subscribed_channel) = if subscription.is_empty() {
        (String::new(), channel.clone())
    } else {
        (channel.clone(), subscription.clone())
    };
    let event = Message {
        message: decoded,
        actual_channel,
        subscribed_channel,
        channel,
        subscription,
        timetoken,
        publisher: issuing_client_id,
        user_metadata,
    };
    (Outcome::Message(event), status)
}

/// Drain the delivery queue into the listener registry until `exit` fires.
/// Items already queued at exit are still delivered.
pub(crate) async fn run_dispatcher(
    mut rx: mpsc::Receiver<Delivery>,
    listeners: Arc<ListenerRegistry>,
    codec: PayloadCodec,
    exit: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            item = rx.recv() => item,
            _ = exit.cancelled() => break,
        };
        match item {
            Some(item) => deliver(item, &listeners, &codec),
            None => return,
        }
    }

    rx.close();
    while let Some(item) = rx.recv().await {
        deliver(item, &listeners, &codec);
    }
    tracing::debug!("dispatcher exited");
}

fn deliver(item: Delivery, listeners: &ListenerRegistry, codec: &PayloadCodec) {
    match item {
        Delivery::Status(status) => listeners.announce_status(Arc::new(status)),
        Delivery::Message(message) => {
            let (outcome, status) = decode_message(*message, codec);
            if let Some(status) = status {
                log_status(&status);
                listeners.announce_status(Arc::new(status));
            }
            match outcome {
                Outcome::Message(m) => listeners.announce_message(Arc::new(m)),
                Outcome::Presence(p) => listeners.announce_presence(Arc::new(p)),
            }
        }
    }
}
