//! The long-poll subscribe loop.

use tokio_util::sync::CancellationToken;

use crate::dispatch::Announcer;
use crate::heartbeat::Heartbeat;
use crate::protocol;
use crate::state::{PollSnapshot, SharedState, SubscriptionSet};
use crate::transport::Transport;
use crate::types::{Error, Operation, Status, StatusCategory};

/// Everything one run of the loop needs. The loop owns no subscription state
/// of its own; it snapshots [`SharedState`] at the top of every iteration.
pub(crate) struct LoopContext {
    pub transport: Transport,
    pub state: SharedState,
    pub announcer: Announcer,
    pub heartbeat: Heartbeat,
    /// Session token. Its cancellation, unlike a restart's, is announced.
    pub session: CancellationToken,
    /// Responses with more messages than this raise an advisory status.
    pub overflow_count: usize,
}

enum Flow {
    Continue,
    Stop,
}

/// Poll until the subscription set is empty or `cancel` fires.
///
/// Every failure other than cancellation is announced and retried
/// immediately. Session cancellation announces `Cancelled` once and ends the
/// loop; a restart ends it silently.
pub(crate) async fn run_subscribe_loop(ctx: LoopContext, cancel: CancellationToken) {
    tracing::debug!("subscribe loop started");
    loop {
        let snapshot = ctx.state.read(SubscriptionSet::snapshot);
        if snapshot.is_empty() {
            tracing::info!("no channels left to subscribe");
            ctx.announcer
                .status(Status::new(StatusCategory::Disconnected))
                .await;
            ctx.heartbeat.stop().await;
            return;
        }

        tracing::debug!(
            channels = ?snapshot.channels,
            groups = ?snapshot.groups,
            timetoken = snapshot.cursor.timetoken,
            region = snapshot.cursor.region,
            "long-poll"
        );
        ctx.heartbeat.mark_request_sent();
        let body = match ctx.transport.subscribe(&snapshot, &cancel).await {
            Ok(body) => body,
            Err(e) => match handle_poll_error(&ctx, &snapshot, e).await {
                Flow::Continue => continue,
                Flow::Stop => return,
            },
        };

        if let Flow::Stop = handle_response(&ctx, &snapshot, &body).await {
            return;
        }
    }
}

async fn handle_poll_error(ctx: &LoopContext, snapshot: &PollSnapshot, error: Error) -> Flow {
    let cancelled = matches!(error, Error::Cancelled);
    if cancelled && !ctx.session.is_cancelled() {
        tracing::debug!("subscribe loop stopped for restart");
        return Flow::Stop;
    }

    let status = Status::new(error.category())
        .operation(Operation::Subscribe)
        .failure(&error)
        .affected(&snapshot.channels, &snapshot.groups);
    ctx.announcer.status(status).await;
    if cancelled {
        tracing::debug!("subscribe loop cancelled");
        Flow::Stop
    } else {
        Flow::Continue
    }
}

/// Deliver one accepted response and advance the cursor. Only session
/// cancellation abandons it midway; a restart waits for it to finish.
async fn handle_response(ctx: &LoopContext, snapshot: &PollSnapshot, body: &str) -> Flow {
    if ctx.state.write(SubscriptionSet::take_announcement) {
        let status = Status::new(StatusCategory::Connected)
            .operation(Operation::Subscribe)
            .affected(&snapshot.channels, &snapshot.groups);
        ctx.announcer.status(status).await;
    }

    let (envelope, decode_error) = protocol::decode_envelope(body);
    if let Some(e) = decode_error {
        ctx.announcer.status(bad_request(snapshot, &e)).await;
    }

    let count = envelope.messages.len();
    if count > ctx.overflow_count {
        tracing::warn!(count, threshold = ctx.overflow_count, "message count exceeded");
        let status = Status::new(StatusCategory::RequestMessageCountExceeded)
            .operation(Operation::Subscribe)
            .affected(&snapshot.channels, &snapshot.groups);
        ctx.announcer.status(status).await;
    }

    for message in envelope.messages {
        let queued = tokio::select! {
            biased;
            _ = ctx.session.cancelled() => {
                return handle_poll_error(ctx, snapshot, Error::Cancelled).await;
            }
            queued = ctx.announcer.message(message) => queued,
        };
        if !queued {
            tracing::debug!("dispatcher gone, stopping subscribe loop");
            return Flow::Stop;
        }
    }

    match ctx.state.write(|s| s.advance_cursor(&envelope.metadata)) {
        Ok(cursor) => {
            tracing::trace!(timetoken = cursor.timetoken, region = cursor.region, "cursor advanced");
        }
        Err(e) => ctx.announcer.status(bad_request(snapshot, &e)).await,
    }
    Flow::Continue
}

fn bad_request(snapshot: &PollSnapshot, error: &Error) -> Status {
    Status::new(StatusCategory::BadRequest)
        .operation(Operation::Subscribe)
        .failure(error)
        .affected(&snapshot.channels, &snapshot.groups)
}
