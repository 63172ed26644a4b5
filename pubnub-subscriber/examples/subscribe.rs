//! Subscribe to one or more channels and print what arrives.
//!
//! ```sh
//! cargo run -p pubnub-subscriber --example subscribe -- <SUBSCRIBE_KEY> <CHANNEL>[,<CHANNEL>...] [ORIGIN]
//! ```
//!
//! Or pass the subscribe key via environment variable:
//! ```sh
//! PUBNUB_SUBSCRIBE_KEY=sub-c-... cargo run -p pubnub-subscriber --example subscribe \
//!     -- <CHANNELS> [ORIGIN]
//! ```
//!
//! Set `PUBNUB_PRESENCE=1` to also subscribe to presence events.
//! Message payloads are printed to stdout (pipe to `jq` for formatting).

use pubnub_subscriber::{
    ChannelListener, Config, Event, ReconnectionPolicy, StatusCategory, SubscribeOperation,
    SubscriptionManager,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let env_key = std::env::var("PUBNUB_SUBSCRIBE_KEY").ok();

    let (subscribe_key, channels, origin) = if let Some(ref key) = env_key {
        let channels = args.first().ok_or("usage: subscribe <CHANNELS> [ORIGIN]")?;
        (key.as_str(), channels.as_str(), args.get(1).cloned())
    } else {
        let key = args
            .first()
            .ok_or("usage: subscribe <SUBSCRIBE_KEY> <CHANNELS> [ORIGIN]")?;
        let channels = args
            .get(1)
            .ok_or("usage: subscribe <SUBSCRIBE_KEY> <CHANNELS> [ORIGIN]")?;
        (key.as_str(), channels.as_str(), args.get(2).cloned())
    };
    let presence = std::env::var("PUBNUB_PRESENCE").is_ok_and(|v| v == "1");

    let mut config = Config::new(subscribe_key);
    if let Some(origin) = origin {
        config.origin = origin;
    }
    config.reconnection_policy = ReconnectionPolicy::Exponential;

    let manager = SubscriptionManager::new(config)?;
    let (listener, mut events) = ChannelListener::new();
    manager.add_listener(listener);

    eprintln!("subscribing to '{channels}' ...");
    let channels: Vec<String> = channels.split(',').map(str::to_string).collect();
    manager
        .subscribe(SubscribeOperation {
            channels: channels.clone(),
            ..Default::default()
        })
        .await;
    if presence {
        manager
            .subscribe(SubscribeOperation {
                channels,
                presence_enabled: true,
                ..Default::default()
            })
            .await;
    }

    loop {
        let event = tokio::select! {
            event = events.next() => event,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(event) = event else { break };
        match &event {
            Event::Message(msg) => {
                eprintln!(
                    "[message] channel={} publisher={} tt={}",
                    msg.channel, msg.publisher, msg.timetoken
                );
                println!("{}", msg.message);
            }
            Event::Presence(p) => {
                eprintln!(
                    "[presence] {} {} on {} (occupancy {})",
                    p.uuid, p.event, p.channel, p.occupancy
                );
            }
            Event::Status(status) => {
                eprintln!(
                    "[status] {:?} op={:?} code={}",
                    status.category,
                    status.operation,
                    status
                        .status_code
                        .map_or_else(|| "-".to_string(), |c| c.to_string()),
                );
                if status.category == StatusCategory::ReconnectionAttemptsExhausted {
                    break;
                }
            }
        }
    }

    manager.destroy().await;
    Ok(())
}
