//! Subscribe engine for a long-polling publish/subscribe service.
//!
//! Maintains a resumable subscription to a set of channels and channel
//! groups, delivers decoded messages, presence events and statuses to
//! registered listeners, keeps presence alive with periodic heartbeats and
//! recovers from transport failures.
//!
//! # Features
//! - Long-poll loop with cursor bookkeeping and one-shot timetoken overrides
//! - Presence subscriptions alongside data subscriptions
//! - Heartbeat keepalive with drift correction
//! - Linear or exponential reconnection with a retry budget
//! - Pluggable payload decryption via [`Cipher`]
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), pubnub_subscriber::Error> {
//! use pubnub_subscriber::{ChannelListener, Config, Event, SubscribeOperation, SubscriptionManager};
//!
//! let manager = SubscriptionManager::new(Config::new("sub-c-demo"))?;
//! let (listener, mut events) = ChannelListener::new();
//! manager.add_listener(listener);
//!
//! manager
//!     .subscribe(SubscribeOperation {
//!         channels: vec!["room1".to_string()],
//!         ..Default::default()
//!     })
//!     .await;
//!
//! while let Some(event) = events.next().await {
//!     match event {
//!         Event::Message(msg) => println!("{}: {}", msg.channel, msg.message),
//!         Event::Status(status) => println!("status: {:?}", status.category),
//!         Event::Presence(p) => println!("{} {} on {}", p.uuid, p.event, p.channel),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod codec;
mod config;
mod connection;
mod dispatch;
mod heartbeat;
mod listener;
mod protocol;
mod reconnection;
mod state;
mod subscribe;
mod transport;
mod types;

pub use codec::{Cipher, PN_OTHER};
pub use config::{Config, TimingConfig};
pub use listener::{ChannelListener, EventReceiver, Listener, ListenerId};
pub use reconnection::ReconnectionPolicy;
pub use state::Cursor;
pub use subscribe::SubscriptionManager;
pub use types::{
    BoxError, Error, Event, Message, Operation, Presence, StateOperation, Status,
    StatusCategory, SubscribeOperation, UnsubscribeOperation,
};
