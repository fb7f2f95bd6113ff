//! Real-time pub/sub client for Centrifugo-compatible servers.
//!
//! Implements the client side of the JSON protocol over WebSocket:
//!
//! - Connection lifecycle with ordered state events
//! - Client-side subscriptions with stream recovery and join/leave
//! - Server-side subscriptions announced by the server
//! - Publish and history requests with per-call deadlines
//! - Heartbeat-based liveness detection (server pings, client pongs)
//! - HS256 connection token issuing
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), centrifuge_client::Error> {
//! use centrifuge_client::{Client, ClientConfig, Event, SubscriptionConfig, issue_token};
//!
//! let token = issue_token(b"secret", "user-4", 0)?;
//! let (client, mut events) =
//!     Client::new(ClientConfig::new("ws://localhost:8000/connection/websocket", token));
//! client.connect()?;
//!
//! let sub = client.new_subscription("news", SubscriptionConfig::default())?;
//! while let Some(event) = events.next().await {
//!     match event {
//!         Event::Connected { client_id } => {
//!             println!("connected as {client_id}");
//!             sub.subscribe()?;
//!         }
//!         Event::Subscription { channel, event } => println!("{channel}: {event:?}"),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod connection;
mod error;
mod history;
pub mod protocol;
mod subscription;
mod token;
mod types;

pub use client::{Client, Events};
pub use error::{Error, Result};
pub use history::{HistoryPage, HistoryPager, HistorySource};
pub use subscription::Subscription;
pub use token::{Claims, issue_token};
pub use types::{
    ClientConfig, ClientInfo, ConnectionState, Event, HistoryOptions, HistoryResult,
    Publication, PublishResult, StreamPosition, SubscriptionConfig, SubscriptionEvent,
    SubscriptionState, TimingConfig,
};
