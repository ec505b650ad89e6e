//! Bayeux publish/subscribe client
//!
//! A client for the Bayeux protocol: JSON envelopes over HTTP long-polling
//! or WebSocket, with channel-based routing, wildcard subscriptions, and
//! server-advised reconnection.
//!
//! # Example
//!
//! ```no_run
//! use bayeux_client::{BayeuxClient, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("https://example.com/faye");
//!     let client = BayeuxClient::new(config);
//!
//!     client.connect().await?;
//!
//!     // Receive everything under /chat
//!     let subscription = client
//!         .subscribe("/chat/**", |channel, data| {
//!             println!("{}: {}", channel, data);
//!         })
//!         .await?;
//!
//!     // Publish; Bayeux-level failure rides the returned Publication
//!     let publication = client
//!         .publish("/chat/room1", serde_json::json!({"text": "hello"}))
//!         .await?;
//!     assert!(publication.successful());
//!
//!     subscription.cancel().await?;
//!     client.close().await;
//!     Ok(())
//! }
//! ```

mod channel;
mod client;
mod config;
mod dispatcher;
mod error;
mod extension;
mod message;
mod subscription;
mod transport;

pub use channel::{
    channel_matches, is_in_namespace, is_valid_channel_name, is_valid_channel_pattern, namespace,
    normalize, parents, relative_to, Channel, ChannelError,
};
pub use client::{BayeuxClient, ClientStatistics, MessageHandler};
pub use config::ClientConfig;
pub use dispatcher::{ClientState, Dispatcher, DispatcherStats};
pub use error::{BayeuxError, Result};
pub use extension::{AuthExtension, Extension, FnExtension, TransformFn};
pub use message::{
    extract_bayeux_message, Advice, ReconnectAdvice, BAYEUX_VERSION, CONNECT_CHANNEL,
    DISCONNECT_CHANNEL, HANDSHAKE_CHANNEL, SUBSCRIBE_CHANNEL, UNSUBSCRIBE_CHANNEL,
};
pub use subscription::{Publication, Subscription};
pub use transport::{
    HttpTransport, Transport, TransportStats, WebSocketTransport, CALLBACK_POLLING, LONG_POLLING,
    WEBSOCKET,
};
