//! Bayeux client
//!
//! The client owns the subscription registry and fans inbound messages out
//! to callbacks; all protocol work is delegated to the [`Dispatcher`].

use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::dispatcher::{ClientState, Dispatcher};
use crate::error::{BayeuxError, Result};
use crate::extension::Extension;
use crate::message::{Advice, ReconnectAdvice};
use crate::subscription::{Publication, Subscription, SubscriptionState};
use crate::transport::TransportStats;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handler invoked with `(channel, data)` for each matching message
pub type MessageHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

struct SubscriptionEntry {
    state: Arc<SubscriptionState>,
    callback: MessageHandler,
}

/// Shared client state behind the public handle
pub(crate) struct ClientCore {
    dispatcher: Dispatcher,
    // Registration order is fan-out order
    subscriptions: Mutex<Vec<SubscriptionEntry>>,
    messages_tx: broadcast::Sender<Value>,
    router: Mutex<Option<JoinHandle<()>>>,
}

/// Statistics snapshot combining session, registry, and transport counters
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatistics {
    pub state: ClientState,
    pub client_id: Option<String>,
    pub transport: Option<String>,
    pub subscriptions: usize,
    pub advice: Advice,
    pub pending_responses: usize,
    pub transport_stats: Option<TransportStats>,
}

/// Bayeux publish/subscribe client.
///
/// Cheaply cloneable; clones share one session.
///
/// # Example
///
/// ```no_run
/// use bayeux_client::{BayeuxClient, ClientConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = BayeuxClient::new(ClientConfig::new("https://example.com/faye"));
///     client.connect().await?;
///
///     let sub = client
///         .subscribe("/chat/**", |channel, data| {
///             println!("{}: {}", channel, data);
///         })
///         .await?;
///
///     let publication = client
///         .publish("/chat/room1", serde_json::json!({"text": "hi"}))
///         .await?;
///     assert!(publication.successful());
///
///     sub.cancel().await?;
///     client.close().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct BayeuxClient {
    core: Arc<ClientCore>,
}

impl BayeuxClient {
    /// Create a client for the given configuration
    pub fn new(config: ClientConfig) -> Self {
        Self::with_dispatcher(Dispatcher::new(config))
    }

    /// Create a client over an existing dispatcher (custom transports)
    pub fn with_dispatcher(dispatcher: Dispatcher) -> Self {
        let (messages_tx, _) = broadcast::channel(256);
        let inbound = dispatcher.messages();
        let core = Arc::new(ClientCore {
            dispatcher,
            subscriptions: Mutex::new(Vec::new()),
            messages_tx,
            router: Mutex::new(None),
        });

        let router_core = core.clone();
        let router = tokio::spawn(async move {
            route_messages(router_core, inbound).await;
        });
        *core.router.lock() = Some(router);

        Self { core }
    }

    /// Connect and handshake. Idempotent while connecting or connected.
    pub async fn connect(&self) -> Result<()> {
        self.core.dispatcher.connect(None).await
    }

    /// Connect with extra headers applied to the transport requests
    pub async fn connect_with_headers(&self, headers: HashMap<String, String>) -> Result<()> {
        self.core.dispatcher.connect(Some(headers)).await
    }

    /// Disconnect the session. Subscription objects are preserved but no
    /// further messages arrive until the next connect.
    pub async fn disconnect(&self) -> Result<()> {
        self.core.dispatcher.disconnect().await
    }

    /// Current session state
    pub fn state(&self) -> ClientState {
        self.core.dispatcher.state()
    }

    /// Watch channel following state transitions
    pub fn state_receiver(&self) -> watch::Receiver<ClientState> {
        self.core.dispatcher.state_receiver()
    }

    /// Server-assigned session id
    pub fn client_id(&self) -> Option<String> {
        self.core.dispatcher.client_id()
    }

    /// Stream of non-meta messages after fan-out
    pub fn messages(&self) -> broadcast::Receiver<Value> {
        self.core.messages_tx.subscribe()
    }

    /// Session and transport error stream
    pub fn errors(&self) -> broadcast::Receiver<BayeuxError> {
        self.core.dispatcher.errors()
    }

    /// The dispatcher carrying this session
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.core.dispatcher
    }

    /// Subscribe a channel name or pattern.
    ///
    /// The callback fires once per matching message, in subscription
    /// registration order.
    pub async fn subscribe<F>(&self, channel: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        let parsed = Channel::parse(channel).map_err(|e| BayeuxError::Channel {
            channel: channel.to_string(),
            reason: e.to_string(),
        })?;

        let response = self.core.dispatcher.subscribe(channel).await?;
        let successful = response
            .get("successful")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !successful {
            let message = response
                .get("error")
                .map(|e| BayeuxError::from_error_field(e).to_string())
                .unwrap_or_else(|| "Subscription rejected by server".to_string());
            return Err(BayeuxError::Subscription {
                subscription: channel.to_string(),
                message,
            });
        }

        let state = SubscriptionState::new(parsed);
        self.core.subscriptions.lock().push(SubscriptionEntry {
            state: state.clone(),
            callback: Arc::new(callback),
        });
        debug!(channel, "Subscribed");
        Ok(Subscription::new(state, self.core.clone()))
    }

    /// Unsubscribe every registered subscription on the given channel
    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let response = self.core.dispatcher.unsubscribe(channel).await?;
        let successful = response
            .get("successful")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !successful {
            let message = response
                .get("error")
                .map(|e| BayeuxError::from_error_field(e).to_string())
                .unwrap_or_else(|| "Unsubscribe rejected by server".to_string());
            return Err(BayeuxError::Subscription {
                subscription: channel.to_string(),
                message,
            });
        }

        let mut subscriptions = self.core.subscriptions.lock();
        subscriptions.retain(|entry| {
            if entry.state.channel().name() == channel {
                entry.state.deactivate();
                false
            } else {
                true
            }
        });
        Ok(())
    }

    /// Publish a data payload on a concrete channel.
    ///
    /// Bayeux-level failure never raises; the outcome travels inside the
    /// returned [`Publication`] so fire-and-forget callers need no handler.
    pub async fn publish(&self, channel: &str, data: Value) -> Result<Publication> {
        let parsed = Channel::parse(channel).map_err(|e| BayeuxError::Channel {
            channel: channel.to_string(),
            reason: e.to_string(),
        })?;
        if parsed.is_pattern() {
            return Err(BayeuxError::Channel {
                channel: channel.to_string(),
                reason: "cannot publish to a pattern".to_string(),
            });
        }

        let subscriber_count = self
            .core
            .subscriptions
            .lock()
            .iter()
            .filter(|e| e.state.is_active() && e.state.channel().matches(&parsed))
            .count() as u64;

        let id = self.core.dispatcher.next_message_id();
        let mut publication =
            Publication::new(id.clone(), channel.to_string(), data.clone(), subscriber_count);

        match self.core.dispatcher.publish(channel, &data, &id).await {
            Ok(response) => {
                let successful = response
                    .get("successful")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if successful {
                    if let Some(ext) = response.get("ext") {
                        publication.set_ext(ext.clone());
                    }
                    publication.mark_successful();
                } else {
                    let message = response
                        .get("error")
                        .map(|e| BayeuxError::from_error_field(e).to_string())
                        .unwrap_or_else(|| "Publish rejected by server".to_string());
                    publication.mark_failed(BayeuxError::Publication {
                        channel: channel.to_string(),
                        message,
                    });
                }
            }
            Err(e) => publication.mark_failed(e),
        }
        Ok(publication)
    }

    /// Install an extension on the dispatcher
    pub fn set_extension(&self, extension: impl Extension + 'static) {
        self.core.dispatcher.set_extension(Some(Arc::new(extension)));
    }

    /// Remove the installed extension
    pub fn clear_extension(&self) {
        self.core.dispatcher.set_extension(None);
    }

    /// Select the transport by connection-type name
    pub fn set_transport(&self, name: &str) -> Result<()> {
        self.core.dispatcher.set_transport(name)
    }

    /// Register the JSONP transport
    pub fn enable_callback_polling(&self) {
        self.core.dispatcher.enable_callback_polling();
    }

    /// Snapshot of session, registry, and transport counters
    pub fn statistics(&self) -> ClientStatistics {
        let dispatcher = self.core.dispatcher.statistics();
        ClientStatistics {
            state: dispatcher.state,
            client_id: dispatcher.client_id,
            transport: dispatcher.transport,
            subscriptions: self.core.subscriptions.lock().len(),
            advice: dispatcher.advice,
            pending_responses: dispatcher.pending_responses,
            transport_stats: dispatcher.transport_stats,
        }
    }

    /// Cancel all subscriptions and release the session
    pub async fn close(&self) {
        {
            let mut subscriptions = self.core.subscriptions.lock();
            for entry in subscriptions.iter() {
                entry.state.deactivate();
            }
            subscriptions.clear();
        }
        if let Some(router) = self.core.router.lock().take() {
            router.abort();
        }
        self.core.dispatcher.close().await;
    }
}

impl ClientCore {
    /// Remove one subscription; unsubscribes the channel on the server when
    /// this was its last entry.
    pub(crate) async fn cancel_subscription(&self, state: &Arc<SubscriptionState>) -> Result<()> {
        let channel = state.channel().name().to_string();
        state.deactivate();

        let last_for_channel = {
            let mut subscriptions = self.subscriptions.lock();
            subscriptions.retain(|entry| entry.state.id() != state.id());
            !subscriptions
                .iter()
                .any(|entry| entry.state.channel().name() == channel)
        };

        if last_for_channel && self.dispatcher.state() == ClientState::Connected {
            self.dispatcher.unsubscribe(&channel).await?;
        }
        Ok(())
    }

    /// Route one inbound message: meta traffic to the session handlers,
    /// everything else through pattern fan-out and the general stream.
    fn handle_message(&self, message: Value) {
        let message = match self.dispatcher.extension() {
            Some(extension) => match extension.incoming(message.clone()) {
                Ok(rewritten) => rewritten,
                Err(e) => {
                    warn!(error = %e, "Incoming extension failed, using original message");
                    message
                }
            },
            None => message,
        };

        let Some(channel) = message
            .get("channel")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            warn!("Dropping inbound message without a channel");
            return;
        };

        if channel.starts_with("/meta/") {
            self.handle_meta(&channel, &message);
        } else {
            self.fan_out(&channel, &message);
            let _ = self.messages_tx.send(message);
        }
    }

    fn handle_meta(&self, channel: &str, message: &Value) {
        match channel {
            "/meta/connect" => {
                if let Some(advice) = message.get("advice") {
                    self.dispatcher.apply_advice(advice);
                }
                // Long-poll style re-arming: each connect response queues
                // the next one after the advised interval
                if self.dispatcher.state() == ClientState::Connected {
                    let advice = self.dispatcher.advice();
                    if advice.reconnect == ReconnectAdvice::Retry {
                        let dispatcher = self.dispatcher.clone();
                        tokio::spawn(async move {
                            if advice.interval > 0 {
                                tokio::time::sleep(Duration::from_millis(advice.interval)).await;
                            }
                            if dispatcher.state() == ClientState::Connected {
                                if let Err(e) = dispatcher.send_connect().await {
                                    debug!(error = %e, "Keepalive connect failed");
                                }
                            }
                        });
                    }
                }
            }
            "/meta/subscribe" | "/meta/unsubscribe" => {
                // The promise returned to the caller already carries the
                // outcome via correlation
                debug!(channel, successful = ?message.get("successful"), "Meta response");
            }
            "/meta/disconnect" => {
                debug!("Server acknowledged disconnect");
            }
            other => {
                debug!(channel = other, "Unhandled meta message");
            }
        }
    }

    /// Deliver `data` to every active subscription matching the channel, in
    /// registration order. A panicking callback counts as an error on its
    /// subscription and does not halt fan-out.
    fn fan_out(&self, channel: &str, message: &Value) {
        let parsed = match Channel::parse(channel) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(channel, error = %e, "Dropping message with invalid channel");
                return;
            }
        };
        let data = message.get("data").cloned().unwrap_or(Value::Null);

        let targets: Vec<(Arc<SubscriptionState>, MessageHandler)> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|entry| entry.state.is_active() && entry.state.channel().matches(&parsed))
            .map(|entry| (entry.state.clone(), entry.callback.clone()))
            .collect();

        for (state, callback) in targets {
            match catch_unwind(AssertUnwindSafe(|| callback(channel, &data))) {
                Ok(()) => state.record_message(),
                Err(_) => {
                    state.record_error();
                    warn!(channel, subscription = %state.channel(), "Subscription callback panicked");
                }
            }
        }
    }
}

async fn route_messages(core: Arc<ClientCore>, mut inbound: broadcast::Receiver<Value>) {
    loop {
        match inbound.recv().await {
            Ok(message) => core.handle_message(message),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Client router lagged, messages dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> BayeuxClient {
        BayeuxClient::new(ClientConfig::new("http://localhost:8000/faye"))
    }

    #[tokio::test]
    async fn test_initial_state() {
        let client = client();
        assert_eq!(client.state(), ClientState::Unconnected);
        assert!(client.client_id().is_none());
        let stats = client.statistics();
        assert_eq!(stats.subscriptions, 0);
        assert_eq!(stats.pending_responses, 0);
    }

    #[tokio::test]
    async fn test_subscribe_invalid_channel() {
        let client = client();
        let err = client
            .subscribe("not a channel", |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, BayeuxError::Channel { .. }));
        assert_eq!(err.code(), 400);
    }

    #[tokio::test]
    async fn test_publish_rejects_patterns() {
        let client = client();
        let err = client.publish("/chat/*", json!({"x": 1})).await.unwrap_err();
        assert!(matches!(err, BayeuxError::Channel { .. }));
    }

    #[tokio::test]
    async fn test_publish_when_unconnected_returns_failed_publication() {
        let client = client();
        let publication = client.publish("/chat/room1", json!("hello")).await.unwrap();
        assert!(publication.is_complete());
        assert!(!publication.successful());
        assert!(publication.error().is_some());
    }

    #[tokio::test]
    async fn test_unsubscribe_when_unconnected_fails() {
        let client = client();
        assert!(client.unsubscribe("/chat/room1").await.is_err());
    }

    #[tokio::test]
    async fn test_set_transport_validation() {
        let client = client();
        assert!(client.set_transport("websocket").is_ok());
        assert!(client.set_transport("smoke-signals").is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let client = client();
        client.close().await;
        client.close().await;
        assert_eq!(client.state(), ClientState::Unconnected);
    }
}
