//! Session dispatcher
//!
//! Owns the protocol session: the connection state machine, the handshake,
//! message-id correlation, advice tracking, and the extension slot. The
//! dispatcher talks to the server only through the current [`Transport`]
//! and knows nothing about subscriptions; routing lives in the client.

use crate::config::ClientConfig;
use crate::error::{BayeuxError, Result};
use crate::extension::Extension;
use crate::message::{self, Advice, ReconnectAdvice};
use crate::transport::{HttpTransport, Transport, TransportStats, WebSocketTransport};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Message ids stay within the integer-safe range of JSON consumers
const MAX_MESSAGE_ID: u64 = (1 << 53) - 1;

/// Session connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClientState {
    Unconnected = 1,
    Connecting = 2,
    Connected = 3,
    Disconnected = 4,
}

impl ClientState {
    /// Numeric protocol code for this state
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

/// Snapshot of the dispatcher's session state
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub state: ClientState,
    pub client_id: Option<String>,
    pub transport: Option<String>,
    pub pending_responses: usize,
    pub advice: Advice,
    pub transport_stats: Option<TransportStats>,
}

struct DispatcherInner {
    config: ClientConfig,
    transports: Mutex<Vec<Arc<dyn Transport>>>,
    current: Mutex<Option<Arc<dyn Transport>>>,
    state_tx: watch::Sender<ClientState>,
    client_id: Mutex<Option<String>>,
    advice: Mutex<Advice>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    message_id: AtomicU64,
    extension: Mutex<Option<Arc<dyn Extension>>>,
    messages_tx: broadcast::Sender<Value>,
    errors_tx: broadcast::Sender<BayeuxError>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

/// Protocol dispatcher; cheaply cloneable handle over shared session state
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Create a dispatcher with the default transports registered:
    /// long-polling always, websocket when supported.
    pub fn new(config: ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ClientState::Unconnected);
        let (messages_tx, _) = broadcast::channel(256);
        let (errors_tx, _) = broadcast::channel(64);

        let long_polling: Arc<dyn Transport> = Arc::new(HttpTransport::long_polling(&config));
        let websocket: Arc<dyn Transport> = Arc::new(WebSocketTransport::new(&config));
        let transports: Vec<Arc<dyn Transport>> = [long_polling, websocket]
            .into_iter()
            .filter(|t| t.supported())
            .collect();

        Self {
            inner: Arc::new(DispatcherInner {
                config,
                transports: Mutex::new(transports),
                current: Mutex::new(None),
                state_tx,
                client_id: Mutex::new(None),
                advice: Mutex::new(Advice::default()),
                pending: Mutex::new(HashMap::new()),
                message_id: AtomicU64::new(0),
                extension: Mutex::new(None),
                messages_tx,
                errors_tx,
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register the JSONP transport (opt-in)
    pub fn enable_callback_polling(&self) {
        let transport: Arc<dyn Transport> =
            Arc::new(HttpTransport::callback_polling(&self.inner.config));
        self.register_transport(transport);
    }

    /// Register an additional transport under its connection-type name
    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        let mut transports = self.inner.transports.lock();
        transports.retain(|t| t.name() != transport.name());
        transports.push(transport);
    }

    /// Current session state
    pub fn state(&self) -> ClientState {
        *self.state_receiver().borrow()
    }

    /// Watch channel following state transitions
    pub fn state_receiver(&self) -> watch::Receiver<ClientState> {
        self.inner.state_tx.subscribe()
    }

    /// Server-assigned session id, if a handshake has completed
    pub fn client_id(&self) -> Option<String> {
        self.inner.client_id.lock().clone()
    }

    /// Current merged advice
    pub fn advice(&self) -> Advice {
        self.inner.advice.lock().clone()
    }

    /// Inbound messages that were not claimed by a pending awaiter
    pub fn messages(&self) -> broadcast::Receiver<Value> {
        self.inner.messages_tx.subscribe()
    }

    /// Session and transport error stream
    pub fn errors(&self) -> broadcast::Receiver<BayeuxError> {
        self.inner.errors_tx.subscribe()
    }

    /// Install (or clear) the extension slot
    pub fn set_extension(&self, extension: Option<Arc<dyn Extension>>) {
        *self.inner.extension.lock() = extension;
    }

    pub(crate) fn extension(&self) -> Option<Arc<dyn Extension>> {
        self.inner.extension.lock().clone()
    }

    /// Connection-type names advertised in the handshake
    pub fn supported_connection_types(&self) -> Vec<String> {
        self.inner
            .transports
            .lock()
            .iter()
            .filter(|t| t.supported())
            .map(|t| t.name().to_string())
            .collect()
    }

    /// Select a registered transport by connection-type name
    pub fn set_transport(&self, name: &str) -> Result<()> {
        let transport = self
            .lookup_transport(name)
            .ok_or_else(|| BayeuxError::Protocol(format!("Unknown transport: {}", name)))?;
        *self.inner.current.lock() = Some(transport);
        Ok(())
    }

    /// The transport currently carrying the session
    pub fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner.current.lock().clone()
    }

    fn lookup_transport(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.inner
            .transports
            .lock()
            .iter()
            .find(|t| t.name() == name)
            .cloned()
    }

    pub(crate) fn next_message_id(&self) -> String {
        let n = self.inner.message_id.fetch_add(1, Ordering::SeqCst);
        ((n % MAX_MESSAGE_ID) + 1).to_string()
    }

    /// Connect the session: open the transport, wire listeners, handshake.
    ///
    /// A no-op while a session is already connecting or connected.
    pub async fn connect(&self, headers: Option<HashMap<String, String>>) -> Result<()> {
        match self.state() {
            ClientState::Connecting | ClientState::Connected => return Ok(()),
            ClientState::Unconnected | ClientState::Disconnected => {}
        }

        let mut headers = headers.unwrap_or_default();
        for (name, value) in &self.inner.config.handshake_headers {
            headers.entry(name.clone()).or_insert_with(|| value.clone());
        }

        self.inner.set_state(ClientState::Connecting);
        match self.do_connect(&headers).await {
            Ok(()) => {
                self.inner.set_state(ClientState::Connected);
                Ok(())
            }
            Err(e) => {
                self.inner.set_state(ClientState::Disconnected);
                let _ = self
                    .inner
                    .errors_tx
                    .send(BayeuxError::Network(format!("Connect failed: {}", e)));
                Err(e)
            }
        }
    }

    async fn do_connect(&self, headers: &HashMap<String, String>) -> Result<()> {
        let transport = self.select_transport()?;
        transport
            .connect(&self.inner.config.endpoint, headers)
            .await?;
        self.inner.wire_listeners(&transport);
        self.handshake(&transport, headers).await
    }

    fn select_transport(&self) -> Result<Arc<dyn Transport>> {
        if let Some(current) = self.inner.current.lock().clone() {
            return Ok(current);
        }
        let chosen = {
            let transports = self.inner.transports.lock();
            transports.iter().find(|t| t.supported()).cloned()
        };
        let chosen =
            chosen.ok_or_else(|| BayeuxError::Network("No transport selected".to_string()))?;
        *self.inner.current.lock() = Some(chosen.clone());
        Ok(chosen)
    }

    async fn handshake(
        &self,
        transport: &Arc<dyn Transport>,
        headers: &HashMap<String, String>,
    ) -> Result<()> {
        let id = self.next_message_id();
        let envelope = message::handshake(&self.supported_connection_types(), &id);
        let response = self.send_message(envelope).await?;
        let response = self.inner.apply_incoming(response);

        let successful = response
            .get("successful")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !successful {
            return Err(response
                .get("error")
                .map(BayeuxError::from_error_field)
                .unwrap_or_else(|| {
                    BayeuxError::Network("Handshake rejected by server".to_string())
                }));
        }

        let client_id = response
            .get("clientId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BayeuxError::Protocol("Handshake response missing clientId".to_string())
            })?
            .to_string();
        *self.inner.client_id.lock() = Some(client_id.clone());
        transport.set_client_id(Some(client_id.clone()));
        if let Some(advice) = response.get("advice") {
            self.apply_advice(advice);
        }
        debug!(client_id = %client_id, transport = transport.name(), "Handshake complete");

        // Switch to the server's preferred connection type when we own it
        let preferred = response
            .get("supportedConnectionTypes")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(preferred) = preferred {
            if preferred != transport.name() {
                if let Some(next) = self.lookup_transport(&preferred) {
                    match next.connect(&self.inner.config.endpoint, headers).await {
                        Ok(()) => {
                            next.set_client_id(Some(client_id));
                            next.set_request_timeout(transport.request_timeout());
                            self.inner.wire_listeners(&next);
                            *self.inner.current.lock() = Some(next);
                            let _ = transport.disconnect().await;
                            debug!(transport = %preferred, "Switched to server-preferred transport");
                        }
                        Err(e) => {
                            warn!(transport = %preferred, error = %e,
                                "Preferred transport failed to connect, keeping current");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Disconnect the session, best-effort notifying the server.
    ///
    /// A no-op unless connecting or connected.
    pub async fn disconnect(&self) -> Result<()> {
        match self.state() {
            ClientState::Connected | ClientState::Connecting => {}
            _ => return Ok(()),
        }
        self.inner.set_state(ClientState::Disconnected);

        let transport = self.inner.current.lock().clone();
        let client_id = self.inner.client_id.lock().clone();
        if let (Some(transport), Some(client_id)) = (&transport, &client_id) {
            let envelope = message::disconnect(client_id);
            if let Err(e) = transport.send(&envelope).await {
                debug!(error = %e, "Best-effort disconnect message failed");
            }
        }
        if let Some(transport) = &transport {
            let _ = transport.disconnect().await;
            transport.set_client_id(None);
        }

        *self.inner.client_id.lock() = None;
        // Dropping the senders cancels every awaiter
        self.inner.pending.lock().clear();
        self.inner.set_state(ClientState::Unconnected);
        Ok(())
    }

    /// Release every transport and cancel all pending awaiters
    pub async fn close(&self) {
        self.inner.pending.lock().clear();
        let transports: Vec<Arc<dyn Transport>> = self.inner.transports.lock().clone();
        for transport in transports {
            let _ = transport.close().await;
        }
        for task in self.inner.listeners.lock().drain(..) {
            task.abort();
        }
        *self.inner.client_id.lock() = None;
        *self.inner.current.lock() = None;
        self.inner.set_state(ClientState::Unconnected);
    }

    /// Send an envelope, awaiting the correlated response when it has an id.
    ///
    /// The await is bounded by the transport timeout; on expiry the awaiter
    /// is removed and the caller gets a timeout error. A response arriving
    /// after that is routed as an ordinary inbound push.
    pub async fn send_message(&self, message: Value) -> Result<Value> {
        let message = self.inner.apply_outgoing(message);
        let transport = self
            .inner
            .current
            .lock()
            .clone()
            .ok_or_else(|| BayeuxError::Network("No transport selected".to_string()))?;

        let id = message
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(id) = id else {
            transport.send(&message).await?;
            return Ok(Value::Null);
        };

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id.clone(), tx);

        if let Err(e) = transport.send(&message).await {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(transport.request_timeout(), rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(BayeuxError::Closed),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                Err(BayeuxError::Timeout(format!("Message timeout: {}", id)))
            }
        }
    }

    /// Subscribe a channel or pattern on the server.
    ///
    /// Allowed while CONNECTING as well, so an extension can subscribe from
    /// within its processing of the handshake response.
    pub async fn subscribe(&self, subscription: &str) -> Result<Value> {
        let state = self.state();
        if state != ClientState::Connected && state != ClientState::Connecting {
            return Err(BayeuxError::Network(format!(
                "Cannot subscribe in state {:?}",
                state
            )));
        }
        let client_id = self.require_client_id()?;
        let id = self.next_message_id();
        let envelope = message::subscribe(&client_id, subscription, &id);
        self.send_message(envelope).await
    }

    /// Unsubscribe a channel or pattern on the server
    pub async fn unsubscribe(&self, subscription: &str) -> Result<Value> {
        self.require_connected("unsubscribe")?;
        let client_id = self.require_client_id()?;
        let id = self.next_message_id();
        let envelope = message::unsubscribe(&client_id, subscription, &id);
        self.send_message(envelope).await
    }

    /// Publish a data payload on a channel, correlated under the given id
    pub async fn publish(&self, channel: &str, data: &Value, id: &str) -> Result<Value> {
        self.require_connected("publish")?;
        let client_id = self.require_client_id()?;
        let envelope = message::publish(channel, data, &client_id, id);
        self.send_message(envelope).await
    }

    /// Send a keepalive `/meta/connect`. No awaiter is installed; the
    /// server's reply arrives through the inbound pipeline.
    pub async fn send_connect(&self) -> Result<()> {
        self.require_connected("send connect")?;
        let client_id = self.require_client_id()?;
        let transport = self
            .inner
            .current
            .lock()
            .clone()
            .ok_or_else(|| BayeuxError::Network("No transport selected".to_string()))?;
        let envelope = message::connect(&client_id, transport.name());
        let envelope = self.inner.apply_outgoing(envelope);
        transport.send(&envelope).await
    }

    /// Merge server advice into the session.
    ///
    /// `reconnect="handshake"` resets the session id so the next connect
    /// starts with a fresh handshake; an advice timeout updates the
    /// per-message await timeout on the current transport.
    pub fn apply_advice(&self, value: &Value) {
        self.inner.advice.lock().merge(value);

        if let Some(timeout) = value.get("timeout").and_then(Value::as_u64) {
            if let Some(transport) = self.inner.current.lock().clone() {
                transport.set_request_timeout(Duration::from_millis(timeout));
            }
        }

        if self.inner.advice.lock().reconnect == ReconnectAdvice::Handshake {
            *self.inner.client_id.lock() = None;
            if let Some(transport) = self.inner.current.lock().clone() {
                transport.set_client_id(None);
            }
        }
    }

    /// Snapshot of session state and transport counters
    pub fn statistics(&self) -> DispatcherStats {
        let transport = self.inner.current.lock().clone();
        DispatcherStats {
            state: self.state(),
            client_id: self.client_id(),
            transport: transport.as_ref().map(|t| t.name().to_string()),
            pending_responses: self.inner.pending.lock().len(),
            advice: self.advice(),
            transport_stats: transport.map(|t| t.statistics()),
        }
    }

    fn require_connected(&self, operation: &str) -> Result<()> {
        if self.state() != ClientState::Connected {
            return Err(BayeuxError::Network(format!(
                "Cannot {} in state {:?}",
                operation,
                self.state()
            )));
        }
        Ok(())
    }

    fn require_client_id(&self) -> Result<String> {
        self.inner.client_id.lock().clone().ok_or_else(|| {
            BayeuxError::Network("No client id; handshake has not completed".to_string())
        })
    }
}

impl DispatcherInner {
    fn set_state(&self, state: ClientState) {
        let _ = self.state_tx.send(state);
    }

    /// Wire exactly one listener pair onto the transport's event streams,
    /// aborting any previous pair so reconnects never stack listeners.
    fn wire_listeners(self: &Arc<Self>, transport: &Arc<dyn Transport>) {
        let mut listeners = self.listeners.lock();
        for task in listeners.drain(..) {
            task.abort();
        }

        let mut messages = transport.messages();
        let inner = self.clone();
        let message_task = tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok(frame) => inner.handle_transport_message(frame),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Inbound listener lagged, frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut errors = transport.errors();
        let inner = self.clone();
        let error_task = tokio::spawn(async move {
            loop {
                match errors.recv().await {
                    Ok(error) => {
                        let _ = inner.errors_tx.send(error);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        *listeners = vec![message_task, error_task];
    }

    /// Route one transport frame: maps resolve a pending awaiter or flow to
    /// the client, arrays recurse per element, strings are decoded first.
    fn handle_transport_message(&self, frame: Value) {
        match frame {
            Value::Array(items) => {
                for item in items {
                    self.handle_transport_message(item);
                }
            }
            Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(decoded) => self.handle_transport_message(decoded),
                Err(e) => {
                    let _ = self
                        .errors_tx
                        .send(BayeuxError::Protocol(format!("Failed to parse frame: {}", e)));
                }
            },
            Value::Object(_) => {
                let id = frame
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if let Some(id) = id {
                    if let Some(tx) = self.pending.lock().remove(&id) {
                        // Correlated responses complete their awaiter and
                        // are not re-emitted
                        let _ = tx.send(frame);
                        return;
                    }
                }
                let _ = self.messages_tx.send(frame);
            }
            other => {
                let _ = self
                    .errors_tx
                    .send(BayeuxError::Protocol(format!("Unexpected frame: {}", other)));
            }
        }
    }

    fn apply_outgoing(&self, message: Value) -> Value {
        let Some(extension) = self.extension.lock().clone() else {
            return message;
        };
        match extension.outgoing(message.clone()) {
            Ok(rewritten) => rewritten,
            Err(e) => {
                warn!(error = %e, "Outgoing extension failed, using original message");
                message
            }
        }
    }

    fn apply_incoming(&self, message: Value) -> Value {
        let Some(extension) = self.extension.lock().clone() else {
            return message;
        };
        match extension.incoming(message.clone()) {
            Ok(rewritten) => rewritten,
            Err(e) => {
                warn!(error = %e, "Incoming extension failed, using original message");
                message
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::FnExtension;
    use serde_json::json;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(ClientConfig::new("http://localhost:8000/faye"))
    }

    #[test]
    fn test_initial_state() {
        let dispatcher = dispatcher();
        assert_eq!(dispatcher.state(), ClientState::Unconnected);
        assert!(dispatcher.client_id().is_none());
        assert_eq!(dispatcher.advice(), Advice::default());
    }

    #[test]
    fn test_state_codes() {
        assert_eq!(ClientState::Unconnected.code(), 1);
        assert_eq!(ClientState::Connecting.code(), 2);
        assert_eq!(ClientState::Connected.code(), 3);
        assert_eq!(ClientState::Disconnected.code(), 4);
    }

    #[test]
    fn test_message_ids_are_sequential_decimal() {
        let dispatcher = dispatcher();
        assert_eq!(dispatcher.next_message_id(), "1");
        assert_eq!(dispatcher.next_message_id(), "2");
        assert_eq!(dispatcher.next_message_id(), "3");
    }

    #[test]
    fn test_default_connection_types() {
        let dispatcher = dispatcher();
        let types = dispatcher.supported_connection_types();
        assert_eq!(types, vec!["long-polling", "websocket"]);
    }

    #[test]
    fn test_enable_callback_polling() {
        let dispatcher = dispatcher();
        dispatcher.enable_callback_polling();
        assert!(dispatcher
            .supported_connection_types()
            .contains(&"callback-polling".to_string()));
    }

    #[test]
    fn test_set_transport_unknown_name() {
        let dispatcher = dispatcher();
        let err = dispatcher.set_transport("carrier-pigeon").unwrap_err();
        assert!(matches!(err, BayeuxError::Protocol(_)));
    }

    #[test]
    fn test_set_transport_known_name() {
        let dispatcher = dispatcher();
        dispatcher.set_transport("websocket").unwrap();
        assert_eq!(
            dispatcher.current_transport().map(|t| t.name()),
            Some("websocket")
        );
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let dispatcher = dispatcher();
        assert!(dispatcher.subscribe("/chat/room1").await.is_err());
        assert!(dispatcher.unsubscribe("/chat/room1").await.is_err());
        assert!(dispatcher
            .publish("/chat/room1", &json!({"x": 1}), "9")
            .await
            .is_err());
        assert!(dispatcher.send_connect().await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_when_unconnected_is_noop() {
        let dispatcher = dispatcher();
        dispatcher.disconnect().await.unwrap();
        assert_eq!(dispatcher.state(), ClientState::Unconnected);
    }

    #[test]
    fn test_apply_advice_merges() {
        let dispatcher = dispatcher();
        dispatcher.apply_advice(&json!({"reconnect": "none", "interval": 250}));
        let advice = dispatcher.advice();
        assert_eq!(advice.reconnect, ReconnectAdvice::None);
        assert_eq!(advice.interval, 250);
    }

    #[test]
    fn test_advice_handshake_resets_client_id() {
        let dispatcher = dispatcher();
        *dispatcher.inner.client_id.lock() = Some("abc".to_string());
        dispatcher.apply_advice(&json!({"reconnect": "handshake"}));
        assert!(dispatcher.client_id().is_none());
    }

    #[test]
    fn test_extension_failure_falls_back_to_identity() {
        let dispatcher = dispatcher();
        dispatcher.set_extension(Some(Arc::new(
            FnExtension::new()
                .with_outgoing(|_| Err(BayeuxError::Protocol("broken".to_string()))),
        )));
        let original = json!({"channel": "/x", "id": "1"});
        assert_eq!(dispatcher.inner.apply_outgoing(original.clone()), original);
    }

    #[test]
    fn test_statistics_snapshot() {
        let dispatcher = dispatcher();
        let stats = dispatcher.statistics();
        assert_eq!(stats.state, ClientState::Unconnected);
        assert!(stats.client_id.is_none());
        assert!(stats.transport.is_none());
        assert_eq!(stats.pending_responses, 0);
    }
}
