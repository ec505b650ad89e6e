//! Transport abstraction
//!
//! A transport moves JSON envelopes between the client and the server and
//! owns its connection lifecycle. The dispatcher talks to transports only
//! through the [`Transport`] trait, so new carriers can be plugged in
//! without touching the session logic.

mod http;
mod websocket;

pub use http::HttpTransport;
pub use websocket::WebSocketTransport;

use crate::error::{BayeuxError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, watch};

/// Connection-type name of the HTTP long-polling transport
pub const LONG_POLLING: &str = "long-polling";
/// Connection-type name of the JSONP transport
pub const CALLBACK_POLLING: &str = "callback-polling";
/// Connection-type name of the WebSocket transport
pub const WEBSOCKET: &str = "websocket";

/// Client id placed in keepalive envelopes before a handshake has assigned
/// the real one.
pub(crate) const PLACEHOLDER_CLIENT_ID: &str = "temp";

/// Frame-level carrier of Bayeux envelopes.
///
/// Implementations must be safe to share behind an `Arc`: all operations
/// take `&self` and internal state is synchronized. Inbound frames and
/// steady-state faults are delivered on broadcast streams so any number of
/// observers can follow along.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connection-type name advertised in handshakes
    fn name(&self) -> &'static str;

    /// Whether this transport can run in the current environment
    fn supported(&self) -> bool;

    /// Whether the transport currently holds a live connection
    fn connected(&self) -> bool;

    /// Timeout applied to correlated request/response exchanges
    fn request_timeout(&self) -> Duration;

    /// Update the request timeout (e.g. from server advice)
    fn set_request_timeout(&self, timeout: Duration);

    /// Install the session client id used in keepalive/poll envelopes
    fn set_client_id(&self, client_id: Option<String>);

    /// Open a connection to the endpoint
    async fn connect(&self, url: &str, headers: &HashMap<String, String>) -> Result<()>;

    /// Tear down the connection and cancel timers
    async fn disconnect(&self) -> Result<()>;

    /// Send one envelope
    async fn send(&self, message: &Value) -> Result<()>;

    /// Send a batch of envelopes in one exchange
    async fn send_batch(&self, messages: &[Value]) -> Result<()>;

    /// Release all resources; the transport cannot be used afterwards
    async fn close(&self) -> Result<()>;

    /// Snapshot of the traffic counters
    fn statistics(&self) -> TransportStats;

    /// Inbound envelope stream
    fn messages(&self) -> broadcast::Receiver<Value>;

    /// Steady-state fault stream (heartbeat/poll/reconnect failures)
    fn errors(&self) -> broadcast::Receiver<BayeuxError>;

    /// Connection-state stream (`true` while connected)
    fn connection_states(&self) -> watch::Receiver<bool>;
}

/// Traffic counters shared by all transports.
///
/// Byte counts are measured against the JSON-serialized form of each
/// envelope.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub errors: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connected_at: Option<SystemTime>,
    pub last_activity: Option<SystemTime>,
}

/// Bookkeeping shared by the concrete transports: counters, event streams,
/// the connected flag, the mutable timeout, and the client-id slot.
pub(crate) struct TransportBase {
    name: &'static str,
    connected: AtomicBool,
    state_tx: watch::Sender<bool>,
    messages_tx: broadcast::Sender<Value>,
    errors_tx: broadcast::Sender<BayeuxError>,
    timeout: Mutex<Duration>,
    client_id: Mutex<Option<String>>,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    errors: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    connected_at: Mutex<Option<SystemTime>>,
    last_activity: Mutex<Option<SystemTime>>,
}

impl TransportBase {
    pub(crate) fn new(name: &'static str, timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(false);
        let (messages_tx, _) = broadcast::channel(256);
        let (errors_tx, _) = broadcast::channel(64);
        Self {
            name,
            connected: AtomicBool::new(false),
            state_tx,
            messages_tx,
            errors_tx,
            timeout: Mutex::new(timeout),
            client_id: Mutex::new(None),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            connected_at: Mutex::new(None),
            last_activity: Mutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        *self.connected_at.lock() = connected.then(SystemTime::now);
        let _ = self.state_tx.send(connected);
    }

    pub(crate) fn timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    pub(crate) fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = timeout;
    }

    pub(crate) fn set_client_id(&self, client_id: Option<String>) {
        *self.client_id.lock() = client_id;
    }

    pub(crate) fn client_id_or_placeholder(&self) -> String {
        self.client_id
            .lock()
            .clone()
            .unwrap_or_else(|| PLACEHOLDER_CLIENT_ID.to_string())
    }

    /// Record an outbound envelope against the counters
    pub(crate) fn record_sent(&self, message: &Value) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent
            .fetch_add(serialized_len(message), Ordering::Relaxed);
        *self.last_activity.lock() = Some(SystemTime::now());
    }

    /// Deliver an inbound envelope to every observer
    pub(crate) fn emit_message(&self, message: Value) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(serialized_len(&message), Ordering::Relaxed);
        *self.last_activity.lock() = Some(SystemTime::now());
        let _ = self.messages_tx.send(message);
    }

    /// Deliver a steady-state fault to every observer
    pub(crate) fn emit_error(&self, error: BayeuxError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        let _ = self.errors_tx.send(error);
    }

    pub(crate) fn messages(&self) -> broadcast::Receiver<Value> {
        self.messages_tx.subscribe()
    }

    pub(crate) fn errors(&self) -> broadcast::Receiver<BayeuxError> {
        self.errors_tx.subscribe()
    }

    pub(crate) fn connection_states(&self) -> watch::Receiver<bool> {
        self.state_tx.subscribe()
    }

    pub(crate) fn stats(&self) -> TransportStats {
        TransportStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            connected_at: *self.connected_at.lock(),
            last_activity: *self.last_activity.lock(),
        }
    }
}

fn serialized_len(message: &Value) -> u64 {
    serde_json::to_vec(message).map(|b| b.len() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_base_counters() {
        let base = TransportBase::new(LONG_POLLING, Duration::from_secs(30));
        assert_eq!(base.name(), "long-polling");

        let msg = json!({"channel": "/x", "data": 1});
        let encoded_len = serde_json::to_vec(&msg).unwrap().len() as u64;

        base.record_sent(&msg);
        base.record_sent(&msg);
        let mut rx = base.messages();
        base.emit_message(msg.clone());

        let stats = base.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.bytes_sent, encoded_len * 2);
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.bytes_received, encoded_len);
        assert!(stats.last_activity.is_some());
        assert_eq!(rx.try_recv().unwrap(), msg);
    }

    #[test]
    fn test_base_connected_flag() {
        let base = TransportBase::new(WEBSOCKET, Duration::from_secs(30));
        let rx = base.connection_states();
        assert!(!base.is_connected());
        assert!(base.stats().connected_at.is_none());

        base.set_connected(true);
        assert!(base.is_connected());
        assert!(base.stats().connected_at.is_some());
        assert!(*rx.borrow());

        base.set_connected(false);
        assert!(!base.is_connected());
        assert!(base.stats().connected_at.is_none());
    }

    #[test]
    fn test_base_client_id_slot() {
        let base = TransportBase::new(WEBSOCKET, Duration::from_secs(30));
        assert_eq!(base.client_id_or_placeholder(), "temp");
        base.set_client_id(Some("abc".to_string()));
        assert_eq!(base.client_id_or_placeholder(), "abc");
        base.set_client_id(None);
        assert_eq!(base.client_id_or_placeholder(), "temp");
    }

    #[test]
    fn test_base_timeout_is_mutable() {
        let base = TransportBase::new(LONG_POLLING, Duration::from_secs(30));
        assert_eq!(base.timeout(), Duration::from_secs(30));
        base.set_timeout(Duration::from_secs(5));
        assert_eq!(base.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_error_counter() {
        let base = TransportBase::new(LONG_POLLING, Duration::from_secs(30));
        let mut rx = base.errors();
        base.emit_error(BayeuxError::Network("poll failed".to_string()));
        assert_eq!(base.stats().errors, 1);
        assert!(matches!(rx.try_recv().unwrap(), BayeuxError::Network(_)));
    }
}
