//! Scriptable in-memory transport for driving the client without a server

use async_trait::async_trait;
use bayeux_client::{BayeuxError, Result, Transport, TransportStats};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

type Responder = Box<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;

/// In-memory transport. Sends are logged; a responder closure scripts the
/// frames the "server" emits in reply. Unsolicited pushes go through
/// [`MockTransport::emit`].
pub struct MockTransport {
    name: &'static str,
    connected: AtomicBool,
    fail_sends: AtomicBool,
    timeout: Mutex<Duration>,
    sent: Mutex<Vec<Value>>,
    responder: Mutex<Option<Responder>>,
    client_id: Mutex<Option<String>>,
    messages_tx: broadcast::Sender<Value>,
    errors_tx: broadcast::Sender<BayeuxError>,
    state_tx: watch::Sender<bool>,
}

impl MockTransport {
    pub fn new(name: &'static str) -> Arc<Self> {
        let (messages_tx, _) = broadcast::channel(256);
        let (errors_tx, _) = broadcast::channel(64);
        let (state_tx, _) = watch::channel(false);
        Arc::new(Self {
            name,
            connected: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            timeout: Mutex::new(Duration::from_secs(30)),
            sent: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            client_id: Mutex::new(None),
            messages_tx,
            errors_tx,
            state_tx,
        })
    }

    /// A mock that answers handshake/subscribe/unsubscribe/publish the way
    /// a well-behaved Bayeux server would. Handshake replies arrive as a
    /// one-element array, exercising the normalizer path.
    pub fn bayeux_server(name: &'static str) -> Arc<Self> {
        let transport = Self::new(name);
        transport.set_responder(move |message| default_reply(name, message));
        transport
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&Value) -> Vec<Value> + Send + Sync + 'static,
    {
        *self.responder.lock() = Some(Box::new(responder));
    }

    #[allow(dead_code)]
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Push an unsolicited server message
    pub fn emit(&self, message: Value) {
        let _ = self.messages_tx.send(message);
    }

    /// Push an error onto the transport error stream
    #[allow(dead_code)]
    pub fn emit_error(&self, error: BayeuxError) {
        let _ = self.errors_tx.send(error);
    }

    /// Snapshot of every envelope handed to `send`/`send_batch`
    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    /// The client id last installed by the dispatcher
    #[allow(dead_code)]
    pub fn installed_client_id(&self) -> Option<String> {
        self.client_id.lock().clone()
    }

    fn dispatch(&self, message: &Value) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(BayeuxError::Network("mock send failure".to_string()));
        }
        self.sent.lock().push(message.clone());
        let replies = match &*self.responder.lock() {
            Some(responder) => responder(message),
            None => Vec::new(),
        };
        for reply in replies {
            self.emit(reply);
        }
        Ok(())
    }
}

/// Default server behavior: confirm everything, assign a fixed client id
pub fn default_reply(name: &str, message: &Value) -> Vec<Value> {
    let channel = message.get("channel").and_then(Value::as_str).unwrap_or("");
    let id = message.get("id").cloned().unwrap_or(Value::Null);
    match channel {
        "/meta/handshake" => vec![json!([{
            "channel": "/meta/handshake",
            "successful": true,
            "clientId": "mock-client",
            "supportedConnectionTypes": [name],
            "id": id,
        }])],
        "/meta/subscribe" => vec![json!({
            "channel": "/meta/subscribe",
            "successful": true,
            "subscription": message.get("subscription").cloned().unwrap_or(Value::Null),
            "id": id,
        })],
        "/meta/unsubscribe" => vec![json!({
            "channel": "/meta/unsubscribe",
            "successful": true,
            "subscription": message.get("subscription").cloned().unwrap_or(Value::Null),
            "id": id,
        })],
        "/meta/connect" | "/meta/disconnect" => Vec::new(),
        publish_channel => {
            if id.is_null() {
                Vec::new()
            } else {
                vec![json!({
                    "channel": publish_channel,
                    "successful": true,
                    "id": id,
                })]
            }
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    fn supported(&self) -> bool {
        true
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn request_timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    fn set_request_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = timeout;
    }

    fn set_client_id(&self, client_id: Option<String>) {
        *self.client_id.lock() = client_id;
    }

    async fn connect(&self, _url: &str, _headers: &HashMap<String, String>) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.state_tx.send(true);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.state_tx.send(false);
        Ok(())
    }

    async fn send(&self, message: &Value) -> Result<()> {
        self.dispatch(message)
    }

    async fn send_batch(&self, messages: &[Value]) -> Result<()> {
        for message in messages {
            self.dispatch(message)?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.disconnect().await
    }

    fn statistics(&self) -> TransportStats {
        TransportStats {
            messages_sent: self.sent.lock().len() as u64,
            ..TransportStats::default()
        }
    }

    fn messages(&self) -> broadcast::Receiver<Value> {
        self.messages_tx.subscribe()
    }

    fn errors(&self) -> broadcast::Receiver<BayeuxError> {
        self.errors_tx.subscribe()
    }

    fn connection_states(&self) -> watch::Receiver<bool> {
        self.state_tx.subscribe()
    }
}
