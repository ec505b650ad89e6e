//! WebSocket transport
//!
//! One duplex socket carries the whole session: a writer task drains an
//! outbound queue, a reader task decodes frames onto the inbound stream,
//! and a heartbeat task keeps intermediaries from reaping idle
//! connections. A dropped socket triggers reconnection with 1.5x backoff,
//! transparent to the dispatcher.

use crate::config::ClientConfig;
use crate::error::{BayeuxError, Result};
use crate::message;
use crate::transport::{Transport, TransportBase, TransportStats, WEBSOCKET};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, warn};

struct WsConnection {
    url: Option<String>,
    headers: HashMap<String, String>,
    writer: Option<mpsc::Sender<WsMessage>>,
    tasks: Vec<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    reconnect_attempts: u32,
    reconnect_delay: Duration,
    closing: bool,
}

struct WsInner {
    base: TransportBase,
    heartbeat_interval: Duration,
    auto_reconnect: bool,
    max_reconnect_attempts: u32,
    initial_reconnect_delay: Duration,
    conn: Mutex<WsConnection>,
}

/// WebSocket transport with heartbeat and reconnect backoff
pub struct WebSocketTransport {
    inner: Arc<WsInner>,
}

impl WebSocketTransport {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            inner: Arc::new(WsInner {
                base: TransportBase::new(WEBSOCKET, config.request_timeout),
                heartbeat_interval: config.heartbeat_interval,
                auto_reconnect: config.auto_reconnect,
                max_reconnect_attempts: config.max_reconnect_attempts,
                initial_reconnect_delay: config.reconnect_delay,
                conn: Mutex::new(WsConnection {
                    url: None,
                    headers: HashMap::new(),
                    writer: None,
                    tasks: Vec::new(),
                    reconnect_task: None,
                    reconnect_attempts: 0,
                    reconnect_delay: config.reconnect_delay,
                    closing: false,
                }),
            }),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        WEBSOCKET
    }

    fn supported(&self) -> bool {
        true
    }

    fn connected(&self) -> bool {
        self.inner.base.is_connected()
    }

    fn request_timeout(&self) -> Duration {
        self.inner.base.timeout()
    }

    fn set_request_timeout(&self, timeout: Duration) {
        self.inner.base.set_timeout(timeout);
    }

    fn set_client_id(&self, client_id: Option<String>) {
        self.inner.base.set_client_id(client_id);
    }

    async fn connect(&self, url: &str, headers: &HashMap<String, String>) -> Result<()> {
        {
            let mut conn = self.inner.conn.lock();
            conn.url = Some(url.to_string());
            conn.headers = headers.clone();
            conn.closing = false;
        }
        establish(&self.inner, url).await
    }

    async fn disconnect(&self) -> Result<()> {
        teardown(&self.inner);
        Ok(())
    }

    async fn send(&self, message: &Value) -> Result<()> {
        let text = serde_json::to_string(message)
            .map_err(|e| BayeuxError::Network(format!("Failed to encode message: {}", e)))?;
        let writer = self
            .inner
            .conn
            .lock()
            .writer
            .clone()
            .ok_or_else(|| BayeuxError::Network("WebSocket is not connected".to_string()))?;
        writer
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|_| BayeuxError::Network("WebSocket writer is gone".to_string()))?;
        self.inner.base.record_sent(message);
        Ok(())
    }

    async fn send_batch(&self, messages: &[Value]) -> Result<()> {
        let payload = Value::Array(messages.to_vec());
        let text = serde_json::to_string(&payload)
            .map_err(|e| BayeuxError::Network(format!("Failed to encode batch: {}", e)))?;
        let writer = self
            .inner
            .conn
            .lock()
            .writer
            .clone()
            .ok_or_else(|| BayeuxError::Network("WebSocket is not connected".to_string()))?;
        writer
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|_| BayeuxError::Network("WebSocket writer is gone".to_string()))?;
        for message in messages {
            self.inner.base.record_sent(message);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        teardown(&self.inner);
        self.inner.conn.lock().url = None;
        Ok(())
    }

    fn statistics(&self) -> TransportStats {
        self.inner.base.stats()
    }

    fn messages(&self) -> broadcast::Receiver<Value> {
        self.inner.base.messages()
    }

    fn errors(&self) -> broadcast::Receiver<BayeuxError> {
        self.inner.base.errors()
    }

    fn connection_states(&self) -> watch::Receiver<bool> {
        self.inner.base.connection_states()
    }
}

/// Convert an endpoint URL to its `ws(s)://` form, preserving authority,
/// path, and query.
fn websocket_url(endpoint: &str) -> Result<String> {
    let url = url::Url::parse(endpoint)
        .map_err(|e| BayeuxError::Network(format!("Invalid endpoint URL: {}", e)))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(BayeuxError::Network(format!(
                "Unsupported URL scheme: {}",
                other
            )))
        }
    };
    let mut out = format!("{}://{}{}", scheme, url.authority(), url.path());
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    Ok(out)
}

/// Open the socket and start the writer/reader/heartbeat tasks.
/// Resets the reconnect counters on success.
async fn establish(inner: &Arc<WsInner>, url: &str) -> Result<()> {
    let ws_url = websocket_url(url)?;
    let headers = inner.conn.lock().headers.clone();

    let mut request = ws_url
        .clone()
        .into_client_request()
        .map_err(|e| BayeuxError::Network(format!("Failed to build WebSocket request: {}", e)))?;
    for (name, value) in &headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(n), Ok(v)) => {
                request.headers_mut().insert(n, v);
            }
            _ => warn!(header = name, "Skipping invalid WebSocket header"),
        }
    }

    let (stream, _) = connect_async(request).await.map_err(|e| match e {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            let body = response
                .into_body()
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default();
            BayeuxError::Http { status, body }
        }
        other => BayeuxError::Network(format!("WebSocket connect failed: {}", other)),
    })?;

    debug!(url = %ws_url, "WebSocket connected");
    let (mut sink, mut source) = stream.split();
    let (writer_tx, mut writer_rx) = mpsc::channel::<WsMessage>(64);

    // Writer pump: owns the sink half
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = writer_rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    // Reader: decodes frames until the socket drops, then hands off to the
    // reconnect policy
    let reader_inner = inner.clone();
    let reader_writer = writer_tx.clone();
    let reader_task = tokio::spawn(async move {
        while let Some(frame) = source.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => handle_frame(&reader_inner.base, text.as_str()),
                Ok(WsMessage::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => handle_frame(&reader_inner.base, text),
                    Err(_) => reader_inner.base.emit_error(BayeuxError::Protocol(
                        "Binary frame is not valid UTF-8".to_string(),
                    )),
                },
                Ok(WsMessage::Ping(payload)) => {
                    let _ = reader_writer.try_send(WsMessage::Pong(payload));
                }
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    reader_inner
                        .base
                        .emit_error(BayeuxError::Network(format!("WebSocket error: {}", e)));
                    break;
                }
            }
        }

        reader_inner.base.set_connected(false);
        let should_reconnect = {
            let mut conn = reader_inner.conn.lock();
            conn.writer = None;
            !conn.closing && reader_inner.auto_reconnect
        };
        if should_reconnect {
            schedule_reconnect(reader_inner.clone());
        }
    });

    // Heartbeat: minimal /meta/connect at a fixed cadence; failure is
    // reported but never closes the socket by itself
    let heartbeat_inner = inner.clone();
    let heartbeat_writer = writer_tx.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_inner.heartbeat_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !heartbeat_inner.base.is_connected() {
                break;
            }
            let envelope = message::connect(
                &heartbeat_inner.base.client_id_or_placeholder(),
                WEBSOCKET,
            );
            let text = match serde_json::to_string(&envelope) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if heartbeat_writer.send(WsMessage::Text(text.into())).await.is_err() {
                heartbeat_inner
                    .base
                    .emit_error(BayeuxError::Network("Heartbeat failed".to_string()));
                break;
            }
            heartbeat_inner.base.record_sent(&envelope);
        }
    });

    {
        let mut conn = inner.conn.lock();
        if conn.closing {
            writer_task.abort();
            reader_task.abort();
            heartbeat_task.abort();
            return Err(BayeuxError::Network(
                "Transport closed during connect".to_string(),
            ));
        }
        for task in conn.tasks.drain(..) {
            task.abort();
        }
        conn.writer = Some(writer_tx);
        conn.tasks = vec![writer_task, reader_task, heartbeat_task];
        conn.reconnect_attempts = 0;
        conn.reconnect_delay = inner.initial_reconnect_delay;
    }
    inner.base.set_connected(true);
    Ok(())
}

/// Retry `connect` after the current delay, growing it by 1.5x per failed
/// attempt, until the attempt cap.
fn schedule_reconnect(inner: Arc<WsInner>) {
    let task_inner = inner.clone();
    let task = tokio::spawn(async move {
        loop {
            let (delay, url) = {
                let conn = task_inner.conn.lock();
                if conn.closing || conn.reconnect_attempts >= task_inner.max_reconnect_attempts {
                    return;
                }
                match &conn.url {
                    Some(url) => (conn.reconnect_delay, url.clone()),
                    None => return,
                }
            };

            tokio::time::sleep(delay).await;
            if task_inner.conn.lock().closing {
                return;
            }

            match establish(&task_inner, &url).await {
                Ok(()) => {
                    debug!("WebSocket reconnected");
                    return;
                }
                Err(e) => {
                    {
                        let mut conn = task_inner.conn.lock();
                        conn.reconnect_attempts += 1;
                        let next = (conn.reconnect_delay.as_millis() as f64 * 1.5).round() as u64;
                        conn.reconnect_delay = Duration::from_millis(next);
                    }
                    task_inner
                        .base
                        .emit_error(BayeuxError::Network(format!("Reconnection failed: {}", e)));
                }
            }
        }
    });

    let mut conn = inner.conn.lock();
    if let Some(old) = conn.reconnect_task.replace(task) {
        old.abort();
    }
}

fn teardown(inner: &Arc<WsInner>) {
    let mut conn = inner.conn.lock();
    conn.closing = true;
    if let Some(writer) = conn.writer.take() {
        let _ = writer.try_send(WsMessage::Close(None));
    }
    for task in conn.tasks.drain(..) {
        task.abort();
    }
    if let Some(task) = conn.reconnect_task.take() {
        task.abort();
    }
    inner.base.set_connected(false);
}

/// Decode one frame: an object emits once, an array emits each element in
/// order, any other JSON is wrapped so the dispatcher always sees a map.
fn handle_frame(base: &TransportBase, text: &str) {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => {
            for item in items {
                base.emit_message(item);
            }
        }
        Ok(value @ Value::Object(_)) => base.emit_message(value),
        Ok(other) => {
            let kind = json_type_name(&other);
            base.emit_message(json!({ "data": other, "type": kind }));
        }
        Err(e) => {
            base.emit_error(BayeuxError::Protocol(format!(
                "Failed to parse frame: {}",
                e
            )));
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
