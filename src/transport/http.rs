//! HTTP transports: long-polling and JSONP callback-polling
//!
//! Every exchange is a single HTTP request carrying one envelope or a
//! batch. Responses are re-emitted on the inbound message stream so the
//! dispatcher's correlation map can satisfy awaiters through the same path
//! that server pushes take.

use crate::config::ClientConfig;
use crate::error::{BayeuxError, Result};
use crate::message::{self, extract_bayeux_message, BAYEUX_VERSION, HANDSHAKE_CHANNEL};
use crate::transport::{Transport, TransportBase, TransportStats, CALLBACK_POLLING, LONG_POLLING};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HttpMode {
    LongPolling,
    CallbackPolling,
}

impl HttpMode {
    fn name(self) -> &'static str {
        match self {
            HttpMode::LongPolling => LONG_POLLING,
            HttpMode::CallbackPolling => CALLBACK_POLLING,
        }
    }
}

struct HttpConnection {
    url: Option<String>,
    headers: HashMap<String, String>,
    poll_task: Option<JoinHandle<()>>,
}

/// HTTP transport speaking either long-polling POSTs or JSONP GETs
pub struct HttpTransport {
    mode: HttpMode,
    http: reqwest::Client,
    base: Arc<TransportBase>,
    polling_interval: Duration,
    conn: Mutex<HttpConnection>,
}

impl HttpTransport {
    /// Build the long-polling variant
    pub fn long_polling(config: &ClientConfig) -> Self {
        Self::new(HttpMode::LongPolling, config)
    }

    /// Build the JSONP callback-polling variant
    pub fn callback_polling(config: &ClientConfig) -> Self {
        Self::new(HttpMode::CallbackPolling, config)
    }

    fn new(mode: HttpMode, config: &ClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(config.user_agent.clone())
            .build()
            .unwrap_or_default();

        Self {
            mode,
            http,
            base: Arc::new(TransportBase::new(mode.name(), config.request_timeout)),
            polling_interval: config.polling_interval,
            conn: Mutex::new(HttpConnection {
                url: None,
                headers: HashMap::new(),
                poll_task: None,
            }),
        }
    }

    fn target(&self) -> Result<(String, HashMap<String, String>)> {
        let conn = self.conn.lock();
        match &conn.url {
            Some(url) => Ok((url.clone(), conn.headers.clone())),
            None => Err(BayeuxError::Network(
                "HTTP transport is not connected".to_string(),
            )),
        }
    }

    fn start_polling(&self) {
        let http = self.http.clone();
        let base = self.base.clone();
        let mode = self.mode;
        let interval = self.polling_interval;
        let (url, headers) = {
            let conn = self.conn.lock();
            (
                conn.url.clone().unwrap_or_default(),
                conn.headers.clone(),
            )
        };

        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !base.is_connected() {
                    break;
                }
                let envelope =
                    message::connect(&base.client_id_or_placeholder(), mode.name());
                match http_exchange(&http, mode, &url, &headers, &envelope).await {
                    Ok(response) => emit_response(&base, response),
                    Err(e) => {
                        // Recovery is the session's responsibility
                        warn!(error = %e, "Poll failed, stopping poll timer");
                        base.emit_error(BayeuxError::Network(format!("Poll failed: {}", e)));
                        break;
                    }
                }
            }
        });

        let mut conn = self.conn.lock();
        if let Some(old) = conn.poll_task.replace(task) {
            old.abort();
        }
    }

    fn stop_polling(&self) {
        if let Some(task) = self.conn.lock().poll_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        self.mode.name()
    }

    fn supported(&self) -> bool {
        true
    }

    fn connected(&self) -> bool {
        self.base.is_connected()
    }

    fn request_timeout(&self) -> Duration {
        self.base.timeout()
    }

    fn set_request_timeout(&self, timeout: Duration) {
        self.base.set_timeout(timeout);
    }

    fn set_client_id(&self, client_id: Option<String>) {
        self.base.set_client_id(client_id);
    }

    async fn connect(&self, url: &str, headers: &HashMap<String, String>) -> Result<()> {
        {
            let mut conn = self.conn.lock();
            conn.url = Some(url.to_string());
            conn.headers = headers.clone();
        }

        // Probe the endpoint with a minimal handshake before reporting the
        // transport usable.
        let probe = json!({
            "channel": HANDSHAKE_CHANNEL,
            "version": BAYEUX_VERSION,
            "supportedConnectionTypes": [self.name()],
        });
        let response = http_exchange(&self.http, self.mode, url, headers, &probe).await?;
        let first = extract_bayeux_message(response)?;

        if !first.get("successful").and_then(Value::as_bool).unwrap_or(false) {
            return Err(first
                .get("error")
                .map(BayeuxError::from_error_field)
                .unwrap_or_else(|| {
                    BayeuxError::Network("Handshake probe rejected by server".to_string())
                }));
        }

        debug!(url, transport = self.name(), "HTTP transport connected");
        self.base.set_connected(true);

        if self.mode == HttpMode::LongPolling {
            self.start_polling();
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_polling();
        self.base.set_connected(false);
        Ok(())
    }

    async fn send(&self, message: &Value) -> Result<()> {
        let (url, headers) = self.target()?;
        self.base.record_sent(message);

        let response = http_exchange(&self.http, self.mode, &url, &headers, message).await?;
        // Immediate requests carry their reply in the POST body; the first
        // envelope must reach any pending awaiter via the inbound stream.
        let first = extract_bayeux_message(response)?;
        self.base.emit_message(first);
        Ok(())
    }

    async fn send_batch(&self, messages: &[Value]) -> Result<()> {
        let (url, headers) = self.target()?;
        for message in messages {
            self.base.record_sent(message);
        }

        let payload = Value::Array(messages.to_vec());
        let response = http_exchange(&self.http, self.mode, &url, &headers, &payload).await?;
        emit_response(&self.base, response);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.stop_polling();
        self.base.set_connected(false);
        self.conn.lock().url = None;
        Ok(())
    }

    fn statistics(&self) -> TransportStats {
        self.base.stats()
    }

    fn messages(&self) -> broadcast::Receiver<Value> {
        self.base.messages()
    }

    fn errors(&self) -> broadcast::Receiver<BayeuxError> {
        self.base.errors()
    }

    fn connection_states(&self) -> watch::Receiver<bool> {
        self.base.connection_states()
    }
}

/// Emit every element of an array response, or a single object, in order
fn emit_response(base: &TransportBase, response: Value) {
    match response {
        Value::Array(items) => {
            for item in items {
                base.emit_message(item);
            }
        }
        other => base.emit_message(other),
    }
}

/// One HTTP exchange: POST for long-polling, GET with a JSONP callback for
/// callback-polling. Non-200 statuses surface as HTTP passthrough errors.
async fn http_exchange(
    http: &reqwest::Client,
    mode: HttpMode,
    url: &str,
    headers: &HashMap<String, String>,
    payload: &Value,
) -> Result<Value> {
    let mut request = match mode {
        HttpMode::LongPolling => http
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(payload),
        HttpMode::CallbackPolling => {
            let encoded = serde_json::to_string(payload)
                .map_err(|e| BayeuxError::Network(format!("Failed to encode request: {}", e)))?;
            let callback = jsonp_callback_name();
            http.get(url).query(&[
                ("message", encoded.as_str()),
                ("jsonp", callback.as_str()),
            ])
        }
    };

    for (name, value) in headers {
        request = request.header(name, value);
    }

    let response = request
        .send()
        .await
        .map_err(|e| BayeuxError::Network(format!("Request failed: {}", e)))?;

    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| BayeuxError::Network(format!("Failed to read response body: {}", e)))?;

    if status != 200 {
        return Err(BayeuxError::Http { status, body });
    }

    let body = match mode {
        HttpMode::LongPolling => body.as_str(),
        HttpMode::CallbackPolling => strip_jsonp_wrapper(&body),
    };

    serde_json::from_str(body)
        .map_err(|e| BayeuxError::Network(format!("Failed to parse response: {}", e)))
}

/// Callback parameter name derived from the current millisecond timestamp
fn jsonp_callback_name() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("callback{}", millis)
}

/// Strip the `callback(...)` wrapper from a JSONP response body
fn strip_jsonp_wrapper(body: &str) -> &str {
    match (body.find('('), body.rfind(')')) {
        (Some(open), Some(close)) if open < close => &body[open + 1..close],
        _ => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig::new("http://localhost:8000/faye")
    }

    #[test]
    fn test_transport_names() {
        assert_eq!(HttpTransport::long_polling(&config()).name(), "long-polling");
        assert_eq!(
            HttpTransport::callback_polling(&config()).name(),
            "callback-polling"
        );
    }

    #[test]
    fn test_always_supported() {
        assert!(HttpTransport::long_polling(&config()).supported());
    }

    #[test]
    fn test_starts_disconnected() {
        let transport = HttpTransport::long_polling(&config());
        assert!(!transport.connected());
        assert_eq!(transport.statistics().messages_sent, 0);
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let transport = HttpTransport::long_polling(&config());
        let err = transport.send(&json!({"channel": "/x"})).await.unwrap_err();
        assert!(matches!(err, BayeuxError::Network(_)));
    }

    #[test]
    fn test_timeout_is_mutable() {
        let transport = HttpTransport::long_polling(&config());
        transport.set_request_timeout(Duration::from_secs(3));
        assert_eq!(transport.request_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_strip_jsonp_wrapper() {
        assert_eq!(
            strip_jsonp_wrapper(r#"callback1700000000000([{"successful":true}]);"#),
            r#"[{"successful":true}]"#
        );
        // Bodies without a wrapper pass through untouched
        assert_eq!(strip_jsonp_wrapper(r#"{"a":1}"#), r#"{"a":1}"#);
    }

    #[test]
    fn test_jsonp_callback_name_shape() {
        let name = jsonp_callback_name();
        assert!(name.starts_with("callback"));
        assert!(name["callback".len()..].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_emit_response_array_order() {
        let base = TransportBase::new(LONG_POLLING, Duration::from_secs(30));
        let mut rx = base.messages();
        emit_response(
            &base,
            json!([{"channel": "/a"}, {"channel": "/b"}]),
        );
        assert_eq!(rx.try_recv().unwrap()["channel"], "/a");
        assert_eq!(rx.try_recv().unwrap()["channel"], "/b");
    }
}
