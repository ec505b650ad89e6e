//! Bayeux envelopes, advice, and response-shape normalization
//!
//! Wire messages stay dynamic `serde_json::Value` maps because the protocol
//! is schemaless; the builders here pin down the fields each meta operation
//! requires. `Advice` is the one stable shape worth a typed struct.

use crate::error::{BayeuxError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const HANDSHAKE_CHANNEL: &str = "/meta/handshake";
pub const CONNECT_CHANNEL: &str = "/meta/connect";
pub const SUBSCRIBE_CHANNEL: &str = "/meta/subscribe";
pub const UNSUBSCRIBE_CHANNEL: &str = "/meta/unsubscribe";
pub const DISCONNECT_CHANNEL: &str = "/meta/disconnect";

/// Protocol version advertised in the handshake
pub const BAYEUX_VERSION: &str = "1.0";

/// Build a `/meta/handshake` envelope
pub fn handshake(supported_connection_types: &[String], id: &str) -> Value {
    json!({
        "channel": HANDSHAKE_CHANNEL,
        "version": BAYEUX_VERSION,
        "supportedConnectionTypes": supported_connection_types,
        "id": id,
    })
}

/// Build a keepalive `/meta/connect` envelope (no correlation id)
pub fn connect(client_id: &str, connection_type: &str) -> Value {
    json!({
        "channel": CONNECT_CHANNEL,
        "clientId": client_id,
        "connectionType": connection_type,
    })
}

/// Build a `/meta/subscribe` envelope
pub fn subscribe(client_id: &str, subscription: &str, id: &str) -> Value {
    json!({
        "channel": SUBSCRIBE_CHANNEL,
        "clientId": client_id,
        "subscription": subscription,
        "id": id,
    })
}

/// Build a `/meta/unsubscribe` envelope
pub fn unsubscribe(client_id: &str, subscription: &str, id: &str) -> Value {
    json!({
        "channel": UNSUBSCRIBE_CHANNEL,
        "clientId": client_id,
        "subscription": subscription,
        "id": id,
    })
}

/// Build a best-effort `/meta/disconnect` envelope
pub fn disconnect(client_id: &str) -> Value {
    json!({
        "channel": DISCONNECT_CHANNEL,
        "clientId": client_id,
    })
}

/// Build a publish envelope for a user channel
pub fn publish(channel: &str, data: &Value, client_id: &str, id: &str) -> Value {
    json!({
        "channel": channel,
        "clientId": client_id,
        "data": data,
        "id": id,
    })
}

/// Server reconnect policy carried in advice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectAdvice {
    /// Re-issue `/meta/connect` on the existing session
    Retry,
    /// Start over with a fresh handshake
    Handshake,
    /// Do not reconnect at all
    None,
}

/// Server-supplied hints on reconnect behavior and timing.
///
/// Any `advice` object received from the server merges into the session
/// advice field-by-field; absent fields keep their previous values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advice {
    pub reconnect: ReconnectAdvice,
    /// Delay in milliseconds before the next `/meta/connect`
    pub interval: u64,
    /// Per-message response timeout in milliseconds
    pub timeout: u64,
}

impl Default for Advice {
    fn default() -> Self {
        Self {
            reconnect: ReconnectAdvice::Retry,
            interval: 0,
            timeout: 60_000,
        }
    }
}

impl Advice {
    /// Merge a server `advice` object into this advice
    pub fn merge(&mut self, value: &Value) {
        let Some(obj) = value.as_object() else {
            return;
        };
        match obj.get("reconnect").and_then(Value::as_str) {
            Some("retry") => self.reconnect = ReconnectAdvice::Retry,
            Some("handshake") => self.reconnect = ReconnectAdvice::Handshake,
            Some("none") => self.reconnect = ReconnectAdvice::None,
            _ => {}
        }
        if let Some(interval) = obj.get("interval").and_then(Value::as_u64) {
            self.interval = interval;
        }
        if let Some(timeout) = obj.get("timeout").and_then(Value::as_u64) {
            self.timeout = timeout;
        }
    }
}

/// Normalize a Bayeux response into its first envelope.
///
/// Servers reply with either a single object or an array of one or more
/// objects, and some transports hand us the raw body string. This accepts
/// all three shapes and returns the first envelope map.
pub fn extract_bayeux_message(response: Value) -> Result<Value> {
    match response {
        Value::String(raw) => {
            let decoded: Value = serde_json::from_str(&raw)
                .map_err(|e| BayeuxError::Network(format!("Failed to parse response: {}", e)))?;
            match decoded {
                Value::String(_) => Err(BayeuxError::Network(
                    "Failed to parse response: nested string payload".to_string(),
                )),
                other => extract_bayeux_message(other),
            }
        }
        Value::Array(items) => {
            if items.is_empty() {
                return Err(BayeuxError::Network("Empty response array".to_string()));
            }
            let first = items.into_iter().next().unwrap_or(Value::Null);
            if first.is_object() {
                Ok(first)
            } else {
                Err(BayeuxError::Network(format!(
                    "Expected an object in response array, got: {}",
                    first
                )))
            }
        }
        Value::Object(_) => Ok(response),
        other => Err(BayeuxError::Network(format!(
            "Unexpected response shape: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_envelope() {
        let msg = handshake(
            &["long-polling".to_string(), "websocket".to_string()],
            "1",
        );
        assert_eq!(msg["channel"], "/meta/handshake");
        assert_eq!(msg["version"], "1.0");
        assert_eq!(
            msg["supportedConnectionTypes"],
            json!(["long-polling", "websocket"])
        );
        assert_eq!(msg["id"], "1");
    }

    #[test]
    fn test_connect_envelope() {
        let msg = connect("abc", "long-polling");
        assert_eq!(msg["channel"], "/meta/connect");
        assert_eq!(msg["clientId"], "abc");
        assert_eq!(msg["connectionType"], "long-polling");
        assert!(msg.get("id").is_none());
    }

    #[test]
    fn test_subscribe_envelope() {
        let msg = subscribe("abc", "/chat/room1", "2");
        assert_eq!(msg["channel"], "/meta/subscribe");
        assert_eq!(msg["clientId"], "abc");
        assert_eq!(msg["subscription"], "/chat/room1");
        assert_eq!(msg["id"], "2");
    }

    #[test]
    fn test_publish_envelope() {
        let msg = publish("/chat/room1", &json!({"text": "hi"}), "abc", "3");
        assert_eq!(msg["channel"], "/chat/room1");
        assert_eq!(msg["data"]["text"], "hi");
        assert_eq!(msg["clientId"], "abc");
        assert_eq!(msg["id"], "3");
    }

    #[test]
    fn test_advice_defaults() {
        let advice = Advice::default();
        assert_eq!(advice.reconnect, ReconnectAdvice::Retry);
        assert_eq!(advice.interval, 0);
        assert_eq!(advice.timeout, 60_000);
    }

    #[test]
    fn test_advice_merge() {
        let mut advice = Advice::default();
        advice.merge(&json!({"reconnect": "handshake", "interval": 500}));
        assert_eq!(advice.reconnect, ReconnectAdvice::Handshake);
        assert_eq!(advice.interval, 500);
        // Unspecified fields keep their values
        assert_eq!(advice.timeout, 60_000);

        advice.merge(&json!({"timeout": 15000}));
        assert_eq!(advice.timeout, 15_000);
        assert_eq!(advice.reconnect, ReconnectAdvice::Handshake);
    }

    #[test]
    fn test_advice_merge_ignores_garbage() {
        let mut advice = Advice::default();
        advice.merge(&json!("not an object"));
        advice.merge(&json!({"reconnect": "bogus"}));
        assert_eq!(advice, Advice::default());
    }

    #[test]
    fn test_advice_serde_round_trip() {
        let advice = Advice {
            reconnect: ReconnectAdvice::None,
            interval: 100,
            timeout: 5000,
        };
        let encoded = serde_json::to_string(&advice).unwrap();
        assert!(encoded.contains("\"none\""));
        let decoded: Advice = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, advice);
    }

    #[test]
    fn test_extract_single_object() {
        let msg = extract_bayeux_message(json!({"successful": true, "clientId": "c1"})).unwrap();
        assert_eq!(msg["clientId"], "c1");
    }

    #[test]
    fn test_extract_array_takes_first() {
        let msg = extract_bayeux_message(json!([
            {"successful": true, "clientId": "c1"},
            {"channel": "/x", "data": 1},
        ]))
        .unwrap();
        assert_eq!(msg["clientId"], "c1");
    }

    #[test]
    fn test_extract_empty_array() {
        let err = extract_bayeux_message(json!([])).unwrap_err();
        assert!(err.to_string().contains("Empty response array"));
    }

    #[test]
    fn test_extract_array_of_non_objects() {
        let err = extract_bayeux_message(json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, BayeuxError::Network(_)));
    }

    #[test]
    fn test_extract_from_string() {
        let msg =
            extract_bayeux_message(json!(r#"{"successful": true, "clientId": "c1"}"#)).unwrap();
        assert_eq!(msg["clientId"], "c1");

        let msg = extract_bayeux_message(json!(r#"[{"successful": false}]"#)).unwrap();
        assert_eq!(msg["successful"], false);
    }

    #[test]
    fn test_extract_unparseable_string() {
        let err = extract_bayeux_message(json!("not json")).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn test_extract_scalar() {
        let err = extract_bayeux_message(json!(42)).unwrap_err();
        assert!(matches!(err, BayeuxError::Network(_)));
    }

    #[test]
    fn test_value_clone_is_deep() {
        let original = json!({"a": {"b": [1, 2, 3]}});
        let mut copy = original.clone();
        assert_eq!(copy, original);
        copy["a"]["b"][0] = json!(99);
        // The original is untouched; clones share no mutable substructure
        assert_eq!(original["a"]["b"][0], 1);
    }
}
