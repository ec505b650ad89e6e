//! Configuration for the Bayeux client

use std::collections::HashMap;
use std::time::Duration;

/// Configuration for connecting to a Bayeux server
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server endpoint URL (e.g. "https://example.com/faye")
    pub endpoint: String,

    /// Extra headers sent with the handshake and every transport request
    pub handshake_headers: HashMap<String, String>,

    /// Timeout for operations that await a correlated response
    pub request_timeout: Duration,

    /// Interval between long-poll `/meta/connect` requests
    pub polling_interval: Duration,

    /// Interval between WebSocket keepalive envelopes
    pub heartbeat_interval: Duration,

    /// Whether the WebSocket transport reconnects after a dropped socket
    pub auto_reconnect: bool,

    /// Maximum number of reconnection attempts before giving up
    pub max_reconnect_attempts: u32,

    /// Initial delay before reconnecting; grows by 1.5x per failed attempt
    pub reconnect_delay: Duration,

    /// User-Agent header value for HTTP requests
    pub user_agent: String,
}

impl ClientConfig {
    /// Create a new configuration for the given endpoint
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            handshake_headers: HashMap::new(),
            request_timeout: Duration::from_secs(30),
            polling_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
            user_agent: format!("bayeux-client-rs/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Add a header to every transport request
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.handshake_headers.insert(name.into(), value.into());
        self
    }

    /// Set the per-message response timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the long-poll interval
    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Set the WebSocket heartbeat interval
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Disable automatic reconnection
    pub fn no_reconnect(mut self) -> Self {
        self.auto_reconnect = false;
        self
    }

    /// Set the reconnection policy: initial delay and attempt cap
    pub fn reconnect(mut self, initial_delay: Duration, max_attempts: u32) -> Self {
        self.reconnect_delay = initial_delay;
        self.max_reconnect_attempts = max_attempts;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::new("https://example.com/faye");

        assert_eq!(config.endpoint, "https://example.com/faye");
        assert!(config.handshake_headers.is_empty());
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.polling_interval, Duration::from_secs(1));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert!(config.auto_reconnect);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert!(config.user_agent.starts_with("bayeux-client-rs/"));
    }

    #[test]
    fn test_config_builder_chain() {
        let config = ClientConfig::new("https://example.com/faye")
            .header("Authorization", "Bearer tok")
            .request_timeout(Duration::from_secs(5))
            .polling_interval(Duration::from_millis(250))
            .heartbeat_interval(Duration::from_secs(10))
            .no_reconnect()
            .reconnect(Duration::from_millis(100), 3);

        assert_eq!(
            config.handshake_headers.get("Authorization"),
            Some(&"Bearer tok".to_string())
        );
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.polling_interval, Duration::from_millis(250));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert!(!config.auto_reconnect);
        assert_eq!(config.reconnect_delay, Duration::from_millis(100));
        assert_eq!(config.max_reconnect_attempts, 3);
    }

    #[test]
    fn test_config_clone() {
        let config = ClientConfig::new("https://example.com/faye").no_reconnect();
        let copy = config.clone();
        assert_eq!(config.endpoint, copy.endpoint);
        assert_eq!(config.auto_reconnect, copy.auto_reconnect);
    }
}
