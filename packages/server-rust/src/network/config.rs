//! Listener and per-connection settings.

use std::time::Duration;

/// Settings for the request/reply listener and the message transport.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub host: String,
    /// 0 lets the OS pick a port.
    pub port: u16,
    /// Path the message transport upgrades on.
    pub ws_path: String,
    pub connection: ConnectionConfig,
    /// `*` allows any origin.
    pub cors_origins: Vec<String>,
    /// Upper bound for a single request/reply call, enforced by the HTTP stack.
    pub request_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            ws_path: "/ws".to_string(),
            connection: ConnectionConfig::default(),
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Backpressure settings for one message-transport connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Capacity of the bounded outbound queue.
    pub outbound_channel_capacity: usize,
    /// How long a reply may wait for queue space before it is dropped.
    pub send_timeout: Duration,
    /// Envelopes dispatched concurrently on one connection. Envelopes beyond
    /// this are answered with an overloaded failure instead of being run.
    pub max_in_flight: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            send_timeout: Duration::from_secs(5),
            max_in_flight: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_config_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 0);
        assert_eq!(config.ws_path, "/ws");
        assert_eq!(config.cors_origins, vec!["*"]);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn connection_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.outbound_channel_capacity, 256);
        assert_eq!(config.send_timeout, Duration::from_secs(5));
        assert_eq!(config.max_in_flight, 64);
    }
}
