use std::time::Duration;

/// Tunable parameters shared across the client: HTTP timeouts, websocket
/// keep-alive cadence, and prekey replenishment thresholds.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP request timeout against the relay and Atlas.
    pub http_timeout: Duration,
    /// WebSocketResource keep-alive idle interval before a ping is sent.
    pub keepalive_interval: Duration,
    /// Grace period after a keep-alive ping before the socket is force-closed.
    pub keepalive_disconnect_timeout: Duration,
    /// `refreshPreKeys` triggers a refill once the available count drops to or below this.
    pub prekey_low_water_mark: u32,
    /// Number of prekeys generated per refill batch.
    pub prekey_fill: u32,
    /// Whether MessageReceiver reconnects with unbounded retries on unintentional close.
    pub auto_reconnect: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(55),
            keepalive_disconnect_timeout: Duration::from_secs(1),
            prekey_low_water_mark: 10,
            prekey_fill: 100,
            auto_reconnect: true,
        }
    }
}
