use std::time::Duration;

use wavelink_proto::IceServer;

/// Protocol revision this client speaks.
pub const PROTOCOL_VERSION: u32 = 12;

/// Client metadata sent as part of the join handshake.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub sdk: String,
    pub version: String,
    pub os: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            sdk: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
        }
    }
}

/// How the engine decides between resume and rebuild when recovering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReconnectOverride {
    /// Resume first, rebuild once resume attempts are spent.
    #[default]
    Auto,
    ForceSoftReconnect,
    ForceFullReconnect,
}

/// Retry budget and pacing for the reconnection ladder.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    /// Wall-clock budget across all attempts.
    pub max_elapsed: Duration,
    /// Per-attempt cap on the quadratic backoff delay.
    pub max_delay: Duration,
    /// How long to wait for transport connectivity after a re-join.
    pub transport_connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            max_elapsed: Duration::from_secs(60),
            max_delay: Duration::from_secs(5),
            transport_connect_timeout: Duration::from_secs(20),
        }
    }
}

impl ReconnectPolicy {
    /// Quadratic backoff: 100ms, 600ms, 2.1s, 4.6s, then capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let millis = 100 + u64::from(attempt) * u64::from(attempt) * 500;
        Duration::from_millis(millis).min(self.max_delay)
    }
}

/// Options governing a session: negotiated capabilities, reconnect policy,
/// and client metadata.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub auto_subscribe: bool,
    pub adaptive_stream: bool,
    pub protocol_version: u32,
    /// Caller-supplied ICE servers; when non-empty these take precedence
    /// over the ones in the join response.
    pub ice_servers: Vec<IceServer>,
    pub reconnect: ReconnectPolicy,
    pub client_info: ClientInfo,
    /// How long to wait for the server to acknowledge a track publication.
    pub publish_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            auto_subscribe: true,
            adaptive_stream: false,
            protocol_version: PROTOCOL_VERSION,
            ice_servers: Vec::new(),
            reconnect: ReconnectPolicy::default(),
            client_info: ClientInfo::default(),
            publish_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectOptions {
    pub fn with_auto_subscribe(mut self, auto_subscribe: bool) -> Self {
        self.auto_subscribe = auto_subscribe;
        self
    }

    pub fn with_adaptive_stream(mut self, adaptive_stream: bool) -> Self {
        self.adaptive_stream = adaptive_stream;
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}
