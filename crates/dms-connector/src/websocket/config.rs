//! DMS connection configuration.

use std::time::Duration;

use crate::reconnect::ReconnectPolicy;

/// Default DMS websocket port.
pub const DEFAULT_PORT: u16 = 9020;
/// Default DMS host; local connections need no authentication.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default base path for JSON Data Exchange.
pub const DEFAULT_BASE_PATH: &str = "/json_data";

/// Configuration for a DMS client.
#[derive(Clone, Debug)]
pub struct DmsConfig {
    // Endpoint
    /// DMS host name or address.
    pub host: String,
    /// DMS port.
    pub port: u16,
    /// Base path of the JSON Data Exchange endpoint.
    pub base_path: String,
    /// Use `wss://` instead of `ws://`.
    pub secure: bool,

    // Identity
    /// Client name sent as `whois` in every frame.
    pub whois: String,
    /// User name sent as `user` in every frame.
    pub user: String,

    // Reconnection settings
    /// Behaviour after an unexpected disconnect.
    pub reconnect: ReconnectPolicy,

    // Heartbeat settings
    /// Interval between ping frames.
    pub ping_interval: Duration,
    /// Maximum time to wait for a pong.
    pub pong_timeout: Duration,
    /// Send websocket protocol-level pings.
    pub use_websocket_ping: bool,

    // Request handling
    /// Default timeout for request-response operations.
    pub request_timeout: Duration,
    /// Maximum number of requests in flight.
    pub max_pending_requests: usize,

    // Channels
    /// Capacity of the command channel to the connection task.
    pub command_channel_capacity: usize,

    // Event delivery
    /// Warn when one handler invocation runs longer than this.
    pub callback_duration_warning: Duration,
    /// Warn when more events than this wait for their handlers.
    pub event_queue_warn_size: usize,

    // Connection
    /// Timeout for opening the websocket.
    pub connect_timeout: Duration,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl Default for DmsConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            base_path: DEFAULT_BASE_PATH.to_string(),
            secure: false,
            whois: String::new(),
            user: String::new(),
            reconnect: ReconnectPolicy::default(),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            use_websocket_ping: true,
            request_timeout: Duration::from_secs(300),
            max_pending_requests: 1000,
            command_channel_capacity: 64,
            callback_duration_warning: Duration::from_secs(10),
            event_queue_warn_size: 100,
            connect_timeout: Duration::from_secs(10),
            max_message_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}

impl DmsConfig {
    /// Create a configuration for the given client and user names.
    pub fn new(whois: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            whois: whois.into(),
            user: user.into(),
            ..Default::default()
        }
    }

    /// The websocket URL built from the endpoint settings.
    pub fn url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let path = if self.base_path.starts_with('/') {
            self.base_path.clone()
        } else {
            format!("/{}", self.base_path)
        };
        format!("{scheme}://{}:{}{path}", self.host, self.port)
    }

    /// Set the host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the base path.
    #[must_use]
    pub fn base_path(mut self, path: impl Into<String>) -> Self {
        self.base_path = path.into();
        self
    }

    /// Set whether to use TLS.
    #[must_use]
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Set the reconnect policy.
    #[must_use]
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the ping interval.
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the pong timeout.
    #[must_use]
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    /// Set whether to use websocket protocol-level pings.
    #[must_use]
    pub fn use_websocket_ping(mut self, use_ws_ping: bool) -> Self {
        self.use_websocket_ping = use_ws_ping;
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the maximum pending requests.
    #[must_use]
    pub fn max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    /// Set the command channel capacity.
    #[must_use]
    pub fn command_channel_capacity(mut self, capacity: usize) -> Self {
        self.command_channel_capacity = capacity;
        self
    }

    /// Set the slow-handler warning threshold.
    #[must_use]
    pub fn callback_duration_warning(mut self, duration: Duration) -> Self {
        self.callback_duration_warning = duration;
        self
    }

    /// Set the event queue warning size.
    #[must_use]
    pub fn event_queue_warn_size(mut self, size: usize) -> Self {
        self.event_queue_warn_size = size;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the maximum inbound message size.
    #[must_use]
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("Host cannot be empty".to_string());
        }
        if self.port == 0 {
            return Err("Port must be > 0".to_string());
        }
        if self.whois.is_empty() {
            return Err("whois cannot be empty".to_string());
        }
        if self.user.is_empty() {
            return Err("user cannot be empty".to_string());
        }
        self.reconnect.validate()?;
        if self.ping_interval.is_zero() {
            return Err("Ping interval must be > 0".to_string());
        }
        if self.pong_timeout.is_zero() {
            return Err("Pong timeout must be > 0".to_string());
        }
        if self.request_timeout.is_zero() {
            return Err("Request timeout must be > 0".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be > 0".to_string());
        }
        if self.max_pending_requests == 0 {
            return Err("Max pending requests must be > 0".to_string());
        }
        if self.command_channel_capacity == 0 {
            return Err("Command channel capacity must be > 0".to_string());
        }
        if self.event_queue_warn_size == 0 {
            return Err("Event queue warning size must be > 0".to_string());
        }
        Ok(())
    }
}
