//! Engine configuration.

use std::collections::HashMap;
use std::time::Duration;

use url::Url;

use crate::error::Result;

/// Default API host.
pub const DEFAULT_API_SERVER: &str = "api.qminder.com";

/// Header carrying the long-lived API key on the key exchange request.
pub const API_KEY_HEADER: &str = "X-Qminder-REST-API-Key";

/// Query parameter carrying the temporary key on the subscription socket URL.
pub const TEMPORARY_KEY_PARAM: &str = "rest-api-key";

/// Lower and upper bound of a retry delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryDelays {
    /// Shortest delay between attempts.
    pub min_delay: Duration,
    /// Longest delay between attempts (before jitter).
    pub max_delay: Duration,
}

impl Default for RetryDelays {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryDelays {
    /// Create retry bounds.
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay,
        }
    }
}

/// Configuration for the subscription engine.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// API host, optionally with a port (`api.qminder.com`, `localhost:8080`).
    pub api_server: String,
    /// Use `https`/`wss`. Turned off only for local testing.
    pub secure: bool,
    /// How often a `ping` frame is sent while connected.
    pub ping_interval: Duration,
    /// How long to wait for a `pong` before the connection is considered dead.
    pub pong_timeout: Duration,
    /// Bounds of the randomized reconnect backoff.
    pub reconnect: RetryDelays,
    /// Bounds of the temporary key retry delay.
    pub credential_retry: RetryDelays,
    /// WebSocket handshake timeout.
    pub connect_timeout: Duration,
    /// Timeout of the temporary key request.
    pub request_timeout: Duration,
    /// Extra headers sent during the WebSocket handshake.
    pub headers: HashMap<String, String>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            api_server: DEFAULT_API_SERVER.to_string(),
            secure: true,
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(12),
            reconnect: RetryDelays::default(),
            credential_retry: RetryDelays::default(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            headers: HashMap::new(),
        }
    }
}

impl SubscriptionConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the API host.
    pub fn server(mut self, api_server: impl Into<String>) -> Self {
        self.api_server = api_server.into();
        self
    }

    /// Use plain `http`/`ws` instead of TLS.
    pub fn insecure(mut self) -> Self {
        self.secure = false;
        self
    }

    /// Set the ping interval.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the pong timeout.
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    /// Set the reconnect backoff bounds.
    pub fn reconnect_delays(mut self, delays: RetryDelays) -> Self {
        self.reconnect = delays;
        self
    }

    /// Set the temporary key retry bounds.
    pub fn credential_retry_delays(mut self, delays: RetryDelays) -> Self {
        self.credential_retry = delays;
        self
    }

    /// Set the WebSocket handshake timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the temporary key request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Add a header for the WebSocket handshake.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// URL of the temporary key exchange endpoint.
    pub fn key_url(&self) -> Result<Url> {
        let scheme = if self.secure { "https" } else { "http" };
        Ok(Url::parse(&format!(
            "{scheme}://{}/graphql/connection-key",
            self.api_server
        ))?)
    }

    /// URL of the subscription socket for a temporary key.
    pub fn subscription_url(&self, temporary_key: &str) -> Result<Url> {
        let mut url = if self.secure {
            Url::parse(&format!("wss://{}:443/graphql/subscription", self.api_server))?
        } else {
            Url::parse(&format!("ws://{}/graphql/subscription", self.api_server))?
        };
        url.query_pairs_mut()
            .append_pair(TEMPORARY_KEY_PARAM, temporary_key);
        Ok(url)
    }
}
