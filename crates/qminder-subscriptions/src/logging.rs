//! Tracing targets used by the subscription engine.
//!
//! The crate never installs a subscriber. To see logs, install one in the
//! application and filter with these targets:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("qminder_subscriptions::connection=info")
//!     .init();
//! ```

/// Target names for log filtering.
pub mod targets {
    /// Connection state machine: open, close, reconnect.
    pub const CONNECTION: &str = "qminder_subscriptions::connection";
    /// Ping/pong liveness checks.
    pub const HEARTBEAT: &str = "qminder_subscriptions::heartbeat";
    /// Inbound frame dispatch.
    pub const ROUTER: &str = "qminder_subscriptions::router";
    /// Temporary key exchange.
    pub const CREDENTIALS: &str = "qminder_subscriptions::credentials";
    /// WebSocket pump.
    pub const TRANSPORT: &str = "qminder_subscriptions::transport";
    /// Online/offline monitoring.
    pub const NETWORK: &str = "qminder_subscriptions::network";
}
