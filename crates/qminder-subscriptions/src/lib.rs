//! GraphQL subscriptions for the Qminder API.
//!
//! This crate keeps real-time subscriptions to the Qminder API alive:
//!
//! - **One connection**: every subscription is multiplexed over a single
//!   WebSocket, opened lazily with a temporary key obtained from the API key
//! - **Liveness**: a ping every 20 seconds; no pong within 12 seconds means
//!   the connection is dead
//! - **Reconnect**: randomized exponential backoff, after which every active
//!   subscription is started again on the new connection
//! - **Isolation**: a server error or an unsubscribe affects only its own
//!   subscription
//!
//! # Subscribing
//!
//! ```ignore
//! use qminder_subscriptions::{SubscriptionClient, SubscriptionEvent};
//!
//! let client = SubscriptionClient::builder("API_KEY").build()?;
//!
//! let mut created = client
//!     .subscribe("subscription { createdTickets(locationId: 123) { id firstName } }")
//!     .await?;
//!
//! while let Some(event) = created.next().await {
//!     if let SubscriptionEvent::Next(data) = event {
//!         println!("{data}"); // {"createdTickets":{"id":"12","firstName":"Marta"}}
//!     }
//! }
//! ```
//!
//! [`SubscriptionStream`] also implements `futures::Stream`. Dropping it
//! unsubscribes.
//!
//! ## Observers
//!
//! ```ignore
//! use qminder_subscriptions::{Observer, SubscriptionError};
//!
//! struct Printer;
//!
//! impl Observer for Printer {
//!     fn next(&mut self, value: serde_json::Value) {
//!         println!("{value}");
//!     }
//!
//!     fn error(&mut self, error: SubscriptionError) {
//!         eprintln!("{error}");
//!     }
//! }
//!
//! let handle = client
//!     .subscribe_with("subscription { ticketCreated { id } }", Printer)
//!     .await?;
//! // ...
//! handle.cancel();
//! ```
//!
//! # Connection Status
//!
//! ```ignore
//! let mut status = client.connection_status();
//! client.ensure_connected().await?;
//!
//! while status.changed().await.is_ok() {
//!     println!("{:?}", *status.borrow());
//! }
//! ```
//!
//! # Configuration
//!
//! ```ignore
//! use std::time::Duration;
//! use qminder_subscriptions::{SubscriptionClient, SubscriptionConfig};
//!
//! let config = SubscriptionConfig::new()
//!     .server("api.qminder.com")
//!     .ping_interval(Duration::from_secs(30))
//!     .header("X-Client", "kiosk");
//!
//! let client = SubscriptionClient::builder("API_KEY").config(config).build()?;
//! ```
//!
//! # Logging
//!
//! Diagnostics are emitted with `tracing` under the targets in
//! [`logging::targets`].

pub mod backoff;
mod client;
pub mod config;
pub mod credentials;
mod engine;
mod error;
mod heartbeat;
pub mod logging;
pub mod network;
pub mod protocol;
mod registry;
mod router;
mod stream;
pub mod transport;

pub use client::{ConnectionStatus, SubscriptionClient, SubscriptionClientBuilder};
pub use config::{RetryDelays, SubscriptionConfig};
pub use credentials::{TemporaryKeyProvider, TokenProvider};
pub use error::{CredentialError, Error, Result, SubscriptionError};
pub use network::NetworkMonitor;
pub use protocol::{GraphQLError, GraphQLLocation, PathSegment};
pub use stream::{Observer, SubscriptionEvent, SubscriptionHandle, SubscriptionStream};
pub use transport::{CloseReason, Connection, ConnectionPeer, Connector, TransportEvent};
