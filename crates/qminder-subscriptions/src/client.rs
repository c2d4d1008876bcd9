//! Public entry point.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::config::SubscriptionConfig;
use crate::credentials::{TemporaryKeyProvider, TokenProvider};
use crate::engine::{Command, Engine};
use crate::error::{Error, Result};
use crate::stream::{self, Observer, SubscriptionHandle, SubscriptionStream};
use crate::transport::{Connector, WebSocketConnector};

/// State of the shared subscription connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// A connection attempt is in progress.
    Connecting,
    /// The server acknowledged the connection.
    Connected,
    /// No connection. A reconnect may be scheduled.
    Disconnected,
}

/// Client for Qminder GraphQL subscriptions.
///
/// All subscriptions share one WebSocket connection, opened lazily on the
/// first `subscribe()` and kept alive with ping/pong. Dropped connections are
/// re-established with randomized exponential backoff and every active
/// subscription is restarted on the new connection.
///
/// Cloning is cheap; clones share the connection. The background task stops
/// when [`shutdown`](Self::shutdown) is called or the last clone is dropped.
///
/// # Example
///
/// ```ignore
/// use qminder_subscriptions::{SubscriptionClient, SubscriptionEvent};
///
/// let client = SubscriptionClient::builder("API_KEY").build()?;
/// let mut tickets = client
///     .subscribe("subscription { createdTickets(locationId: 123) { id firstName } }")
///     .await?;
///
/// while let Some(event) = tickets.next().await {
///     match event {
///         SubscriptionEvent::Next(data) => println!("{data}"),
///         SubscriptionEvent::Error(e) => eprintln!("{e}"),
///         SubscriptionEvent::Complete => break,
///     }
/// }
/// ```
#[derive(Clone)]
pub struct SubscriptionClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl SubscriptionClient {
    /// Start configuring a client for the given long-lived API key.
    pub fn builder(api_key: impl Into<String>) -> SubscriptionClientBuilder {
        SubscriptionClientBuilder::new(api_key)
    }

    /// Subscribe to a GraphQL subscription document.
    ///
    /// Opens the connection if needed. Dropping the returned stream stops the
    /// subscription.
    pub async fn subscribe(&self, query: impl Into<String>) -> Result<SubscriptionStream> {
        let query = query.into();
        if query.trim().is_empty() {
            return Err(Error::InvalidQuery(
                "subscribe() expects a GraphQL query as its first argument".into(),
            ));
        }

        let (sink, events) = stream::channel();
        let (reply, id) = oneshot::channel();
        self.commands
            .send(Command::Subscribe { query, sink, reply })
            .map_err(|_| Error::Closed)?;
        let id = id.await.map_err(|_| Error::Closed)?;

        Ok(SubscriptionStream::new(id, events, &self.commands))
    }

    /// Subscribe and feed the events into `observer` on a background task.
    pub async fn subscribe_with<O: Observer>(
        &self,
        query: impl Into<String>,
        observer: O,
    ) -> Result<SubscriptionHandle> {
        let stream = self.subscribe(query).await?;
        Ok(SubscriptionHandle::spawn(stream, observer))
    }

    /// Open the connection ahead of any subscription.
    ///
    /// Resolves once the temporary key for the connection attempt has been
    /// obtained, or immediately if a connection is already established. Fails
    /// only if the API key is rejected.
    pub async fn ensure_connected(&self) -> Result<()> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::EnsureConnected { reply })
            .map_err(|_| Error::Closed)?;
        result.await.map_err(|_| Error::Closed)?
    }

    /// Watch connection status changes.
    ///
    /// Starts at [`ConnectionStatus::Connecting`]; repeated values are not
    /// reported.
    pub fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Get the current connection status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Close the connection and end every subscription.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Check if the background task has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

impl std::fmt::Debug for SubscriptionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionClient")
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Builder for [`SubscriptionClient`].
pub struct SubscriptionClientBuilder {
    api_key: String,
    config: SubscriptionConfig,
    connector: Option<Arc<dyn Connector>>,
    tokens: Option<Arc<dyn TokenProvider>>,
    network: Option<watch::Receiver<bool>>,
}

impl SubscriptionClientBuilder {
    fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            config: SubscriptionConfig::default(),
            connector: None,
            tokens: None,
            network: None,
        }
    }

    /// Set the API host (default `api.qminder.com`).
    pub fn server(mut self, api_server: impl Into<String>) -> Self {
        self.config.api_server = api_server.into();
        self
    }

    /// Replace the whole configuration. The server set by
    /// [`server`](Self::server) is overwritten too.
    pub fn config(mut self, config: SubscriptionConfig) -> Self {
        self.config = config;
        self
    }

    /// Open sockets with a custom [`Connector`].
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Obtain temporary keys from a custom [`TokenProvider`].
    pub fn token_provider(mut self, provider: impl TokenProvider) -> Self {
        self.tokens = Some(Arc::new(provider));
        self
    }

    /// Feed online/offline changes into the engine.
    ///
    /// A change while connected triggers an immediate ping. While offline,
    /// connection problems are logged at a lower level.
    pub fn network_status(mut self, online: watch::Receiver<bool>) -> Self {
        self.network = Some(online);
        self
    }

    /// Build the client and start its background task.
    ///
    /// Must be called within a Tokio runtime.
    pub fn build(self) -> Result<SubscriptionClient> {
        // Fail early on a malformed server address.
        self.config.key_url()?;

        let tokens: Arc<dyn TokenProvider> = match self.tokens {
            Some(tokens) => tokens,
            None => {
                let mut provider = TemporaryKeyProvider::new(self.api_key, &self.config)?;
                if let Some(online) = &self.network {
                    provider = provider.with_network_status(online.clone());
                }
                Arc::new(provider)
            }
        };
        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(WebSocketConnector::new(
                self.config.connect_timeout,
                self.config.headers.clone(),
            )),
        };

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Connection(format!("No Tokio runtime: {e}")))?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let engine = Engine::new(
            self.config,
            connector,
            tokens,
            self.network,
            commands_rx,
            status_tx,
        );
        runtime.spawn(engine.run());

        Ok(SubscriptionClient {
            commands: commands_tx,
            status: status_rx,
        })
    }
}

impl std::fmt::Debug for SubscriptionClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionClientBuilder")
            .field("config", &self.config)
            .field("custom_connector", &self.connector.is_some())
            .field("custom_token_provider", &self.tokens.is_some())
            .finish()
    }
}
