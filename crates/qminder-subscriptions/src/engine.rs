//! The connection state machine.
//!
//! One task owns the socket, the registry and every timer. Clients talk to it
//! through [`Command`]s; everything else (key exchange, socket events, ping
//! interval, pong deadline, reconnect delay, network changes) is a branch of
//! the same `select!` loop, so no state is shared and nothing needs a lock.

use std::future::pending;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::backoff::reconnect_delay;
use crate::client::ConnectionStatus;
use crate::config::SubscriptionConfig;
use crate::credentials::TokenProvider;
use crate::error::{CredentialError, Error, Result, SubscriptionError};
use crate::heartbeat::Heartbeat;
use crate::logging::targets;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::Registry;
use crate::router::{self, Routed};
use crate::stream::ObserverSink;
use crate::transport::{CloseReason, Connection, Connector, TransportEvent};

/// Requests from client handles.
pub(crate) enum Command {
    Subscribe {
        query: String,
        sink: ObserverSink,
        reply: oneshot::Sender<String>,
    },
    Unsubscribe {
        id: String,
    },
    EnsureConnected {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Progress of a connection attempt.
enum OpenStep {
    Key(std::result::Result<String, CredentialError>),
    Socket(Result<Connection>),
}

pub(crate) struct Engine {
    config: SubscriptionConfig,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    commands: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<ConnectionStatus>,
    network: Option<watch::Receiver<bool>>,

    /// `None` until the first connection attempt.
    status: Option<ConnectionStatus>,
    registry: Registry,
    heartbeat: Heartbeat,
    /// Consecutive failed or dropped connection attempts.
    attempts: u32,
    connection: Option<Connection>,
    opening: Option<BoxFuture<'static, OpenStep>>,
    awaiting_key: bool,
    reconnect_at: Option<Instant>,
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl Engine {
    pub(crate) fn new(
        config: SubscriptionConfig,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
        network: Option<watch::Receiver<bool>>,
        commands: mpsc::UnboundedReceiver<Command>,
        status_tx: watch::Sender<ConnectionStatus>,
    ) -> Self {
        let heartbeat = Heartbeat::new(config.ping_interval, config.pong_timeout);
        Self {
            config,
            connector,
            tokens,
            commands,
            status_tx,
            network,
            status: None,
            registry: Registry::new(),
            heartbeat,
            attempts: 0,
            connection: None,
            opening: None,
            awaiting_key: false,
            reconnect_at: None,
            waiters: Vec::new(),
        }
    }

    /// Run until shut down or until every client handle is dropped.
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        self.shutdown();
                        return;
                    }
                    Some(command) => self.handle_command(command),
                },

                event = next_event(&mut self.connection) => self.on_transport_event(event),

                step = join_opening(&mut self.opening) => {
                    self.opening = None;
                    self.on_open_step(step);
                }

                _ = sleep_until(self.heartbeat.pong_deadline()) => self.on_pong_timeout(),

                _ = sleep_until(self.heartbeat.next_ping()) => self.on_ping_interval(),

                _ = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.ensure_connected();
                }

                online = network_changed(&mut self.network) => match online {
                    Some(online) => self.on_network_change(online),
                    None => self.network = None,
                },
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe { query, sink, reply } => self.subscribe(query, sink, reply),
            Command::Unsubscribe { id } => self.unsubscribe(&id),
            Command::EnsureConnected { reply } => {
                self.ensure_connected();
                if self.awaiting_key {
                    self.waiters.push(reply);
                } else {
                    let _ = reply.send(Ok(()));
                }
            }
            // Handled by the run loop.
            Command::Shutdown => {}
        }
    }

    fn subscribe(&mut self, query: String, sink: ObserverSink, reply: oneshot::Sender<String>) {
        let id = self.registry.add(query.clone(), sink);
        if reply.send(id.clone()).is_err() {
            // The caller went away before it got the stream.
            self.registry.remove(&id);
            return;
        }

        tracing::debug!(target: targets::CONNECTION, id = %id, "Subscription added");
        if self.status == Some(ConnectionStatus::Connected) {
            self.send(ClientMessage::start(id, query));
        } else {
            // The replay on connection_ack sends the start frame.
            self.ensure_connected();
        }
    }

    fn unsubscribe(&mut self, id: &str) {
        if self.registry.remove(id).is_none() {
            return;
        }
        tracing::debug!(target: targets::CONNECTION, id, "Subscription removed");
        if self.connection.is_some() {
            self.send(ClientMessage::stop(id));
        }
    }

    /// Start a connection attempt unless one is in progress or established.
    fn ensure_connected(&mut self) {
        if matches!(
            self.status,
            Some(ConnectionStatus::Connecting | ConnectionStatus::Connected)
        ) {
            return;
        }

        self.set_status(ConnectionStatus::Connecting);
        self.reconnect_at = None;
        self.awaiting_key = true;
        tracing::info!(target: targets::CONNECTION, attempt = self.attempts, "Connecting to websocket");

        let tokens = Arc::clone(&self.tokens);
        self.opening = Some(async move { OpenStep::Key(tokens.fetch().await) }.boxed());
    }

    fn on_open_step(&mut self, step: OpenStep) {
        match step {
            OpenStep::Key(Ok(key)) => {
                self.awaiting_key = false;
                self.resolve_waiters(Ok(()));
                match self.config.subscription_url(&key) {
                    Ok(url) => {
                        let connect = self.connector.connect(url);
                        self.opening = Some(connect.map(OpenStep::Socket).boxed());
                    }
                    Err(e) => self.on_open_failed(e),
                }
            }
            OpenStep::Key(Err(e)) => {
                self.awaiting_key = false;
                self.on_credential_rejected(e);
            }
            OpenStep::Socket(Ok(connection)) => {
                tracing::debug!(target: targets::CONNECTION, "WebSocket open, initializing");
                self.connection = Some(connection);
                self.send(ClientMessage::connection_init());
            }
            OpenStep::Socket(Err(e)) => self.on_open_failed(e),
        }
    }

    fn on_open_failed(&mut self, error: Error) {
        self.log_socket_error(&error.to_string());
        self.on_close(CloseReason::abnormal());
    }

    /// The API key was rejected. Nothing can ever connect, so every tracked
    /// subscription is failed instead of retried.
    fn on_credential_rejected(&mut self, error: CredentialError) {
        tracing::error!(
            target: targets::CREDENTIALS,
            error = %error,
            subscriptions = self.registry.len(),
            "Unable to connect"
        );
        self.set_status(ConnectionStatus::Disconnected);
        self.resolve_waiters(Err(Error::Credential(error.clone())));
        for (_, sink) in self.registry.drain() {
            sink.error(SubscriptionError::Credential(error.clone()));
        }
    }

    fn on_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Message(text)) => self.on_message(&text),
            Some(TransportEvent::Error(message)) => self.log_socket_error(&message),
            Some(TransportEvent::Closed(reason)) => self.on_close(reason),
            None => self.on_close(CloseReason::abnormal()),
        }
    }

    fn on_message(&mut self, text: &str) {
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(target: targets::ROUTER, error = %e, "Discarding unparseable message");
                return;
            }
        };

        match router::route(message, &mut self.registry) {
            Routed::ConnectionAck => self.on_ack(),
            Routed::Pong => self.heartbeat.on_pong(),
            Routed::Handled => {}
        }
    }

    fn on_ack(&mut self) {
        self.attempts = 0;
        self.set_status(ConnectionStatus::Connected);
        tracing::info!(target: targets::CONNECTION, subscriptions = self.registry.len(), "Connected to websocket");
        self.heartbeat.start(Instant::now());

        for subscription in self.registry.iter() {
            self.send(ClientMessage::start(&subscription.id, &subscription.query));
        }
    }

    fn on_close(&mut self, reason: CloseReason) {
        tracing::warn!(
            target: targets::CONNECTION,
            code = reason.code,
            reason = %reason.reason,
            "WebSocket connection closed"
        );

        let was_connecting = self.status == Some(ConnectionStatus::Connecting);
        self.connection = None;
        self.heartbeat.stop();
        self.set_status(ConnectionStatus::Disconnected);

        if was_connecting {
            tracing::error!(
                target: targets::CONNECTION,
                code = reason.code,
                "Received socket close event before a connection was established"
            );
        }

        if !reason.is_normal() || !self.registry.is_empty() {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        let delay = reconnect_delay(self.attempts, &self.config.reconnect);
        self.attempts = self.attempts.saturating_add(1);
        self.reconnect_at = Some(Instant::now() + delay);
        tracing::info!(
            target: targets::CONNECTION,
            delay_ms = delay.as_millis() as u64,
            "Waiting before reconnecting"
        );
    }

    fn on_ping_interval(&mut self) {
        let now = Instant::now();
        self.heartbeat.interval_elapsed(now);
        self.send_ping(now);
    }

    fn send_ping(&mut self, now: Instant) {
        tracing::trace!(target: targets::HEARTBEAT, "Sending ping");
        self.heartbeat.ping_sent(now);
        self.send(ClientMessage::Ping);
    }

    /// No pong in time: the socket may still look open, so it is discarded
    /// without waiting for a close event.
    fn on_pong_timeout(&mut self) {
        if self.is_online() {
            tracing::warn!(target: targets::HEARTBEAT, "Websocket connection dropped");
        } else {
            tracing::info!(target: targets::HEARTBEAT, "Websocket connection dropped. The network is offline");
        }

        self.heartbeat.stop();
        if let Some(stale) = self.connection.take() {
            stale.close(CloseReason::normal());
        }
        self.set_status(ConnectionStatus::Disconnected);
        self.schedule_reconnect();
    }

    fn on_network_change(&mut self, online: bool) {
        tracing::info!(target: targets::NETWORK, online, "Network status changed");
        if self.status == Some(ConnectionStatus::Connected) {
            self.send_ping(Instant::now());
        }
    }

    fn shutdown(&mut self) {
        tracing::info!(
            target: targets::CONNECTION,
            subscriptions = self.registry.len(),
            "Shutting down subscription engine"
        );

        self.opening = None;
        self.awaiting_key = false;
        self.reconnect_at = None;
        self.heartbeat.stop();
        if let Some(connection) = self.connection.take() {
            connection.close(CloseReason::normal());
        }
        for (_, sink) in self.registry.drain() {
            sink.complete();
        }
        self.resolve_waiters(Err(Error::Closed));
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn send(&self, message: ClientMessage) {
        let Some(connection) = &self.connection else {
            return;
        };
        match message.to_json() {
            Ok(text) => {
                if connection.send_text(text).is_err() {
                    tracing::debug!(target: targets::TRANSPORT, "Socket gone, frame dropped");
                }
            }
            Err(e) => {
                tracing::error!(target: targets::TRANSPORT, error = %e, "Failed to encode frame");
            }
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        self.status = Some(status);
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn resolve_waiters(&mut self, result: Result<()>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn log_socket_error(&self, message: &str) {
        if self.is_online() {
            tracing::error!(target: targets::CONNECTION, error = message, "Websocket error occurred");
        } else {
            tracing::info!(target: targets::CONNECTION, error = message, "Websocket error occurred while offline");
        }
    }

    fn is_online(&self) -> bool {
        self.network.as_ref().is_none_or(|online| *online.borrow())
    }
}

async fn next_event(connection: &mut Option<Connection>) -> Option<TransportEvent> {
    match connection {
        Some(connection) => connection.recv().await,
        None => pending().await,
    }
}

async fn join_opening(opening: &mut Option<BoxFuture<'static, OpenStep>>) -> OpenStep {
    match opening {
        Some(opening) => opening.await,
        None => pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Resolves with the new online state, or `None` once the source is gone.
async fn network_changed(network: &mut Option<watch::Receiver<bool>>) -> Option<bool> {
    match network {
        Some(online) => match online.changed().await {
            Ok(()) => Some(*online.borrow_and_update()),
            Err(_) => None,
        },
        None => pending().await,
    }
}
