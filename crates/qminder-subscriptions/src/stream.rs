//! Push streams handed out by [`SubscriptionClient`](crate::SubscriptionClient).

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::engine::Command;
use crate::error::{Result, SubscriptionError};

/// An item pushed to a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// A result from the server (`payload.data`, unchanged).
    Next(Value),
    /// The subscription failed. No further events follow.
    Error(SubscriptionError),
    /// The subscription ended. No further events follow.
    Complete,
}

impl SubscriptionEvent {
    /// Whether no further events follow this one.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Next(_))
    }

    /// The raw data of a `Next` event.
    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Next(value) => Some(value),
            _ => None,
        }
    }

    /// Deserialize the data of a `Next` event.
    ///
    /// Returns `None` for `Error` and `Complete`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Option<Result<T>> {
        self.data()
            .map(|value| serde_json::from_value(value.clone()).map_err(Into::into))
    }
}

/// Receives the events of one subscription.
///
/// Used with [`SubscriptionClient::subscribe_with`](crate::SubscriptionClient::subscribe_with).
pub trait Observer: Send + 'static {
    /// Called for every result.
    fn next(&mut self, value: Value);

    /// Called once if the subscription fails.
    fn error(&mut self, _error: SubscriptionError) {}

    /// Called once when the subscription ends normally.
    fn complete(&mut self) {}
}

/// Registry side of a subscription's event channel.
///
/// Holding a sink does not keep the stream alive: once the stream is dropped,
/// pushes are silently discarded.
#[derive(Debug, Clone)]
pub(crate) struct ObserverSink {
    tx: mpsc::UnboundedSender<SubscriptionEvent>,
}

impl ObserverSink {
    pub(crate) fn next(&self, value: Value) {
        let _ = self.tx.send(SubscriptionEvent::Next(value));
    }

    pub(crate) fn error(&self, error: SubscriptionError) {
        let _ = self.tx.send(SubscriptionEvent::Error(error));
    }

    pub(crate) fn complete(&self) {
        let _ = self.tx.send(SubscriptionEvent::Complete);
    }
}

/// Create the two ends of a subscription's event channel.
pub(crate) fn channel() -> (ObserverSink, mpsc::UnboundedReceiver<SubscriptionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ObserverSink { tx }, rx)
}

/// A stream of subscription events.
///
/// Dropping the stream unsubscribes: the engine forgets the subscription and
/// sends a `stop` frame. Other subscriptions on the same connection are not
/// affected.
pub struct SubscriptionStream {
    id: String,
    events: mpsc::UnboundedReceiver<SubscriptionEvent>,
    commands: Option<mpsc::WeakUnboundedSender<Command>>,
}

impl SubscriptionStream {
    pub(crate) fn new(
        id: String,
        events: mpsc::UnboundedReceiver<SubscriptionEvent>,
        commands: &mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            events,
            commands: Some(commands.downgrade()),
        }
    }

    /// Get the subscription ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the next event. Returns `None` after a terminal event or shutdown.
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    /// Stop the subscription.
    pub fn unsubscribe(&mut self) {
        // The engine is gone once every client handle is dropped.
        if let Some(commands) = self.commands.take().and_then(|weak| weak.upgrade()) {
            let _ = commands.send(Command::Unsubscribe {
                id: self.id.clone(),
            });
        }
        self.events.close();
    }
}

impl Stream for SubscriptionStream {
    type Item = SubscriptionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for SubscriptionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionStream")
            .field("id", &self.id)
            .field("active", &self.commands.is_some())
            .finish()
    }
}

/// Cancellation handle for an [`Observer`]-driven subscription.
///
/// Dropping the handle cancels the subscription.
pub struct SubscriptionHandle {
    id: String,
    cancel_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Feed `stream` into `observer` on a background task.
    pub(crate) fn spawn<O: Observer>(mut stream: SubscriptionStream, mut observer: O) -> Self {
        let id = stream.id().to_owned();
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    event = stream.next() => match event {
                        Some(SubscriptionEvent::Next(value)) => observer.next(value),
                        Some(SubscriptionEvent::Error(error)) => {
                            observer.error(error);
                            break;
                        }
                        Some(SubscriptionEvent::Complete) => {
                            observer.complete();
                            break;
                        }
                        None => break,
                    },
                }
            }
            // Dropping the stream sends the unsubscribe.
            drop(stream);
        });

        Self {
            id,
            cancel_tx: Some(cancel_tx),
            task,
        }
    }

    /// Get the subscription ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Check if the observer still receives events.
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the subscription.
    pub fn cancel(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_event_data_as() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Ticket {
            id: String,
        }

        let event = SubscriptionEvent::Next(json!({"id": "12"}));
        let ticket: Ticket = event.data_as().unwrap().unwrap();
        assert_eq!(ticket, Ticket { id: "12".into() });
        assert!(!event.is_terminal());

        assert!(SubscriptionEvent::Complete.data_as::<Ticket>().is_none());
        assert!(SubscriptionEvent::Complete.is_terminal());
    }

    #[tokio::test]
    async fn test_drop_sends_unsubscribe_once() {
        let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
        let (_sink, events) = channel();
        let mut stream = SubscriptionStream::new("5".into(), events, &commands_tx);

        stream.unsubscribe();
        drop(stream);
        drop(commands_tx);

        match commands_rx.recv().await {
            Some(Command::Unsubscribe { id }) => assert_eq!(id, "5"),
            _ => panic!("expected unsubscribe"),
        }
        assert!(commands_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_ends_when_sink_dropped() {
        let (commands_tx, _commands_rx) = mpsc::unbounded_channel();
        let (sink, events) = channel();
        let mut stream = SubscriptionStream::new("1".into(), events, &commands_tx);

        sink.next(json!({"n": 1}));
        sink.complete();
        drop(sink);

        assert_eq!(stream.next().await, Some(SubscriptionEvent::Next(json!({"n": 1}))));
        assert_eq!(stream.next().await, Some(SubscriptionEvent::Complete));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_stream_does_not_keep_engine_alive() {
        let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
        let (_sink, events) = channel();
        let stream = SubscriptionStream::new("2".into(), events, &commands_tx);

        drop(commands_tx);
        assert!(commands_rx.recv().await.is_none());
        drop(stream);
    }
}
