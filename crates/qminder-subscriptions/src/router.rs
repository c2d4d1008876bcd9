//! Dispatch of inbound frames.
//!
//! Subscription-addressed frames are delivered to the registry's observers
//! here. Connection-level frames are handed back to the state machine as a
//! [`Routed`] value.

use crate::error::SubscriptionError;
use crate::logging::targets;
use crate::protocol::{InboundPayload, ServerMessage};
use crate::registry::Registry;

/// What the state machine has to do after a frame was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routed {
    /// Nothing.
    Handled,
    /// The server acknowledged the connection.
    ConnectionAck,
    /// The server answered a ping.
    Pong,
}

/// Route one decoded frame.
///
/// Frames for IDs that are no longer tracked are dropped: the subscription was
/// stopped locally before the server's reply arrived.
pub(crate) fn route(message: ServerMessage, registry: &mut Registry) -> Routed {
    match message {
        ServerMessage::KeepAlive => Routed::Handled,
        ServerMessage::ConnectionAck => Routed::ConnectionAck,
        ServerMessage::Pong => Routed::Pong,
        ServerMessage::Data { id, data } => {
            match registry.observer(&id) {
                Some(observer) => observer.next(data),
                None => untracked(&id, "data"),
            }
            Routed::Handled
        }
        ServerMessage::Complete { id } => {
            match registry.remove(&id) {
                Some(observer) => observer.complete(),
                None => untracked(&id, "complete"),
            }
            Routed::Handled
        }
        ServerMessage::Error { id, errors } => {
            match registry.remove(&id) {
                Some(observer) => observer.error(SubscriptionError::Graphql(errors)),
                None => untracked(&id, "error"),
            }
            Routed::Handled
        }
        ServerMessage::Unrecognized { id, kind, payload } => {
            route_unrecognized(id, &kind, payload, registry);
            Routed::Handled
        }
    }
}

/// Legacy handling of unknown frame types: a payload with `data` or a
/// non-empty `errors` list is surfaced to the addressed observer as an error.
/// The subscription stays tracked.
fn route_unrecognized(
    id: Option<String>,
    kind: &str,
    payload: Option<InboundPayload>,
    registry: &Registry,
) {
    let error = match payload {
        Some(InboundPayload {
            data: Some(data), ..
        }) => SubscriptionError::Unexpected(data),
        Some(InboundPayload {
            errors: Some(errors),
            ..
        }) if !errors.is_empty() => SubscriptionError::Graphql(errors),
        _ => {
            tracing::debug!(target: targets::ROUTER, kind, "Ignoring unrecognized message");
            return;
        }
    };

    let observer = id.as_deref().and_then(|id| registry.observer(id));
    match observer {
        Some(observer) => {
            tracing::warn!(target: targets::ROUTER, kind, "Unrecognized message routed as an error");
            observer.error(error);
        }
        None => tracing::debug!(target: targets::ROUTER, kind, ?id, "Unrecognized message for unknown subscription"),
    }
}

fn untracked(id: &str, kind: &str) {
    tracing::debug!(target: targets::ROUTER, id, kind, "Message for a subscription that is no longer tracked");
}
