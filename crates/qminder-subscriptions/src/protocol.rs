//! Wire format of the subscription socket.
//!
//! Every frame is a JSON object `{ id?, type, payload? }`. The client speaks the
//! `subscriptions-transport-ws` dialect (`start`/`stop`/`data`) plus a
//! `ping`/`pong` pair for liveness checks.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Client -> server frames.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Initialize the connection. Serialized with an explicit `"payload": null`.
    ConnectionInit { payload: Option<Value> },
    /// Start a subscription.
    Start { id: String, payload: StartPayload },
    /// Stop a subscription. Serialized with an explicit `"payload": null`.
    Stop { id: String, payload: Option<Value> },
    /// Liveness probe.
    Ping,
}

impl ClientMessage {
    /// `connection_init` frame.
    pub fn connection_init() -> Self {
        Self::ConnectionInit { payload: None }
    }

    /// `start` frame for a subscription.
    pub fn start(id: impl Into<String>, query: impl Into<String>) -> Self {
        Self::Start {
            id: id.into(),
            payload: StartPayload {
                query: query.into(),
            },
        }
    }

    /// `stop` frame for a subscription.
    pub fn stop(id: impl Into<String>) -> Self {
        Self::Stop {
            id: id.into(),
            payload: None,
        }
    }

    /// Serialize to the JSON text sent over the socket.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Payload of a `start` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartPayload {
    /// The subscription document.
    pub query: String,
}

/// Server -> client frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// The server accepted `connection_init`.
    ConnectionAck,
    /// Server keepalive (`ka`).
    KeepAlive,
    /// A result for subscription `id`.
    Data { id: String, data: Value },
    /// Subscription `id` finished.
    Complete { id: String },
    /// Answer to a `ping`.
    Pong,
    /// Subscription `id` failed.
    Error {
        id: String,
        errors: Vec<GraphQLError>,
    },
    /// Any other frame type.
    Unrecognized {
        id: Option<String>,
        kind: String,
        payload: Option<InboundPayload>,
    },
}

/// Payload of an inbound frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundPayload {
    /// Result data.
    pub data: Option<Value>,
    /// Errors reported by the server.
    pub errors: Option<Vec<GraphQLError>>,
}

impl InboundPayload {
    /// Pick `data` and `errors` out of a raw payload. Fields of the wrong
    /// shape are dropped instead of failing the whole frame.
    fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut fields) = value else {
            return None;
        };
        let data = fields.remove("data").filter(|data| !data.is_null());
        let errors = match fields.remove("errors") {
            Some(Value::Array(errors)) => {
                Some(errors.into_iter().map(GraphQLError::lenient).collect())
            }
            _ => None,
        };
        Some(Self { data, errors })
    }
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<Value>,
}

impl ServerMessage {
    /// Decode an inbound text frame.
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawMessage = serde_json::from_str(text)?;
        let RawMessage { id, kind, payload } = raw;
        let payload = payload.and_then(InboundPayload::from_value);

        let message = match (kind.as_str(), id) {
            ("connection_ack", _) => Self::ConnectionAck,
            ("ka" | "keepalive", _) => Self::KeepAlive,
            ("pong", _) => Self::Pong,
            ("data", Some(id)) => Self::Data {
                id,
                data: payload.and_then(|p| p.data).unwrap_or(Value::Null),
            },
            ("complete", Some(id)) => Self::Complete { id },
            ("error", Some(id)) => Self::Error {
                id,
                errors: payload.and_then(|p| p.errors).unwrap_or_default(),
            },
            (_, id) => Self::Unrecognized { id, kind, payload },
        };
        Ok(message)
    }
}

/// A GraphQL error reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLError {
    /// The error message.
    #[serde(default)]
    pub message: String,

    /// Server-side error classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,

    /// Locations in the document where the error occurred.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<GraphQLLocation>>,

    /// Path to the field that caused the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,

    /// Excerpt of the offending document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_preview: Option<String>,

    /// The token the parser choked on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offending_token: Option<String>,

    /// Additional error metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLError {
    /// Create an error with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

impl GraphQLError {
    /// Decode one entry of an `errors` array, keeping whatever message it
    /// carries when the entry does not match the expected shape.
    fn lenient(value: Value) -> Self {
        match serde_json::from_value::<Self>(value.clone()) {
            Ok(error) => error,
            Err(_) => match value.get("message").and_then(Value::as_str) {
                Some(message) => Self::new(message),
                None => Self::new(value.to_string()),
            },
        }
    }
}

impl fmt::Display for GraphQLError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref path) = self.path {
            write!(f, " (at ")?;
            for (i, segment) in path.iter().enumerate() {
                if i > 0 {
                    write!(f, ".")?;
                }
                match segment {
                    PathSegment::Field(name) => write!(f, "{name}")?,
                    PathSegment::Index(idx) => write!(f, "[{idx}]")?,
                }
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// A location in a GraphQL document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphQLLocation {
    /// Line number (1-indexed).
    pub line: u32,
    /// Column number (1-indexed).
    pub column: u32,
}

/// A segment in an error path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// A field name.
    Field(String),
    /// An array index.
    Index(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_value(message: &ClientMessage) -> Value {
        serde_json::from_str(&message.to_json().unwrap()).unwrap()
    }

    #[test]
    fn test_outbound_frames() {
        assert_eq!(
            as_value(&ClientMessage::connection_init()),
            json!({"type": "connection_init", "payload": null})
        );
        assert_eq!(
            as_value(&ClientMessage::start("1", "subscription { ticketCreated }")),
            json!({
                "id": "1",
                "type": "start",
                "payload": {"query": "subscription { ticketCreated }"}
            })
        );
        assert_eq!(
            as_value(&ClientMessage::stop("7")),
            json!({"id": "7", "type": "stop", "payload": null})
        );
        assert_eq!(as_value(&ClientMessage::Ping), json!({"type": "ping"}));
    }

    #[test]
    fn test_parse_known_types() {
        assert_eq!(
            ServerMessage::parse(r#"{"type":"connection_ack"}"#).unwrap(),
            ServerMessage::ConnectionAck
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"ka"}"#).unwrap(),
            ServerMessage::KeepAlive
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"keepalive"}"#).unwrap(),
            ServerMessage::KeepAlive
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"pong"}"#).unwrap(),
            ServerMessage::Pong
        );
        assert_eq!(
            ServerMessage::parse(r#"{"id":"3","type":"complete"}"#).unwrap(),
            ServerMessage::Complete { id: "3".into() }
        );
    }

    #[test]
    fn test_parse_data_keeps_payload_unchanged() {
        let text = r#"{"id":"1","type":"data","payload":{"data":{"ticketCreated":{"id":"12","firstName":"Marta"}}}}"#;
        assert_eq!(
            ServerMessage::parse(text).unwrap(),
            ServerMessage::Data {
                id: "1".into(),
                data: json!({"ticketCreated": {"id": "12", "firstName": "Marta"}}),
            }
        );
    }

    #[test]
    fn test_parse_error_frame() {
        let text = r#"{"id":"2","type":"error","payload":{"errors":[{"message":"Location not found","errorType":"ValidationError","path":["tickets",0]}]}}"#;
        let ServerMessage::Error { id, errors } = ServerMessage::parse(text).unwrap() else {
            panic!("expected error frame");
        };
        assert_eq!(id, "2");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type.as_deref(), Some("ValidationError"));
        assert_eq!(errors[0].to_string(), "Location not found (at tickets.[0])");
    }

    #[test]
    fn test_parse_unrecognized_frame() {
        let text = r#"{"id":"4","type":"connection_error","payload":{"errors":[{"message":"boom"}]}}"#;
        let ServerMessage::Unrecognized { id, kind, payload } = ServerMessage::parse(text).unwrap()
        else {
            panic!("expected unrecognized frame");
        };
        assert_eq!(id.as_deref(), Some("4"));
        assert_eq!(kind, "connection_error");
        assert_eq!(payload.unwrap().errors.unwrap()[0].message, "boom");

        // A data frame without an id cannot be routed.
        assert!(matches!(
            ServerMessage::parse(r#"{"type":"data","payload":{"data":{}}}"#).unwrap(),
            ServerMessage::Unrecognized { id: None, .. }
        ));
    }

    #[test]
    fn test_parse_tolerates_malformed_payload() {
        assert_eq!(
            ServerMessage::parse(r#"{"type":"connection_ack","payload":"ok"}"#).unwrap(),
            ServerMessage::ConnectionAck
        );

        let text = r#"{"id":"1","type":"data","payload":{"data":{"x":1},"errors":[{"message":null}]}}"#;
        assert_eq!(
            ServerMessage::parse(text).unwrap(),
            ServerMessage::Data {
                id: "1".into(),
                data: json!({"x": 1}),
            }
        );

        let text = r#"{"id":"2","type":"error","payload":{"errors":[{"message":"denied","locations":"nowhere"},{"message":null}]}}"#;
        let ServerMessage::Error { errors, .. } = ServerMessage::parse(text).unwrap() else {
            panic!("expected error frame");
        };
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].message, "denied");
        assert_eq!(errors[1].message, r#"{"message":null}"#);

        let text = r#"{"id":"3","type":"error","payload":{"errors":"boom"}}"#;
        assert_eq!(
            ServerMessage::parse(text).unwrap(),
            ServerMessage::Error {
                id: "3".into(),
                errors: Vec::new(),
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ServerMessage::parse("not json").is_err());
        assert!(ServerMessage::parse(r#"{"id":"1"}"#).is_err());
    }
}
