//! Error types for the subscription engine.

use serde_json::Value;

use crate::protocol::GraphQLError;

/// A specialized Result type for subscription operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the public API.
///
/// Connection-level failures are recovered inside the engine and never show up
/// here, with the exception of a rejected API key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The temporary key exchange failed.
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// The transport could not be opened or broke down.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The query passed to `subscribe()` was empty.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Invalid server address.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),

    /// The engine task has stopped.
    #[error("Subscription engine is closed")]
    Closed,
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

/// Failure of the temporary key exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    /// The server answered 403: the long-lived key is invalid.
    #[error("Provided API key is invalid. Unable to fetch temporary key")]
    InvalidKey,

    /// The server answered with an error status.
    #[error("Failed to fetch API key from the server. Status: {0}")]
    Status(u16),

    /// The request never produced a response.
    #[error("Failed to fetch temporary API key: {0}")]
    Transport(String),

    /// The response body did not carry a key.
    #[error("Failed to parse the temporary API key response: {0}")]
    MalformedResponse(String),
}

impl CredentialError {
    /// Whether retrying can never succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidKey)
    }
}

/// A terminal error delivered to a single subscription.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubscriptionError {
    /// The server sent an `error` frame for this subscription.
    #[error("GraphQL error: {}", join_messages(.0))]
    Graphql(Vec<GraphQLError>),

    /// A frame of an unknown type carried data for this subscription.
    #[error("Unexpected message payload: {0}")]
    Unexpected(Value),

    /// The connection can never be established because the API key was rejected.
    #[error("{0}")]
    Credential(CredentialError),
}

fn join_messages(errors: &[GraphQLError]) -> String {
    if errors.is_empty() {
        return "unknown error".into();
    }
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_invalid_key_is_fatal() {
        assert!(CredentialError::InvalidKey.is_fatal());
        assert!(!CredentialError::Status(503).is_fatal());
        assert!(!CredentialError::Transport("reset".into()).is_fatal());
        assert!(!CredentialError::MalformedResponse("{}".into()).is_fatal());
    }

    #[test]
    fn test_graphql_error_display() {
        let err = SubscriptionError::Graphql(vec![
            GraphQLError::new("Location not found"),
            GraphQLError::new("Access denied"),
        ]);
        assert_eq!(
            err.to_string(),
            "GraphQL error: Location not found; Access denied"
        );
        assert_eq!(
            SubscriptionError::Graphql(vec![]).to_string(),
            "GraphQL error: unknown error"
        );
    }

    #[test]
    fn test_credential_error_converts() {
        let err: Error = CredentialError::InvalidKey.into();
        assert!(matches!(err, Error::Credential(CredentialError::InvalidKey)));
    }
}
