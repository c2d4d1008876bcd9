//! Temporary key exchange.
//!
//! The subscription socket does not accept the long-lived API key. Before each
//! connection attempt the engine trades it for a short-lived key by calling
//! `POST /graphql/connection-key`. Transient failures are retried forever with
//! a doubling delay; a 403 means the API key itself is bad and is never
//! retried.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Deserialize;
use tokio::sync::watch;
use url::Url;

use crate::backoff::credential_retry_delay;
use crate::config::{RetryDelays, SubscriptionConfig, API_KEY_HEADER};
use crate::error::{CredentialError, Result};
use crate::logging::targets;

/// Source of short-lived connection keys.
pub trait TokenProvider: Send + Sync + 'static {
    /// Fetch a key for one connection attempt.
    ///
    /// Implementations retry transient failures themselves; an error returned
    /// here is treated as fatal.
    fn fetch(&self) -> BoxFuture<'_, std::result::Result<String, CredentialError>>;
}

#[derive(Deserialize)]
struct KeyResponse {
    key: Option<serde_json::Value>,
}

/// [`TokenProvider`] that calls the Qminder API.
#[derive(Debug, Clone)]
pub struct TemporaryKeyProvider {
    client: reqwest::Client,
    key_url: Url,
    api_key: String,
    retry: RetryDelays,
    online: Option<watch::Receiver<bool>>,
}

impl TemporaryKeyProvider {
    /// Create a provider for the server in `config`.
    pub fn new(api_key: impl Into<String>, config: &SubscriptionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(format!(
                "QminderSubscriptions/{} (Rust)",
                env!("CARGO_PKG_VERSION")
            ))
            .build()?;

        Ok(Self {
            client,
            key_url: config.key_url()?,
            api_key: api_key.into(),
            retry: config.credential_retry,
            online: None,
        })
    }

    /// Use `online` to pick log levels for failed requests.
    pub fn with_network_status(mut self, online: watch::Receiver<bool>) -> Self {
        self.online = Some(online);
        self
    }

    /// The endpoint this provider calls.
    pub fn key_url(&self) -> &Url {
        &self.key_url
    }

    /// Fetch a key, retrying until success or a rejected API key.
    ///
    /// `retry_count` seeds the retry delay.
    pub async fn fetch_key(
        &self,
        mut retry_count: u32,
    ) -> std::result::Result<String, CredentialError> {
        loop {
            match self.request_key().await {
                Ok(key) => return Ok(key),
                Err(e) if e.is_fatal() => return Err(e),
                Err(_) => {
                    let delay = credential_retry_delay(retry_count, &self.retry);
                    tracing::info!(
                        target: targets::CREDENTIALS,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying to fetch API key"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count = retry_count.saturating_add(1);
                }
            }
        }
    }

    /// One attempt of the exchange.
    async fn request_key(&self) -> std::result::Result<String, CredentialError> {
        let response = match self
            .client
            .post(self.key_url.clone())
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if self.is_online() {
                    tracing::warn!(target: targets::CREDENTIALS, error = %e, "Failed to fetch temporary API key");
                } else {
                    tracing::info!(target: targets::CREDENTIALS, "Failed to fetch temporary API key. The network is offline");
                }
                return Err(CredentialError::Transport(e.to_string()));
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(CredentialError::InvalidKey);
        }
        if !status.is_success() {
            tracing::error!(
                target: targets::CREDENTIALS,
                status = status.as_u16(),
                "Failed to fetch API key from the server"
            );
            return Err(CredentialError::Status(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| CredentialError::Transport(e.to_string()))?;
        match serde_json::from_str::<KeyResponse>(&body) {
            Ok(KeyResponse {
                key: Some(serde_json::Value::String(key)),
            }) => Ok(key),
            _ => {
                tracing::error!(
                    target: targets::CREDENTIALS,
                    body = %body,
                    "Failed to parse the temporary API key response"
                );
                Err(CredentialError::MalformedResponse(format!(
                    "Response does not contain key. Response: {body}"
                )))
            }
        }
    }

    fn is_online(&self) -> bool {
        self.online.as_ref().is_none_or(|online| *online.borrow())
    }
}

impl TokenProvider for TemporaryKeyProvider {
    fn fetch(&self) -> BoxFuture<'_, std::result::Result<String, CredentialError>> {
        self.fetch_key(0).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> TemporaryKeyProvider {
        let config = SubscriptionConfig::new()
            .server(server.address().to_string())
            .insecure()
            .credential_retry_delays(RetryDelays::new(
                Duration::from_millis(5),
                Duration::from_millis(20),
            ));
        TemporaryKeyProvider::new("permanent-key", &config).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_returns_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql/connection-key"))
            .and(header("X-Qminder-REST-API-Key", "permanent-key"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"key": "temp-1"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let key = provider(&server).fetch().await.unwrap();
        assert_eq!(key, "temp-1");
    }

    #[tokio::test]
    async fn test_forbidden_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql/connection-key"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let err = provider(&server).fetch().await.unwrap_err();
        assert_eq!(err, CredentialError::InvalidKey);
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql/connection-key"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/graphql/connection-key"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"key": "temp-2"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let key = provider(&server).fetch().await.unwrap();
        assert_eq!(key, "temp-2");
    }

    #[tokio::test]
    async fn test_malformed_response_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql/connection-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "x"})))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/graphql/connection-key"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"key": "temp-3"})),
            )
            .mount(&server)
            .await;

        let key = provider(&server).fetch().await.unwrap();
        assert_eq!(key, "temp-3");
    }

    #[tokio::test]
    async fn test_single_attempt_reports_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql/connection-key"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = provider(&server).request_key().await.unwrap_err();
        assert!(matches!(err, CredentialError::MalformedResponse(_)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_retried() {
        let config = SubscriptionConfig::new()
            .server("127.0.0.1:1")
            .insecure()
            .credential_retry_delays(RetryDelays::new(
                Duration::from_millis(5),
                Duration::from_millis(20),
            ));
        let provider = TemporaryKeyProvider::new("permanent-key", &config).unwrap();

        let err = provider.request_key().await.unwrap_err();
        assert!(matches!(err, CredentialError::Transport(_)));
        assert!(!err.is_fatal());

        let result = tokio::time::timeout(Duration::from_millis(300), provider.fetch()).await;
        assert!(result.is_err(), "fetch gave up: {result:?}");
    }

    #[test]
    fn test_key_url_follows_config() {
        let config = SubscriptionConfig::new();
        let provider = TemporaryKeyProvider::new("k", &config).unwrap();
        assert_eq!(
            provider.key_url().as_str(),
            "https://api.qminder.com/graphql/connection-key"
        );
    }
}
