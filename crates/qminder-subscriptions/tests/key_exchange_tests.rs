//! Temporary key exchange through the default provider.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use qminder_subscriptions::{
    Connection, ConnectionPeer, ConnectionStatus, Connector, CredentialError, Error,
    SubscriptionClient, SubscriptionConfig,
};
use serde_json::json;
use tokio::sync::mpsc;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct RecordingConnector {
    accepted: mpsc::UnboundedSender<(Url, ConnectionPeer)>,
}

impl Connector for RecordingConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, qminder_subscriptions::Result<Connection>> {
        let (connection, peer) = Connection::pair();
        let _ = self.accepted.send((url, peer));
        async move { Ok(connection) }.boxed()
    }
}

fn client_for(
    server: &MockServer,
) -> (SubscriptionClient, mpsc::UnboundedReceiver<(Url, ConnectionPeer)>) {
    let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
    let config = SubscriptionConfig::new()
        .server(server.address().to_string())
        .insecure();
    let client = SubscriptionClient::builder("permanent-key")
        .config(config)
        .connector(RecordingConnector {
            accepted: accepted_tx,
        })
        .build()
        .unwrap();
    (client, accepted_rx)
}

#[tokio::test]
async fn test_socket_url_carries_temporary_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql/connection-key"))
        .and(header("X-Qminder-REST-API-Key", "permanent-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"key": "temp-9"})))
        .expect(1)
        .mount(&server)
        .await;

    let (client, mut accepted) = client_for(&server);
    client.ensure_connected().await.unwrap();

    let (url, _peer) = accepted.recv().await.unwrap();
    assert_eq!(url.scheme(), "ws");
    assert_eq!(url.port(), Some(server.address().port()));
    assert_eq!(url.path(), "/graphql/subscription");
    assert_eq!(url.query(), Some("rest-api-key=temp-9"));
    assert_eq!(client.status(), ConnectionStatus::Connecting);
}

#[tokio::test]
async fn test_forbidden_rejects_ensure_connected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql/connection-key"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let (client, mut accepted) = client_for(&server);
    match client.ensure_connected().await {
        Err(Error::Credential(CredentialError::InvalidKey)) => {}
        other => panic!("expected rejected key, got {other:?}"),
    }
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert!(accepted.try_recv().is_err());
}
