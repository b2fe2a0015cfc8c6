//! Handshake tests: greeting, version check, salted password hashing,
//! worker identity.

use std::time::Duration;

use faktory_client::{Client, ClientError, Config};
use faktory_protocol::hash_password;
use faktory_test_utils::{MockServer, MockServerConfig};

fn config_for(server: &MockServer) -> Config {
    Config {
        host: "127.0.0.1".to_owned(),
        port: server.local_addr().port(),
        reconnect_delay: Duration::from_millis(1),
        ..Config::default()
    }
}

#[tokio::test]
async fn hello_carries_hostname_labels_and_version() {
    let server = MockServer::start().await.unwrap();
    let _client = Client::connect(config_for(&server)).await.unwrap();

    let hello = server.last_hello().expect("HELLO captured");
    assert_eq!(hello["v"], 2);
    assert_eq!(hello["labels"][0], "rust");
    assert!(hello["hostname"].is_string());
    // Not a worker connection: no worker identity fields.
    assert!(hello.get("wid").is_none());
    assert!(hello.get("pid").is_none());
}

#[tokio::test]
async fn password_handshake_sends_iterated_pwdhash() {
    let server = MockServer::start_with(MockServerConfig {
        salt: Some("dozens".to_owned()),
        iterations: 10,
        password: Some("password1".to_owned()),
        ..MockServerConfig::default()
    })
    .await
    .unwrap();
    let cfg = Config {
        password: Some("password1".to_owned()),
        ..config_for(&server)
    };

    // Connect resolves only if the server accepted the hash.
    let _client = Client::connect(cfg).await.unwrap();

    let hello = server.last_hello().expect("HELLO captured");
    assert_eq!(
        hello["pwdhash"],
        hash_password("password1", "dozens", 10).unwrap().as_str()
    );
}

#[tokio::test]
async fn wrong_password_is_rejected_by_the_server() {
    let server = MockServer::start_with(MockServerConfig {
        salt: Some("s1".to_owned()),
        iterations: 2,
        password: Some("correct".to_owned()),
        ..MockServerConfig::default()
    })
    .await
    .unwrap();
    let cfg = Config {
        password: Some("wrong".to_owned()),
        ..config_for(&server)
    };

    let err = Client::connect(cfg).await.unwrap_err();
    assert!(matches!(err, ClientError::Handshake(_)), "got {err:?}");
}

#[tokio::test]
async fn salted_greeting_without_configured_password_fails_locally() {
    let server = MockServer::start_with(MockServerConfig {
        salt: Some("s1".to_owned()),
        iterations: 1,
        ..MockServerConfig::default()
    })
    .await
    .unwrap();

    let err = Client::connect(config_for(&server)).await.unwrap_err();
    assert!(matches!(err, ClientError::Handshake(_)), "got {err:?}");
}

#[tokio::test]
async fn server_version_mismatch_fails_connect() {
    let server = MockServer::start_with(MockServerConfig {
        version: 3,
        ..MockServerConfig::default()
    })
    .await
    .unwrap();

    let err = Client::connect(config_for(&server)).await.unwrap_err();
    assert_eq!(err, ClientError::VersionMismatch { server: 3 });
}

#[tokio::test]
async fn worker_connections_send_wid_and_pid() {
    let server = MockServer::start().await.unwrap();
    let cfg = Config {
        wid: Some("wid-123".to_owned()),
        ..config_for(&server)
    };
    let _client = Client::connect(cfg).await.unwrap();

    let hello = server.last_hello().expect("HELLO captured");
    assert_eq!(hello["wid"], "wid-123");
    assert!(hello["pid"].is_number());
}
