//! Reconnect behavior: drain on disconnect, linear backoff within budget,
//! attempt-counter reset, budget exhaustion.

use std::time::Duration;

use faktory_client::{Client, ClientError, Config, ConnectionEvent, Job};
use faktory_test_utils::{MockServer, MockServerConfig};
use tokio::net::TcpListener;
use tokio::time::timeout;

fn config_for(server: &MockServer) -> Config {
    Config {
        host: "127.0.0.1".to_owned(),
        port: server.local_addr().port(),
        reconnect_delay: Duration::from_millis(1),
        ..Config::default()
    }
}

/// Receive events until `want` shows up; panics after `deadline`.
async fn await_event(
    events: &mut tokio::sync::broadcast::Receiver<ConnectionEvent>,
    want: &ConnectionEvent,
    deadline: Duration,
) {
    let wait = async {
        loop {
            let event = events.recv().await.expect("event stream open");
            if event == *want {
                return;
            }
        }
    };
    timeout(deadline, wait)
        .await
        .unwrap_or_else(|_| panic!("no {want:?} within {deadline:?}"));
}

#[tokio::test]
async fn reconnects_and_rehandshakes_after_mid_session_drop() {
    let server = MockServer::start().await.unwrap();
    let client = Client::connect(config_for(&server)).await.unwrap();
    let mut events = client.events();

    let mut job = Job::new("t", vec![]).on_queue("q-first");
    client.push(&mut job).await.unwrap();

    server.drop_connections();
    await_event(
        &mut events,
        &ConnectionEvent::Reconnecting { attempt: 1 },
        Duration::from_secs(2),
    )
    .await;
    await_event(&mut events, &ConnectionEvent::Connected, Duration::from_secs(2)).await;

    // The fresh session works.
    let mut job = Job::new("t", vec![]).on_queue("q-second");
    client.push(&mut job).await.unwrap();
    assert_eq!(server.connection_count(), 2);
}

#[tokio::test]
async fn attempt_counter_resets_after_each_successful_handshake() {
    let server = MockServer::start().await.unwrap();
    let cfg = Config {
        reconnect_limit: 1,
        ..config_for(&server)
    };
    let client = Client::connect(cfg).await.unwrap();
    let mut events = client.events();

    // Two consecutive drops survive a budget of one only if the counter
    // resets on reconnect.
    server.drop_connections();
    await_event(&mut events, &ConnectionEvent::Connected, Duration::from_secs(2)).await;
    server.drop_connections();
    await_event(&mut events, &ConnectionEvent::Connected, Duration::from_secs(2)).await;

    let mut job = Job::new("t", vec![]);
    client.push(&mut job).await.unwrap();
    assert_eq!(server.connection_count(), 3);
}

#[tokio::test]
async fn in_flight_operations_are_drained_with_connection_lost() {
    let server = MockServer::start_with(MockServerConfig {
        stall_fetch: true,
        ..MockServerConfig::default()
    })
    .await
    .unwrap();
    let cfg = Config {
        reconnect_limit: 0,
        ..config_for(&server)
    };
    let client = Client::connect(cfg).await.unwrap();

    let fetcher = {
        let client = client.clone();
        tokio::spawn(async move { client.fetch(&["q-stalled"]).await })
    };
    // Let the FETCH reach the wire before killing the socket.
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.drop_connections();

    let result = timeout(Duration::from_secs(2), fetcher)
        .await
        .expect("fetch resolved")
        .unwrap();
    assert_eq!(result.unwrap_err(), ClientError::ConnectionLost);
}

#[tokio::test]
async fn budget_exhaustion_terminates_the_engine() {
    let mut server = MockServer::start().await.unwrap();
    let client = Client::connect(config_for(&server)).await.unwrap();
    let mut events = client.events();

    server.shutdown().await;

    let deadline = Duration::from_secs(2);
    await_event(
        &mut events,
        &ConnectionEvent::Reconnecting { attempt: 1 },
        deadline,
    )
    .await;
    await_event(
        &mut events,
        &ConnectionEvent::Reconnecting { attempt: 2 },
        deadline,
    )
    .await;
    let wait_terminated = async {
        loop {
            if let ConnectionEvent::Terminated { .. } =
                events.recv().await.expect("event stream open")
            {
                return;
            }
        }
    };
    timeout(deadline, wait_terminated)
        .await
        .expect("engine terminated");

    let mut job = Job::new("t", vec![]);
    let err = client.push(&mut job).await.unwrap_err();
    assert_eq!(err, ClientError::NotWritable);
}

#[tokio::test]
async fn initial_connect_failure_surfaces_a_connect_error() {
    // Grab a free port and close it again.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let cfg = Config {
        host: "127.0.0.1".to_owned(),
        port,
        reconnect_limit: 1,
        reconnect_delay: Duration::from_millis(1),
        ..Config::default()
    };
    let err = Client::connect(cfg).await.unwrap_err();
    assert!(matches!(err, ClientError::Connect(_)), "got {err:?}");
}
