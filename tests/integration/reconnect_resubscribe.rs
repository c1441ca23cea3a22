//! Reconnection with resubscription replay.

use deepstream_client::protocol::{Action, Topic};
use deepstream_client::{Client, ClientOptions, ConnectionState};
use ds_test_utils::MockServer;
use serde_json::json;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn wait_for_state(client: &Client, state: ConnectionState) {
    let mut rx = client.state_changes();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *rx.borrow() == state {
                return;
            }
            rx.changed().await.expect("state channel open");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {state}"));
}

fn count(server: &MockServer, topic: Topic, action: Action, name: &str) -> usize {
    server
        .received()
        .into_iter()
        .filter(|f| f.topic == topic && f.action == action && f.part(0) == Some(name))
        .count()
}

#[tokio::test]
async fn reconnect_replays_subscriptions_provides_and_reads() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let mut options = ClientOptions::default();
    options.reconnect_interval_increment = Duration::from_millis(20);
    let client = Client::with_options(&server.url(), options);
    client.connect();
    assert!(client.login(json!({"user": "alice"})).await.unwrap().success);

    client.events().subscribe("news", |_| {}).await.unwrap();
    let _record = client.records().get_record("profile").await.unwrap();
    client.rpcs().provide("addTwo", |_, _| {}).await.unwrap();
    client.presence().subscribe(|_, _| {}).await.unwrap();
    server
        .wait_for(Topic::Rpc, Action::Subscribe, Some("addTwo"))
        .await
        .expect("initial provide");

    server.drop_connections();
    wait_for_state(&client, ConnectionState::Open).await;
    assert_eq!(server.connection_count(), 2);

    // Every subscription, provide and read is replayed on the new socket.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if count(&server, Topic::Event, Action::Subscribe, "news") == 2
                && count(&server, Topic::Record, Action::CreateOrRead, "profile") == 2
                && count(&server, Topic::Rpc, Action::Subscribe, "addTwo") == 2
                && count(&server, Topic::Presence, Action::Subscribe, "S") == 2
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscriptions replayed");

    // Authentication was replayed from the stored params.
    let auths = server
        .received()
        .into_iter()
        .filter(|f| f.topic == Topic::Auth && f.action == Action::Request)
        .count();
    assert_eq!(auths, 2);
}

#[tokio::test]
async fn frames_sent_while_reconnecting_drain_after_reopen() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let mut options = ClientOptions::default();
    options.reconnect_interval_increment = Duration::from_millis(50);
    let client = Client::with_options(&server.url(), options);
    client.connect();
    assert!(client.login(json!({})).await.unwrap().success);

    server.drop_connections();
    // Emitted while the socket is down (or mid-redial): queued client-side
    // and flushed once the state re-enters open.
    client.events().emit("held", json!("back"));

    wait_for_state(&client, ConnectionState::Open).await;
    let event = server
        .wait_for(Topic::Event, Action::Event, Some("held"))
        .await
        .expect("queued event delivered after reconnect");
    assert_eq!(event.part(1), Some("Sback"));
}

#[tokio::test]
async fn reconnect_exhaustion_ends_in_error() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let mut options = ClientOptions::default();
    options.max_reconnect_attempts = 2;
    options.reconnect_interval_increment = Duration::from_millis(10);
    let client = Client::with_options(&server.url(), options);
    client.connect();
    assert!(client.login(json!({})).await.unwrap().success);

    // Take the server away for good.
    let addr = server.local_addr();
    drop(server);
    // The port is free now; nothing answers the redials.
    let _ = addr;

    wait_for_state(&client, ConnectionState::Error).await;
}
