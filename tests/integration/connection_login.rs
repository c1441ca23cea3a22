//! Connection and authentication flows against the mock server.

use deepstream_client::protocol::{Action, Topic};
use deepstream_client::{Client, ClientOptions, ConnectionState};
use ds_test_utils::{AuthBehavior, MockServer};
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

#[tokio::test]
async fn successful_login_reaches_open() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let client = Client::new(&server.url());
    client.connect();

    let result = client.login(json!({"user": "alice"})).await.unwrap();
    assert!(result.success);
    assert!(result.error.is_none());
    assert_eq!(client.connection_state(), ConnectionState::Open);

    // The server saw the challenge response and the auth request with
    // JSON-encoded params.
    let auth = server
        .wait_for(Topic::Auth, Action::Request, None)
        .await
        .expect("auth request received");
    assert_eq!(auth.part(0), Some("{\"user\":\"alice\"}"));
    assert!(
        server
            .wait_for(Topic::Connection, Action::ChallengeResponse, None)
            .await
            .is_some()
    );
}

#[tokio::test]
async fn recoverable_auth_failure_allows_retry() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    server.set_auth(AuthBehavior::Reject {
        code: "INVALID_AUTH_DATA".to_owned(),
        message: "invalid credentials".to_owned(),
    });
    let client = Client::new(&server.url());
    client.connect();

    let result = client.login(json!({"user": "mallory"})).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("INVALID_AUTH_DATA"));
    assert_eq!(result.data, Some(json!("invalid credentials")));
    assert_eq!(
        client.connection_state(),
        ConnectionState::AwaitingAuthentication
    );

    // The server relents; a second login succeeds on the same socket.
    server.set_auth(AuthBehavior::Accept { data: None });
    let result = client.login(json!({"user": "alice"})).await.unwrap();
    assert!(result.success);
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn too_many_auth_attempts_latches_the_client() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    server.set_auth(AuthBehavior::Reject {
        code: "TOO_MANY_AUTH_ATTEMPTS".to_owned(),
        message: "too many authentication attempts".to_owned(),
    });
    let client = Client::new(&server.url());
    client.connect();

    let result = client.login(json!({})).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("TOO_MANY_AUTH_ATTEMPTS"));

    // Latched: subsequent logins resolve immediately without the server.
    let result = client.login(json!({})).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("IS_CLOSED"));
}

#[tokio::test]
async fn frames_issued_before_open_drain_in_order() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let client = Client::new(&server.url());
    client.connect();

    // Subscriptions before authentication are queued client-side.
    let events = client.events();
    events.subscribe("first", |_| {}).await.unwrap();
    events.subscribe("second", |_| {}).await.unwrap();

    client.login(json!({})).await.unwrap();

    server
        .wait_for(Topic::Event, Action::Subscribe, Some("second"))
        .await
        .expect("queued subscriptions flushed");
    let subscribed: Vec<String> = server
        .received()
        .into_iter()
        .filter(|f| f.topic == Topic::Event && f.action == Action::Subscribe)
        .map(|f| f.part(0).unwrap_or_default().to_owned())
        .collect();
    assert_eq!(subscribed, vec!["first", "second"]);
}

#[tokio::test]
async fn deliberate_close_suppresses_reconnect_and_login_reopens() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let client = Client::new(&server.url());
    client.connect();
    client.login(json!({"user": "alice"})).await.unwrap();

    client.close();
    wait_for_state(&client, ConnectionState::Closed).await;
    // Stays closed: no automatic redial.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.connection_state(), ConnectionState::Closed);
    assert_eq!(server.connection_count(), 1);

    // login on a deliberately closed client dials again first.
    let result = client.login(json!({"user": "alice"})).await.unwrap();
    assert!(result.success);
    assert_eq!(server.connection_count(), 2);
    assert_eq!(client.connection_state(), ConnectionState::Open);
}

#[tokio::test]
async fn state_transitions_are_broadcast() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let client = Client::new(&server.url());
    let mut rx = client.state_changes();
    let mut seen = vec![*rx.borrow()];

    client.connect();
    let login_client = client.clone();
    let login = tokio::spawn(async move { login_client.login(json!({})).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while *rx.borrow() != ConnectionState::Open {
            rx.changed().await.unwrap();
            let state = *rx.borrow();
            seen.push(state);
        }
    })
    .await
    .expect("reached open");
    login.await.unwrap().unwrap();

    // The watch channel may coalesce intermediate states; the path must
    // still start closed, move through at least one transition, and end
    // open.
    assert_eq!(seen.first(), Some(&ConnectionState::Closed));
    assert!(seen.len() >= 2);
    assert_eq!(seen.last(), Some(&ConnectionState::Open));
}

#[tokio::test]
async fn unreachable_server_surfaces_connection_error() {
    init_tracing();
    let mut options = ClientOptions::default();
    options.max_reconnect_attempts = 1;
    options.reconnect_interval_increment = Duration::from_millis(10);

    // Nothing listens on this port (bound then dropped).
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = Client::with_options(&format!("ws://{addr}"), options);
    let (err_tx, mut err_rx) = tokio::sync::mpsc::unbounded_channel();
    client
        .on_error(move |e| {
            let _ = err_tx.send(e);
        })
        .await
        .unwrap();
    client.connect();

    let event = tokio::time::timeout(Duration::from_secs(5), err_rx.recv())
        .await
        .expect("error surfaced")
        .unwrap();
    assert_eq!(event.code, "CONNECTION_ERROR");
    wait_for_state(&client, ConnectionState::Error).await;
}
