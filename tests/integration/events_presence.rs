//! Event and presence flows against the mock server.

use deepstream_client::Client;
use deepstream_client::protocol::{Action, Frame, Topic};
use ds_test_utils::MockServer;
use serde_json::json;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn open_client(server: &MockServer) -> Client {
    let client = Client::new(&server.url());
    client.connect();
    assert!(client.login(json!({})).await.unwrap().success);
    client
}

fn frame(raw: &str) -> Frame {
    deepstream_client::protocol::parse_frame(&raw.replace('|', "\u{1f}")).unwrap()
}

#[tokio::test]
async fn subscribe_receives_server_events() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let client = open_client(&server).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client
        .events()
        .subscribe("news", move |value| {
            let _ = tx.send(value);
        })
        .await
        .unwrap();
    server
        .wait_for(Topic::Event, Action::Subscribe, Some("news"))
        .await
        .expect("subscription sent");

    server.send_frame(&frame("E|EVT|news|Sbreaking"));
    server.send_frame(&frame("E|EVT|news|O{\"score\":3}"));

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, json!("breaking"));
    assert_eq!(second, json!({"score": 3}));
}

#[tokio::test]
async fn emit_sends_typed_data_and_fires_local_subscribers() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let client = open_client(&server).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client
        .events()
        .subscribe("scores", move |value| {
            let _ = tx.send(value);
        })
        .await
        .unwrap();

    client.events().emit("scores", json!(42));
    let local = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(local, json!(42));

    let event = server
        .wait_for(Topic::Event, Action::Event, Some("scores"))
        .await
        .expect("event sent");
    assert_eq!(event.part(1), Some("N42"));
}

#[tokio::test]
async fn last_unsubscriber_tells_the_server() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let client = open_client(&server).await;

    let first = client.events().subscribe("dup", |_| {}).await.unwrap();
    let second = client.events().subscribe("dup", |_| {}).await.unwrap();
    client.events().unsubscribe("dup", first);
    client.events().unsubscribe("dup", second);

    server
        .wait_for(Topic::Event, Action::Unsubscribe, Some("dup"))
        .await
        .expect("unsubscription sent");
    let subscribes = server
        .received()
        .into_iter()
        .filter(|f| f.topic == Topic::Event && f.action == Action::Subscribe)
        .count();
    assert_eq!(subscribes, 1);
}

#[tokio::test]
async fn event_listen_accept_and_reject() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let client = open_client(&server).await;

    client.events().listen("news/*", |event| {
        if let Some(responder) = event.responder {
            if event.name.ends_with("sports") {
                responder.accept();
            } else {
                responder.reject();
            }
        }
    });
    server
        .wait_for(Topic::Event, Action::Listen, Some("news/*"))
        .await
        .expect("listen sent");

    server.send_frame(&frame("E|SP|news/*|news/sports"));
    server.send_frame(&frame("E|SP|news/*|news/weather"));

    let accept = server
        .wait_for(Topic::Event, Action::ListenAccept, Some("news/*"))
        .await
        .expect("accept sent");
    assert_eq!(accept.part(1), Some("news/sports"));
    let reject = server
        .wait_for(Topic::Event, Action::ListenReject, Some("news/*"))
        .await
        .expect("reject sent");
    assert_eq!(reject.part(1), Some("news/weather"));
}

#[tokio::test]
async fn presence_subscribe_and_notifications() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let client = open_client(&server).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client
        .presence()
        .subscribe(move |user, online| {
            let _ = tx.send((user, online));
        })
        .await
        .unwrap();
    server
        .wait_for(Topic::Presence, Action::Subscribe, None)
        .await
        .expect("presence subscription sent");

    server.send_frame(&frame("U|PNJ|alice"));
    server.send_frame(&frame("U|PNL|bob"));

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, ("alice".to_owned(), true));
    assert_eq!(second, ("bob".to_owned(), false));
}

#[tokio::test]
async fn presence_get_all_returns_the_user_list() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    server.set_presence_users(&["alice", "bob"]);
    let client = open_client(&server).await;

    let users = client.presence().get_all().await.unwrap();
    assert_eq!(users, vec!["alice".to_owned(), "bob".to_owned()]);

    let query = server
        .wait_for(Topic::Presence, Action::Query, None)
        .await
        .expect("query sent");
    assert_eq!(query.part(0), Some("Q"));
}

#[tokio::test]
async fn targeted_presence_query_sends_the_user_list() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    server.set_presence_users(&["alice"]);
    let client = open_client(&server).await;

    let users = client
        .presence()
        .get(vec!["alice".to_owned(), "bob".to_owned()])
        .await
        .unwrap();
    assert_eq!(users, vec!["alice".to_owned()]);

    let query = server
        .wait_for(Topic::Presence, Action::Query, None)
        .await
        .expect("query sent");
    assert_eq!(query.part(0), Some("alice,bob"));
}
