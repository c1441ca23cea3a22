//! Record engine flows against the mock server.

use deepstream_client::protocol::{Action, Frame, Topic};
use deepstream_client::{Client, ListEventKind};
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
    let result = client.login(json!({})).await.unwrap();
    assert!(result.success);
    client
}

fn frame(raw: &str) -> Frame {
    deepstream_client::protocol::parse_frame(&raw.replace('|', "\u{1f}")).unwrap()
}

#[tokio::test]
async fn record_round_trip() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let client = open_client(&server).await;

    let record = client.records().get_record("rec").await.unwrap();
    let info = record.info().await.unwrap().unwrap();
    assert!(info.is_ready);
    assert_eq!(info.version, Some(0));

    record.set(json!({"firstname": "John"})).unwrap();
    let update = server
        .wait_for(Topic::Record, Action::Update, Some("rec"))
        .await
        .expect("update sent");
    assert_eq!(update.part(1), Some("1"));
    assert_eq!(update.part(2), Some("{\"firstname\":\"John\"}"));

    assert_eq!(
        record.get_path("firstname").await.unwrap(),
        Some(json!("John"))
    );
}

#[tokio::test]
async fn set_with_ack_resolves_on_write_acknowledgement() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let client = open_client(&server).await;

    let record = client.records().get_record("rec").await.unwrap();
    record.set_with_ack(json!({"a": 1})).await.unwrap();

    let update = server
        .wait_for(Topic::Record, Action::Update, Some("rec"))
        .await
        .unwrap();
    assert_eq!(update.part(3), Some("{\"writeSuccess\":true}"));
}

#[tokio::test]
async fn server_pushed_patches_fan_out_to_path_subscribers() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    server.set_record("profile", 2, "{\"age\":30}");
    let client = open_client(&server).await;

    let record = client.records().get_record("profile").await.unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    record
        .subscribe_path("age", false, move |v| {
            let _ = tx.send(v);
        })
        .await
        .unwrap();

    server.send_frame(&frame("R|P|profile|3|age|N31"));
    let value = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("patch delivered")
        .unwrap();
    assert_eq!(value, json!(31));
    assert_eq!(
        record.info().await.unwrap().unwrap().version,
        Some(3)
    );
}

#[tokio::test]
async fn gapped_patch_triggers_snapshot_refresh() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    server.set_record("rec", 3, "{\"a\":\"a\",\"b\":{\"b1\":\"b1\"},\"c\":\"c\"}");
    let client = open_client(&server).await;

    let record = client.records().get_record("rec").await.unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    record
        .subscribe_path("b.b1", false, move |v| {
            let _ = tx.send(v);
        })
        .await
        .unwrap();

    // Advance the server-side store, then push a patch with a version gap.
    server.set_record("rec", 5, "{\"a\":\"a\",\"b\":{\"b1\":\"anotherValue\"},\"c\":\"c\"}");
    server.send_frame(&frame("R|P|rec|5|b.b1|SanotherValue"));

    // The client cannot merge a gapped patch; it asks for a snapshot and
    // adopts the refreshed document.
    server
        .wait_for(Topic::Record, Action::Snapshot, Some("rec"))
        .await
        .expect("snapshot requested");
    let value = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("refresh delivered")
        .unwrap();
    assert_eq!(value, json!("anotherValue"));
    assert_eq!(record.info().await.unwrap().unwrap().version, Some(5));
}

#[tokio::test]
async fn snapshot_and_has_for_uncached_records() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    server.set_record("elsewhere", 4, "{\"x\":9}");
    let client = open_client(&server).await;

    let snapshot = client.records().snapshot("elsewhere").await.unwrap();
    assert_eq!(snapshot, json!({"x": 9}));

    assert!(client.records().has("elsewhere").await.unwrap());
    assert!(!client.records().has("missing").await.unwrap());
}

#[tokio::test]
async fn discard_unsubscribes_and_delete_deletes() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let client = open_client(&server).await;

    let record = client.records().get_record("tmp").await.unwrap();
    record.discard().await.unwrap();
    server
        .wait_for(Topic::Record, Action::Unsubscribe, Some("tmp"))
        .await
        .expect("unsubscribe sent");

    let record = client.records().get_record("doomed").await.unwrap();
    record.delete().await.unwrap();
    server
        .wait_for(Topic::Record, Action::Delete, Some("doomed"))
        .await
        .expect("delete sent");
}

#[tokio::test]
async fn list_entry_events_from_remote_updates() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    server.set_record("tasks", 0, "[\"a\",\"b\",\"c\",\"d\",\"e\"]");
    let client = open_client(&server).await;

    let list = client.records().get_list("tasks").await.unwrap();
    assert_eq!(list.entries().await.unwrap(), vec!["a", "b", "c", "d", "e"]);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let added = tx.clone();
    list.on_entry_added(move |entry, index| {
        let _ = added.send(("added", entry, index));
    })
    .await
    .unwrap();
    let removed = tx.clone();
    list.on_entry_removed(move |entry, index| {
        let _ = removed.send(("removed", entry, index));
    })
    .await
    .unwrap();
    let moved = tx;
    list.on_entry_moved(move |entry, index| {
        let _ = moved.send(("moved", entry, index));
    })
    .await
    .unwrap();

    server.send_frame(&frame("R|U|tasks|1|[\"c\",\"b\",\"f\"]"));

    let mut events = Vec::new();
    for _ in 0..5 {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("list event")
            .unwrap();
        events.push(event);
    }
    assert_eq!(
        events,
        vec![
            ("removed", "a".to_owned(), 0),
            ("removed", "d".to_owned(), 3),
            ("removed", "e".to_owned(), 4),
            ("moved", "c".to_owned(), 0),
            ("added", "f".to_owned(), 2),
        ]
    );
    assert_eq!(list.entries().await.unwrap(), vec!["c", "b", "f"]);
}

#[tokio::test]
async fn local_list_mutations_reach_the_server() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    server.set_record("tasks", 0, "[\"a\"]");
    let client = open_client(&server).await;

    let list = client.records().get_list("tasks").await.unwrap();
    list.add_entry("b", None);
    list.remove_entry("a");

    assert_eq!(list.entries().await.unwrap(), vec!["b"]);

    let updates = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let updates: Vec<String> = server
                .received()
                .into_iter()
                .filter(|f| f.topic == Topic::Record && f.action == Action::Update)
                .map(|f| f.part(2).unwrap_or_default().to_owned())
                .collect();
            if updates.len() == 2 {
                return updates;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("both list updates sent");
    assert_eq!(updates, vec!["[\"a\",\"b\"]", "[\"b\"]"]);
}

#[tokio::test]
async fn record_listen_accepts_matches() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let client = open_client(&server).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client.records().listen("users/*", move |event| {
        let name = event.name.clone();
        if let Some(responder) = event.responder {
            responder.accept();
        }
        let _ = tx.send((name, event.is_subscribed));
    });
    server
        .wait_for(Topic::Record, Action::Listen, Some("users/*"))
        .await
        .expect("listen sent");

    server.send_frame(&frame("R|SP|users/*|users/alice"));
    let (name, is_subscribed) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("match delivered")
        .unwrap();
    assert_eq!(name, "users/alice");
    assert!(is_subscribed);

    let accept = server
        .wait_for(Topic::Record, Action::ListenAccept, Some("users/*"))
        .await
        .expect("accept sent");
    assert_eq!(accept.part(1), Some("users/alice"));

    server.send_frame(&frame("R|SR|users/*|users/alice"));
    let (_, is_subscribed) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("removal delivered")
        .unwrap();
    assert!(!is_subscribed);
}

#[tokio::test]
async fn list_event_unsubscribe_stops_delivery() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    server.set_record("tasks", 0, "[]");
    let client = open_client(&server).await;

    let list = client.records().get_list("tasks").await.unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let id = list
        .on_entry_added(move |entry, _| {
            let _ = tx.send(entry);
        })
        .await
        .unwrap();
    list.unsubscribe_entries(ListEventKind::EntryAdded, id);

    server.send_frame(&frame("R|U|tasks|1|[\"x\"]"));
    // The update applies but no entry event is delivered.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if list.entries().await.unwrap() == vec!["x".to_owned()] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("update applied");
    assert!(rx.try_recv().is_err());
}
