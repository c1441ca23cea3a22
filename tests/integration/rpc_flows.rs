//! RPC caller and provider flows against the mock server.

use deepstream_client::protocol::{Action, Frame, Topic};
use deepstream_client::{Client, ClientOptions, RpcError};
use ds_test_utils::{MockServer, Rule};
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
async fn make_resolves_with_the_typed_response() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    server.add_rule(Rule {
        topic: Topic::Rpc,
        action: Action::Request,
        name: Some("addTwo".to_owned()),
        responses: vec![
            frame("P|A|REQ|addTwo|${1}"),
            frame("P|RES|addTwo|${1}|N11"),
        ],
    });
    let client = open_client(&server).await;

    let result = client
        .rpcs()
        .make("addTwo", json!({"numA": 3, "numB": 8}))
        .await
        .unwrap();
    assert_eq!(result, json!(11));

    let request = server
        .wait_for(Topic::Rpc, Action::Request, Some("addTwo"))
        .await
        .unwrap();
    assert_eq!(request.part(2), Some("O{\"numA\":3,\"numB\":8}"));
}

#[tokio::test]
async fn make_surfaces_remote_errors() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    server.add_rule(Rule {
        topic: Topic::Rpc,
        action: Action::Request,
        name: Some("broken".to_owned()),
        responses: vec![
            frame("P|A|REQ|broken|${1}"),
            frame("P|E|NO_RPC_PROVIDER|broken|${1}"),
        ],
    });
    let client = open_client(&server).await;

    let err = client.rpcs().make("broken", json!(null)).await.unwrap_err();
    assert_eq!(err, RpcError::Remote("NO_RPC_PROVIDER".to_owned()));
}

#[tokio::test]
async fn missing_ack_times_out() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    // No rule for P|REQ: the server stays silent.
    let mut options = ClientOptions::default();
    options.rpc_ack_timeout = Duration::from_millis(100);
    options.rpc_response_timeout = Duration::from_millis(500);
    let client = Client::with_options(&server.url(), options);
    client.connect();
    assert!(client.login(json!({})).await.unwrap().success);

    let err = client.rpcs().make("slow", json!(1)).await.unwrap_err();
    assert_eq!(err, RpcError::AckTimeout);
}

#[tokio::test]
async fn missing_response_times_out_after_ack() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    server.add_rule(Rule {
        topic: Topic::Rpc,
        action: Action::Request,
        name: Some("slow".to_owned()),
        responses: vec![frame("P|A|REQ|slow|${1}")],
    });
    let mut options = ClientOptions::default();
    options.rpc_ack_timeout = Duration::from_millis(200);
    options.rpc_response_timeout = Duration::from_millis(400);
    let client = Client::with_options(&server.url(), options);
    client.connect();
    assert!(client.login(json!({})).await.unwrap().success);

    let err = client.rpcs().make("slow", json!(1)).await.unwrap_err();
    assert_eq!(err, RpcError::ResponseTimeout);
}

#[tokio::test]
async fn provider_receives_requests_and_responds() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let client = open_client(&server).await;

    client
        .rpcs()
        .provide("addTwo", |data, responder| {
            let sum = data["numA"].as_i64().unwrap_or(0) + data["numB"].as_i64().unwrap_or(0);
            responder.send(&json!(sum)).unwrap();
        })
        .await
        .unwrap();
    server
        .wait_for(Topic::Rpc, Action::Subscribe, Some("addTwo"))
        .await
        .expect("provider registered");

    server.send_frame(&frame("P|REQ|addTwo|corr-7|O{\"numA\":2,\"numB\":9}"));
    let response = server
        .wait_for(Topic::Rpc, Action::Response, Some("addTwo"))
        .await
        .expect("response sent");
    assert_eq!(response.part(1), Some("corr-7"));
    assert_eq!(response.part(2), Some("N11"));
}

#[tokio::test]
async fn duplicate_provide_is_rejected_locally() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let client = open_client(&server).await;

    client.rpcs().provide("echo", |_, _| {}).await.unwrap();
    let err = client.rpcs().provide("echo", |_, _| {}).await.unwrap_err();
    assert_eq!(err, RpcError::AlreadyProvided("echo".to_owned()));
}

#[tokio::test]
async fn request_without_provider_is_rejected_on_the_wire() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let client = open_client(&server).await;
    // Keep the connection alive while the server pushes an unsolicited
    // request for an unprovided procedure.
    let _events = client.events().subscribe("keepalive", |_| {}).await.unwrap();

    server.send_frame(&frame("P|REQ|nobody|corr-1|N1"));
    let rejection = server
        .wait_for(Topic::Rpc, Action::Rejection, Some("nobody"))
        .await
        .expect("rejection sent");
    assert_eq!(rejection.part(1), Some("corr-1"));
}

#[tokio::test]
async fn rejecting_provider_suppresses_auto_ack() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let client = open_client(&server).await;

    client
        .rpcs()
        .provide("busy", |_, responder| {
            responder.reject().unwrap();
        })
        .await
        .unwrap();
    server
        .wait_for(Topic::Rpc, Action::Subscribe, Some("busy"))
        .await
        .unwrap();

    server.send_frame(&frame("P|REQ|busy|corr-2|N1"));
    server
        .wait_for(Topic::Rpc, Action::Rejection, Some("busy"))
        .await
        .expect("rejection sent");

    // Give any stray auto-ack a chance to land, then check none did.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let acks = server
        .received()
        .into_iter()
        .filter(|f| f.topic == Topic::Rpc && f.action == Action::Ack)
        .count();
    assert_eq!(acks, 0);
}

#[tokio::test]
async fn unprovide_unsubscribes() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let client = open_client(&server).await;

    client.rpcs().provide("gone", |_, _| {}).await.unwrap();
    client.rpcs().unprovide("gone");
    server
        .wait_for(Topic::Rpc, Action::Unsubscribe, Some("gone"))
        .await
        .expect("unsubscribe sent");
}
