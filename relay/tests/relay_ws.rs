//! Full-stack relay tests: a node connection and a client connection
//! exchanging frames through a real relay server.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use fabric_relay::config::Config;
use fabric_relay::server::{RelayServer, SharedRelayServer};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay(mutate: impl FnOnce(&mut Config)) -> SharedRelayServer {
    let mut config = Config {
        bind_address: "127.0.0.1:0".to_string(),
        rate_limit: 10_000,
        rate_burst: 10_000,
        ..Default::default()
    };
    mutate(&mut config);
    RelayServer::start(config).await.expect("relay starts")
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{}/", addr))
        .await
        .expect("ws connect");
    ws
}

async fn send(ws: &mut Ws, env: Value) {
    ws.send(Message::Text(env.to_string())).await.expect("send");
}

async fn recv(ws: &mut Ws) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let msg = ws.next().await.expect("frame").expect("frame ok");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).expect("json");
            }
        }
    })
    .await
    .expect("frame within deadline")
}

fn envelope(kind: &str, id: &str, payload: Value) -> Value {
    json!({"v": 1, "type": kind, "id": id, "payload": payload})
}

async fn hello(ws: &mut Ws, node_id: &str, token: &str) {
    send(
        ws,
        envelope(
            "relay_hello",
            &format!("hello-{node_id}"),
            json!({"nodeId": node_id, "relayToken": token}),
        ),
    )
    .await;
    let reply = recv(ws).await;
    assert_eq!(reply["type"], "relay_hello_ok");
    assert_eq!(reply["payload"]["nodeId"], node_id);
}

#[actix_web::test]
async fn forwards_request_and_result_with_id_rewrite() {
    let relay = start_relay(|_| {}).await;
    let mut node = connect(relay.bound_addr()).await;
    hello(&mut node, "n1", "").await;

    let mut client = connect(relay.bound_addr()).await;
    send(
        &mut client,
        envelope(
            "relay_request",
            "client-req-1",
            json!({"nodeId": "n1", "kind": "echo", "prompt": "hi", "clientId": "c1"}),
        ),
    )
    .await;

    // the node sees an internal id, never the client's
    let task = recv(&mut node).await;
    assert_eq!(task["type"], "relay_task");
    let internal_id = task["id"].as_str().unwrap().to_string();
    assert_ne!(internal_id, "client-req-1");
    assert_eq!(task["payload"]["kind"], "echo");
    assert_eq!(task["payload"]["prompt"], "hi");
    assert_eq!(task["payload"]["clientId"], "c1");

    send(
        &mut node,
        envelope(
            "relay_result",
            &internal_id,
            json!({"ok": true, "content": "hi", "nodeId": "n1"}),
        ),
    )
    .await;

    // the client's reply carries its original id
    let response = recv(&mut client).await;
    assert_eq!(response["type"], "relay_response");
    assert_eq!(response["id"], "client-req-1");
    assert_eq!(response["payload"]["ok"], true);
    assert_eq!(response["payload"]["content"], "hi");

    relay.stop().await;
}

#[actix_web::test]
async fn offline_target_fails_fast_with_original_id() {
    let relay = start_relay(|_| {}).await;
    let mut client = connect(relay.bound_addr()).await;
    send(
        &mut client,
        envelope(
            "relay_request",
            "req-77",
            json!({"nodeId": "ghost", "kind": "echo", "prompt": "hi"}),
        ),
    )
    .await;
    let reply = recv(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["id"], "req-77");
    assert_eq!(reply["payload"]["message"], "node offline");

    relay.stop().await;
}

#[actix_web::test]
async fn invalid_relay_token_is_rejected() {
    let relay = start_relay(|c| c.relay_token = "secret".to_string()).await;

    let mut node = connect(relay.bound_addr()).await;
    send(
        &mut node,
        envelope("relay_hello", "h1", json!({"nodeId": "n1", "relayToken": "wrong"})),
    )
    .await;
    let reply = recv(&mut node).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["message"], "invalid relay token");

    let mut client = connect(relay.bound_addr()).await;
    send(
        &mut client,
        envelope(
            "relay_request",
            "r1",
            json!({"nodeId": "n1", "kind": "echo", "prompt": "x", "relayToken": "nope"}),
        ),
    )
    .await;
    let reply = recv(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["message"], "invalid relay token");

    relay.stop().await;
}

#[actix_web::test]
async fn pending_ttl_times_out_and_late_result_is_discarded() {
    let relay = start_relay(|c| c.pending_ttl = 1).await;
    let mut node = connect(relay.bound_addr()).await;
    hello(&mut node, "n1", "").await;

    let mut client = connect(relay.bound_addr()).await;
    send(
        &mut client,
        envelope(
            "relay_request",
            "slow-req",
            json!({"nodeId": "n1", "kind": "echo", "prompt": "slow"}),
        ),
    )
    .await;
    let task = recv(&mut node).await;
    let internal_id = task["id"].as_str().unwrap().to_string();

    // let the pending entry expire, then poke the relay so the
    // opportunistic sweep runs
    tokio::time::sleep(Duration::from_millis(1500)).await;
    send(&mut node, envelope("ping", "tick", json!({}))).await;

    let response = recv(&mut client).await;
    assert_eq!(response["type"], "relay_response");
    assert_eq!(response["id"], "slow-req");
    assert_eq!(response["payload"]["ok"], false);
    assert_eq!(response["payload"]["message"], "timeout");

    // the node's late result has nowhere to go and is dropped silently
    send(
        &mut node,
        envelope(
            "relay_result",
            &internal_id,
            json!({"ok": true, "content": "too late", "nodeId": "n1"}),
        ),
    )
    .await;
    // the pong for "tick" is the node's only other traffic; the client
    // must receive nothing further
    let nothing = tokio::time::timeout(Duration::from_millis(500), client.next()).await;
    assert!(nothing.is_err(), "late result must not reach the client");

    relay.stop().await;
}

#[actix_web::test]
async fn node_disconnect_makes_target_offline() {
    let relay = start_relay(|_| {}).await;
    let mut node = connect(relay.bound_addr()).await;
    hello(&mut node, "n1", "").await;
    drop(node);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut client = connect(relay.bound_addr()).await;
    send(
        &mut client,
        envelope(
            "relay_request",
            "after-drop",
            json!({"nodeId": "n1", "kind": "echo", "prompt": "x"}),
        ),
    )
    .await;
    let reply = recv(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["message"], "node offline");

    relay.stop().await;
}
