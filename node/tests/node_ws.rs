//! Full-stack node service tests: task intake over a real WebSocket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use fabric_node::config::Config;
use fabric_node::executor::{ExecutorConfig, TaskExecutor};
use fabric_node::service::{NodeServer, SharedNodeServer};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_node(mutate: impl FnOnce(&mut Config)) -> SharedNodeServer {
    let mut config = Config {
        bind_address: "127.0.0.1:0".to_string(),
        rate_limit: 10_000,
        rate_burst: 10_000,
        rate_limit_by_client: 10_000,
        rate_burst_by_client: 10_000,
        ..Default::default()
    };
    mutate(&mut config);
    let executor = Arc::new(TaskExecutor::new(ExecutorConfig::default(), None, Vec::new()));
    NodeServer::start(config, executor).await.expect("node starts")
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{}/", addr))
        .await
        .expect("ws connect");
    ws
}

async fn request(ws: &mut Ws, env: Value) -> Value {
    let id = env["id"].as_str().unwrap().to_string();
    ws.send(Message::Text(env.to_string())).await.expect("send");
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let msg = ws.next().await.expect("frame").expect("frame ok");
            if let Message::Text(text) = msg {
                let value: Value = serde_json::from_str(&text).expect("json");
                if value["id"] == json!(id) {
                    return value;
                }
            }
        }
    })
    .await
    .expect("reply within deadline")
}

fn task_run(id: &str, payload: Value) -> Value {
    json!({"v": 1, "type": "task_run", "id": id, "payload": payload})
}

#[actix_web::test]
async fn echo_task_round_trips() {
    let server = start_node(|_| {}).await;
    let mut ws = connect(server.bound_addr()).await;

    let reply = request(
        &mut ws,
        task_run("t1", json!({"kind": "echo", "prompt": "hi"})),
    )
    .await;
    assert_eq!(reply["type"], "task_result");
    assert_eq!(reply["id"], "t1");
    assert_eq!(reply["payload"]["content"], "hi");

    server.stop().await;
}

#[actix_web::test]
async fn ping_and_frame_discipline() {
    let server = start_node(|_| {}).await;
    let mut ws = connect(server.bound_addr()).await;

    let reply = request(&mut ws, json!({"v": 1, "type": "ping", "id": "p1"})).await;
    assert_eq!(reply["type"], "pong");

    let reply = request(&mut ws, json!({"v": 1, "type": "list", "id": "x1"})).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["message"], "expected task_run");

    server.stop().await;
}

#[actix_web::test]
async fn task_validation_errors() {
    let server = start_node(|c| c.service_token = "svc".to_string()).await;
    let mut ws = connect(server.bound_addr()).await;

    let reply = request(
        &mut ws,
        task_run("t1", json!({"kind": "echo", "prompt": "hi", "serviceToken": "bad"})),
    )
    .await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["message"], "invalid service token");

    let reply = request(
        &mut ws,
        task_run("t2", json!({"kind": "shell", "prompt": "rm", "serviceToken": "svc"})),
    )
    .await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["message"], "unsupported kind: shell");

    let reply = request(
        &mut ws,
        task_run("t3", json!({"kind": "echo", "serviceToken": "svc"})),
    )
    .await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["message"], "missing prompt");

    // errors never close the socket
    let reply = request(
        &mut ws,
        task_run("t4", json!({"kind": "echo", "prompt": "ok", "serviceToken": "svc"})),
    )
    .await;
    assert_eq!(reply["type"], "task_result");

    server.stop().await;
}

#[actix_web::test]
async fn chat_without_provider_is_a_task_error() {
    let server = start_node(|_| {}).await;
    let mut ws = connect(server.bound_addr()).await;

    let reply = request(
        &mut ws,
        task_run("t1", json!({"kind": "llm.chat", "prompt": "hi"})),
    )
    .await;
    assert_eq!(reply["type"], "task_error");
    assert_eq!(reply["payload"]["message"], "no chat provider configured");

    server.stop().await;
}

#[actix_web::test]
async fn per_client_rate_limit_applies() {
    let server = start_node(|c| {
        c.rate_limit_by_client = 60;
        c.rate_burst_by_client = 1;
    })
    .await;
    let mut ws = connect(server.bound_addr()).await;

    let ok = request(
        &mut ws,
        task_run("t1", json!({"kind": "echo", "prompt": "a", "clientId": "c1"})),
    )
    .await;
    assert_eq!(ok["type"], "task_result");

    let denied = request(
        &mut ws,
        task_run("t2", json!({"kind": "echo", "prompt": "b", "clientId": "c1"})),
    )
    .await;
    assert_eq!(denied["type"], "error");
    assert_eq!(denied["payload"]["message"], "rate limited");

    // a different client id is unaffected
    let other = request(
        &mut ws,
        task_run("t3", json!({"kind": "echo", "prompt": "c", "clientId": "c2"})),
    )
    .await;
    assert_eq!(other["type"], "task_result");

    server.stop().await;
}
