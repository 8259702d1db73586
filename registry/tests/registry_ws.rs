//! Full-stack registry tests: a real server on an ephemeral port, driven
//! by a raw WebSocket client speaking the JSON wire format.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use fabric_registry::config::Config;
use fabric_registry::server::{RegistryServer, SharedRegistryServer};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(mutate: impl FnOnce(&mut Config)) -> SharedRegistryServer {
    let mut config = Config {
        bind_address: "127.0.0.1:0".to_string(),
        rate_limit: 10_000,
        rate_burst: 10_000,
        ..Default::default()
    };
    mutate(&mut config);
    RegistryServer::start(config).await.expect("server starts")
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{}/", addr))
        .await
        .expect("ws connect");
    ws
}

/// Send one envelope and wait for the reply carrying the same id.
async fn request(ws: &mut Ws, env: Value) -> Value {
    let id = env["id"].as_str().expect("request id").to_string();
    ws.send(Message::Text(env.to_string())).await.expect("send");
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            let msg = ws.next().await.expect("reply").expect("frame");
            if let Message::Text(text) = msg {
                let value: Value = serde_json::from_str(&text).expect("reply json");
                if value["id"] == json!(id) {
                    return value;
                }
            }
        }
    })
    .await
    .expect("reply within deadline")
}

fn envelope(kind: &str, id: &str, payload: Value) -> Value {
    json!({"v": 1, "type": kind, "id": id, "payload": payload})
}

async fn register_node(ws: &mut Ws, node_id: &str, caps: Value, price: u64) -> Value {
    request(
        ws,
        envelope(
            "register",
            &format!("reg-{node_id}"),
            json!({
                "nodeId": node_id,
                "nodeName": format!("{node_id} name"),
                "endpointUrl": format!("ws://{node_id}:18998"),
                "capabilities": caps,
                "pricePoints": price,
            }),
        ),
    )
    .await
}

#[actix_web::test]
async fn register_list_resolve_roundtrip() {
    let server = start_server(|_| {}).await;
    let mut ws = connect(server.bound_addr()).await;

    let reply = register_node(&mut ws, "n1", json!({"llm.chat": true}), 2).await;
    assert_eq!(reply["type"], "register_ok");
    assert_eq!(reply["id"], "reg-n1");
    assert_eq!(reply["payload"]["nodeId"], "n1");

    let reply = request(
        &mut ws,
        envelope(
            "list",
            "list-1",
            json!({"onlineOnly": true, "requireCapabilities": ["llm.chat"]}),
        ),
    )
    .await;
    assert_eq!(reply["type"], "list_result");
    assert_eq!(reply["payload"]["total"], 1);
    let node = &reply["payload"]["nodes"][0];
    assert_eq!(node["nodeId"], "n1");
    assert_eq!(node["pricePoints"], 2);
    // list never discloses endpoints
    assert!(node.get("endpointUrl").is_none());

    // capability filtering drops non-matching nodes
    let reply = request(
        &mut ws,
        envelope(
            "list",
            "list-2",
            json!({"onlineOnly": true, "requireCapabilities": ["web_search"]}),
        ),
    )
    .await;
    assert_eq!(reply["payload"]["total"], 0);

    let reply = request(&mut ws, envelope("resolve", "res-1", json!({"nodeId": "n1"}))).await;
    assert_eq!(reply["type"], "resolve_ok");
    assert_eq!(reply["payload"]["endpointUrl"], "ws://n1:18998");
    assert_eq!(reply["payload"]["online"], true);

    server.stop().await;
}

#[actix_web::test]
async fn ledger_flow_reserve_commit_cancel() {
    let server = start_server(|c| c.initial_points = 10).await;
    let mut ws = connect(server.bound_addr()).await;
    register_node(&mut ws, "client", json!({}), 1).await;
    register_node(&mut ws, "provider", json!({"llm.chat": true}), 2).await;

    // reserve 2 points
    let reply = request(
        &mut ws,
        envelope(
            "reserve",
            "rsv-1",
            json!({"nodeId": "provider", "payerNode": "client", "points": 2}),
        ),
    )
    .await;
    assert_eq!(reply["type"], "reserve_ok");
    let rid = reply["payload"]["reservationId"].as_str().unwrap().to_string();

    // commit settles payer and provider
    let reply = request(
        &mut ws,
        envelope("commit", "cmt-1", json!({"reservationId": rid})),
    )
    .await;
    assert_eq!(reply["type"], "commit_ok");

    let reply = request(
        &mut ws,
        envelope("list", "list-3", json!({"onlineOnly": false})),
    )
    .await;
    let nodes = reply["payload"]["nodes"].as_array().unwrap();
    let by_id = |id: &str| {
        nodes
            .iter()
            .find(|n| n["nodeId"] == json!(id))
            .unwrap()
            .clone()
    };
    let payer = by_id("client");
    assert_eq!(payer["balance"], 8);
    assert_eq!(payer["spentPoints"], 2);
    assert_eq!(payer["heldPoints"], 0);
    let provider = by_id("provider");
    assert_eq!(provider["balance"], 12);
    assert_eq!(provider["earnedPoints"], 2);
    assert_eq!(provider["completedTasks"], 1);

    // double-commit is an error; cancel after reserve restores
    let reply = request(
        &mut ws,
        envelope("commit", "cmt-2", json!({"reservationId": "bogus"})),
    )
    .await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["message"], "unknown reservation");

    let reply = request(
        &mut ws,
        envelope(
            "reserve",
            "rsv-2",
            json!({"nodeId": "provider", "payerNode": "client", "points": 8}),
        ),
    )
    .await;
    let rid2 = reply["payload"]["reservationId"].as_str().unwrap().to_string();
    let reply = request(
        &mut ws,
        envelope("cancel", "cnl-1", json!({"reservationId": rid2})),
    )
    .await;
    assert_eq!(reply["type"], "cancel_ok");

    // over-reserve fails with a short human-readable message
    let reply = request(
        &mut ws,
        envelope(
            "reserve",
            "rsv-3",
            json!({"nodeId": "provider", "payerNode": "client", "points": 100}),
        ),
    )
    .await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["message"], "insufficient balance");

    server.stop().await;
}

#[actix_web::test]
async fn award_and_report_update_the_entry() {
    let server = start_server(|c| c.initial_points = 10).await;
    let mut ws = connect(server.bound_addr()).await;
    register_node(&mut ws, "payer", json!({}), 1).await;
    register_node(&mut ws, "earner", json!({}), 1).await;

    // minting is disabled by default
    let reply = request(
        &mut ws,
        envelope("award", "awd-1", json!({"nodeId": "earner", "points": 3})),
    )
    .await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["message"], "payerNode required");

    let reply = request(
        &mut ws,
        envelope(
            "award",
            "awd-2",
            json!({"nodeId": "earner", "points": 3, "payerNode": "payer"}),
        ),
    )
    .await;
    assert_eq!(reply["type"], "award_ok");

    let reply = request(
        &mut ws,
        envelope(
            "report",
            "rep-1",
            json!({"nodeId": "earner", "ok": true, "latencyMs": 250}),
        ),
    )
    .await;
    assert_eq!(reply["type"], "report_ok");

    let reply = request(
        &mut ws,
        envelope("leaderboard", "lb-1", json!({"sortBy": "earnedPoints", "limit": 10})),
    )
    .await;
    assert_eq!(reply["type"], "leaderboard_result");
    assert_eq!(reply["payload"]["nodes"][0]["nodeId"], "earner");
    assert_eq!(reply["payload"]["nodes"][0]["earnedPoints"], 3);
    assert_eq!(reply["payload"]["nodes"][0]["avgLatencyMs"], 250);

    server.stop().await;
}

#[actix_web::test]
async fn auth_and_binding_rules() {
    let server = start_server(|c| c.token = "secret".to_string()).await;
    let mut ws = connect(server.bound_addr()).await;

    // wrong token
    let reply = request(
        &mut ws,
        envelope(
            "register",
            "reg-bad",
            json!({"nodeId": "n1", "registryToken": "wrong"}),
        ),
    )
    .await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["message"], "invalid registry token");

    // good token works and binds the connection
    let reply = request(
        &mut ws,
        envelope(
            "register",
            "reg-good",
            json!({"nodeId": "n1", "registryToken": "secret"}),
        ),
    )
    .await;
    assert_eq!(reply["type"], "register_ok");

    // updating another node over this connection is rejected
    let reply = request(
        &mut ws,
        envelope(
            "update",
            "upd-1",
            json!({"nodeId": "other", "registryToken": "secret"}),
        ),
    )
    .await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["message"], "connection not bound to node");

    // updating the bound node succeeds
    let reply = request(
        &mut ws,
        envelope(
            "update",
            "upd-2",
            json!({"nodeId": "n1", "registryToken": "secret"}),
        ),
    )
    .await;
    assert_eq!(reply["type"], "update_ok");

    // an unbound second connection cannot update either
    let mut ws2 = connect(server.bound_addr()).await;
    let reply = request(
        &mut ws2,
        envelope(
            "update",
            "upd-3",
            json!({"nodeId": "n1", "registryToken": "secret"}),
        ),
    )
    .await;
    assert_eq!(reply["type"], "error");

    server.stop().await;
}

#[actix_web::test]
async fn malformed_and_unknown_frames_keep_the_socket_open() {
    let server = start_server(|_| {}).await;
    let mut ws = connect(server.bound_addr()).await;

    ws.send(Message::Text("{ not json".to_string())).await.unwrap();
    let msg = ws.next().await.unwrap().unwrap();
    let reply: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
    assert_eq!(reply["type"], "error");

    // the connection survived; a ping still works and keeps its id
    let reply = request(&mut ws, envelope("ping", "ping-1", json!({}))).await;
    assert_eq!(reply["type"], "pong");
    assert_eq!(reply["id"], "ping-1");

    let reply = request(&mut ws, envelope("frobnicate", "f-1", json!({}))).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["message"], "unknown type: frobnicate");

    server.stop().await;
}

#[actix_web::test]
async fn rate_limit_rejects_with_correlator() {
    let server = start_server(|c| {
        c.rate_limit = 60;
        c.rate_burst = 2;
    })
    .await;
    let mut ws = connect(server.bound_addr()).await;

    let first = request(&mut ws, envelope("ping", "p1", json!({}))).await;
    assert_eq!(first["type"], "pong");
    let second = request(&mut ws, envelope("ping", "p2", json!({}))).await;
    assert_eq!(second["type"], "pong");
    let third = request(&mut ws, envelope("ping", "p3", json!({}))).await;
    assert_eq!(third["type"], "error");
    assert_eq!(third["payload"]["message"], "rate limited");
    assert_eq!(third["id"], "p3");

    server.stop().await;
}

#[actix_web::test]
async fn knowledge_publish_update_get() {
    let server = start_server(|_| {}).await;
    let mut ws = connect(server.bound_addr()).await;

    let reply = request(
        &mut ws,
        envelope(
            "knowledge_publish",
            "kp-1",
            json!({
                "id": "X", "name": "p", "kind": "skill", "content": "v1",
                "ownerNode": "A",
            }),
        ),
    )
    .await;
    assert_eq!(reply["type"], "knowledge_publish_ok");
    assert_eq!(reply["payload"]["id"], "X");
    assert_eq!(reply["payload"]["sizeBytes"], 2);

    // update with allowUpdate
    let reply = request(
        &mut ws,
        envelope(
            "knowledge_publish",
            "kp-2",
            json!({
                "id": "X", "name": "p", "kind": "skill", "content": "v2",
                "ownerNode": "A", "allowUpdate": true,
            }),
        ),
    )
    .await;
    assert_eq!(reply["type"], "knowledge_publish_ok");

    let reply = request(&mut ws, envelope("knowledge_get", "kg-1", json!({"id": "X"}))).await;
    assert_eq!(reply["type"], "knowledge_get_result");
    assert_eq!(reply["payload"]["content"], "v2");
    assert_eq!(
        reply["payload"]["contentHash"],
        "fb04dcb6970e4c3d1873de51fd5a50d7bb46b3383113602665c350ec40b5f990"
    );

    // foreign owner is rejected
    let reply = request(
        &mut ws,
        envelope(
            "knowledge_publish",
            "kp-3",
            json!({
                "id": "X", "name": "p", "kind": "skill", "content": "v3",
                "ownerNode": "B", "allowUpdate": true,
            }),
        ),
    )
    .await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["message"], "owner mismatch");

    let reply = request(
        &mut ws,
        envelope("knowledge_list", "kl-1", json!({"kind": "skill"})),
    )
    .await;
    assert_eq!(reply["type"], "knowledge_list_result");
    let packs = reply["payload"]["packs"].as_array().unwrap();
    assert_eq!(packs.len(), 1);
    assert!(packs[0].get("content").is_none());

    let reply = request(&mut ws, envelope("knowledge_get", "kg-2", json!({"id": "nope"}))).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["message"], "unknown knowledge pack");

    server.stop().await;
}

#[actix_web::test]
async fn sync_merges_presentational_fields_only() {
    let server = start_server(|c| c.initial_points = 10).await;
    let mut ws = connect(server.bound_addr()).await;
    register_node(&mut ws, "local", json!({"llm.chat": true}), 1).await;

    let reply = request(
        &mut ws,
        envelope(
            "sync",
            "sync-1",
            json!({
                "nodes": [
                    {"nodeId": "remote", "nodeName": "peer node", "endpointUrl": "ws://remote",
                     "capabilities": {"echo": true}, "pricePoints": 4, "online": true,
                     "lastSeenTs": 12345,
                     // counters from the peer must be ignored
                     "balance": 999, "earnedPoints": 999}
                ],
            }),
        ),
    )
    .await;
    assert_eq!(reply["type"], "sync_ok");
    assert_eq!(reply["payload"]["merged"], 1);

    let reply = request(
        &mut ws,
        envelope("list", "list-s", json!({"onlineOnly": false})),
    )
    .await;
    let nodes = reply["payload"]["nodes"].as_array().unwrap();
    let remote = nodes.iter().find(|n| n["nodeId"] == "remote").unwrap();
    assert_eq!(remote["nodeName"], "peer node");
    assert_eq!(remote["pricePoints"], 4);
    assert_eq!(remote["balance"], 0);
    assert_eq!(remote["earnedPoints"], 0);

    server.stop().await;
}

#[actix_web::test]
async fn node_goes_offline_when_register_connection_drops() {
    let server = start_server(|_| {}).await;
    let mut ws = connect(server.bound_addr()).await;
    register_node(&mut ws, "n1", json!({"llm.chat": true}), 1).await;
    drop(ws);

    // the server processes the close asynchronously
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut ws2 = connect(server.bound_addr()).await;
    let reply = request(
        &mut ws2,
        envelope("list", "list-off", json!({"onlineOnly": true})),
    )
    .await;
    assert_eq!(reply["payload"]["total"], 0);

    let reply = request(
        &mut ws2,
        envelope("list", "list-all", json!({"onlineOnly": false})),
    )
    .await;
    assert_eq!(reply["payload"]["total"], 1);

    server.stop().await;
}

#[actix_web::test]
async fn ttl_sweep_flips_silent_nodes_offline() {
    let server = start_server(|c| c.ttl = 1).await;
    let mut ws = connect(server.bound_addr()).await;
    register_node(&mut ws, "n1", json!({"llm.chat": true}), 1).await;

    // no updates for > ttl; the background sweep flips the node
    tokio::time::sleep(Duration::from_secs(3)).await;

    let reply = request(
        &mut ws,
        envelope("list", "list-ttl", json!({"onlineOnly": true})),
    )
    .await;
    assert_eq!(reply["payload"]["total"], 0);

    // re-registering restores online
    register_node(&mut ws, "n1", json!({"llm.chat": true}), 1).await;
    let reply = request(
        &mut ws,
        envelope("list", "list-ttl2", json!({"onlineOnly": true})),
    )
    .await;
    assert_eq!(reply["payload"]["total"], 1);

    server.stop().await;
}

#[actix_web::test]
async fn snapshot_persists_across_restart() {
    let dir = tempdir::TempDir::new("registry-e2e").unwrap();
    let state_file = dir
        .path()
        .join("state.json")
        .to_string_lossy()
        .to_string();

    let server = start_server(|c| {
        c.state_file = Some(state_file.clone());
        c.initial_points = 10;
    })
    .await;
    let mut ws = connect(server.bound_addr()).await;
    register_node(&mut ws, "n1", json!({"llm.chat": true}), 2).await;
    drop(ws);
    server.stop().await;

    let restarted = start_server(|c| c.state_file = Some(state_file.clone())).await;
    let mut ws = connect(restarted.bound_addr()).await;
    let reply = request(
        &mut ws,
        envelope("list", "list-r", json!({"onlineOnly": false})),
    )
    .await;
    assert_eq!(reply["payload"]["total"], 1);
    assert_eq!(reply["payload"]["nodes"][0]["balance"], 10);

    restarted.stop().await;
}

#[actix_web::test]
async fn health_endpoint_reports_status() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let server = start_server(|_| {}).await;
    let mut ws = connect(server.bound_addr()).await;
    register_node(&mut ws, "n1", json!({}), 1).await;

    let health = fabric_registry::health::HealthServer::start("127.0.0.1:0", server.clone(), None)
        .await
        .expect("health starts");
    let health_addr = health.bound_addr();

    let mut stream = tokio::net::TcpStream::connect(health_addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"status\":\"ok\""));
    assert!(response.contains("\"nodesTotal\":1"));

    // metrics are 404 without an installed recorder
    let mut stream = tokio::net::TcpStream::connect(health_addr).await.unwrap();
    stream
        .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"));

    health.stop().await;
    server.stop().await;
}
