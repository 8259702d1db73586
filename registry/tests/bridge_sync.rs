//! Federation bridge test: two live registries, one pushing its online
//! directory to the other.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

use fabric_registry::bridge::RegistryBridge;
use fabric_registry::config::Config;
use fabric_registry::server::{RegistryServer, SharedRegistryServer};

async fn start_registry() -> SharedRegistryServer {
    RegistryServer::start(Config {
        bind_address: "127.0.0.1:0".to_string(),
        rate_limit: 10_000,
        rate_burst: 10_000,
        ..Default::default()
    })
    .await
    .expect("registry starts")
}

async fn register_node(addr: SocketAddr, node_id: &str) -> Ws {
    let (mut ws, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();
    let env = json!({
        "v": 1, "type": "register", "id": "reg-1",
        "payload": {
            "nodeId": node_id,
            "nodeName": "bridged node",
            "endpointUrl": "ws://origin:18998",
            "capabilities": {"llm.chat": true},
            "pricePoints": 3,
        }
    });
    ws.send(Message::Text(env.to_string())).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    let reply: Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(reply["type"], "register_ok");
    ws
}

async fn list_all(addr: SocketAddr) -> Vec<Value> {
    let (mut ws, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();
    let env = json!({"v": 1, "type": "list", "id": "list-1", "payload": {"onlineOnly": false}});
    ws.send(Message::Text(env.to_string())).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply: Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    reply["payload"]["nodes"].as_array().cloned().unwrap_or_default()
}

#[actix_web::test]
async fn bridge_pushes_online_nodes_to_the_peer() {
    let origin = start_registry().await;
    let peer = start_registry().await;

    let _node_ws = register_node(origin.bound_addr(), "origin-node").await;

    let bridge = RegistryBridge::start(
        origin.state().clone(),
        vec![format!("ws://{}/", peer.bound_addr())],
        String::new(),
        1,
    );

    // the bridge ticks once per second; give it a few
    let mut found = None;
    for _ in 0..50 {
        let nodes = list_all(peer.bound_addr()).await;
        if let Some(node) = nodes.iter().find(|n| n["nodeId"] == "origin-node") {
            found = Some(node.clone());
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let node = found.expect("bridged node appears on the peer");

    // presentational fields crossed; the ledger did not
    assert_eq!(node["nodeName"], "bridged node");
    assert_eq!(node["pricePoints"], 3);
    assert_eq!(node["balance"], 0);
    assert_eq!(node["earnedPoints"], 0);

    bridge.stop();
    peer.stop().await;
    origin.stop().await;
}
