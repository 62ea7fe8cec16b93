//! MCP sessions driven over in-memory stdio against a live plug-in listener.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use cadwork_mcp::client::{Connection, Endpoint};
use cadwork_mcp::config::ConnectionMode;
use cadwork_mcp::host::{self, Model};
use cadwork_mcp::mcp::{LineTransport, McpServer, ServerState, Tool};
use cadwork_mcp::server::{PluginServer, ServerHandle};

fn spawn_plugin() -> ServerHandle {
    let model = Arc::new(Mutex::new(Model::new(Some("barn.3d".to_string()))));
    PluginServer::bind("127.0.0.1:0".parse().unwrap(), host::dispatcher(&model))
        .unwrap()
        .spawn()
}

fn connection(addr: SocketAddr, mode: ConnectionMode) -> Connection {
    let endpoint = Endpoint::new(addr.ip().to_string(), addr.port())
        .with_connect_timeout(Duration::from_secs(2))
        .with_timeout(Duration::from_secs(5));
    Connection::new(endpoint, mode)
}

/// A loopback address nothing listens on.
async fn dead_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Runs `requests` through a fresh session and returns every reply.
async fn session(server: &mut McpServer, requests: &[Value]) -> Vec<Value> {
    let mut input = String::new();
    for request in requests {
        input.push_str(&request.to_string());
        input.push('\n');
    }

    let mut transport = LineTransport::new(input.as_bytes(), Vec::new());
    server.serve(&mut transport).await.unwrap();

    String::from_utf8(transport.into_writer())
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn handshake_requests() -> Vec<Value> {
    vec![
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "test-client", "version": "1.0"}
            }
        }),
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
    ]
}

fn tool_call(id: u64, name: &str, arguments: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {"name": name, "arguments": arguments}
    })
}

fn tool_text(reply: &Value) -> &str {
    reply["result"]["content"][0]["text"].as_str().unwrap()
}

#[tokio::test]
async fn full_session_creates_and_inspects_a_beam() {
    let plugin = spawn_plugin();
    let mut server = McpServer::new(connection(plugin.local_addr(), ConnectionMode::PerCall));

    let mut requests = handshake_requests();
    requests.push(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}));
    requests.push(tool_call(
        3,
        "create_beam",
        json!({"p1": [0, 0, 0], "p2": [4000, 0, 0], "width": 100, "height": 240}),
    ));
    requests.push(tool_call(4, "get_element_info", json!({"element_id": 1})));
    requests.push(tool_call(5, "get_model_name", Value::Null));

    let replies = session(&mut server, &requests).await;
    assert_eq!(replies.len(), 5);
    assert_eq!(server.state(), ServerState::ShuttingDown);

    assert_eq!(replies[0]["result"]["protocolVersion"], "2024-11-05");
    assert_eq!(replies[0]["result"]["serverInfo"]["name"], "cadwork-mcp");

    let tools = replies[1]["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), Tool::ALL.len());
    assert!(tools.iter().any(|tool| tool["name"] == "reconnect_cadwork"));

    let created: Value = serde_json::from_str(tool_text(&replies[2])).unwrap();
    assert_eq!(created, json!({"status": "ok", "id": 1}));

    let info: Value = serde_json::from_str(tool_text(&replies[3])).unwrap();
    assert_eq!(info["length"], 4000.0);
    assert_eq!(info["p3"], json!([0.0, 0.0, 1.0]));

    let name: Value = serde_json::from_str(tool_text(&replies[4])).unwrap();
    assert_eq!(name["name"], "barn.3d");

    plugin.shutdown().await;
}

#[tokio::test]
async fn plugin_errors_become_tool_errors() {
    let plugin = spawn_plugin();
    let mut server = McpServer::new(connection(plugin.local_addr(), ConnectionMode::PerCall));

    let mut requests = handshake_requests();
    requests.push(tool_call(2, "get_element_info", json!({"element_id": 99})));
    requests.push(tool_call(3, "create_beam", json!({"p1": [0, 0, 0]})));
    requests.push(tool_call(4, "no_such_tool", json!({})));

    let replies = session(&mut server, &requests).await;
    assert_eq!(replies.len(), 4);

    assert_eq!(replies[1]["result"]["isError"], true);
    assert_eq!(
        tool_text(&replies[1]),
        "Cadwork plug-in reported an error: element 99 not found"
    );

    assert_eq!(replies[2]["result"]["isError"], true);
    assert!(tool_text(&replies[2]).contains("p2, width, height"));

    assert_eq!(replies[3]["result"]["isError"], true);
    assert_eq!(tool_text(&replies[3]), "Unknown tool: no_such_tool");

    plugin.shutdown().await;
}

#[tokio::test]
async fn unreachable_plugin_suggests_reconnect() {
    let addr = dead_addr().await;
    let mut server = McpServer::new(connection(addr, ConnectionMode::Persistent));
    assert!(!server.handshake().await);

    let mut requests = handshake_requests();
    requests.push(tool_call(2, "ping_cadwork", json!({})));

    let replies = session(&mut server, &requests).await;
    assert_eq!(replies[1]["result"]["isError"], true);
    let text = tool_text(&replies[1]);
    assert!(text.starts_with("Failed to connect to Cadwork plug-in"), "{text}");
    assert!(text.contains("reconnect_cadwork"));
}

#[tokio::test]
async fn persistent_bridge_recovers_through_reconnect_tool() {
    let plugin = spawn_plugin();
    let mut server = McpServer::new(connection(plugin.local_addr(), ConnectionMode::Persistent));
    assert!(server.handshake().await);

    // The listener closes after every reply, so each socket carries one command.
    let mut requests = handshake_requests();
    requests.push(tool_call(2, "list_elements", json!({})));
    requests.push(tool_call(3, "list_elements", json!({})));
    for round in 0..3 {
        requests.push(tool_call(10 + round * 2, "reconnect_cadwork", json!({})));
        requests.push(tool_call(11 + round * 2, "list_elements", json!({})));
    }

    let replies = session(&mut server, &requests).await;
    assert_eq!(replies.len(), 9);

    let listed: Value = serde_json::from_str(tool_text(&replies[1])).unwrap();
    assert_eq!(listed, json!({"status": "ok", "count": 0, "element_ids": []}));

    assert_eq!(replies[2]["result"]["isError"], true);
    assert!(tool_text(&replies[2]).contains("reconnect_cadwork"));

    for pair in replies[3..].chunks(2) {
        assert!(pair[0]["result"].get("isError").is_none());
        assert!(tool_text(&pair[0]).starts_with("Reconnected to the Cadwork plug-in"));
        assert!(pair[1]["result"].get("isError").is_none(), "{}", pair[1]);
        assert!(tool_text(&pair[1]).contains("element_ids"));
    }

    plugin.shutdown().await;
}

#[tokio::test]
async fn per_call_reconnect_pings_the_plugin() {
    let plugin = spawn_plugin();
    let mut server = McpServer::new(connection(plugin.local_addr(), ConnectionMode::PerCall));
    assert!(server.handshake().await);

    let result = server.call_tool(Tool::Reconnect, &Value::Null).await;
    assert!(!result.is_error);
    assert!(result.first_text().contains("per-call"));

    let result = server.call_tool(Tool::ListElements, &Value::Null).await;
    assert!(!result.is_error, "{}", result.first_text());

    plugin.shutdown().await;
}

#[tokio::test]
async fn requests_before_initialisation_are_rejected() {
    let mut server = McpServer::new(connection(dead_addr().await, ConnectionMode::PerCall));

    let replies = session(
        &mut server,
        &[
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
            json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}),
        ],
    )
    .await;

    assert_eq!(replies[0]["error"]["code"], -32600);
    assert_eq!(replies[0]["error"]["message"], "Server not initialised");
    assert_eq!(replies[1]["result"], json!({}));
}
