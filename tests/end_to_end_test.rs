// End-to-end tests over real sockets.
//
// The server binds to 127.0.0.1:0 and serves the demo chat schema with its
// room filter. Clients are tokio-tungstenite sockets speaking graphql-ws;
// events are injected with the real BroadcastPublisher.
//
// Frames from one connection are handled in order, so a client can confirm
// that an earlier frame (e.g. subscription_end) was processed by sending a
// start for an unknown field and waiting for its subscription_fail.

use futures::{SinkExt, StreamExt};
use gql_fanout::config::{PublisherConfig, ServerConfig};
use gql_fanout::demo;
use gql_fanout::publisher::BroadcastPublisher;
use gql_fanout::server::{RunningServer, ServerBuilder};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

async fn boot_server(control_token: Option<&str>) -> RunningServer {
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        control_token: control_token.map(str::to_string),
        ..ServerConfig::default()
    };
    ServerBuilder::new(Arc::new(demo::build_executor()))
        .config(config)
        .filters(demo::filters())
        .bind()
        .await
        .unwrap()
}

fn publisher_for(server: &RunningServer, token: Option<&str>) -> BroadcastPublisher {
    BroadcastPublisher::new(&PublisherConfig {
        endpoint: "ws://127.0.0.1".to_string(),
        port: server.local_addr().port(),
        token: token.map(str::to_string),
        connect_timeout_ms: 2000,
        ..PublisherConfig::default()
    })
}

async fn connect_client(server: &RunningServer) -> WsStream {
    let url = format!("ws://{}/subscriptions", server.local_addr());
    let mut request = url.into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("graphql-ws"));
    let (ws, _) = connect_async(request).await.unwrap();
    ws
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Read the next text frame as JSON.
async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn assert_quiet(ws: &mut WsStream) {
    if let Ok(Some(Ok(Message::Text(text)))) = timeout(QUIET, ws.next()).await {
        panic!("unexpected frame: {}", text);
    }
}

async fn init(ws: &mut WsStream) {
    send_json(ws, json!({"type": "init"})).await;
    assert_eq!(read_json(ws).await, json!({"type": "init_success"}));
}

async fn start(ws: &mut WsStream, id: &str, query: &str, variables: Value) {
    send_json(
        ws,
        json!({"type": "subscription_start", "id": id, "query": query, "variables": variables}),
    )
    .await;
    assert_eq!(
        read_json(ws).await,
        json!({"type": "subscription_success", "id": id})
    );
}

/// Round-trip a rejected start so every earlier frame is known to be handled.
async fn barrier(ws: &mut WsStream) {
    send_json(
        ws,
        json!({"type": "subscription_start", "id": "barrier", "query": "subscription { nope }"}),
    )
    .await;
    let reply = read_json(ws).await;
    assert_eq!(reply["type"], "subscription_fail");
    assert_eq!(reply["id"], "barrier");
}

#[tokio::test]
async fn test_chat_scenario() {
    let server = boot_server(None).await;
    let publisher = publisher_for(&server, None);

    let mut c1 = connect_client(&server).await;
    init(&mut c1).await;
    start(
        &mut c1,
        "s1",
        r#"subscription{ messageAdded(room:"a"){ text } }"#,
        json!({}),
    )
    .await;

    let mut c2 = connect_client(&server).await;
    init(&mut c2).await;
    start(
        &mut c2,
        "s2",
        "subscription($room: String) { messageAdded(room: $room) { text } }",
        json!({"room": "b"}),
    )
    .await;

    // Observer without a room variable sees every room
    let mut c3 = connect_client(&server).await;
    init(&mut c3).await;
    start(
        &mut c3,
        "all",
        "subscription { messageAdded { room text } }",
        json!({}),
    )
    .await;

    publisher
        .try_publish("messageAdded", json!({"room": "a", "text": "hi"}))
        .await
        .unwrap();

    assert_eq!(
        read_json(&mut c1).await,
        json!({
            "type": "subscription_data",
            "id": "s1",
            "payload": {"data": {"messageAdded": {"text": "hi"}}}
        })
    );
    assert_eq!(
        read_json(&mut c3).await["payload"]["data"]["messageAdded"],
        json!({"room": "a", "text": "hi"})
    );
    assert_quiet(&mut c2).await;

    send_json(&mut c1, json!({"type": "subscription_end", "id": "s1"})).await;
    barrier(&mut c1).await;

    publisher
        .try_publish("messageAdded", json!({"room": "a", "text": "after stop"}))
        .await
        .unwrap();

    assert_eq!(
        read_json(&mut c3).await["payload"]["data"]["messageAdded"]["text"],
        "after stop"
    );
    assert_quiet(&mut c1).await;
    assert_quiet(&mut c2).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_other_subscription_names_untouched() {
    let server = boot_server(None).await;
    let publisher = publisher_for(&server, None);

    let mut ws = connect_client(&server).await;
    init(&mut ws).await;
    start(&mut ws, "joins", "subscription { userJoined { name } }", json!({})).await;
    start(&mut ws, "msgs", "subscription { messageAdded { text } }", json!({})).await;

    publisher
        .try_publish("userJoined", json!({"room": "a", "name": "ada"}))
        .await
        .unwrap();

    let frame = read_json(&mut ws).await;
    assert_eq!(frame["id"], "joins");
    assert_eq!(frame["payload"]["data"]["userJoined"]["name"], "ada");
    assert_quiet(&mut ws).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_resolver_error_reaches_only_its_subscriber() {
    let server = boot_server(None).await;
    let publisher = publisher_for(&server, None);

    let mut ws = connect_client(&server).await;
    init(&mut ws).await;
    start(&mut ws, "m", "subscription { messageAdded { text } }", json!({})).await;

    // Payload missing `text` fails to decode in the resolver
    publisher
        .try_publish("messageAdded", json!({"room": "a"}))
        .await
        .unwrap();

    let frame = read_json(&mut ws).await;
    assert_eq!(frame["type"], "subscription_data");
    assert_eq!(frame["id"], "m");
    assert!(frame["payload"]["errors"].as_array().is_some_and(|e| !e.is_empty()));

    // The connection keeps working
    publisher
        .try_publish("messageAdded", json!({"room": "a", "text": "ok"}))
        .await
        .unwrap();
    let frame = read_json(&mut ws).await;
    assert_eq!(frame["payload"]["data"]["messageAdded"]["text"], "ok");

    server.shutdown().await;
}

#[tokio::test]
async fn test_client_cannot_inject_events() {
    let server = boot_server(None).await;

    let mut ws = connect_client(&server).await;
    init(&mut ws).await;
    start(&mut ws, "m", "subscription { messageAdded { text } }", json!({})).await;

    send_json(
        &mut ws,
        json!({
            "type": "subscription_data",
            "subscription": "messageAdded",
            "payload": {"room": "a", "text": "forged"}
        }),
    )
    .await;

    // Had the forged frame been an event, its data would arrive first
    barrier(&mut ws).await;
    assert_quiet(&mut ws).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_start_before_init_and_duplicate_id() {
    let server = boot_server(None).await;

    let mut ws = connect_client(&server).await;
    send_json(
        &mut ws,
        json!({"type": "subscription_start", "id": 7, "query": "subscription { messageAdded { text } }"}),
    )
    .await;
    assert_eq!(
        read_json(&mut ws).await,
        json!({"type": "subscription_fail", "id": "7", "errors": ["connection not initialized"]})
    );

    init(&mut ws).await;
    start(&mut ws, "dup", "subscription { messageAdded { text } }", json!({})).await;
    send_json(
        &mut ws,
        json!({"type": "subscription_start", "id": "dup", "query": "subscription { userJoined { name } }"}),
    )
    .await;
    assert_eq!(
        read_json(&mut ws).await,
        json!({"type": "subscription_fail", "id": "dup", "errors": ["duplicate id"]})
    );

    // The original subscription is still live
    server
        .handle()
        .publish("messageAdded", json!({"room": "a", "text": "still here"}))
        .await
        .unwrap();
    let frame = read_json(&mut ws).await;
    assert_eq!(frame["id"], "dup");
    assert_eq!(frame["payload"]["data"]["messageAdded"]["text"], "still here");

    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_removes_subscriptions() {
    let server = boot_server(None).await;

    let mut ws = connect_client(&server).await;
    init(&mut ws).await;
    start(&mut ws, "a", "subscription { messageAdded { text } }", json!({})).await;
    start(&mut ws, "b", "subscription { userJoined { name } }", json!({})).await;
    assert_eq!(server.registry().subscription_count(), 2);

    ws.close(None).await.unwrap();
    drop(ws);

    let registry = Arc::clone(server.registry());
    timeout(TIMEOUT, async move {
        while registry.connection_count() > 0 || registry.subscription_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("connection was not cleaned up");

    server.shutdown().await;
}

#[tokio::test]
async fn test_control_token_enforced() {
    let server = boot_server(Some("s3cret")).await;

    let mut ws = connect_client(&server).await;
    init(&mut ws).await;
    start(&mut ws, "m", "subscription { messageAdded { text } }", json!({})).await;

    let rejected = publisher_for(&server, None)
        .try_publish("messageAdded", json!({"room": "a", "text": "nope"}))
        .await;
    assert!(rejected.is_err());

    let wrong = publisher_for(&server, Some("guess"))
        .try_publish("messageAdded", json!({"room": "a", "text": "nope"}))
        .await;
    assert!(wrong.is_err());

    publisher_for(&server, Some("s3cret"))
        .try_publish("messageAdded", json!({"room": "a", "text": "yes"}))
        .await
        .unwrap();

    let frame = read_json(&mut ws).await;
    assert_eq!(frame["payload"]["data"]["messageAdded"]["text"], "yes");

    server.shutdown().await;
}

#[tokio::test]
async fn test_control_token_with_reserved_characters() {
    let server = boot_server(Some("a+b&c #%")).await;

    let mut ws = connect_client(&server).await;
    init(&mut ws).await;
    start(&mut ws, "m", "subscription { messageAdded { text } }", json!({})).await;

    publisher_for(&server, Some("a+b&c #%"))
        .try_publish("messageAdded", json!({"room": "a", "text": "encoded"}))
        .await
        .unwrap();

    let frame = read_json(&mut ws).await;
    assert_eq!(frame["payload"]["data"]["messageAdded"]["text"], "encoded");

    server.shutdown().await;
}

#[tokio::test]
async fn test_invalid_document_rejected_at_start() {
    let server = boot_server(None).await;
    let publisher = publisher_for(&server, None);

    let mut ws = connect_client(&server).await;
    init(&mut ws).await;
    send_json(
        &mut ws,
        json!({
            "type": "subscription_start",
            "id": "bad",
            "query": "subscription { messageAdded { nonexistent } }"
        }),
    )
    .await;

    let reply = read_json(&mut ws).await;
    assert_eq!(reply["type"], "subscription_fail");
    assert_eq!(reply["id"], "bad");
    assert!(reply["errors"][0]
        .as_str()
        .is_some_and(|e| e.contains("nonexistent")));
    assert_eq!(server.registry().subscription_count(), 0);

    publisher
        .try_publish("messageAdded", json!({"room": "a", "text": "hi"}))
        .await
        .unwrap();
    assert_quiet(&mut ws).await;

    server.shutdown().await;
}
