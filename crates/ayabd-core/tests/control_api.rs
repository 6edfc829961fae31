//! Control API over TCP against a simulated machine

use std::net::SocketAddr;

use ayabd_core::api;
use ayabd_core::config::ServiceConfig;
use ayabd_core::service::KnitService;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::Level;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init();
}

async fn start_daemon(state_dir: &std::path::Path) -> SocketAddr {
    init_tracing();
    let config = ServiceConfig {
        connection: "simulation".to_string(),
        state_dir: state_dir.to_path_buf(),
        ..ServiceConfig::default()
    };
    let (service, handle) = KnitService::new(config).unwrap();
    tokio::spawn(service.run());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(api::serve(listener, handle));
    addr
}

/// Send raw bytes the way the web front end does and read the reply until EOF
async fn exchange(addr: SocketAddr, request: &[u8]) -> Value {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();
    assert!(reply.ends_with('\n'), "reply not newline terminated: {:?}", reply);
    serde_json::from_str(&reply).unwrap()
}

async fn call(addr: SocketAddr, request: Value) -> Value {
    exchange(addr, request.to_string().as_bytes()).await
}

#[tokio::test]
async fn test_queue_and_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_daemon(dir.path()).await;

    let reply = call(addr, json!({"method": "GET", "uri": "/queue"})).await;
    assert_eq!(reply["result"]["queue"], json!([]));
    assert_eq!(reply["result"]["colors"], 2);
    assert_eq!(reply["result"]["cursor"]["endOfPattern"], true);

    for length in ["4", "6"] {
        call(
            addr,
            json!({"method": "POST", "uri": "/queue", "data": {"addSpacer": length}}),
        )
        .await;
    }
    let reply = call(
        addr,
        json!({"method": "POST", "uri": "/cursor", "data": {"setPosition": 5}}),
    )
    .await;
    assert_eq!(
        reply["result"],
        json!({"entry": 1, "offset": 1, "phase": 0, "position": 5, "endOfPattern": false})
    );

    // query parameters stand in for a body
    let reply = call(
        addr,
        json!({"method": "POST", "uri": "/cursor", "uri_params": {"setPosition": "-2", "relative": "1"}}),
    )
    .await;
    assert_eq!(reply["result"]["position"], 3);

    let reply = call(addr, json!({"method": "GET", "uri": "/queue"})).await;
    assert_eq!(reply["result"]["totalLength"], 10);
    assert_eq!(reply["result"]["queue"][1]["startPosition"], 4);
    assert_eq!(reply["result"]["queue"][1]["spacer"], true);
}

#[tokio::test]
async fn test_machine_settings() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_daemon(dir.path()).await;

    let reply = call(
        addr,
        json!({"method": "POST", "uri": "/machine", "data": {"setWidth": "40", "setRibber": "true"}}),
    )
    .await;
    assert_eq!(reply["result"]["patternWidth"], 40);
    assert_eq!(reply["result"]["ribber"], true);

    let reply = call(
        addr,
        json!({"method": "POST", "uri": "/machine", "data": {"setColors": 1}}),
    )
    .await;
    assert!(reply["error"].is_string());

    let reply = call(addr, json!({"method": "GET", "uri": "/machine"})).await;
    assert_eq!(reply["result"]["simulation"], true);
    assert_eq!(reply["result"]["connection"], "simulation");
    assert_eq!(reply["result"]["connected"], true);
}

#[tokio::test]
async fn test_errors_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_daemon(dir.path()).await;

    let reply = call(addr, json!({"method": "GET", "uri": "/nothing"})).await;
    assert_eq!(reply, json!({"error": "Unknown request: GET /nothing"}));

    let reply = call(
        addr,
        json!({"method": "POST", "uri": "/queue", "data": {"removeFile": 3}}),
    )
    .await;
    assert!(reply["error"].as_str().unwrap().contains('3'));

    let reply = exchange(addr, b"this is not json").await;
    assert!(reply["error"].as_str().unwrap().starts_with("Invalid JSON"));
}

#[tokio::test]
async fn test_out_of_range_settings_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_daemon(dir.path()).await;

    for data in [
        json!({"setColors": 128, "setRibber": true}),
        json!({"setWidth": 1e12}),
        json!({"setWidth": 201}),
    ] {
        let reply = call(addr, json!({"method": "POST", "uri": "/machine", "data": data})).await;
        assert!(reply["error"].is_string(), "accepted {}", data);
    }

    // the daemon keeps serving with the previous settings
    let reply = call(addr, json!({"method": "GET", "uri": "/queue"})).await;
    assert_eq!(reply["result"]["colors"], 2);
    assert_eq!(reply["result"]["patternWidth"], 0);

    let reply = call(
        addr,
        json!({"method": "POST", "uri": "/cursor", "data": {"setPosition": i64::MAX, "relative": true}}),
    )
    .await;
    assert_eq!(reply["result"]["endOfPattern"], true);
}

#[tokio::test]
async fn test_request_split_across_writes() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_daemon(dir.path()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(br#"{"method": "GET", "#).await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    stream.write_all(br#""uri": "/cursor"}"#).await.unwrap();

    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();
    let reply: Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(reply["result"]["position"], 0);
}
