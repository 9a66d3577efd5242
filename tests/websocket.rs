//! The WebSocket transport and HTTP endpoints against a live server.

use codebox::config::{Config, Toolchain};
use codebox::server;
use codebox::session::SessionState;
use codebox::state::AppState;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const WAIT: Duration = Duration::from_secs(20);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn config(root: &Path) -> Config {
    Config {
        workspace_root: root.to_path_buf(),
        toolchain: Toolchain {
            compile: vec!["sh".to_string(), "-n".to_string()],
            run: vec!["sh".to_string(), "Main.sh".to_string()],
            source_file: "Main.sh".to_string(),
        },
        output_buffer: 16,
    }
}

async fn start(config: Config) -> (SocketAddr, AppState) {
    let state = AppState::new(config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("connect");
    ws
}

async fn send(ws: &mut Client, frame: serde_json::Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Read output frames until the accumulated text contains `needle`.
async fn read_until(ws: &mut Client, needle: &str) -> String {
    let mut text = String::new();
    let found = tokio::time::timeout(WAIT, async {
        while let Some(msg) = ws.next().await {
            if let Message::Text(frame) = msg.expect("frame") {
                let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
                assert_eq!(value["event"], "output");
                text.push_str(value["data"].as_str().unwrap());
                if text.contains(needle) {
                    return true;
                }
            }
        }
        false
    })
    .await;
    assert_eq!(found, Ok(true), "never saw {needle:?}; got {text:?}");
    text
}

async fn only_session(state: &AppState) -> String {
    let sessions = state.sessions.read().await;
    assert_eq!(sessions.len(), 1);
    sessions.keys().next().unwrap().clone()
}

async fn wait_until_gone(state: &AppState, key: &str, root: &Path) {
    let deadline = Instant::now() + WAIT;
    while state.sessions.read().await.contains_key(key) || root.join(key).exists() {
        assert!(Instant::now() < deadline, "session {key} was not torn down");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn http(addr: SocketAddr, method: &str, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        method, path, addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_run_with_args_and_input() {
    let tmp = tempfile::tempdir().unwrap();
    let (addr, _state) = start(config(tmp.path())).await;
    let mut ws = connect(addr).await;

    send(
        &mut ws,
        serde_json::json!({
            "event": "run-code",
            "data": { "code": "read l\necho \"hi $l $1\"\n", "args": "x" }
        }),
    )
    .await;
    read_until(&mut ws, "Running...").await;

    send(&mut ws, serde_json::json!({ "event": "input", "data": "there" })).await;
    let text = read_until(&mut ws, "Process exited with code 0.").await;
    assert!(text.contains("hi there x"), "{text:?}");
}

#[tokio::test]
async fn test_legacy_payload_and_malformed_frames() {
    let tmp = tempfile::tempdir().unwrap();
    let (addr, _state) = start(config(tmp.path())).await;
    let mut ws = connect(addr).await;

    ws.send(Message::Text("not json".to_string())).await.unwrap();
    send(&mut ws, serde_json::json!({ "event": "bogus", "data": 1 })).await;
    send(
        &mut ws,
        serde_json::json!({ "event": "run-code", "data": "echo legacy\n" }),
    )
    .await;

    let text = read_until(&mut ws, "Process exited").await;
    assert!(text.starts_with("Compiling...\n"), "{text:?}");
    assert!(text.contains("legacy\n"), "{text:?}");
}

#[tokio::test]
async fn test_closing_socket_tears_session_down() {
    let tmp = tempfile::tempdir().unwrap();
    let (addr, state) = start(config(tmp.path())).await;
    let mut ws = connect(addr).await;

    send(
        &mut ws,
        serde_json::json!({ "event": "run-code", "data": "sleep 30\n" }),
    )
    .await;
    read_until(&mut ws, "Running...").await;

    let key = only_session(&state).await;
    assert!(tmp.path().join(&key).exists());
    let handle = state.sessions.read().await[&key].handle.clone();
    assert_eq!(handle.status().state, SessionState::Running);

    ws.close(None).await.unwrap();
    drop(ws);

    wait_until_gone(&state, &key, tmp.path()).await;
    assert_eq!(handle.status().state, SessionState::Terminated);
}

#[tokio::test]
async fn test_http_endpoints() {
    let tmp = tempfile::tempdir().unwrap();
    let (addr, state) = start(config(tmp.path())).await;

    let health = http(addr, "GET", "/health").await;
    assert!(health.starts_with("HTTP/1.1 200"), "{health}");
    assert!(health.ends_with("OK"), "{health}");

    let mut ws = connect(addr).await;
    send(
        &mut ws,
        serde_json::json!({ "event": "run-code", "data": "sleep 30\n" }),
    )
    .await;
    read_until(&mut ws, "Running...").await;
    let key = only_session(&state).await;

    let listing = http(addr, "GET", "/sessions").await;
    assert!(listing.contains(&key), "{listing}");
    assert!(listing.contains(r#""state":"running""#), "{listing}");

    let one = http(addr, "GET", &format!("/sessions/{}", key)).await;
    assert!(one.starts_with("HTTP/1.1 200"), "{one}");

    let missing = http(addr, "GET", "/sessions/nope").await;
    assert!(missing.starts_with("HTTP/1.1 404"), "{missing}");

    let deleted = http(addr, "DELETE", &format!("/sessions/{}", key)).await;
    assert!(deleted.starts_with("HTTP/1.1 204"), "{deleted}");
    wait_until_gone(&state, &key, tmp.path()).await;

    let again = http(addr, "DELETE", &format!("/sessions/{}", key)).await;
    assert!(again.starts_with("HTTP/1.1 404"), "{again}");
}
