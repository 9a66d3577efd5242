//! WebSocket transport and HTTP endpoints using Axum.

use crate::session::{SessionHandle, SessionState, Submission};
use crate::state::AppState;
use crate::stream::Output;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Frames sent by the browser.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    RunCode(RunPayload),
    Input(serde_json::Value),
}

/// Either the plain source text (older clients) or source plus arguments.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RunPayload {
    Code(String),
    WithArgs {
        code: String,
        #[serde(default)]
        args: String,
    },
}

impl From<RunPayload> for Submission {
    fn from(payload: RunPayload) -> Self {
        match payload {
            RunPayload::Code(code) => Submission::new(code, ""),
            RunPayload::WithArgs { code, args } => Submission::new(code, args),
        }
    }
}

/// Frames sent to the browser.
#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    Output(String),
}

#[derive(Serialize)]
struct SessionInfo {
    id: String,
    state: SessionState,
    outcome: Option<String>,
    completed: u64,
    age_secs: u64,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on `addr` until the listener fails.
pub async fn run_server(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting server on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await
}

async fn health() -> &'static str {
    "OK"
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (output, mut outbound) = Output::channel(state.config.output_buffer);
    let session = state.open_session(output).await;
    let key = session.key().to_string();
    info!(session = %key, "Client connected");

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            let frame = match serde_json::to_string(&ServerMessage::Output(text)) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Failed to encode output frame");
                    continue;
                }
            };
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => dispatch(&session, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(session = %key, error = %e, "Socket error");
                break;
            }
        }
    }

    // Stop writing before teardown so forwarders never wait on a dead socket.
    writer.abort();
    state.close_session(&key).await;
    info!(session = %key, "Client disconnected");
}

async fn dispatch(session: &SessionHandle, frame: &str) {
    match serde_json::from_str::<ClientMessage>(frame) {
        Ok(ClientMessage::RunCode(payload)) => session.submit(payload.into()).await,
        Ok(ClientMessage::Input(value)) => session.input(input_text(value)).await,
        Err(e) => warn!(session = %session.key(), error = %e, "Ignoring malformed frame"),
    }
}

fn input_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    }
}

fn session_info(id: &str, handle: &SessionHandle, created_at: Instant) -> SessionInfo {
    let status = handle.status();
    SessionInfo {
        id: id.to_string(),
        state: status.state,
        outcome: status.outcome.map(|o| o.to_string()),
        completed: status.completed,
        age_secs: created_at.elapsed().as_secs(),
    }
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    let sessions = state.sessions.read().await;
    let list = sessions
        .iter()
        .map(|(id, entry)| session_info(id, &entry.handle, entry.created_at))
        .collect();
    Json(list)
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, StatusCode> {
    let sessions = state.sessions.read().await;
    let entry = sessions.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(session_info(&id, &entry.handle, entry.created_at)))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> StatusCode {
    if state.close_session(&id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(frame: &str) -> ClientMessage {
        serde_json::from_str(frame).expect("frame should parse")
    }

    #[test]
    fn test_run_code_with_args() {
        let msg = parse(r#"{"event":"run-code","data":{"code":"class Main {}","args":"a \"b c\""}}"#);
        let ClientMessage::RunCode(payload) = msg else {
            panic!("expected run-code");
        };
        let submission: Submission = payload.into();
        assert_eq!(submission.code, "class Main {}");
        assert_eq!(submission.args, r#"a "b c""#);
    }

    #[test]
    fn test_legacy_run_code() {
        let ClientMessage::RunCode(payload) = parse(r#"{"event":"run-code","data":"class Main {}"}"#) else {
            panic!("expected run-code");
        };
        assert_eq!(Submission::from(payload), Submission::new("class Main {}", ""));
    }

    #[test]
    fn test_run_code_without_args_field() {
        let ClientMessage::RunCode(payload) = parse(r#"{"event":"run-code","data":{"code":"x"}}"#) else {
            panic!("expected run-code");
        };
        assert_eq!(Submission::from(payload), Submission::new("x", ""));
    }

    #[test]
    fn test_input_accepts_strings_and_numbers() {
        let ClientMessage::Input(value) = parse(r#"{"event":"input","data":"42"}"#) else {
            panic!("expected input");
        };
        assert_eq!(input_text(value), "42");
        let ClientMessage::Input(value) = parse(r#"{"event":"input","data":42}"#) else {
            panic!("expected input");
        };
        assert_eq!(input_text(value), "42");
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"event":"shutdown"}"#).is_err());
    }

    #[test]
    fn test_output_frame_shape() {
        let frame = serde_json::to_string(&ServerMessage::Output("hello\n".to_string())).unwrap();
        assert_eq!(frame, r#"{"event":"output","data":"hello\n"}"#);
    }
}
