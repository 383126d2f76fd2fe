//! WebSocket endpoint for client connections.
//!
//! Flow:
//! 1. Client connects to `/ws/sessions/:id?lastSeq=<cursor>`
//! 2. Relay ensures the sandbox is attached (first connection activates)
//! 3. Relay sends `connected` with the session's current journal position
//! 4. If the client's cursor is behind, `replay_start` → historical events
//!    in seq order → `replay_end`; live events queue behind the replay tail
//! 5. Bidirectional loop: client frames are forwarded to the agent, hub
//!    frames (events, correlated responses, errors) go to the client

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;

use ar_domain::session::SessionStatus;
use ar_protocol::ServerFrame;

use crate::hub::{ReplayPlan, SessionHub};
use crate::state::AppState;

const REPLAY_PAGE: usize = 500;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Last seq the client has already seen; replay starts after it.
    #[serde(default, rename = "lastSeq")]
    pub last_seq: Option<i64>,
}

/// GET /ws/sessions/:id, upgraded to the session's event stream.
pub async fn session_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let session = match state.store.get_session(&id) {
        Ok(session) => session,
        Err(_) => return (StatusCode::NOT_FOUND, "no such session").into_response(),
    };
    if session.status == SessionStatus::Archived {
        return (StatusCode::CONFLICT, "session is archived").into_response();
    }

    let cursor = query.last_seq.unwrap_or(0).max(0);
    ws.on_upgrade(move |socket| handle_socket(socket, state, id, cursor))
        .into_response()
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    session_id: String,
    client_last_seq: i64,
) {
    let (mut sink, mut stream) = socket.split();
    let hub = state.hubs.get_or_create(&session_id);

    // First connection (or reconnection after idle/error) brings the
    // sandbox up before anything is promised to the client.
    if let Err(e) = hub.activate().await {
        tracing::warn!(session_id = %session_id, error = %e, "activation on ws attach failed");
        let _ = send_error(&mut sink, &e.to_string()).await;
        return;
    }

    let (client_id, mut rx, plan) = match hub.attach_client(client_last_seq) {
        Ok(attached) => attached,
        Err(e) => {
            let _ = send_error(&mut sink, &e.to_string()).await;
            return;
        }
    };

    let connected = ServerFrame::Connected {
        session_id: session_id.clone(),
        last_seq: plan.upto,
    };
    if send_frame(&mut sink, &connected.to_value()).await.is_err() {
        hub.detach_client(client_id);
        return;
    }

    if plan.is_needed() && replay(&mut sink, &state, &session_id, plan).await.is_err() {
        hub.detach_client(client_id);
        return;
    }

    // Main loop: hub frames out, client commands in.
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if send_frame(&mut sink, &frame).await.is_err() {
                        break;
                    }
                }
                // Hub dropped us (overflow, archive, shutdown).
                None => break,
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_client_frame(&hub, client_id, &mut sink, &text).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {
                    // Ping/pong are answered by axum itself.
                }
            },
        }
    }

    hub.detach_client(client_id);
}

async fn handle_client_frame(
    hub: &Arc<SessionHub>,
    client_id: u64,
    sink: &mut (impl SinkExt<Message> + Unpin),
    text: &str,
) {
    let command = match serde_json::from_str::<Value>(text) {
        Ok(v) if v.is_object() => v,
        _ => {
            tracing::debug!(session_id = %hub.session_id(), "ignoring unparseable client frame");
            return;
        }
    };
    if let Err(e) = hub.submit_command(client_id, command).await {
        let _ = send_error(sink, &e.to_string()).await;
    }
}

/// Stream the journal window `(plan.after, plan.upto]` in order, bracketed
/// by `replay_start`/`replay_end`.
async fn replay(
    sink: &mut (impl SinkExt<Message> + Unpin),
    state: &AppState,
    session_id: &str,
    plan: ReplayPlan,
) -> Result<(), ()> {
    send_frame(sink, &ServerFrame::ReplayStart.to_value()).await?;

    let mut cursor = plan.after;
    'pages: while cursor < plan.upto {
        let (events, _) = state
            .store
            .events_after(session_id, cursor, REPLAY_PAGE)
            .map_err(|e| {
                tracing::error!(session_id, error = %e, "replay query failed");
            })?;
        if events.is_empty() {
            break;
        }
        for event in events {
            if event.seq > plan.upto {
                break 'pages;
            }
            cursor = event.seq;
            send_frame(sink, &ar_protocol::event_frame(&event.payload, event.seq)).await?;
        }
    }

    send_frame(sink, &ServerFrame::ReplayEnd.to_value()).await
}

async fn send_frame(
    sink: &mut (impl SinkExt<Message> + Unpin),
    frame: &Value,
) -> Result<(), ()> {
    sink.send(Message::Text(frame.to_string()))
        .await
        .map_err(|_| ())
}

async fn send_error(
    sink: &mut (impl SinkExt<Message> + Unpin),
    message: &str,
) -> Result<(), ()> {
    send_frame(
        sink,
        &ServerFrame::Error {
            message: message.to_string(),
        }
        .to_value(),
    )
    .await
}
