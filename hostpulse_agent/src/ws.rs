//! WebSocket upgrade and per-connection wiring: one session protocol engine
//! plus one push loop per accepted connection, with a single writer task so
//! whole frames never interleave.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::push;
use crate::rpc;
use crate::session::Session;
use crate::state::AppState;
use crate::types::Request;

pub fn router(state: AppState) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // All outbound frames (responses and notifications) funnel through one
    // writer task; closing the channel ends it.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let session = Session::new(tx);
    info!(conn = %session.conn_id, "client connected");

    let push_loop = push::spawn_push_loop(state.clone(), session.clone());

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<Request>(&text) {
                Ok(req) => {
                    let resp = rpc::dispatch(&state, &session, req).await;
                    if !session.send_response(&resp) {
                        break;
                    }
                }
                Err(e) => debug!(conn = %session.conn_id, "undecodable frame dropped: {e}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Session teardown: stop the push loop and any warm-up/burst tasks, then
    // best-effort announce the disconnect.
    let _ = session.notify("bridge_disconnected", json!({ "reason": "disconnected" }));
    push_loop.abort();
    session.abort_tasks();
    writer.abort();
    info!(conn = %session.conn_id, "client disconnected");
}
