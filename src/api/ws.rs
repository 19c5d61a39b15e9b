//! WebSocket change feed.
//!
//! After the upgrade the server sends the text frame `ok`, then one text
//! frame per changed resource key. A `ping` frame goes out after
//! `ws_keepalive` without any other traffic. Client frames are ignored
//! apart from Close.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use tracing::{debug, info};

use super::AppState;

pub const READY_FRAME: &str = "ok";
pub const KEEPALIVE_FRAME: &str = "ping";

/// GET /api/music/ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    // Subscribe before the ready frame so no change after it is missed.
    let mut changes = state.cache.bus().subscribe();
    info!("WebSocket subscriber {} connected", changes.id());

    if sender.send(Message::Text(READY_FRAME.into())).await.is_err() {
        debug!("WebSocket closed before ready frame");
        return;
    }

    let keepalive = tokio::time::sleep(state.ws_keepalive);
    tokio::pin!(keepalive);

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
            key = changes.recv() => {
                let Some(key) = key else { break };
                if sender.send(Message::Text(key.into())).await.is_err() {
                    break;
                }
                keepalive.as_mut().reset(tokio::time::Instant::now() + state.ws_keepalive);
            }
            _ = &mut keepalive => {
                if sender.send(Message::Text(KEEPALIVE_FRAME.into())).await.is_err() {
                    break;
                }
                keepalive.as_mut().reset(tokio::time::Instant::now() + state.ws_keepalive);
            }
        }
    }

    info!("WebSocket subscriber {} disconnected", changes.id());
    // Dropping `changes` unregisters it from the bus.
}
