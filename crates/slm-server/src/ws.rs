//! WebSocket broadcaster.
//!
//! `GET /ws/events?topic=…` wraps a bus subscription and forwards frames as
//! JSON text messages. The bus handles back-pressure: a subscriber that
//! stops draining is detached there, and this task then ends on `None`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use slm_bus::TOPIC_GLOBAL;
use tracing::{debug, info};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    topic: Option<String>,
}

pub async fn ws_events(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let topic = params.topic.unwrap_or_else(|| TOPIC_GLOBAL.to_string());
    ws.on_upgrade(move |socket| stream_topic(socket, state, topic))
}

async fn stream_topic(socket: WebSocket, state: AppState, topic: String) {
    let mut sub = state.bus.subscribe(&topic);
    info!(topic = %topic, subscriber = sub.id, "websocket subscribed");

    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            frame = sub.recv() => {
                let Some(frame) = frame else { break };
                let Ok(text) = serde_json::to_string(&frame) else { continue };
                if sender.send(Message::Text(text)).await.is_err() {
                    debug!(topic = %topic, "websocket send failed, closing");
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Ping/pong handled by axum; subscribe frames carry no
                    // state beyond the topic already bound at upgrade.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.bus.unsubscribe(&topic, sub.id);
    info!(topic = %topic, subscriber = sub.id, "websocket closed");
}
