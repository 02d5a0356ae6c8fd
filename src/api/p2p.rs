//! Peer data channel.
//!
//! The WebRTC-style transport: after a `welcome` hello frame, every inbound
//! text frame is one JSON request mirroring the HTTP `/responses` body, and
//! every reply is one JSON frame with the same response schema. Requests may
//! carry an `id` which is echoed on the reply so clients can multiplex.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use super::routes::AppState;
use super::types::ResponsesRequest;

#[derive(Debug, Deserialize)]
pub struct PeerParams {
    /// Client-chosen peer id, echoed in the welcome frame.
    pub peer_id: Option<String>,
}

pub async fn peer_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<PeerParams>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_peer(socket, state, params))
}

async fn handle_peer(socket: WebSocket, state: Arc<AppState>, params: PeerParams) {
    let peer_id = params
        .peer_id
        .or_else(|| state.peer_id.clone())
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let (mut sink, mut stream) = socket.split();

    let welcome = json!({
        "type": "welcome",
        "peer_id": peer_id,
        "endpoints": ["/responses"],
    });
    if sink
        .send(WsMessage::Text(welcome.to_string()))
        .await
        .is_err()
    {
        return;
    }
    tracing::info!(%peer_id, "peer connected");

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let reply = answer(&state, &text).await;
        if sink.send(WsMessage::Text(reply.to_string())).await.is_err() {
            break;
        }
    }
    tracing::info!(%peer_id, "peer disconnected");
}

async fn answer(state: &AppState, text: &str) -> Value {
    let parsed: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            return json!({ "status": "failed", "error": format!("invalid JSON: {e}") });
        }
    };
    let id = parsed.get("id").cloned();

    let request: ResponsesRequest = match serde_json::from_value(parsed) {
        Ok(request) => request,
        Err(e) => {
            let mut reply = json!({ "status": "failed", "error": format!("invalid request: {e}") });
            if let Some(id) = id {
                reply["id"] = id;
            }
            return reply;
        }
    };

    let session_hint = None;
    let response = state.dispatch(request, session_hint).await;
    let mut reply = serde_json::to_value(&response)
        .unwrap_or_else(|e| json!({ "status": "failed", "error": format!("encode error: {e}") }));
    if let Some(id) = id {
        reply["id"] = id;
    }
    reply
}
