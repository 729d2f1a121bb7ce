//! WebSocket transport for the message protocol.
//!
//! Each connection gets a fresh session id and an outbound queue. Inbound
//! frames are dispatched one at a time, in arrival order; replies and
//! broadcasts are drained from the queue into the socket.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use polyfier_session::{ChannelHandle, JobOrchestrator, SessionId};
use tracing::{debug, info};

use crate::ApiState;

/// GET /ws
pub async fn upgrade(State(state): State<ApiState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let session_id = state.next_session.fetch_add(1, Ordering::Relaxed);
    ws.on_upgrade(move |socket| serve(socket, state.orchestrator, session_id))
}

async fn serve(mut socket: WebSocket, orchestrator: Arc<JobOrchestrator>, session_id: SessionId) {
    let (channel, mut outbound) = ChannelHandle::pair(session_id);
    info!(session_id, "connection opened");

    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    orchestrator.dispatch(&channel, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session_id, error = %e, "receive failed");
                    break;
                }
            },
            Some(frame) = outbound.recv() => {
                if let Err(e) = socket.send(Message::Text(frame.into())).await {
                    debug!(session_id, error = %e, "send failed");
                    break;
                }
            }
        }
    }

    orchestrator.disconnect(session_id).await;
    info!(session_id, "connection closed");
}
