//! WebSocket stream of a build's events.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use conveyor_core::ResourceId;
use conveyor_scheduler::BuildEvent;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::AppState;

/// WebSocket upgrade handler.
pub async fn build_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    // Subscribe before the upgrade so no event slips in between.
    let events = state.plane.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, ResourceId::from_uuid(id), events))
}

async fn handle_socket(
    socket: WebSocket,
    build_id: ResourceId,
    mut events: broadcast::Receiver<BuildEvent>,
) {
    info!(build_id = %build_id, "Build event stream opened");
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) if event.build_id() == build_id => {
                    let finished = matches!(event, BuildEvent::BuildFinished { .. });
                    let Ok(json) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() || finished {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(build_id = %build_id, skipped, "Build event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    info!(build_id = %build_id, "Build event stream closed");
}
