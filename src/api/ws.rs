//! Metrics WebSocket: pushes `MetricsEvent`s to dashboard clients.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::routes::AppState;
use crate::pipeline::metrics::{MetricsEvent, MetricsHub};

pub(crate) async fn metrics_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("Metrics client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_snapshot(socket: &mut WebSocket, metrics: &MetricsHub) -> bool {
    let snapshot = MetricsEvent::Snapshot {
        totals: metrics.snapshot().await,
    };
    send_event(socket, &snapshot).await
}

async fn send_event(socket: &mut WebSocket, event: &MetricsEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        // Nothing to send; keep the connection.
        Err(e) => {
            warn!(error = %e, "Failed to serialize metrics event");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    // Subscribe before the snapshot so nothing falls between them.
    let mut rx = state.metrics.subscribe();

    if !send_snapshot(&mut socket, &state.metrics).await {
        warn!("Failed to send initial snapshot, client disconnected");
        return;
    }
    info!("Metrics client connected");

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send_event(&mut socket, &event).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "Metrics client lagged behind broadcast");
                        if !send_snapshot(&mut socket, &state.metrics).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    // Any text frame asks for a fresh snapshot.
                    Some(Ok(Message::Text(_))) => {
                        if !send_snapshot(&mut socket, &state.metrics).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Metrics client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("Metrics connection closed");
}
