//! WebSocket signaling transport
//!
//! One socket per client, namespaced by class. Requests are JSON envelopes
//! with a correlation id; each is answered with exactly one response
//! envelope, and server-pushed events from the class hub are interleaved
//! on the same socket. Outbound traffic goes through a bounded channel
//! with `try_send` backpressure, so one slow client drops its own events
//! instead of stalling the class.

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    response::IntoResponse,
};
use classcast_core::signaling::{
    ErrorBody, RequestEnvelope, ResponseEnvelope, Role,
};
use classcast_media::ClassId;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::server::AppState;

const OUTBOUND_CHANNEL_CAPACITY: usize = 256;
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Handshake parameters carried on the upgrade request.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub role: Role,
    pub student: Option<String>,
}

/// `GET /ws/class/{class_id}?role=producer|viewer&student=name`
pub async fn websocket_handler(
    State(state): State<AppState>,
    Path(class_id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| {
            handle_socket(socket, state, ClassId::new(class_id), query.role, query.student)
        })
}

async fn handle_socket(
    socket: axum::extract::ws::WebSocket,
    state: AppState,
    class_id: ClassId,
    role: Role,
    student: Option<String>,
) {
    let (mut conn, mut events) = state.signaling.connect(class_id.clone(), role, student);
    let connection_id = conn.id();

    debug!(class_id = %class_id, connection_id, ?role, "websocket connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) =
        tokio::sync::mpsc::channel::<String>(OUTBOUND_CHANNEL_CAPACITY);

    // Writer task: the only place that touches the socket's send half.
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if ws_sender
                .send(axum::extract::ws::Message::Text(text.into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Event task: class-hub events, minus the ones this connection caused.
    let event_tx = outbound_tx.clone();
    let event_class = class_id.clone();
    let events_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(envelope) => {
                    if envelope.origin == Some(connection_id) {
                        continue;
                    }
                    let Ok(text) = serde_json::to_string(&envelope.event) else {
                        continue;
                    };
                    if let Err(e) = event_tx.try_send(text) {
                        match e {
                            tokio::sync::mpsc::error::TrySendError::Full(_) => {
                                warn!(
                                    class_id = %event_class,
                                    connection_id,
                                    "client too slow, dropping event"
                                );
                            }
                            tokio::sync::mpsc::error::TrySendError::Closed(_) => break,
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        class_id = %event_class,
                        connection_id,
                        skipped,
                        "event stream lagged"
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Inbound loop: requests are handled sequentially per connection.
    while let Some(message) = ws_receiver.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(class_id = %class_id, connection_id, error = %e, "websocket read failed");
                break;
            }
        };

        let text = match message {
            axum::extract::ws::Message::Text(text) => text,
            axum::extract::ws::Message::Close(_) => break,
            // Binary frames, pings and pongs are not part of the protocol.
            _ => continue,
        };

        let response = match serde_json::from_str::<RequestEnvelope>(text.as_str()) {
            Ok(envelope) => {
                let result = state.signaling.handle(&mut conn, envelope.request).await;
                ResponseEnvelope::from_result(envelope.id, result)
            }
            Err(e) => ResponseEnvelope {
                id: 0,
                data: None,
                error: Some(ErrorBody {
                    message: format!("malformed request: {e}"),
                }),
            },
        };

        let Ok(text) = serde_json::to_string(&response) else {
            continue;
        };
        if outbound_tx.send(text).await.is_err() {
            break;
        }
    }

    // Socket gone: producer teardown ends the class, viewer teardown only
    // releases this connection's resources.
    state.signaling.disconnect(&mut conn).await;

    events_task.abort();
    drop(outbound_tx);
    let _ = writer.await;

    debug!(class_id = %class_id, connection_id, "websocket closed");
}
