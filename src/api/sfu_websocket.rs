use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

use crate::sfu::{SfuConnection, SfuEvent, SfuServer};

pub async fn handle_sfu_websocket(websocket: WebSocket, sfu_server: Arc<SfuServer>) {
    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<SfuEvent>();
    let (request_tx, mut request_rx) = mpsc::unbounded_channel::<String>();

    let connection = Arc::new(SfuConnection::new(sfu_server, event_tx));
    let peer_id = connection.peer_id();
    tracing::info!(peer_id = %peer_id, "New SFU WebSocket connection established");

    // Serializes outbound events in the order the server queued them.
    let sender_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize SFU event");
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(Message::text(text)).await {
                tracing::debug!(error = %e, "Failed to send WebSocket message");
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    // Requests run one at a time per connection, so the socket reader never
    // stalls behind a slow engine call.
    let handler_task = {
        let connection = connection.clone();
        tokio::spawn(async move {
            while let Some(text) = request_rx.recv().await {
                connection.handle_text(&text).await;
            }
        })
    };

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(message) if message.is_close() => break,
            Ok(message) => {
                if let Ok(text) = message.to_str() {
                    tracing::debug!(peer_id = %peer_id, "Received SFU message: {}", text);
                    if request_tx.send(text.to_string()).is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(peer_id = %peer_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // An in-flight request is left to finish: it finds the peer gone and
    // releases whatever the engine created for it.
    drop(request_tx);
    connection.disconnect().await;
    drop(connection);
    if let Err(e) = handler_task.await {
        tracing::error!(peer_id = %peer_id, error = %e, "SFU request handler failed");
    }
    if tokio::time::timeout(std::time::Duration::from_secs(1), sender_task).await.is_err() {
        tracing::debug!(peer_id = %peer_id, "Outbound pump did not drain");
    }
    tracing::info!(peer_id = %peer_id, "SFU WebSocket connection closed");
}
