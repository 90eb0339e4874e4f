use crate::{publisher::PublishedRecord, server::SharedState};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::instrument;

/// Streams every published detection record as one text message.
#[instrument(skip(state, ws))]
pub async fn detection_stream(State(state): State<SharedState>, ws: WebSocketUpgrade) -> Response {
    let records = state.publisher.subscribe_records();
    let shutdown_rx = state.shutdown.subscribe();
    ws.on_upgrade(move |socket| forward_records(socket, records, shutdown_rx))
}

async fn forward_records(
    mut socket: WebSocket,
    mut records: broadcast::Receiver<Arc<PublishedRecord>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tracing::info!("Detection stream client connected");
    loop {
        tokio::select! {
            record = records.recv() => match record {
                Ok(record) => {
                    let text = Message::Text(record.encoded.as_ref().into());
                    if let Err(e) = socket.send(text).await {
                        tracing::debug!("Detection stream client gone: {}", e);
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Detection stream client lagged, skipped {} records", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            _ = shutdown_rx.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }
    tracing::info!("Detection stream client disconnected");
}
