use crate::{publisher::PublishedFrame, server::SharedState};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::StreamExt;
use std::{convert::Infallible, sync::Arc};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::instrument;

const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
const FRAME_BOUNDARY: &str = "frame";

fn multipart_chunk(frame: &PublishedFrame) -> Bytes {
    let part_header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        FRAME_BOUNDARY,
        frame.jpeg.len()
    );
    let mut body = part_header.into_bytes();
    body.extend_from_slice(&frame.jpeg);
    body.extend_from_slice(b"\r\n");
    Bytes::from(body)
}

/// MJPEG feed of annotated frames. Ends when the service shuts down.
#[instrument(skip(state))]
pub async fn video_feed(State(state): State<SharedState>) -> Response {
    let mut shutdown_rx = state.shutdown.subscribe();
    let stream = BroadcastStream::new(state.publisher.subscribe_frames())
        .filter_map(|item: Result<Arc<PublishedFrame>, BroadcastStreamRecvError>| async move {
            match item {
                Ok(frame) => Some(Ok::<_, Infallible>(multipart_chunk(&frame))),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::debug!("Video feed client lagged, skipped {} frames", skipped);
                    None
                }
            }
        })
        .take_until(async move {
            shutdown_rx.recv().await.ok();
        });

    match Response::builder()
        .header(header::CONTENT_TYPE, CONTENT_TYPE)
        .body(Body::from_stream(stream))
    {
        Ok(response) => response,
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
