use crate::{frame::FrameError, server::SharedState};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Frame decoding task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = match &self {
            IngestError::Frame(FrameError::ResolutionMismatch { .. }) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            IngestError::Frame(FrameError::Decode(_)) => StatusCode::BAD_REQUEST,
            IngestError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Serialize)]
pub struct Accepted {
    sequence: u64,
}

/// Decodes a frame from the producer and makes it the newest one.
#[instrument(skip(state, image_data), fields(bytes = image_data.len()))]
pub async fn ingest_frame(
    State(state): State<SharedState>,
    image_data: Bytes,
) -> Result<(StatusCode, Json<Accepted>), IngestError> {
    let frames = state.frames.clone();
    let sequence = tokio::task::spawn_blocking(move || frames.push_encoded(&image_data))
        .await?
        .inspect_err(|e| tracing::warn!("Rejected frame: {}", e))?;

    state.metrics.record_frame();
    tracing::debug!("Accepted frame {}", sequence);

    Ok((StatusCode::ACCEPTED, Json(Accepted { sequence })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frame::{FrameStore, Resolution},
        publisher::StreamPublisher,
        telemetry::Metrics,
    };
    use image::{ImageFormat, RgbImage};
    use std::{io::Cursor, sync::Arc};
    use tokio::sync::broadcast;

    fn state() -> SharedState {
        let (shutdown, _) = broadcast::channel(1);
        SharedState {
            frames: Arc::new(FrameStore::new(Resolution::new(8, 6))),
            publisher: StreamPublisher::new(),
            metrics: Arc::new(Metrics::new()),
            shutdown,
        }
    }

    fn png(width: u32, height: u32) -> Bytes {
        let mut data = Vec::new();
        RgbImage::new(width, height)
            .write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
            .unwrap();
        Bytes::from(data)
    }

    #[tokio::test]
    async fn matching_frame_is_accepted() {
        let state = state();
        let response = ingest_frame(State(state.clone()), png(8, 6))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(state.frames.current().unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn wrong_resolution_is_unprocessable() {
        let state = state();
        let response = ingest_frame(State(state.clone()), png(6, 8))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(state.frames.current().is_none());
    }

    #[tokio::test]
    async fn undecodable_body_is_bad_request() {
        let response = ingest_frame(State(state()), Bytes::from_static(b"garbage"))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
