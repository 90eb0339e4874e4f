mod detections;
mod frames;
mod health;
mod metrics;
mod video_feed;

use crate::{config::StreamsConfig, server::SharedState};
use axum::{
    routing::{get, post},
    Router,
};

pub use detections::detection_stream;
pub use frames::{ingest_frame, IngestError};
pub use health::healthcheck;
pub use metrics::metrics_handler;
pub use video_feed::video_feed;

pub fn api_routes(streams: &StreamsConfig) -> Router<SharedState> {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/metrics", get(metrics_handler))
        .route(&streams.input_stream, post(ingest_frame))
        .route(&streams.output_image_stream, get(video_feed))
        .route(&streams.output_detection_stream, get(detection_stream))
}
