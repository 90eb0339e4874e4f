use crate::{
    config::GroundingConfig,
    detection::{BoundingBox, Detection},
    frame::Frame,
    model_service::{Capabilities, ModelError, ModelService},
    query::{QueryMode, QuerySnapshot},
};
use image::codecs::jpeg::JpegEncoder;
use query_proto::{
    grounding_service_client::GroundingServiceClient, Grounding, GroundingRequest,
};
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tokio::{
    sync::Mutex,
    time::{sleep, timeout, Duration},
};
use tonic::{async_trait, transport::Channel, Request};

#[derive(Error, Debug)]
pub enum GroundingClientError {
    #[error("Maximum connection retries exceeded for {0}")]
    MaxRetriesExceeded(String),
}

/// Client for a remote caption-grounding model.
pub struct GroundingClient {
    client: Mutex<GroundingServiceClient<Channel>>,
}

impl GroundingClient {
    pub async fn new(config: &GroundingConfig) -> Result<Self, GroundingClientError> {
        let client = Self::get_client(config).await?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    async fn get_client(
        config: &GroundingConfig,
    ) -> Result<GroundingServiceClient<Channel>, GroundingClientError> {
        let address = config.get_address();
        let mut retry_delay = Duration::from_millis(50);
        let max_retry_delay = Duration::from_secs(1);
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);

        for attempt in 1..=config.max_retries {
            match timeout(connect_timeout, GroundingServiceClient::connect(address.clone())).await
            {
                Ok(Ok(client)) => {
                    tracing::info!("Connected to grounding model at {}", address);
                    return Ok(client);
                }
                Ok(Err(e)) => {
                    tracing::error!(
                        "Failed to connect to grounding model (attempt {}/{}): {:?}",
                        attempt,
                        config.max_retries,
                        e
                    );
                }
                Err(_) => {
                    tracing::error!(
                        "Connection timeout (attempt {}/{})",
                        attempt,
                        config.max_retries
                    );
                }
            }

            let jitter = rand::random::<f32>() * 0.2 + 0.9;
            sleep(retry_delay.mul_f32(jitter)).await;
            retry_delay = (retry_delay * 2).min(max_retry_delay);
        }

        Err(GroundingClientError::MaxRetriesExceeded(address))
    }
}

fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>, ModelError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, 90)
        .encode_image(&frame.image)
        .map_err(|e| ModelError::MalformedFrame(format!("failed to encode frame: {}", e)))?;
    Ok(buf)
}

fn to_detection(grounding: Grounding) -> Detection {
    Detection {
        label: grounding.phrase.trim().to_string(),
        confidence: grounding.confidence,
        bbox: BoundingBox {
            x1: grounding.x1,
            y1: grounding.y1,
            x2: grounding.x2,
            y2: grounding.y2,
        },
    }
}

#[async_trait]
impl ModelService for GroundingClient {
    fn capabilities(&self) -> Capabilities {
        Capabilities::Caption
    }

    async fn predict(
        &self,
        frame: Arc<Frame>,
        query: &QuerySnapshot,
    ) -> Result<Vec<Detection>, ModelError> {
        let caption = match &query.mode {
            QueryMode::Caption(caption) | QueryMode::Label(caption) => caption.clone(),
            QueryMode::Idle => return Ok(Vec::new()),
        };

        let image_data = tokio::task::spawn_blocking(move || encode_jpeg(&frame))
            .await
            .map_err(|e| ModelError::Unavailable(format!("encoding task failed: {}", e)))??;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;

        let request = Request::new(GroundingRequest {
            image_data,
            caption,
            timestamp,
        });

        let mut client = self.client.lock().await;
        let response = client
            .ground(request)
            .await
            .map_err(|status| ModelError::Unavailable(status.to_string()))?;

        Ok(response
            .into_inner()
            .groundings
            .into_iter()
            .map(to_detection)
            .collect())
    }
}
