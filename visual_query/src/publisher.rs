use crate::{annotation::PassResult, detection::DetectionRecord};
use bytes::Bytes;
use image::{codecs::jpeg::JpegEncoder, RgbImage};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

const STREAM_CAPACITY: usize = 16;
const JPEG_QUALITY: u8 = 85;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to encode frame: {0}")]
    EncodeFrame(#[from] image::ImageError),
    #[error("Failed to encode detection record: {0}")]
    EncodeRecord(#[from] serde_json::Error),
}

/// Annotated frame as sent on the output image stream.
#[derive(Debug, Clone)]
pub struct PublishedFrame {
    pub sequence: u64,
    pub jpeg: Bytes,
}

/// Detection record as sent on the output detection stream.
#[derive(Debug, Clone)]
pub struct PublishedRecord {
    pub sequence: u64,
    pub record: DetectionRecord,
    pub encoded: Arc<str>,
}

/// Fans annotated frames and detection records out to every subscriber.
#[derive(Debug, Clone)]
pub struct StreamPublisher {
    frames: broadcast::Sender<Arc<PublishedFrame>>,
    records: broadcast::Sender<Arc<PublishedRecord>>,
}

impl Default for StreamPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamPublisher {
    pub fn new() -> Self {
        let (frames, _) = broadcast::channel(STREAM_CAPACITY);
        let (records, _) = broadcast::channel(STREAM_CAPACITY);
        Self { frames, records }
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<Arc<PublishedFrame>> {
        self.frames.subscribe()
    }

    pub fn subscribe_records(&self) -> broadcast::Receiver<Arc<PublishedRecord>> {
        self.records.subscribe()
    }

    /// Encodes both outputs first, then sends them, so a pass that fails to
    /// encode publishes nothing at all.
    pub fn publish(&self, result: &PassResult) -> Result<(), PublishError> {
        let jpeg = encode_jpeg(&result.annotated)?;
        let encoded = result.record.encode()?;

        let frame = Arc::new(PublishedFrame {
            sequence: result.frame_sequence,
            jpeg: Bytes::from(jpeg),
        });
        let record = Arc::new(PublishedRecord {
            sequence: result.frame_sequence,
            record: result.record.clone(),
            encoded: Arc::from(encoded),
        });

        if self.frames.send(frame).is_err() {
            tracing::debug!("No subscriber on the output image stream");
        }
        if self.records.send(record).is_err() {
            tracing::debug!("No subscriber on the output detection stream");
        }

        Ok(())
    }
}

fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode_image(image)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model_service::testing::detection,
        query::{QueryMode, QuerySnapshot},
    };

    fn result(sequence: u64, record: DetectionRecord) -> PassResult {
        PassResult {
            frame_sequence: sequence,
            query: QuerySnapshot {
                mode: QueryMode::Idle,
                min_confidence: 0.5,
            },
            detections: Vec::new(),
            record,
            annotated: RgbImage::new(8, 8),
        }
    }

    #[tokio::test]
    async fn publish_reaches_both_streams() {
        let publisher = StreamPublisher::new();
        let mut frames = publisher.subscribe_frames();
        let mut records = publisher.subscribe_records();

        let record = DetectionRecord::from_detections(&[detection("car", 0.9, 0., 0.)]);
        publisher.publish(&result(3, record.clone())).unwrap();

        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.sequence, 3);
        assert!(image::load_from_memory(&frame.jpeg).is_ok());

        let published = records.recv().await.unwrap();
        assert_eq!(published.sequence, 3);
        assert_eq!(published.record, record);
        assert_eq!(
            DetectionRecord::decode(&published.encoded).unwrap(),
            record
        );
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let publisher = StreamPublisher::new();
        assert!(publisher
            .publish(&result(1, DetectionRecord::Nothing))
            .is_ok());
    }
}
