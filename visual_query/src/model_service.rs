use crate::{
    detection::Detection,
    frame::Frame,
    grounding_client::GroundingClient,
    ort_service::OrtModelService,
    query::QuerySnapshot,
    vocabulary::Vocabulary,
};
use std::sync::Arc;
use thiserror::Error;
use tonic::async_trait;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model unavailable: {0}")]
    Unavailable(String),
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    #[error("Inference failed: {0}")]
    Inference(String),
}

/// What kind of query a backend can answer.
#[derive(Debug, Clone)]
pub enum Capabilities {
    /// Detector over an enumerated label set.
    FixedVocabulary(Arc<Vocabulary>),
    /// Grounding model taking free-form captions.
    Caption,
}

impl Capabilities {
    pub fn vocabulary(&self) -> Option<&Vocabulary> {
        match self {
            Capabilities::FixedVocabulary(vocabulary) => Some(vocabulary),
            Capabilities::Caption => None,
        }
    }

    pub fn supports_caption(&self) -> bool {
        matches!(self, Capabilities::Caption)
    }
}

#[async_trait]
pub trait ModelService: Send + Sync + 'static {
    fn capabilities(&self) -> Capabilities;

    /// Runs the model on one frame. Detections come back in model order,
    /// unfiltered by the query's confidence floor.
    async fn predict(
        &self,
        frame: Arc<Frame>,
        query: &QuerySnapshot,
    ) -> Result<Vec<Detection>, ModelError>;
}

/// Backend selected at startup.
pub enum Backend {
    Yolo(OrtModelService),
    Grounding(GroundingClient),
}

#[async_trait]
impl ModelService for Backend {
    fn capabilities(&self) -> Capabilities {
        match self {
            Backend::Yolo(service) => service.capabilities(),
            Backend::Grounding(client) => client.capabilities(),
        }
    }

    async fn predict(
        &self,
        frame: Arc<Frame>,
        query: &QuerySnapshot,
    ) -> Result<Vec<Detection>, ModelError> {
        match self {
            Backend::Yolo(service) => service.predict(frame, query).await,
            Backend::Grounding(client) => client.predict(frame, query).await,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::{
        detection::BoundingBox,
        vocabulary::{ColorLabel, Vocabulary},
    };
    use parking_lot::Mutex;
    use std::time::Duration;

    pub fn coco_subset() -> Arc<Vocabulary> {
        let labels = ["person", "car", "bottle", "cup", "traffic light"]
            .iter()
            .map(|label| ColorLabel {
                label: label.to_string(),
                color: [0, 255, 0],
            })
            .collect();
        Arc::new(Vocabulary::new(labels).unwrap())
    }

    pub fn detection(label: &str, confidence: f32, x1: f32, y1: f32) -> Detection {
        Detection {
            label: label.to_string(),
            confidence,
            bbox: BoundingBox {
                x1,
                y1,
                x2: x1 + 10.,
                y2: y1 + 10.,
            },
        }
    }

    type Script = dyn Fn(&Frame, &QuerySnapshot) -> Result<Vec<Detection>, ModelError> + Send + Sync;

    /// In-memory backend answering from a script.
    pub struct ScriptedModel {
        capabilities: Capabilities,
        script: Box<Script>,
        latency: Duration,
        calls: Mutex<Vec<(u64, QuerySnapshot)>>,
    }

    impl ScriptedModel {
        pub fn fixed(detections: Vec<Detection>) -> Self {
            Self::with_script(Capabilities::FixedVocabulary(coco_subset()), move |_, _| {
                Ok(detections.clone())
            })
        }

        pub fn failing() -> Self {
            Self::with_script(Capabilities::FixedVocabulary(coco_subset()), |_, _| {
                Err(ModelError::Unavailable("scripted failure".to_string()))
            })
        }

        pub fn with_script(
            capabilities: Capabilities,
            script: impl Fn(&Frame, &QuerySnapshot) -> Result<Vec<Detection>, ModelError>
                + Send
                + Sync
                + 'static,
        ) -> Self {
            Self {
                capabilities,
                script: Box::new(script),
                latency: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        /// Frame sequence and query of every call so far.
        pub fn calls(&self) -> Vec<(u64, QuerySnapshot)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl ModelService for ScriptedModel {
        fn capabilities(&self) -> Capabilities {
            self.capabilities.clone()
        }

        async fn predict(
            &self,
            frame: Arc<Frame>,
            query: &QuerySnapshot,
        ) -> Result<Vec<Detection>, ModelError> {
            self.calls.lock().push((frame.sequence, query.clone()));
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            (self.script)(&frame, query)
        }
    }
}
