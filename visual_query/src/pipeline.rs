use crate::{
    annotation::{Annotator, PassResult},
    frame::FrameStore,
    model_service::{Capabilities, ModelService},
    publisher::StreamPublisher,
    query::{QueryMode, QueryState},
    telemetry::Metrics,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::sync::Mutex;
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Tick,
    Where,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Tick => "tick",
            Trigger::Where => "where",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared state of both execution contexts plus the exclusive section that
/// serializes every read-frame, read-query, infer, publish sequence.
pub struct VisionCore<M: ModelService> {
    frames: Arc<FrameStore>,
    query: Arc<QueryState>,
    model: Arc<M>,
    annotator: Annotator,
    publisher: StreamPublisher,
    metrics: Arc<Metrics>,
    section: Mutex<()>,
    closing: AtomicBool,
}

impl<M: ModelService> VisionCore<M> {
    pub fn new(
        frames: Arc<FrameStore>,
        query: Arc<QueryState>,
        model: Arc<M>,
        annotator: Annotator,
        publisher: StreamPublisher,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            frames,
            query,
            model,
            annotator,
            publisher,
            metrics,
            section: Mutex::new(()),
            closing: AtomicBool::new(false),
        }
    }

    pub fn frames(&self) -> &Arc<FrameStore> {
        &self.frames
    }

    pub fn query(&self) -> &Arc<QueryState> {
        &self.query
    }

    pub fn publisher(&self) -> &StreamPublisher {
        &self.publisher
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn capabilities(&self) -> Capabilities {
        self.model.capabilities()
    }

    /// Stops accepting passes. A pass already inside the section completes.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// One periodic pass over the newest frame with the current query.
    pub async fn tick(&self) -> Option<Arc<PassResult>> {
        let _guard = self.section.lock().await;
        self.run_pass(Trigger::Tick).await
    }

    /// Replaces the query once every earlier pass and command has finished.
    /// Returns false when the core is closing and nothing was changed.
    pub async fn set_query(&self, mode: QueryMode) -> bool {
        let _guard = self.section.lock().await;
        if self.is_closing() {
            return false;
        }
        self.query.set_query(mode);
        true
    }

    /// Switches to `mode` and immediately runs a pass on the current frame,
    /// without letting a tick slip in between. Before the first frame the
    /// query is left untouched.
    pub async fn locate(&self, mode: QueryMode) -> Option<Arc<PassResult>> {
        let _guard = self.section.lock().await;
        if self.is_closing() {
            return None;
        }
        if self.frames.current().is_none() {
            tracing::debug!("No frame received yet, cannot locate {}", mode);
            return None;
        }
        self.query.set_query(mode);
        self.run_pass(Trigger::Where).await
    }

    /// Must only be called while holding the section.
    #[instrument(skip(self))]
    async fn run_pass(&self, trigger: Trigger) -> Option<Arc<PassResult>> {
        if self.is_closing() {
            return None;
        }

        let Some(frame) = self.frames.current() else {
            tracing::debug!("No frame received yet, skipping pass");
            return None;
        };
        let query = self.query.snapshot();
        let started = Instant::now();

        let detections = match self.model.predict(frame.clone(), &query).await {
            Ok(detections) => detections,
            Err(e) => {
                tracing::warn!(
                    "Inference failed on frame {}, publishing no detections: {}",
                    frame.sequence,
                    e
                );
                self.metrics.record_inference_failure();
                Vec::new()
            }
        };

        let result = Arc::new(self.annotator.build(&frame, detections, query));
        tracing::debug!(
            "Pass on frame {} with {} kept {} detections",
            result.frame_sequence,
            result.query.mode,
            result.detections.len()
        );

        if let Err(e) = self.publisher.publish(&result) {
            tracing::error!("Failed to publish frame {}: {}", result.frame_sequence, e);
            self.metrics.record_publish_failure();
        }
        self.frames.store_result(result.clone());
        self.metrics
            .record_pass(trigger.as_str(), started.elapsed().as_millis() as u64);

        Some(result)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        detection::DetectionRecord,
        frame::Resolution,
        model_service::testing::{coco_subset, detection, ScriptedModel},
    };
    use image::{Rgb, RgbImage};
    use std::time::Duration;

    pub fn core_with(model: ScriptedModel, mode: QueryMode, floor: f32) -> Arc<VisionCore<ScriptedModel>> {
        Arc::new(VisionCore::new(
            Arc::new(FrameStore::new(Resolution::new(64, 48))),
            Arc::new(QueryState::new(mode, floor)),
            Arc::new(model),
            Annotator::new(Some(coco_subset()), 2),
            StreamPublisher::new(),
            Arc::new(Metrics::new()),
        ))
    }

    #[tokio::test]
    async fn tick_without_frame_publishes_nothing() {
        let core = core_with(ScriptedModel::fixed(Vec::new()), QueryMode::Idle, 0.5);
        let mut records = core.publisher().subscribe_records();

        assert!(core.tick().await.is_none());
        assert!(records.try_recv().is_err());
    }

    #[tokio::test]
    async fn all_zero_frame_with_no_detections_yields_sentinel() {
        let core = core_with(
            ScriptedModel::fixed(Vec::new()),
            QueryMode::Label("person".to_string()),
            0.95,
        );
        let mut records = core.publisher().subscribe_records();
        core.frames().push(RgbImage::new(64, 48)).unwrap();

        let result = core.tick().await.unwrap();
        assert_eq!(result.record, DetectionRecord::Nothing);
        assert_eq!(result.annotated, RgbImage::new(64, 48));

        let published = records.recv().await.unwrap();
        assert!(published.record.is_nothing());
        assert_eq!(&*published.encoded, "\"nothing\"");
    }

    #[tokio::test]
    async fn inference_failure_degrades_to_no_detections() {
        let core = core_with(ScriptedModel::failing(), QueryMode::Idle, 0.5);
        let mut records = core.publisher().subscribe_records();
        core.frames().push(RgbImage::new(64, 48)).unwrap();

        let result = core.tick().await.unwrap();
        assert!(result.record.is_nothing());
        assert!(records.recv().await.unwrap().record.is_nothing());

        // The next pass still runs.
        assert!(core.tick().await.is_some());
    }

    #[tokio::test]
    async fn tick_uses_current_query_and_keeps_latest_result() {
        let core = core_with(
            ScriptedModel::fixed(vec![
                detection("car", 0.9, 0., 0.),
                detection("person", 0.9, 20., 20.),
            ]),
            QueryMode::Label("car".to_string()),
            0.5,
        );
        core.frames().push(RgbImage::new(64, 48)).unwrap();

        let result = core.tick().await.unwrap();
        assert_eq!(result.record.targets().len(), 1);
        assert_eq!(result.record.targets()[0].label, "car");

        let stored = core.frames().latest_result().unwrap();
        assert!(Arc::ptr_eq(&stored, &result));
    }

    #[tokio::test]
    async fn closed_core_runs_no_more_passes() {
        let core = core_with(ScriptedModel::fixed(Vec::new()), QueryMode::Idle, 0.5);
        core.frames().push(RgbImage::new(64, 48)).unwrap();
        core.close();

        assert!(core.tick().await.is_none());
        assert!(core.locate(QueryMode::Label("car".to_string())).await.is_none());
        assert_eq!(core.query().snapshot().mode, QueryMode::Idle);
    }

    #[tokio::test]
    async fn locate_before_first_frame_keeps_query() {
        let core = core_with(ScriptedModel::fixed(Vec::new()), QueryMode::Idle, 0.5);
        let mut records = core.publisher().subscribe_records();

        assert!(core.locate(QueryMode::Label("cup".to_string())).await.is_none());
        assert_eq!(core.query().snapshot().mode, QueryMode::Idle);
        assert!(records.try_recv().is_err());
    }

    #[tokio::test]
    async fn set_query_is_refused_once_closed() {
        let core = core_with(ScriptedModel::fixed(Vec::new()), QueryMode::Idle, 0.5);
        assert!(core.set_query(QueryMode::Label("car".to_string())).await);
        core.close();

        assert!(!core.set_query(QueryMode::Label("cup".to_string())).await);
        assert_eq!(core.query().snapshot().mode, QueryMode::Label("car".to_string()));
    }

    fn frame_with(sequence_marker: u8) -> RgbImage {
        RgbImage::from_pixel(64, 48, Rgb([sequence_marker, 0, 0]))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_tick_and_locate_never_mix_frames() {
        // Every detection is stamped with the marker of the frame it was
        // computed on; the model is slow so frames change mid-inference.
        let model = ScriptedModel::with_script(
            Capabilities::FixedVocabulary(coco_subset()),
            |frame, _| {
                let marker = frame.image.get_pixel(0, 0).0[0];
                Ok(vec![
                    detection(&format!("frame-{}", marker), 0.9, 30., 30.),
                    detection(&format!("frame-{}", marker), 0.8, 40., 30.),
                ])
            },
        )
        .with_latency(Duration::from_millis(5));
        let core = core_with(model, QueryMode::Idle, 0.1);
        let mut frames = core.publisher().subscribe_frames();
        let mut records = core.publisher().subscribe_records();
        core.frames().push(frame_with(1)).unwrap();

        let producer = {
            let core = core.clone();
            tokio::spawn(async move {
                for marker in 2..=40u8 {
                    core.frames().push(frame_with(marker)).unwrap();
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };
        let ticker = {
            let core = core.clone();
            tokio::spawn(async move {
                for _ in 0..6 {
                    core.tick().await;
                }
            })
        };
        let locator = {
            let core = core.clone();
            tokio::spawn(async move {
                for _ in 0..6 {
                    core.locate(QueryMode::Idle).await;
                }
            })
        };

        producer.await.unwrap();
        ticker.await.unwrap();
        locator.await.unwrap();

        for _ in 0..12 {
            let frame = frames.recv().await.unwrap();
            let record = records.recv().await.unwrap();
            assert_eq!(frame.sequence, record.sequence);

            let labels: Vec<_> = record.record.targets().iter().map(|t| &t.label).collect();
            assert_eq!(labels.len(), 2);
            assert_eq!(labels[0], labels[1]);
            // Marker equals the sequence number for every pushed frame.
            assert_eq!(labels[0], &format!("frame-{}", record.sequence));
        }
    }
}
