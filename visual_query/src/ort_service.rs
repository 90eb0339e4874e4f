use crate::{
    config::YoloConfig,
    detection::{BoundingBox, Detection},
    frame::Frame,
    model_service::{Capabilities, ModelError, ModelService},
    query::QuerySnapshot,
    vocabulary::Vocabulary,
};
use image::{imageops::FilterType, RgbImage};
use ndarray::{s, Array, ArrayD, Axis, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use tonic::async_trait;

const INPUT_SIZE: u32 = 640;
const NMS_IOU_THRESHOLD: f32 = 0.7;

fn frame_to_tensor(image: &RgbImage) -> Array<f32, Ix4> {
    let resized = image::imageops::resize(image, INPUT_SIZE, INPUT_SIZE, FilterType::CatmullRom);

    let mut input = Array::zeros((1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    input
}

/// Turns a `[1, 4 + classes, anchors]` YOLOv8 output into pixel-space
/// detections, highest confidence first, after greedy NMS.
fn decode_output(
    output: &ArrayD<f32>,
    vocabulary: &Vocabulary,
    candidate_probability: f32,
    img_width: u32,
    img_height: u32,
) -> Result<Vec<Detection>, ModelError> {
    if output.ndim() != 3 || output.shape()[1] <= 4 {
        return Err(ModelError::Inference(format!(
            "unexpected output shape {:?}",
            output.shape()
        )));
    }

    let output = output.t();
    let output = output.slice(s![.., .., 0]);
    let scale_x = img_width as f32 / INPUT_SIZE as f32;
    let scale_y = img_height as f32 / INPUT_SIZE as f32;

    let mut boxes = Vec::new();
    for row in output.axis_iter(Axis(0)) {
        let row: Vec<_> = row.iter().copied().collect();
        let Some((class_id, prob)) = row
            .iter()
            .skip(4)
            .copied()
            .enumerate()
            .reduce(|accum, item| if item.1 > accum.1 { item } else { accum })
        else {
            continue;
        };

        if prob < candidate_probability {
            continue;
        }

        let label = match vocabulary.label(class_id) {
            Some(entry) => entry.label.clone(),
            None => format!("Unknown class {}", class_id),
        };

        let xc = row[0] * scale_x;
        let yc = row[1] * scale_y;
        let w = row[2] * scale_x;
        let h = row[3] * scale_y;

        boxes.push(Detection {
            label,
            confidence: prob,
            bbox: BoundingBox {
                x1: xc - w / 2.,
                y1: yc - h / 2.,
                x2: xc + w / 2.,
                y2: yc + h / 2.,
            },
        });
    }

    boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));

    let mut result: Vec<Detection> = Vec::new();
    for candidate in boxes {
        if result
            .iter()
            .all(|kept| kept.bbox.iou(&candidate.bbox) < NMS_IOU_THRESHOLD)
        {
            result.push(candidate);
        }
    }

    Ok(result)
}

/// YOLOv8 detector over a fixed label vocabulary, running ONNX sessions
/// round-robin.
#[derive(Clone)]
pub struct OrtModelService {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    vocabulary: Arc<Vocabulary>,
    candidate_probability: f32,
}

impl OrtModelService {
    pub fn new(model_config: &YoloConfig) -> Result<Self, Box<dyn std::error::Error>> {
        model_config.validate()?;

        #[cfg(feature = "cuda")]
        ort::init()
            .with_execution_providers([
                ort::execution_providers::CUDAExecutionProvider::default().build()
            ])
            .commit()?;

        let vocabulary = Arc::new(Vocabulary::load(&model_config.get_labels_path())?);
        let num_instances = model_config.num_instances;
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_config.get_model_path())?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        tracing::info!(
            "Created {} ONNX sessions over {} labels",
            num_instances,
            vocabulary.len()
        );

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
            vocabulary,
            candidate_probability: model_config.candidate_probability,
        })
    }

    fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ArrayD<f32>, ModelError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| ModelError::Unavailable(format!("session mutex poisoned: {}", e)))?;

        tracing::debug!("Running inference on session {}", index);
        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| ModelError::MalformedFrame(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| ModelError::Inference(format!("inference failed: {}", e)))?;

        let (shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::Inference(format!("failed to extract tensor: {}", e)))?;

        ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| ModelError::Inference(format!("invalid tensor shape: {}", e)))
    }

    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, ModelError> {
        let input = frame_to_tensor(&frame.image);
        let output = self.run_inference(&input)?;
        decode_output(
            &output,
            &self.vocabulary,
            self.candidate_probability,
            frame.image.width(),
            frame.image.height(),
        )
    }
}

#[async_trait]
impl ModelService for OrtModelService {
    fn capabilities(&self) -> Capabilities {
        Capabilities::FixedVocabulary(self.vocabulary.clone())
    }

    async fn predict(
        &self,
        frame: Arc<Frame>,
        _query: &QuerySnapshot,
    ) -> Result<Vec<Detection>, ModelError> {
        let service = self.clone();
        tokio::task::spawn_blocking(move || service.detect(&frame))
            .await
            .map_err(|e| ModelError::Unavailable(format!("inference task failed: {}", e)))?
    }
}
