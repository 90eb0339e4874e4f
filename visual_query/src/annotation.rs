use crate::{
    detection::{best_match, Detection, DetectionRecord, Target},
    frame::Frame,
    query::{QueryMode, QuerySnapshot},
    vocabulary::Vocabulary,
};
use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};
use std::{path::Path, sync::Arc};

const CAPTION_COLOR: [u8; 3] = [0, 255, 0];
const TEXT_COLOR: [u8; 3] = [255, 255, 255];
const FONT_SIZE: f32 = 16.0;
const TEXT_HEIGHT: i32 = 20;
const CHAR_WIDTH: f32 = 8.0;
const DEFAULT_FONT: &[u8] = include_bytes!("../assets/font.ttf");

/// Everything one inference pass produced.
#[derive(Debug)]
pub struct PassResult {
    pub frame_sequence: u64,
    pub query: QuerySnapshot,
    pub detections: Vec<Detection>,
    pub record: DetectionRecord,
    pub annotated: RgbImage,
}

impl PassResult {
    pub fn best(&self) -> Option<Target> {
        best_match(&self.detections).map(Detection::to_target)
    }
}

/// Applies the query's filtering policy and draws the surviving detections.
pub struct Annotator {
    vocabulary: Option<Arc<Vocabulary>>,
    font: Option<FontArc>,
    thickness: u32,
}

impl Annotator {
    pub fn new(vocabulary: Option<Arc<Vocabulary>>, thickness: u32) -> Self {
        let font = FontArc::try_from_slice(DEFAULT_FONT)
            .inspect_err(|e| tracing::error!("Embedded font unusable, labels disabled: {}", e))
            .ok();
        Self {
            vocabulary,
            font,
            thickness: thickness.max(1),
        }
    }

    /// Replaces the embedded font.
    pub fn with_font_file(mut self, path: &Path) -> std::io::Result<Self> {
        let data = std::fs::read(path)?;
        let font = FontArc::try_from_vec(data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.font = Some(font);
        Ok(self)
    }

    /// Keeps detections at or above the confidence floor and, in label mode,
    /// only the queried label. In caption mode an empty phrase takes the
    /// caption as its label.
    pub fn filter(&self, detections: Vec<Detection>, query: &QuerySnapshot) -> Vec<Detection> {
        detections
            .into_iter()
            .filter(|d| d.confidence >= query.min_confidence)
            .filter(|d| match &query.mode {
                QueryMode::Label(label) => &d.label == label,
                QueryMode::Caption(_) | QueryMode::Idle => true,
            })
            .map(|mut d| {
                if let QueryMode::Caption(caption) = &query.mode {
                    if d.label.is_empty() {
                        d.label = caption.clone();
                    }
                }
                d
            })
            .collect()
    }

    pub fn build(
        &self,
        frame: &Frame,
        detections: Vec<Detection>,
        query: QuerySnapshot,
    ) -> PassResult {
        let detections = self.filter(detections, &query);
        let mut annotated = frame.image.clone();
        self.annotate(&mut annotated, &detections);

        PassResult {
            frame_sequence: frame.sequence,
            record: DetectionRecord::from_detections(&detections),
            query,
            detections,
            annotated,
        }
    }

    fn color_of(&self, label: &str) -> [u8; 3] {
        self.vocabulary
            .as_ref()
            .and_then(|vocabulary| vocabulary.color_of(label))
            .unwrap_or(CAPTION_COLOR)
    }

    pub fn annotate(&self, image: &mut RgbImage, detections: &[Detection]) {
        let (w, h) = (image.width() as i32, image.height() as i32);

        for detection in detections {
            let x1 = (detection.bbox.x1.floor() as i32).clamp(0, w - 1);
            let y1 = (detection.bbox.y1.floor() as i32).clamp(0, h - 1);
            let x2 = (detection.bbox.x2.ceil() as i32).clamp(0, w - 1);
            let y2 = (detection.bbox.y2.ceil() as i32).clamp(0, h - 1);
            if x1 >= x2 || y1 >= y2 {
                continue;
            }

            let color = Rgb(self.color_of(&detection.label));
            for t in 0..self.thickness as i32 {
                let width = x2 - x1 - 2 * t;
                let height = y2 - y1 - 2 * t;
                if width <= 0 || height <= 0 {
                    break;
                }
                let rect = Rect::at(x1 + t, y1 + t).of_size(width as u32, height as u32);
                draw_hollow_rect_mut(image, rect, color);
            }

            if let Some(font) = &self.font {
                let label = format!(
                    "{} {:.1}%",
                    detection.label,
                    detection.confidence * 100.
                );
                let text_width = ((label.chars().count() as f32 * CHAR_WIDTH) as i32)
                    .min(w - x1)
                    .max(1);
                let label_y = if y1 - TEXT_HEIGHT >= 0 {
                    y1 - TEXT_HEIGHT
                } else {
                    y1
                };
                let background =
                    Rect::at(x1, label_y).of_size(text_width as u32, TEXT_HEIGHT as u32);
                draw_filled_rect_mut(image, background, color);
                draw_text_mut(
                    image,
                    Rgb(TEXT_COLOR),
                    x1,
                    label_y + 2,
                    PxScale::from(FONT_SIZE),
                    font,
                    &label,
                );
            }
        }
    }
}
