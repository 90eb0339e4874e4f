use serde::{Deserialize, Serialize};

/// Axis-aligned box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2., (self.y1 + self.y2) / 2.)
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.) * (self.y2 - self.y1).max(0.)
    }

    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        let w = self.x2.min(other.x2) - self.x1.max(other.x1);
        let h = self.y2.min(other.y2) - self.y1.max(other.y1);
        w.max(0.) * h.max(0.)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let union = self.area() + other.area() - self.intersection(other);
        if union <= 0. {
            return 0.;
        }
        self.intersection(other) / union
    }
}

/// One model-reported object instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn to_target(&self) -> Target {
        let (x, y) = self.bbox.center();
        Target {
            label: self.label.clone(),
            confidence: self.confidence,
            x,
            y,
        }
    }
}

/// Highest-confidence detection; ties go to the earliest one.
pub fn best_match(detections: &[Detection]) -> Option<&Detection> {
    detections.iter().fold(None, |best: Option<&Detection>, d| match best {
        Some(b) if d.confidence <= b.confidence => Some(b),
        _ => Some(d),
    })
}

/// Entry of the outbound detection record: label, confidence and box centre.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(String, f32, f32, f32)", into = "(String, f32, f32, f32)")]
pub struct Target {
    pub label: String,
    pub confidence: f32,
    pub x: f32,
    pub y: f32,
}

impl From<(String, f32, f32, f32)> for Target {
    fn from((label, confidence, x, y): (String, f32, f32, f32)) -> Self {
        Self {
            label,
            confidence,
            x,
            y,
        }
    }
}

impl From<Target> for (String, f32, f32, f32) {
    fn from(target: Target) -> Self {
        (target.label, target.confidence, target.x, target.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
enum Sentinel {
    #[serde(rename = "nothing")]
    Nothing,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireRecord {
    Sentinel(Sentinel),
    Targets(Vec<Target>),
}

/// Structured result of one pass: targets in model order, or the explicit
/// "nothing" marker when the pass found nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireRecord", into = "WireRecord")]
pub enum DetectionRecord {
    Nothing,
    Targets(Vec<Target>),
}

impl DetectionRecord {
    pub fn from_detections(detections: &[Detection]) -> Self {
        if detections.is_empty() {
            return DetectionRecord::Nothing;
        }
        DetectionRecord::Targets(detections.iter().map(Detection::to_target).collect())
    }

    pub fn targets(&self) -> &[Target] {
        match self {
            DetectionRecord::Nothing => &[],
            DetectionRecord::Targets(targets) => targets,
        }
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, DetectionRecord::Nothing)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

impl From<WireRecord> for DetectionRecord {
    fn from(wire: WireRecord) -> Self {
        match wire {
            WireRecord::Sentinel(Sentinel::Nothing) => DetectionRecord::Nothing,
            WireRecord::Targets(targets) if targets.is_empty() => DetectionRecord::Nothing,
            WireRecord::Targets(targets) => DetectionRecord::Targets(targets),
        }
    }
}

impl From<DetectionRecord> for WireRecord {
    fn from(record: DetectionRecord) -> Self {
        match record {
            DetectionRecord::Nothing => WireRecord::Sentinel(Sentinel::Nothing),
            DetectionRecord::Targets(targets) if targets.is_empty() => {
                WireRecord::Sentinel(Sentinel::Nothing)
            }
            DetectionRecord::Targets(targets) => WireRecord::Targets(targets),
        }
    }
}
