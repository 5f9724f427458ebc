use serde::Serialize;

/// Axis-aligned box in top-left + size form, shared by every box-based task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
    pub confidence: f64,
    pub class_id: i64,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentedInstance {
    #[serde(flatten)]
    pub detection: Detection,
    pub mask_polygon: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Keypoint {
    pub id: usize,
    pub x: f64,
    pub y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeypointDetection {
    #[serde(flatten)]
    pub detection: Detection,
    pub keypoints: Vec<Keypoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationEntry {
    pub rank: usize,
    pub confidence: f64,
    pub class_id: i64,
    pub label: String,
}

/// Command-specific payload of a successful response.
///
/// Box-based tasks all serialize as `{detections, count}`; classification adds
/// an always-empty `detections` so callers probing that field see one schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseData {
    Ready {
        has_backend: bool,
    },
    ModelLoaded {
        num_classes: usize,
        class_names: Vec<String>,
    },
    Detections {
        detections: Vec<Detection>,
        count: usize,
    },
    Segments {
        detections: Vec<SegmentedInstance>,
        count: usize,
    },
    Keypoints {
        detections: Vec<KeypointDetection>,
        count: usize,
    },
    Classifications {
        classifications: Vec<ClassificationEntry>,
        top_prediction: Option<ClassificationEntry>,
        detections: Vec<Detection>,
    },
}

impl ResponseData {
    pub fn detections(detections: Vec<Detection>) -> Self {
        let count = detections.len();
        Self::Detections { detections, count }
    }

    pub fn segments(detections: Vec<SegmentedInstance>) -> Self {
        let count = detections.len();
        Self::Segments { detections, count }
    }

    pub fn keypoints(detections: Vec<KeypointDetection>) -> Self {
        let count = detections.len();
        Self::Keypoints { detections, count }
    }

    pub fn classifications(classifications: Vec<ClassificationEntry>) -> Self {
        let top_prediction = classifications.first().cloned();
        Self::Classifications {
            classifications,
            top_prediction,
            detections: Vec::new(),
        }
    }

    /// Number of box-based results, `None` for payloads without boxes.
    pub fn count(&self) -> Option<usize> {
        match self {
            Self::Detections { count, .. }
            | Self::Segments { count, .. }
            | Self::Keypoints { count, .. } => Some(*count),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, data: ResponseData) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
