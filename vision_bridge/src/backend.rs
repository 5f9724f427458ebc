use async_trait::async_trait;
use std::{collections::BTreeMap, fmt, path::Path};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("no inference backend is available in this build")]
    Unavailable,
    #[error("failed to load model: {0}")]
    LoadFailed(String),
    #[error("failed to read image: {0}")]
    InvalidImage(String),
    #[error("model output does not match the {task} task: {reason}")]
    UnexpectedOutput { task: InferenceTask, reason: String },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceTask {
    Detect,
    Segment,
    Classify,
    Keypoint,
}

impl InferenceTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            InferenceTask::Detect => "detect",
            InferenceTask::Segment => "segment",
            InferenceTask::Classify => "classify",
            InferenceTask::Keypoint => "keypoint",
        }
    }
}

impl fmt::Display for InferenceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request values forwarded to the backend once defaults are applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceParams {
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub image_size: u32,
    pub top_k: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawKeypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawClassScore {
    pub confidence: f32,
    pub class_id: i64,
}

/// Backend-native inference output.
///
/// Each field is a capability the model may or may not have: `masks` and
/// `keypoints` are indexed like `boxes`, `probabilities` replaces boxes for
/// classification models and is ranked by descending confidence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendOutput {
    pub boxes: Option<Vec<RawBox>>,
    pub masks: Option<Vec<Option<Vec<[f32; 2]>>>>,
    pub keypoints: Option<Vec<Vec<RawKeypoint>>>,
    pub probabilities: Option<Vec<RawClassScore>>,
}

pub trait ModelHandle: Send + Sync + 'static {
    fn names(&self) -> &BTreeMap<i64, String>;
}

#[async_trait]
pub trait InferenceBackend: Send + Sync + 'static {
    type Handle: ModelHandle;

    fn is_available(&self) -> bool;

    async fn load(&self, model_path: &Path) -> Result<Self::Handle, BackendError>;

    async fn infer(
        &self,
        handle: &Self::Handle,
        task: InferenceTask,
        image_path: &Path,
        params: &InferenceParams,
    ) -> Result<BackendOutput, BackendError>;
}

/// Stand-in used when the binary is built without an inference runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableBackend;

#[derive(Debug)]
pub struct NoModel {
    names: BTreeMap<i64, String>,
}

impl ModelHandle for NoModel {
    fn names(&self) -> &BTreeMap<i64, String> {
        &self.names
    }
}

#[async_trait]
impl InferenceBackend for UnavailableBackend {
    type Handle = NoModel;

    fn is_available(&self) -> bool {
        false
    }

    async fn load(&self, _model_path: &Path) -> Result<NoModel, BackendError> {
        Err(BackendError::Unavailable)
    }

    async fn infer(
        &self,
        _handle: &NoModel,
        _task: InferenceTask,
        _image_path: &Path,
        _params: &InferenceParams,
    ) -> Result<BackendOutput, BackendError> {
        Err(BackendError::Unavailable)
    }
}
