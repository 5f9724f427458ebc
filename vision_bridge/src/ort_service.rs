//! ONNX Runtime adapter for YOLO models exported by Ultralytics.
//!
//! The exporter stores `names`, `task` and `kpt_shape` as custom metadata;
//! they drive label lookup and output decoding. Prediction tensors are laid
//! out `[1, 4 + classes + extra, candidates]`, with boxes in centre form in
//! model-input pixels.

use crate::{
    backend::{
        BackendError, BackendOutput, InferenceBackend, InferenceParams, InferenceTask,
        ModelHandle, RawBox, RawClassScore, RawKeypoint,
    },
    config::BackendSettings,
};
use async_trait::async_trait;
use image::{imageops::FilterType, DynamicImage, GenericImageView, GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use ndarray::{s, Array, Array2, ArrayD, ArrayView2, Axis, Ix2, Ix4};
use ort::{
    execution_providers::ExecutionProviderDispatch,
    session::{builder::GraphOptimizationLevel, Session},
    value::{TensorRef, ValueType},
};
use std::{collections::BTreeMap, path::Path, sync::Mutex};

const DEFAULT_KPT_SHAPE: (usize, usize) = (17, 3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Detect,
    Segment,
    Pose { keypoints: usize, dims: usize },
    Classify,
}

pub struct OrtModel {
    session: Mutex<Session>,
    output_names: Vec<String>,
    names: BTreeMap<i64, String>,
    layout: Layout,
    input_dims: Option<(u32, u32)>,
}

impl ModelHandle for OrtModel {
    fn names(&self) -> &BTreeMap<i64, String> {
        &self.names
    }
}

/// Input size the model ran at and the source image size, used to map
/// model-space coordinates back onto the image.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Frame {
    input_width: u32,
    input_height: u32,
    image_width: u32,
    image_height: u32,
}

impl Frame {
    fn scale_x(&self) -> f32 {
        self.image_width as f32 / self.input_width as f32
    }

    fn scale_y(&self) -> f32 {
        self.image_height as f32 / self.input_height as f32
    }

    fn to_image_box(&self, bbox: &RawBox) -> RawBox {
        let max_x = self.image_width as f32;
        let max_y = self.image_height as f32;
        RawBox {
            x1: (bbox.x1 * self.scale_x()).clamp(0., max_x),
            y1: (bbox.y1 * self.scale_y()).clamp(0., max_y),
            x2: (bbox.x2 * self.scale_x()).clamp(0., max_x),
            y2: (bbox.y2 * self.scale_y()).clamp(0., max_y),
            ..*bbox
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    bbox: RawBox,
    column: usize,
}

fn intersection(box1: &RawBox, box2: &RawBox) -> f32 {
    let width = (box1.x2.min(box2.x2) - box1.x1.max(box2.x1)).max(0.);
    let height = (box1.y2.min(box2.y2) - box1.y1.max(box2.y1)).max(0.);
    width * height
}

fn union(box1: &RawBox, box2: &RawBox) -> f32 {
    ((box1.x2 - box1.x1) * (box1.y2 - box1.y1)) + ((box2.x2 - box2.x1) * (box2.y2 - box2.y1))
        - intersection(box1, box2)
}

fn iou(box1: &RawBox, box2: &RawBox) -> f32 {
    let union = union(box1, box2);
    if union <= 0. {
        return 0.;
    }
    intersection(box1, box2) / union
}

/// Greedy per-class suppression, highest confidence first.
fn non_max_suppression(
    mut candidates: Vec<Candidate>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.bbox.confidence.total_cmp(&a.bbox.confidence));

    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if kept.len() >= max_detections {
            break;
        }
        let suppressed = kept.iter().any(|other| {
            other.bbox.class_id == candidate.bbox.class_id
                && iou(&other.bbox, &candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

/// Best-class candidates above `conf_threshold`, in model-input coordinates.
fn candidates(
    predictions: ArrayView2<f32>,
    num_classes: usize,
    conf_threshold: f32,
) -> Vec<Candidate> {
    let mut found = Vec::new();

    for (column, values) in predictions.axis_iter(Axis(1)).enumerate() {
        let best = values
            .iter()
            .skip(4)
            .take(num_classes)
            .enumerate()
            .map(|(index, value)| (index, *value))
            .reduce(|accum, item| if item.1 > accum.1 { item } else { accum });
        let Some((class_id, confidence)) = best else {
            continue;
        };
        if confidence < conf_threshold {
            continue;
        }

        let (xc, yc, w, h) = (values[0], values[1], values[2], values[3]);
        found.push(Candidate {
            bbox: RawBox {
                x1: xc - w / 2.,
                y1: yc - h / 2.,
                x2: xc + w / 2.,
                y2: yc + h / 2.,
                confidence,
                class_id: class_id as i64,
            },
            column,
        });
    }

    found
}

fn sigmoid(value: f32) -> f32 {
    1. / (1. + (-value).exp())
}

/// Largest outer contour of a binary mask, in mask pixel coordinates.
fn mask_to_polygon(mask: &GrayImage) -> Option<Vec<[f32; 2]>> {
    find_contours::<i32>(mask)
        .into_iter()
        .filter(|contour| matches!(contour.border_type, BorderType::Outer))
        .max_by_key(|contour| contour.points.len())
        .map(|contour| {
            contour
                .points
                .iter()
                .map(|point| [point.x as f32, point.y as f32])
                .collect()
        })
}

/// Parses the exporter's `names` metadata, a Python dict literal such as
/// `{0: 'person', 1: "people's"}`.
fn parse_names(raw: &str) -> BTreeMap<i64, String> {
    let mut names = BTreeMap::new();
    let mut chars = raw.trim().trim_start_matches('{').chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let id: String = chars.by_ref().take_while(|c| *c != ':').collect();
        let Ok(id) = id.trim().parse::<i64>() else {
            break;
        };
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        let Some(quote) = chars.next().filter(|c| *c == '\'' || *c == '"') else {
            break;
        };

        let mut name = String::new();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        name.push(escaped);
                    }
                }
                c if c == quote => break,
                c => name.push(c),
            }
        }
        names.insert(id, name);
    }

    names
}

/// Parses `kpt_shape` metadata such as `[17, 3]`.
fn parse_kpt_shape(raw: &str) -> Option<(usize, usize)> {
    let inner = raw.trim().strip_prefix('[')?.strip_suffix(']')?;
    let mut parts = inner.split(',').map(|part| part.trim().parse::<usize>());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(keypoints)), Some(Ok(dims)), None) if dims == 2 || dims == 3 => {
            Some((keypoints, dims))
        }
        _ => None,
    }
}

/// Picks the output layout from the exporter's `task` metadata, falling back
/// to the output ranks when the metadata is missing.
fn detect_layout(
    task: Option<&str>,
    kpt_shape: Option<(usize, usize)>,
    output_ranks: &[usize],
) -> Layout {
    let pose = |shape: Option<(usize, usize)>| {
        let (keypoints, dims) = shape.unwrap_or(DEFAULT_KPT_SHAPE);
        Layout::Pose { keypoints, dims }
    };

    match task {
        Some("detect") => Layout::Detect,
        Some("segment") => Layout::Segment,
        Some("classify") => Layout::Classify,
        Some("pose") => pose(kpt_shape),
        _ => match output_ranks {
            [2, ..] => Layout::Classify,
            [_, 4, ..] => Layout::Segment,
            _ if kpt_shape.is_some() => pose(kpt_shape),
            _ => Layout::Detect,
        },
    }
}

fn value_shape(value_type: &ValueType) -> Option<Vec<i64>> {
    match value_type {
        ValueType::Tensor { shape, .. } => Some(shape.iter().copied().collect()),
        _ => None,
    }
}

fn load_image(path: &Path) -> Result<DynamicImage, BackendError> {
    image::ImageReader::open(path)
        .map_err(|e| BackendError::InvalidImage(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| BackendError::InvalidImage(e.to_string()))?
        .decode()
        .map_err(|e| BackendError::InvalidImage(e.to_string()))
}

fn transform_image(image: &DynamicImage, width: u32, height: u32) -> Array<f32, Ix4> {
    let img = image.resize_exact(width, height, FilterType::CatmullRom);

    let mut input = Array::zeros((1, 3, height as usize, width as usize));
    for pixel in img.pixels() {
        let x = pixel.0 as usize;
        let y = pixel.1 as usize;
        let [r, g, b, _] = pixel.2 .0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    input
}

fn unexpected(task: InferenceTask, reason: impl Into<String>) -> BackendError {
    BackendError::UnexpectedOutput {
        task,
        reason: reason.into(),
    }
}

/// `[1, C, N]` prediction tensor as a `[C, N]` view.
fn prediction_view(
    output: &ArrayD<f32>,
    task: InferenceTask,
) -> Result<ArrayView2<f32>, BackendError> {
    if output.ndim() != 3 || output.shape()[0] != 1 {
        return Err(unexpected(
            task,
            format!("expected a [1, C, N] prediction tensor, got {:?}", output.shape()),
        ));
    }
    output
        .index_axis(Axis(0), 0)
        .into_dimensionality::<Ix2>()
        .map_err(|e| unexpected(task, e.to_string()))
}

/// Number of class channels once the extra per-candidate channels are removed.
fn class_channels(
    channels: usize,
    extra: usize,
    task: InferenceTask,
) -> Result<usize, BackendError> {
    match channels.checked_sub(4 + extra) {
        Some(classes) if classes > 0 => Ok(classes),
        _ => Err(unexpected(
            task,
            format!("{} channels leave no room for class scores", channels),
        )),
    }
}

fn top_k(probabilities: &[f32], k: usize) -> Vec<RawClassScore> {
    let mut scores: Vec<RawClassScore> = probabilities
        .iter()
        .enumerate()
        .map(|(class_id, confidence)| RawClassScore {
            confidence: *confidence,
            class_id: class_id as i64,
        })
        .collect();
    scores.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    scores.truncate(k);
    scores
}

fn keypoints_for(
    predictions: ArrayView2<f32>,
    candidate: &Candidate,
    offset: usize,
    keypoints: usize,
    dims: usize,
    frame: &Frame,
) -> Vec<RawKeypoint> {
    let values = predictions.column(candidate.column);
    (0..keypoints)
        .map(|index| {
            let base = offset + index * dims;
            RawKeypoint {
                x: values[base] * frame.scale_x(),
                y: values[base + 1] * frame.scale_y(),
                confidence: (dims == 3).then(|| values[base + 2]),
            }
        })
        .collect()
}

struct MaskDecoder {
    /// `[nm, mh * mw]` prototype matrix.
    protos: Array2<f32>,
    mask_width: usize,
    mask_height: usize,
    threshold: f32,
}

impl MaskDecoder {
    fn new(
        output: &ArrayD<f32>,
        threshold: f32,
        task: InferenceTask,
    ) -> Result<Self, BackendError> {
        if output.ndim() != 4 || output.shape()[0] != 1 {
            return Err(unexpected(
                task,
                format!("expected [1, nm, mh, mw] mask prototypes, got {:?}", output.shape()),
            ));
        }
        let (nm, mask_height, mask_width) =
            (output.shape()[1], output.shape()[2], output.shape()[3]);
        let protos = output
            .index_axis(Axis(0), 0)
            .to_owned()
            .into_shape_with_order((nm, mask_height * mask_width))
            .map_err(|e| unexpected(task, e.to_string()))?;

        Ok(Self {
            protos,
            mask_width,
            mask_height,
            threshold,
        })
    }

    fn coefficients(&self) -> usize {
        self.protos.nrows()
    }

    /// Polygon of one instance in source-image coordinates.
    fn polygon(
        &self,
        predictions: ArrayView2<f32>,
        candidate: &Candidate,
        offset: usize,
        frame: &Frame,
    ) -> Option<Vec<[f32; 2]>> {
        let nm = self.coefficients();
        let column = predictions.column(candidate.column);
        let coefficients = column.slice(s![offset..offset + nm]);
        let logits = coefficients.dot(&self.protos);

        let to_mask_x = self.mask_width as f32 / frame.input_width as f32;
        let to_mask_y = self.mask_height as f32 / frame.input_height as f32;
        let (x1, y1) = (candidate.bbox.x1 * to_mask_x, candidate.bbox.y1 * to_mask_y);
        let (x2, y2) = (candidate.bbox.x2 * to_mask_x, candidate.bbox.y2 * to_mask_y);

        let mask = GrayImage::from_fn(self.mask_width as u32, self.mask_height as u32, |x, y| {
            let (fx, fy) = (x as f32 + 0.5, y as f32 + 0.5);
            let inside = fx >= x1 && fx < x2 && fy >= y1 && fy < y2;
            let index = y as usize * self.mask_width + x as usize;
            if inside && sigmoid(logits[index]) > self.threshold {
                Luma([255u8])
            } else {
                Luma([0u8])
            }
        });

        let to_image_x = frame.image_width as f32 / self.mask_width as f32;
        let to_image_y = frame.image_height as f32 / self.mask_height as f32;
        mask_to_polygon(&mask).map(|points| {
            points
                .into_iter()
                .map(|[x, y]| [x * to_image_x, y * to_image_y])
                .collect()
        })
    }
}

pub struct OrtBackend {
    settings: BackendSettings,
    available: bool,
}

impl OrtBackend {
    pub fn new(settings: &BackendSettings) -> Self {
        let available = match init_environment() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("failed to initialise ONNX Runtime: {}", e);
                false
            }
        };

        Self {
            settings: settings.clone(),
            available,
        }
    }

    fn optimization_level(&self) -> GraphOptimizationLevel {
        match self.settings.optimization_level {
            0 => GraphOptimizationLevel::Disable,
            1 => GraphOptimizationLevel::Level1,
            2 => GraphOptimizationLevel::Level2,
            _ => GraphOptimizationLevel::Level3,
        }
    }

    fn build_session(&self, model_path: &Path) -> ort::Result<Session> {
        let mut builder = Session::builder()?.with_optimization_level(self.optimization_level())?;
        if let Some(threads) = self.settings.intra_threads {
            builder = builder.with_intra_threads(threads)?;
        }
        builder.commit_from_file(model_path)
    }

    fn run_inference(
        &self,
        model: &OrtModel,
        input: &Array<f32, Ix4>,
    ) -> Result<Vec<ArrayD<f32>>, BackendError> {
        let mut session = model.session.lock().map_err(|e| {
            BackendError::InferenceFailed(format!("session mutex poisoned: {}", e))
        })?;

        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| BackendError::InferenceFailed(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| BackendError::InferenceFailed(e.to_string()))?;

        let mut arrays = Vec::with_capacity(model.output_names.len());
        for name in &model.output_names {
            let (shape, data) = outputs[name.as_str()]
                .try_extract_tensor::<f32>()
                .map_err(|e| {
                    BackendError::InferenceFailed(format!("failed to extract tensor: {}", e))
                })?;
            let array = ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec()).map_err(|e| {
                BackendError::InferenceFailed(format!("invalid tensor shape: {}", e))
            })?;
            arrays.push(array);
        }

        Ok(arrays)
    }

    fn decode(
        &self,
        model: &OrtModel,
        task: InferenceTask,
        outputs: &[ArrayD<f32>],
        frame: &Frame,
        params: &InferenceParams,
    ) -> Result<BackendOutput, BackendError> {
        let first = outputs
            .first()
            .ok_or_else(|| unexpected(task, "model produced no outputs"))?;

        if model.layout == Layout::Classify {
            if first.ndim() != 2 || first.shape()[0] != 1 {
                return Err(unexpected(
                    task,
                    format!("expected [1, classes] probabilities, got {:?}", first.shape()),
                ));
            }
            let probabilities: Vec<f32> = first.iter().copied().collect();
            return Ok(BackendOutput {
                probabilities: Some(top_k(&probabilities, params.top_k)),
                ..Default::default()
            });
        }

        let predictions = prediction_view(first, task)?;
        let channels = predictions.nrows();

        let masks = match model.layout {
            Layout::Segment => {
                let protos = outputs
                    .get(1)
                    .ok_or_else(|| unexpected(task, "segmentation model without mask prototypes"))?;
                Some(MaskDecoder::new(protos, self.settings.mask_threshold, task)?)
            }
            _ => None,
        };
        let extra = match model.layout {
            Layout::Pose { keypoints, dims } => keypoints * dims,
            _ => masks.as_ref().map(MaskDecoder::coefficients).unwrap_or(0),
        };
        let num_classes = class_channels(channels, extra, task)?;

        let kept = non_max_suppression(
            candidates(predictions, num_classes, params.conf_threshold),
            params.iou_threshold,
            self.settings.max_detections,
        );
        let offset = 4 + num_classes;

        let mut output = BackendOutput {
            boxes: Some(kept.iter().map(|c| frame.to_image_box(&c.bbox)).collect()),
            ..Default::default()
        };

        match (model.layout, &masks) {
            (Layout::Segment, Some(decoder)) if task == InferenceTask::Segment => {
                output.masks = Some(
                    kept.iter()
                        .map(|candidate| decoder.polygon(predictions, candidate, offset, frame))
                        .collect(),
                );
            }
            (Layout::Pose { keypoints, dims }, _) => {
                output.keypoints = Some(
                    kept.iter()
                        .map(|candidate| {
                            keypoints_for(predictions, candidate, offset, keypoints, dims, frame)
                        })
                        .collect(),
                );
            }
            _ => {}
        }

        Ok(output)
    }
}

fn init_environment() -> ort::Result<()> {
    #[allow(unused_mut)]
    let mut providers: Vec<ExecutionProviderDispatch> = Vec::new();
    #[cfg(feature = "tensorrt")]
    providers.push(
        ort::execution_providers::TensorRTExecutionProvider::default()
            .with_engine_cache(true)
            .build(),
    );
    #[cfg(feature = "cuda")]
    providers.push(ort::execution_providers::CUDAExecutionProvider::default().build());

    ort::init().with_execution_providers(providers).commit()?;
    Ok(())
}

#[async_trait]
impl InferenceBackend for OrtBackend {
    type Handle = OrtModel;

    fn is_available(&self) -> bool {
        self.available
    }

    async fn load(&self, model_path: &Path) -> Result<OrtModel, BackendError> {
        if !self.available {
            return Err(BackendError::Unavailable);
        }

        let session = self
            .build_session(model_path)
            .map_err(|e| BackendError::LoadFailed(e.to_string()))?;

        let (names, task, kpt_shape) = match session.metadata() {
            Ok(metadata) => {
                let custom = |key: &str| metadata.custom(key).ok().flatten();
                (
                    custom("names").map(|raw| parse_names(&raw)).unwrap_or_default(),
                    custom("task"),
                    custom("kpt_shape").and_then(|raw| parse_kpt_shape(&raw)),
                )
            }
            Err(e) => {
                tracing::debug!("model has no readable metadata: {}", e);
                (BTreeMap::new(), None, None)
            }
        };

        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        let output_ranks: Vec<usize> = session
            .outputs
            .iter()
            .filter_map(|o| value_shape(&o.output_type))
            .map(|shape| shape.len())
            .collect();
        let layout = detect_layout(task.as_deref(), kpt_shape, &output_ranks);

        let input_dims = session
            .inputs
            .first()
            .and_then(|input| value_shape(&input.input_type))
            .and_then(|shape| match shape.as_slice() {
                [_, _, h, w] if *h > 0 && *w > 0 => Some((*w as u32, *h as u32)),
                _ => None,
            });

        tracing::info!(
            model = %model_path.display(),
            ?layout,
            ?input_dims,
            num_names = names.len(),
            "created ONNX session"
        );

        Ok(OrtModel {
            session: Mutex::new(session),
            output_names,
            names,
            layout,
            input_dims,
        })
    }

    async fn infer(
        &self,
        model: &OrtModel,
        task: InferenceTask,
        image_path: &Path,
        params: &InferenceParams,
    ) -> Result<BackendOutput, BackendError> {
        let image = load_image(image_path)?;
        let (image_width, image_height) = image.dimensions();
        let (input_width, input_height) = match model.input_dims {
            Some(dims) => {
                if dims != (params.image_size, params.image_size) {
                    tracing::debug!(
                        ?dims,
                        requested = params.image_size,
                        "model input size is fixed"
                    );
                }
                dims
            }
            None => (params.image_size, params.image_size),
        };

        let frame = Frame {
            input_width,
            input_height,
            image_width,
            image_height,
        };
        let input = transform_image(&image, input_width, input_height);
        let outputs = self.run_inference(model, &input)?;

        self.decode(model, task, &outputs, &frame, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use ndarray::Array3;

    fn candidate(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32, class_id: i64) -> Candidate {
        Candidate {
            bbox: RawBox {
                x1,
                y1,
                x2,
                y2,
                confidence,
                class_id,
            },
            column: 0,
        }
    }

    #[test]
    fn test_transform_image() {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(100, 50, Rgb([255, 0, 0]));
        let input = transform_image(&DynamicImage::ImageRgb8(img), 64, 32);

        assert_eq!(input.shape(), &[1, 3, 32, 64]);
        assert!((input[[0, 0, 10, 10]] - 1.0).abs() < 0.01);
        assert!(input[[0, 1, 10, 10]].abs() < 0.01);
    }

    #[test]
    fn test_iou_of_disjoint_boxes_is_zero() {
        let a = candidate(0., 0., 10., 10., 0.9, 0).bbox;
        let b = candidate(20., 20., 30., 30., 0.9, 0).bbox;
        let c = candidate(5., 0., 15., 10., 0.9, 0).bbox;

        assert_eq!(iou(&a, &b), 0.);
        assert!((iou(&a, &c) - 50. / 150.).abs() < 1e-6);
    }

    #[test]
    fn test_nms_is_per_class() {
        let kept = non_max_suppression(
            vec![
                candidate(0., 0., 10., 10., 0.8, 0),
                candidate(1., 1., 11., 11., 0.9, 0),
                candidate(1., 1., 11., 11., 0.7, 1),
                candidate(50., 50., 60., 60., 0.6, 0),
            ],
            0.45,
            300,
        );

        let confidences: Vec<f32> = kept.iter().map(|c| c.bbox.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7, 0.6]);
    }

    #[test]
    fn test_nms_respects_max_detections() {
        let boxes = (0..5)
            .map(|i| candidate(i as f32 * 20., 0., i as f32 * 20. + 10., 10., 0.5, 0))
            .collect();
        assert_eq!(non_max_suppression(boxes, 0.45, 2).len(), 2);
    }

    #[test]
    fn test_candidates_pick_best_class_and_filter() {
        // Channels: xc, yc, w, h, class 0, class 1. Three candidates.
        let predictions = Array2::from_shape_vec(
            (6, 3),
            vec![
                50., 10., 0., //
                50., 10., 0., //
                20., 4., 2., //
                40., 4., 2., //
                0.1, 0.2, 0.05, //
                0.8, 0.1, 0.1, //
            ],
        )
        .unwrap();

        let found = candidates(predictions.view(), 2, 0.25);

        assert_eq!(found.len(), 1);
        let bbox = found[0].bbox;
        assert_eq!(found[0].column, 0);
        assert_eq!(bbox.class_id, 1);
        assert_eq!((bbox.x1, bbox.y1, bbox.x2, bbox.y2), (40., 30., 60., 70.));
    }

    #[test]
    fn test_frame_scales_and_clamps_boxes() {
        let frame = Frame {
            input_width: 100,
            input_height: 100,
            image_width: 200,
            image_height: 50,
        };
        let scaled = frame.to_image_box(&candidate(-5., 10., 50., 120., 0.5, 3).bbox);

        assert_eq!((scaled.x1, scaled.y1, scaled.x2, scaled.y2), (0., 5., 100., 50.));
        assert_eq!(scaled.class_id, 3);
    }

    #[test]
    fn test_parse_names() {
        let names = parse_names(r#"{0: 'person', 1: "people's", 2: 'traffic light'}"#);

        assert_eq!(names.len(), 3);
        assert_eq!(names[&0], "person");
        assert_eq!(names[&1], "people's");
        assert_eq!(names[&2], "traffic light");
        assert!(parse_names("not a dict").is_empty());
        assert!(parse_names("{}").is_empty());
    }

    #[test]
    fn test_parse_kpt_shape() {
        assert_eq!(parse_kpt_shape("[17, 3]"), Some((17, 3)));
        assert_eq!(parse_kpt_shape("[5,2]"), Some((5, 2)));
        assert_eq!(parse_kpt_shape("[17, 4]"), None);
        assert_eq!(parse_kpt_shape("17, 3"), None);
    }

    #[test]
    fn test_detect_layout() {
        assert_eq!(detect_layout(Some("segment"), None, &[3]), Layout::Segment);
        assert_eq!(
            detect_layout(Some("pose"), None, &[3]),
            Layout::Pose {
                keypoints: 17,
                dims: 3
            }
        );
        assert_eq!(detect_layout(None, None, &[2]), Layout::Classify);
        assert_eq!(detect_layout(None, None, &[3, 4]), Layout::Segment);
        assert_eq!(
            detect_layout(None, Some((5, 2)), &[3]),
            Layout::Pose {
                keypoints: 5,
                dims: 2
            }
        );
        assert_eq!(detect_layout(None, None, &[3]), Layout::Detect);
    }

    #[test]
    fn test_class_channels() {
        assert_eq!(class_channels(84, 0, InferenceTask::Detect).unwrap(), 80);
        assert_eq!(class_channels(56, 51, InferenceTask::Keypoint).unwrap(), 1);
        assert!(class_channels(36, 32, InferenceTask::Segment).is_err());
    }

    #[test]
    fn test_prediction_view_rejects_wrong_rank() {
        let output = ArrayD::<f32>::zeros(vec![1, 1000]);
        assert!(prediction_view(&output, InferenceTask::Detect).is_err());

        let output = Array3::<f32>::zeros((1, 84, 10)).into_dyn();
        assert_eq!(
            prediction_view(&output, InferenceTask::Detect).unwrap().shape(),
            &[84, 10]
        );
    }

    #[test]
    fn test_top_k() {
        let scores = top_k(&[0.1, 0.5, 0.3, 0.1], 2);

        assert_eq!(scores.len(), 2);
        assert_eq!((scores[0].class_id, scores[1].class_id), (1, 2));
    }

    #[test]
    fn test_keypoints_scaled_with_optional_confidence() {
        // xc, yc, w, h, class, then two keypoints of (x, y, conf).
        let predictions =
            Array2::from_shape_vec((11, 1), vec![5., 5., 4., 4., 0.9, 2., 4., 0.8, 6., 8., 0.3])
                .unwrap();
        let frame = Frame {
            input_width: 10,
            input_height: 10,
            image_width: 20,
            image_height: 40,
        };
        let found = candidates(predictions.view(), 1, 0.25);

        let with_conf = keypoints_for(predictions.view(), &found[0], 5, 2, 3, &frame);
        assert_eq!(with_conf.len(), 2);
        assert_eq!((with_conf[0].x, with_conf[0].y), (4., 16.));
        assert_eq!(with_conf[1].confidence, Some(0.3));

        let without_conf = keypoints_for(predictions.view(), &found[0], 5, 3, 2, &frame);
        assert_eq!(without_conf.len(), 3);
        assert!(without_conf.iter().all(|kp| kp.confidence.is_none()));
    }

    #[test]
    fn test_mask_to_polygon() {
        let mut mask = GrayImage::new(20, 20);
        for y in 5..12 {
            for x in 4..15 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }

        let polygon = mask_to_polygon(&mask).unwrap();
        assert!(polygon.len() >= 4);
        assert!(polygon
            .iter()
            .all(|[x, y]| (4. ..=14.).contains(x) && (5. ..=11.).contains(y)));

        assert!(mask_to_polygon(&GrayImage::new(8, 8)).is_none());
    }

    #[test]
    fn test_mask_decoder_crops_to_box() {
        // One coefficient, a 4x4 prototype that is strongly positive everywhere.
        let protos = ArrayD::from_elem(vec![1, 1, 4, 4], 10.0f32);
        let decoder = MaskDecoder::new(&protos, 0.5, InferenceTask::Segment).unwrap();
        // xc, yc, w, h, class, coefficient.
        let predictions =
            Array2::from_shape_vec((6, 1), vec![4., 4., 4., 4., 0.9, 1.]).unwrap();
        let found = candidates(predictions.view(), 1, 0.25);
        let frame = Frame {
            input_width: 8,
            input_height: 8,
            image_width: 16,
            image_height: 16,
        };

        let polygon = decoder
            .polygon(predictions.view(), &found[0], 5, &frame)
            .unwrap();

        // The box spans mask pixels 1..3, i.e. 4..12 in the image.
        assert!(polygon
            .iter()
            .all(|[x, y]| (4. ..=8.).contains(x) && (4. ..=8.).contains(y)));
    }
}
