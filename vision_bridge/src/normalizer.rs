//! Maps backend-native output onto the task-agnostic response schema.
//!
//! Box tasks share one [`Detection`] core: `x`/`y` are the truncated top-left
//! corner, `width`/`height` the truncated float extent, confidences are
//! clamped to [0, 1] and rounded to four decimals, and a class id outside the
//! label table resolves to `class_{id}`.

use crate::backend::{BackendOutput, InferenceTask, RawBox, RawClassScore, RawKeypoint};
use vision_proto::{
    ClassificationEntry, Detection, Keypoint, KeypointDetection, Point, ResponseData,
    SegmentedInstance,
};

pub fn normalize(
    task: InferenceTask,
    output: BackendOutput,
    class_names: &[String],
    top_k: usize,
) -> ResponseData {
    match task {
        InferenceTask::Detect => ResponseData::detections(detections(&output, class_names)),
        InferenceTask::Segment => ResponseData::segments(segments(&output, class_names)),
        InferenceTask::Keypoint => ResponseData::keypoints(keypoints(&output, class_names)),
        InferenceTask::Classify => {
            ResponseData::classifications(classifications(&output, class_names, top_k))
        }
    }
}

pub fn round_confidence(value: f32) -> f64 {
    let value = f64::from(value);
    if value.is_nan() {
        return 0.0;
    }
    (value.clamp(0.0, 1.0) * 10_000.0).round() / 10_000.0
}

pub fn resolve_label(class_names: &[String], class_id: i64) -> String {
    usize::try_from(class_id)
        .ok()
        .and_then(|index| class_names.get(index))
        .cloned()
        .unwrap_or_else(|| format!("class_{}", class_id))
}

fn to_detection(raw: &RawBox, class_names: &[String]) -> Detection {
    // `as` truncates toward zero and saturates on overflow.
    Detection {
        x: raw.x1 as i64,
        y: raw.y1 as i64,
        width: (raw.x2 - raw.x1) as i64,
        height: (raw.y2 - raw.y1) as i64,
        confidence: round_confidence(raw.confidence),
        class_id: raw.class_id,
        label: resolve_label(class_names, raw.class_id),
    }
}

fn boxes(output: &BackendOutput) -> &[RawBox] {
    output.boxes.as_deref().unwrap_or(&[])
}

pub fn detections(output: &BackendOutput, class_names: &[String]) -> Vec<Detection> {
    boxes(output)
        .iter()
        .map(|raw| to_detection(raw, class_names))
        .collect()
}

pub fn segments(output: &BackendOutput, class_names: &[String]) -> Vec<SegmentedInstance> {
    boxes(output)
        .iter()
        .enumerate()
        .map(|(index, raw)| {
            let mask_polygon = output
                .masks
                .as_ref()
                .and_then(|masks| masks.get(index))
                .and_then(Option::as_ref)
                .map(|polygon| {
                    polygon
                        .iter()
                        .map(|&[x, y]| Point {
                            x: f64::from(x),
                            y: f64::from(y),
                        })
                        .collect()
                })
                .unwrap_or_default();

            SegmentedInstance {
                detection: to_detection(raw, class_names),
                mask_polygon,
            }
        })
        .collect()
}

fn to_keypoint(id: usize, raw: &RawKeypoint) -> Keypoint {
    Keypoint {
        id,
        x: f64::from(raw.x),
        y: f64::from(raw.y),
        confidence: raw.confidence.map(round_confidence),
    }
}

pub fn keypoints(output: &BackendOutput, class_names: &[String]) -> Vec<KeypointDetection> {
    boxes(output)
        .iter()
        .enumerate()
        .map(|(index, raw)| {
            let keypoints = output
                .keypoints
                .as_ref()
                .and_then(|sets| sets.get(index))
                .map(|set| {
                    set.iter()
                        .enumerate()
                        .map(|(id, point)| to_keypoint(id, point))
                        .collect()
                })
                .unwrap_or_default();

            KeypointDetection {
                detection: to_detection(raw, class_names),
                keypoints,
            }
        })
        .collect()
}

/// Ranks the backend's class scores, highest first, keeping at most `top_k`.
pub fn classifications(
    output: &BackendOutput,
    class_names: &[String],
    top_k: usize,
) -> Vec<ClassificationEntry> {
    let mut scores: Vec<RawClassScore> = output.probabilities.clone().unwrap_or_default();
    scores.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    scores.truncate(top_k);

    scores
        .iter()
        .enumerate()
        .map(|(index, score)| ClassificationEntry {
            rank: index + 1,
            confidence: round_confidence(score.confidence),
            class_id: score.class_id,
            label: resolve_label(class_names, score.class_id),
        })
        .collect()
}
