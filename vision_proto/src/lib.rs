//! Wire types for the line-delimited JSON protocol spoken by `vision_bridge`.
//!
//! One JSON object per line in both directions. Requests are a tagged union
//! keyed by `command`; every response has the `{success, message, data?}`
//! envelope.

mod request;
mod response;

pub use request::{ClassifyRequest, ImageRequest, LoadModelRequest, Request, RequestError};
pub use response::{
    ClassificationEntry, Detection, Keypoint, KeypointDetection, Point, Response, ResponseData,
    SegmentedInstance,
};
