use crate::backend::{BackendError, InferenceTask};
use std::{io, path::PathBuf};
use thiserror::Error;
use vision_proto::{RequestError, Response};

/// The four fault classes a request can end in. None of them stops the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    State,
    Validation,
    Backend,
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Protocol(#[from] RequestError),
    #[error("model not loaded")]
    ModelNotLoaded,
    #[error("{what} does not exist: {}", .path.display())]
    MissingFile { what: &'static str, path: PathBuf },
    #[error("cannot read labels file {}: {source}", .path.display())]
    UnreadableLabels {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{context}: {source}")]
    Backend {
        context: &'static str,
        #[source]
        source: BackendError,
    },
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Protocol(_) => ErrorKind::Protocol,
            ServiceError::ModelNotLoaded => ErrorKind::State,
            ServiceError::MissingFile { .. } | ServiceError::UnreadableLabels { .. } => {
                ErrorKind::Validation
            }
            ServiceError::Backend { .. } => ErrorKind::Backend,
        }
    }

    pub fn missing_model(path: impl Into<PathBuf>) -> Self {
        ServiceError::MissingFile {
            what: "model file",
            path: path.into(),
        }
    }

    pub fn missing_image(path: impl Into<PathBuf>) -> Self {
        ServiceError::MissingFile {
            what: "image file",
            path: path.into(),
        }
    }

    pub fn load_failed(source: BackendError) -> Self {
        ServiceError::Backend {
            context: "load model failed",
            source,
        }
    }

    pub fn inference_failed(task: InferenceTask, source: BackendError) -> Self {
        let context = match task {
            InferenceTask::Detect => "detection failed",
            InferenceTask::Segment => "segmentation failed",
            InferenceTask::Classify => "classification failed",
            InferenceTask::Keypoint => "keypoint detection failed",
        };
        ServiceError::Backend { context, source }
    }
}

/// Turns a fault into the failure envelope; logging is the only side effect.
pub fn report(command: Option<&str>, err: &ServiceError) -> Response {
    tracing::warn!(
        command = command.unwrap_or("-"),
        kind = ?err.kind(),
        "request failed: {}",
        err
    );
    Response::failure(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vision_proto::Request;

    #[test]
    fn test_messages_and_kinds() {
        let err = ServiceError::ModelNotLoaded;
        assert_eq!(err.kind(), ErrorKind::State);
        assert_eq!(err.to_string(), "model not loaded");

        let err = ServiceError::missing_image("img.jpg");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.to_string(), "image file does not exist: img.jpg");

        let err = ServiceError::missing_model("missing.pt");
        assert_eq!(err.to_string(), "model file does not exist: missing.pt");
    }

    #[test]
    fn test_protocol_errors_keep_request_message() {
        let err: ServiceError = Request::parse_line("{oops").unwrap_err().into();

        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().starts_with("JSON parse error: "));
    }

    #[test]
    fn test_backend_faults_carry_task_prefix() {
        let err = ServiceError::inference_failed(
            InferenceTask::Segment,
            BackendError::InferenceFailed("out of memory".to_string()),
        );

        assert_eq!(err.kind(), ErrorKind::Backend);
        assert_eq!(
            err.to_string(),
            "segmentation failed: inference failed: out of memory"
        );
    }

    #[test]
    fn test_report_builds_failure_envelope() {
        let response = report(Some("detect"), &ServiceError::ModelNotLoaded);

        assert!(!response.success);
        assert_eq!(response.message, "model not loaded");
        assert!(response.data.is_none());
    }
}
