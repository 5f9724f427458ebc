use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("JSON parse error: {0}")]
    Json(#[source] serde_json::Error),
    #[error("invalid request: missing command")]
    MissingCommand,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("invalid {command} request: {source}")]
    InvalidFields {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoadModelRequest {
    pub model_path: PathBuf,
    #[serde(default)]
    pub labels_path: Option<PathBuf>,
}

/// Shared payload of `detect`, `segment` and `keypoint`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImageRequest {
    pub image_path: PathBuf,
    #[serde(default)]
    pub conf_threshold: Option<f32>,
    #[serde(default)]
    pub iou_threshold: Option<f32>,
    #[serde(default)]
    pub image_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClassifyRequest {
    pub image_path: PathBuf,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    LoadModel(LoadModelRequest),
    Detect(ImageRequest),
    Segment(ImageRequest),
    Classify(ClassifyRequest),
    Keypoint(ImageRequest),
    Exit,
}

impl Request {
    pub const COMMANDS: [&'static str; 6] = [
        "load_model",
        "detect",
        "segment",
        "classify",
        "keypoint",
        "exit",
    ];

    /// Parses one protocol line.
    ///
    /// The command name is checked against [`Request::COMMANDS`] before the
    /// payload is validated, so an unknown command is reported as such even
    /// when its other fields would not fit any known variant.
    pub fn parse_line(line: &str) -> Result<Self, RequestError> {
        let value: Value = serde_json::from_str(line).map_err(RequestError::Json)?;

        let command = match value.get("command") {
            Some(Value::String(command)) => command.clone(),
            _ => return Err(RequestError::MissingCommand),
        };

        if !Self::COMMANDS.contains(&command.as_str()) {
            return Err(RequestError::UnknownCommand(command));
        }
        if command == "exit" {
            return Ok(Self::Exit);
        }

        serde_json::from_value(value)
            .map_err(|source| RequestError::InvalidFields { command, source })
    }

    pub fn command(&self) -> &'static str {
        match self {
            Self::LoadModel(_) => "load_model",
            Self::Detect(_) => "detect",
            Self::Segment(_) => "segment",
            Self::Classify(_) => "classify",
            Self::Keypoint(_) => "keypoint",
            Self::Exit => "exit",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_detect_with_defaults_left_empty() {
        let request = Request::parse_line(r#"{"command":"detect","image_path":"img.jpg"}"#).unwrap();

        assert_eq!(
            request,
            Request::Detect(ImageRequest {
                image_path: PathBuf::from("img.jpg"),
                conf_threshold: None,
                iou_threshold: None,
                image_size: None,
            })
        );
    }

    #[test]
    fn test_parse_ignores_unknown_fields() {
        let request = Request::parse_line(
            r#"{"command":"classify","image_path":"a.png","top_k":3,"colour":"blue"}"#,
        )
        .unwrap();

        match request {
            Request::Classify(classify) => assert_eq!(classify.top_k, Some(3)),
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_load_model_with_labels() {
        let request = Request::parse_line(
            r#"{"command":"load_model","model_path":"m.onnx","labels_path":"labels.txt"}"#,
        )
        .unwrap();

        assert_eq!(request.command(), "load_model");
        match request {
            Request::LoadModel(load) => {
                assert_eq!(load.model_path, PathBuf::from("m.onnx"));
                assert_eq!(load.labels_path, Some(PathBuf::from("labels.txt")));
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_exit_with_extra_fields() {
        let request = Request::parse_line(r#"{"command":"exit","reason":"done"}"#).unwrap();
        assert_eq!(request, Request::Exit);
    }

    #[test]
    fn test_unknown_command_is_named() {
        let err = Request::parse_line(r#"{"command":"bogus"}"#).unwrap_err();

        assert!(matches!(err, RequestError::UnknownCommand(ref name) if name == "bogus"));
        assert_eq!(err.to_string(), "unknown command: bogus");
    }

    #[test]
    fn test_malformed_json() {
        let err = Request::parse_line("{not json").unwrap_err();

        assert!(matches!(err, RequestError::Json(_)));
        assert!(err.to_string().starts_with("JSON parse error: "));
    }

    #[test]
    fn test_missing_or_non_string_command() {
        assert!(matches!(
            Request::parse_line(r#"{"image_path":"a.jpg"}"#),
            Err(RequestError::MissingCommand)
        ));
        assert!(matches!(
            Request::parse_line(r#"{"command":7}"#),
            Err(RequestError::MissingCommand)
        ));
        assert!(matches!(
            Request::parse_line("[1, 2]"),
            Err(RequestError::MissingCommand)
        ));
    }

    #[test]
    fn test_missing_required_field() {
        let err = Request::parse_line(r#"{"command":"segment"}"#).unwrap_err();

        assert!(matches!(err, RequestError::InvalidFields { ref command, .. } if command == "segment"));
        assert!(err.to_string().contains("image_path"));
    }
}
