use crate::{
    backend::{InferenceBackend, InferenceParams, InferenceTask},
    config::RequestDefaults,
    error::{report, ServiceError},
    normalizer::normalize,
    session::ModelSession,
};
use std::{path::Path, time::Instant};
use vision_proto::{
    ClassifyRequest, ImageRequest, LoadModelRequest, Request, RequestError, Response,
    ResponseData,
};

const INFERENCE_COMMANDS: [&str; 4] = ["detect", "segment", "classify", "keypoint"];

/// Result of handling one request: the response to emit and whether the
/// loop keeps reading afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Continue(Response),
    Exit(Response),
}

impl Outcome {
    pub fn response(&self) -> &Response {
        match self {
            Outcome::Continue(response) | Outcome::Exit(response) => response,
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, Outcome::Exit(_))
    }
}

pub struct CommandDispatcher<B: InferenceBackend> {
    backend: B,
    session: ModelSession<B::Handle>,
    defaults: RequestDefaults,
}

impl<B: InferenceBackend> CommandDispatcher<B> {
    pub fn new(backend: B, defaults: RequestDefaults) -> Self {
        Self {
            backend,
            session: ModelSession::new(),
            defaults,
        }
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_available()
    }

    pub fn session(&self) -> &ModelSession<B::Handle> {
        &self.session
    }

    pub async fn handle_line(&mut self, line: &str) -> Outcome {
        match Request::parse_line(line) {
            Ok(request) => self.handle(request).await,
            // The loaded check comes before payload validation.
            Err(RequestError::InvalidFields { ref command, .. })
                if INFERENCE_COMMANDS.contains(&command.as_str()) && !self.session.is_loaded() =>
            {
                Outcome::Continue(report(Some(command), &ServiceError::ModelNotLoaded))
            }
            Err(err) => Outcome::Continue(report(None, &err.into())),
        }
    }

    pub async fn handle(&mut self, request: Request) -> Outcome {
        let command = request.command();
        tracing::debug!(command, "dispatching request");

        match self.dispatch(request).await {
            Ok(outcome) => outcome,
            Err(err) => Outcome::Continue(report(Some(command), &err)),
        }
    }

    async fn dispatch(&mut self, request: Request) -> Result<Outcome, ServiceError> {
        let response = match request {
            Request::Exit => return Ok(Outcome::Exit(Response::ok("stopped"))),
            Request::LoadModel(load) => self.load_model(load).await?,
            Request::Detect(image) => {
                let data = self.run_image_task(InferenceTask::Detect, image).await?;
                let count = data.count().unwrap_or_default();
                Response::ok_with(format!("detection finished, found {} objects", count), data)
            }
            Request::Segment(image) => {
                let data = self.run_image_task(InferenceTask::Segment, image).await?;
                let count = data.count().unwrap_or_default();
                Response::ok_with(
                    format!("segmentation finished, found {} instances", count),
                    data,
                )
            }
            Request::Keypoint(image) => {
                let data = self.run_image_task(InferenceTask::Keypoint, image).await?;
                let count = data.count().unwrap_or_default();
                Response::ok_with(
                    format!("keypoint detection finished, found {} objects", count),
                    data,
                )
            }
            Request::Classify(classify) => self.classify(classify).await?,
        };

        Ok(Outcome::Continue(response))
    }

    async fn load_model(&mut self, load: LoadModelRequest) -> Result<Response, ServiceError> {
        let summary = self
            .session
            .load(&self.backend, &load.model_path, load.labels_path.as_deref())
            .await?;

        Ok(Response::ok_with(
            format!("model loaded: {}", load.model_path.display()),
            ResponseData::ModelLoaded {
                num_classes: summary.num_classes,
                class_names: summary.class_names,
            },
        ))
    }

    async fn run_image_task(
        &self,
        task: InferenceTask,
        image: ImageRequest,
    ) -> Result<ResponseData, ServiceError> {
        let params = InferenceParams {
            conf_threshold: image.conf_threshold.unwrap_or(self.defaults.conf_threshold),
            iou_threshold: image.iou_threshold.unwrap_or(self.defaults.iou_threshold),
            image_size: image.image_size.unwrap_or(self.defaults.image_size),
            top_k: self.defaults.top_k,
        };
        self.infer(task, &image.image_path, params).await
    }

    async fn classify(&self, classify: ClassifyRequest) -> Result<Response, ServiceError> {
        let params = InferenceParams {
            conf_threshold: self.defaults.conf_threshold,
            iou_threshold: self.defaults.iou_threshold,
            image_size: self.defaults.image_size,
            top_k: classify.top_k.unwrap_or(self.defaults.top_k),
        };
        let data = self
            .infer(InferenceTask::Classify, &classify.image_path, params)
            .await?;

        let top = match &data {
            ResponseData::Classifications {
                top_prediction: Some(top),
                ..
            } => top.label.clone(),
            _ => "N/A".to_string(),
        };

        Ok(Response::ok_with(
            format!("classification finished, top-1: {}", top),
            data,
        ))
    }

    async fn infer(
        &self,
        task: InferenceTask,
        image_path: &Path,
        params: InferenceParams,
    ) -> Result<ResponseData, ServiceError> {
        let handle = self.session.handle().ok_or(ServiceError::ModelNotLoaded)?;
        if !image_path.exists() {
            return Err(ServiceError::missing_image(image_path));
        }

        let started = Instant::now();
        let output = self
            .backend
            .infer(handle, task, image_path, &params)
            .await
            .map_err(|e| ServiceError::inference_failed(task, e))?;
        tracing::info!(
            task = task.as_str(),
            image = %image_path.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "inference finished"
        );

        Ok(normalize(
            task,
            output,
            self.session.class_names(),
            params.top_k,
        ))
    }
}
