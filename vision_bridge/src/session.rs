use crate::{
    backend::{InferenceBackend, ModelHandle},
    error::ServiceError,
};
use std::{
    fs::File,
    io::{self, BufRead},
    path::{Path, PathBuf},
};

const SUMMARY_LABELS: usize = 10;

#[derive(Debug)]
struct LoadedModel<H> {
    handle: H,
    model_path: PathBuf,
    class_names: Vec<String>,
}

/// What `load_model` reports back. `class_names` is a preview only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub num_classes: usize,
    pub class_names: Vec<String>,
}

/// The single active model. Path, handle and labels live in one `Option`,
/// so the session is loaded exactly when all three are present.
#[derive(Debug)]
pub struct ModelSession<H> {
    model: Option<LoadedModel<H>>,
}

impl<H> Default for ModelSession<H> {
    fn default() -> Self {
        Self { model: None }
    }
}

impl<H: ModelHandle> ModelSession<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub fn model_path(&self) -> Option<&Path> {
        self.model.as_ref().map(|model| model.model_path.as_path())
    }

    pub fn class_names(&self) -> &[String] {
        self.model
            .as_ref()
            .map(|model| model.class_names.as_slice())
            .unwrap_or(&[])
    }

    pub fn handle(&self) -> Option<&H> {
        self.model.as_ref().map(|model| &model.handle)
    }

    /// Loads `model_path` through `backend` and replaces the current model.
    ///
    /// Labels come from `labels_path` when it names an existing file, else
    /// from the backend's name table in id order. On any failure the
    /// previously loaded model stays active.
    pub async fn load<B>(
        &mut self,
        backend: &B,
        model_path: &Path,
        labels_path: Option<&Path>,
    ) -> Result<LoadSummary, ServiceError>
    where
        B: InferenceBackend<Handle = H>,
    {
        if !model_path.exists() {
            return Err(ServiceError::missing_model(model_path));
        }

        let handle = backend
            .load(model_path)
            .await
            .map_err(ServiceError::load_failed)?;

        let class_names = match labels_path.filter(|path| path.exists()) {
            Some(path) => load_labels(path).map_err(|source| ServiceError::UnreadableLabels {
                path: path.to_path_buf(),
                source,
            })?,
            None => {
                if let Some(path) = labels_path {
                    tracing::debug!(
                        "labels file {} not found, using model names",
                        path.display()
                    );
                }
                handle.names().values().cloned().collect()
            }
        };

        tracing::info!(
            model = %model_path.display(),
            num_classes = class_names.len(),
            "model loaded"
        );

        let summary = LoadSummary {
            num_classes: class_names.len(),
            class_names: class_names.iter().take(SUMMARY_LABELS).cloned().collect(),
        };

        self.model = Some(LoadedModel {
            handle,
            model_path: model_path.to_path_buf(),
            class_names,
        });

        Ok(summary)
    }
}

/// Reads one label per line, skipping blank lines, in file order.
pub fn load_labels(filepath: &Path) -> io::Result<Vec<String>> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let label = line.trim();
        if !label.is_empty() {
            labels.push(label.to_string());
        }
    }

    Ok(labels)
}
