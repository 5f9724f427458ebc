use crate::{
    backend::InferenceBackend,
    config::Settings,
    server::{shutdown_signal, ProtocolServer},
};
use tokio::io::BufReader;

pub struct App<B: InferenceBackend> {
    server: ProtocolServer<B>,
}

impl<B: InferenceBackend> App<B> {
    pub fn new(backend: B, settings: &Settings) -> Self {
        Self {
            server: ProtocolServer::new(backend, settings.defaults),
        }
    }

    /// Serves requests on stdin and answers on stdout until exit or signal.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let reader = BufReader::new(tokio::io::stdin());
        let mut writer = tokio::io::stdout();

        self.server.run(reader, &mut writer, shutdown_signal()).await?;
        tracing::info!("vision bridge stopped");

        Ok(())
    }
}

#[cfg(feature = "onnx")]
pub async fn start_app(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let backend = crate::ort_service::OrtBackend::new(&settings.backend);
    tracing::info!(available = backend.is_available(), "using ONNX Runtime backend");

    App::new(backend, &settings).run().await
}

#[cfg(not(feature = "onnx"))]
pub async fn start_app(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    tracing::warn!("built without an inference backend, inference commands will fail");

    App::new(crate::backend::UnavailableBackend, &settings).run().await
}
