mod app;
mod dispatcher;
mod normalizer;
#[cfg(feature = "onnx")]
mod ort_service;
mod server;
mod session;

pub mod backend;
pub mod config;
pub mod error;

pub use app::start_app;
pub use dispatcher::{CommandDispatcher, Outcome};
pub use server::{shutdown_signal, Phase, ProtocolServer};
pub use session::{LoadSummary, ModelSession};
