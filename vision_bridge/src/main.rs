use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vision_bridge::{config, start_app};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::get_configuration()?;
    let log_level = &format!("{},ort=warn", config.log_level.as_str());

    // stdout carries the protocol, so logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(false)
                .with_level(true)
                .with_writer(std::io::stderr),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(start_app(config));

    // A pending stdin read sits on a blocking thread and cannot be cancelled;
    // waiting for it would keep the process alive after a shutdown signal.
    runtime.shutdown_background();

    result
}
