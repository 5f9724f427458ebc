use crate::{
    backend::InferenceBackend,
    config::RequestDefaults,
    dispatcher::{CommandDispatcher, Outcome},
};
use std::{future::Future, io};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    signal,
};
use vision_proto::{Response, ResponseData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unloaded,
    Loaded,
    Exited,
}

/// Line-delimited JSON loop: one request line in, one response line out.
///
/// Requests are handled strictly in order; a request finishes, including its
/// backend call, before the next line is read.
pub struct ProtocolServer<B: InferenceBackend> {
    dispatcher: CommandDispatcher<B>,
    exited: bool,
}

impl<B: InferenceBackend> ProtocolServer<B> {
    pub fn new(backend: B, defaults: RequestDefaults) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(backend, defaults),
            exited: false,
        }
    }

    pub fn phase(&self) -> Phase {
        if self.exited {
            Phase::Exited
        } else if self.dispatcher.session().is_loaded() {
            Phase::Loaded
        } else {
            Phase::Unloaded
        }
    }

    pub fn ready_response(&self) -> Response {
        let has_backend = self.dispatcher.has_backend();
        let message = if has_backend {
            "vision service started"
        } else {
            "vision service started without an inference backend"
        };
        Response::ok_with(message, ResponseData::Ready { has_backend })
    }

    /// Runs until `exit`, end of input or `shutdown` resolves.
    ///
    /// Only I/O failures on the channel itself are returned; every request
    /// fault is answered in-band.
    pub async fn run<R, W, S>(
        &mut self,
        mut reader: R,
        writer: &mut W,
        shutdown: S,
    ) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        S: Future<Output = ()>,
    {
        write_response(writer, &self.ready_response()).await?;
        tokio::pin!(shutdown);

        let mut buf = Vec::new();
        while self.phase() != Phase::Exited {
            buf.clear();
            let read = tokio::select! {
                read = reader.read_until(b'\n', &mut buf) => read?,
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received, stopping");
                    self.exited = true;
                    break;
                }
            };
            if read == 0 {
                tracing::info!("input closed, stopping");
                self.exited = true;
                break;
            }

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let outcome = self.dispatcher.handle_line(line).await;
            write_response(writer, outcome.response()).await?;
            if let Outcome::Exit(_) = outcome {
                tracing::info!("exit requested");
                self.exited = true;
            }
        }

        Ok(())
    }
}

async fn write_response<W>(writer: &mut W, response: &Response) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = response.to_line().map_err(io::Error::other)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
