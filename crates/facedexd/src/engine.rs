use facedex_core::{Detection, EmbedError, Embedder};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Embed(#[from] EmbedError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Embed {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<Detection>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    dimension: usize,
}

impl EngineHandle {
    /// Detect every face in an encoded image and extract its embedding.
    pub async fn embed(&self, image: Vec<u8>) -> Result<Vec<Detection>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Embed {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Length of every embedding this engine produces.
    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Run `embedder` on a dedicated OS thread.
///
/// Inference is CPU-bound and the ONNX sessions need `&mut`, so requests
/// are serialised through a bounded channel instead of blocking the runtime.
pub fn spawn_engine<E>(mut embedder: E) -> Result<EngineHandle, EngineError>
where
    E: Embedder + Send + 'static,
{
    let dimension = embedder.dimension();
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facedex-engine".into())
        .spawn(move || {
            tracing::info!(dimension, "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Embed { image, reply } => {
                        let started = std::time::Instant::now();
                        let result = embedder.embed(&image).map_err(EngineError::from);
                        match &result {
                            Ok(detections) => tracing::debug!(
                                bytes = image.len(),
                                faces = detections.len(),
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "embed: done"
                            ),
                            Err(err) => tracing::warn!(error = %err, "embed: failed"),
                        }
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, dimension })
}
