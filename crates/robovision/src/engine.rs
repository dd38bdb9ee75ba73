use robovision_core::trainer::TrainError;
use robovision_core::{ArtifactPaths, Detector, Recognizer, Trainer, TrainingEvent, TrainingSummary};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn training thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Train(#[from] TrainError),
    #[error("training thread exited without a result")]
    WorkerExited,
}

/// Everything a background training run needs.
pub struct TrainingJob<D, R> {
    pub dataset_dir: PathBuf,
    pub artifacts: ArtifactPaths,
    pub trainer: Trainer<D, R>,
}

/// Receiving side of a running training job.
pub struct TrainingHandle {
    /// Progress events. Closes once the worker finishes.
    pub events: mpsc::UnboundedReceiver<TrainingEvent>,
    result: oneshot::Receiver<Result<TrainingSummary, TrainError>>,
}

impl TrainingHandle {
    /// Wait for the run to finish. Unread progress events are discarded.
    pub async fn wait(self) -> Result<TrainingSummary, EngineError> {
        drop(self.events);
        self.result.await.map_err(|_| EngineError::WorkerExited)?.map_err(EngineError::from)
    }

    /// Split into the event stream and a future for the final result.
    pub fn split(
        self,
    ) -> (
        mpsc::UnboundedReceiver<TrainingEvent>,
        impl std::future::Future<Output = Result<TrainingSummary, EngineError>>,
    ) {
        let result = self.result;
        let done = async move { result.await.map_err(|_| EngineError::WorkerExited)?.map_err(EngineError::from) };
        (self.events, done)
    }
}

/// Run a training job on a dedicated OS thread.
///
/// Progress is sent over an unbounded channel, so a slow or absent reader
/// never stalls the scan. There is no cancellation; the run completes or fails.
pub fn spawn_training<D, R>(job: TrainingJob<D, R>) -> Result<TrainingHandle, EngineError>
where
    D: Detector + Send + 'static,
    R: Recognizer + Send + 'static,
{
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("robovision-trainer".into())
        .spawn(move || {
            tracing::info!(dataset = %job.dataset_dir.display(), "training thread started");
            let observer = move |event: TrainingEvent| {
                // Receiver gone means nobody is watching; keep training.
                let _ = event_tx.send(event);
            };
            let result = job.trainer.run(&job.dataset_dir, &job.artifacts, &observer);
            if let Err(e) = &result {
                tracing::error!(error = %e, "training failed");
            }
            let _ = reply_tx.send(result);
            tracing::info!("training thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(TrainingHandle {
        events: event_rx,
        result: reply_rx,
    })
}
