//! Background execution of a reconstruction on tokio's blocking pool.
//!
//! The host keeps a [`ReconstructionHandle`]: a `Stream` of [`Progress`]
//! updates, a cancel switch, and the join future yielding the output.

use futures::channel::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;

use crate::config::ReconstructionOptions;
use crate::error::SvrError;
use crate::pipeline::{ReconstructionOutput, run_reconstruction};
use crate::progress::{CancellationToken, Progress, RunContext};
use crate::slice_loader::{GeometrySource, PixelSource, SeriesInput};

pub struct ReconstructionHandle {
    pub progress: UnboundedReceiver<Progress>,
    cancel: CancellationToken,
    task: JoinHandle<Result<ReconstructionOutput, SvrError>>,
}

impl ReconstructionHandle {
    /// Asks the worker to stop at its next checkpoint; `join` then yields
    /// [`SvrError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn join(self) -> Result<ReconstructionOutput, SvrError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(SvrError::Worker(format!("worker panicked: {e}"))),
            Err(e) => Err(SvrError::Worker(e.to_string())),
        }
    }
}

/// Starts `run_reconstruction` on a blocking worker. Must be called from
/// within a tokio runtime.
pub fn spawn_reconstruction<S>(
    source: S,
    inputs: Vec<SeriesInput>,
    options: ReconstructionOptions,
    cancel: CancellationToken,
) -> ReconstructionHandle
where
    S: PixelSource + GeometrySource + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded();
    let ctx = RunContext::new(cancel.clone(), Some(tx));
    let task = tokio::task::spawn_blocking(move || run_reconstruction(&source, &inputs, &options, &ctx));
    ReconstructionHandle {
        progress: rx,
        cancel,
        task,
    }
}
