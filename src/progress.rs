//! Cancellation and progress reporting for long-running reconstructions.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::channel::mpsc::UnboundedSender;

use crate::enums::ProgressPhase;
use crate::error::SvrError;

#[derive(Clone, Debug, PartialEq)]
pub struct Progress {
    pub phase: ProgressPhase,
    pub current: usize,
    pub total: usize,
    pub message: String,
}

/// Shared flag a host sets to abort a run.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-run handle passed down every stage.
#[derive(Clone, Debug, Default)]
pub struct RunContext {
    cancel: CancellationToken,
    progress: Option<UnboundedSender<Progress>>,
}

impl RunContext {
    pub fn new(cancel: CancellationToken, progress: Option<UnboundedSender<Progress>>) -> Self {
        Self { cancel, progress }
    }

    /// No progress listener and a token nobody else holds.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Same cancellation token, no progress listener. For nested solves
    /// whose progress would confuse the host.
    pub fn silent(&self) -> Self {
        Self {
            cancel: self.cancel.clone(),
            progress: None,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn check_cancelled(&self) -> Result<(), SvrError> {
        if self.cancel.is_cancelled() {
            Err(SvrError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sends a progress update. A dropped receiver is not an error.
    pub fn report(&self, phase: ProgressPhase, current: usize, total: usize, message: impl Into<String>) {
        if let Some(tx) = &self.progress {
            let _ = tx.unbounded_send(Progress {
                phase,
                current,
                total,
                message: message.into(),
            });
        }
    }
}
