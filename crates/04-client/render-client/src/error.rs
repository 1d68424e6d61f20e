use driver_process::{ExitOutcome, LifecycleError};
use std::time::Duration;
use task_queue::{ErrorKind, QueueError};
use thiserror::Error;

/// Result alias for [`crate::RenderClient`] setup.
pub type RenderClientResult<T> = Result<T, RenderClientError>;

/// Failures standing up a client/driver pair.
#[derive(Debug, Error)]
pub enum RenderClientError {
    /// The queue region could not be created.
    #[error("failed to create task queue")]
    Queue(#[from] QueueError),

    /// The driver executable could not be launched.
    #[error(transparent)]
    Spawn(#[from] LifecycleError),

    /// The driver kept running but never attached to the queue.
    #[error("driver did not attach within {timeout:?}")]
    AttachTimedOut {
        /// Attach budget that elapsed.
        timeout: Duration,
    },

    /// The driver exited before attaching.
    #[error("driver exited before attaching: {outcome:?}")]
    DriverExited {
        /// How the driver ended.
        outcome: ExitOutcome,
    },
}

impl RenderClientError {
    /// Maps the error onto the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RenderClientError::Queue(err) => err.kind(),
            RenderClientError::Spawn(err) => err.kind(),
            // The launch did not yield a usable driver either way.
            RenderClientError::AttachTimedOut { .. } => ErrorKind::SpawnFailed,
            RenderClientError::DriverExited { .. } => ErrorKind::PeerLost,
        }
    }
}
