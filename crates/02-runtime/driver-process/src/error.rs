use std::io;
use std::path::PathBuf;
use thiserror::Error;
use transport::ErrorKind;

/// Result alias for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Failures raised by [`crate::ProcessManager`].
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The OS refused to launch the executable.
    #[error("failed to spawn driver {program}")]
    SpawnFailed {
        /// Executable that was requested.
        program: PathBuf,
        /// Underlying launch error.
        #[source]
        source: io::Error,
    },

    /// A driver is already starting or running under this manager.
    #[error("driver already running as pid {pid}")]
    AlreadyRunning {
        /// Pid of the live driver.
        pid: u32,
    },
}

impl LifecycleError {
    /// Maps the error onto the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::SpawnFailed { .. } => ErrorKind::SpawnFailed,
            LifecycleError::AlreadyRunning { .. } => ErrorKind::AlreadyExists,
        }
    }
}
