//! Typed failures for queue setup and the blocking client/server calls.

use std::time::Duration;
use thiserror::Error;
use transport::{ErrorKind, TransportError};

/// Result alias for queue setup operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Failures creating, opening, or attaching to a queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Region or ring failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The requested configuration cannot be laid out.
    #[error("invalid queue configuration: {0}")]
    InvalidConfig(&'static str),

    /// Another live driver already serves this queue.
    #[error("a driver is already attached as pid {pid}")]
    DriverAttached { pid: u32 },

    /// The client detached before the driver could attach.
    #[error("client of queue {name} has detached")]
    ClientGone { name: String },
}

impl QueueError {
    /// Maps the error onto the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Transport(err) => err.kind(),
            QueueError::InvalidConfig(_) => ErrorKind::IncompatibleLayout,
            QueueError::DriverAttached { .. } => ErrorKind::AlreadyExists,
            QueueError::ClientGone { .. } => ErrorKind::PeerLost,
        }
    }
}

/// Why [`crate::TaskQueueClient::enqueue`] did not accept a task.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// No slot freed up within the timeout while the driver stayed alive.
    #[error("task queue still full after {timeout:?}")]
    QueueFull { timeout: Duration },
    /// The driver died or detached.
    #[error("driver process lost")]
    PeerLost,
    /// The payload is larger than a slot.
    #[error("task payload of {len} bytes exceeds slot size {max}")]
    PayloadTooLarge { len: usize, max: usize },
}

impl EnqueueError {
    /// Maps the error onto the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EnqueueError::QueueFull { .. } => ErrorKind::QueueFull,
            EnqueueError::PeerLost => ErrorKind::PeerLost,
            EnqueueError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
        }
    }
}

/// Why [`crate::TaskQueueServer::dequeue`] returned without a task.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DequeueError {
    /// Nothing arrived within the timeout while the client stayed alive.
    #[error("no task arrived within {timeout:?}")]
    QueueEmpty { timeout: Duration },
    /// The client died or detached and nothing is left to drain.
    #[error("client process lost")]
    PeerLost,
}

impl DequeueError {
    /// Maps the error onto the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DequeueError::QueueEmpty { .. } => ErrorKind::QueueEmpty,
            DequeueError::PeerLost => ErrorKind::PeerLost,
        }
    }
}

/// Why [`crate::TaskQueueServer::post_result`] could not deliver a result.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PostError {
    /// The client did not drain results within the timeout.
    #[error("result queue still full after {timeout:?}")]
    ResultQueueFull { timeout: Duration },
    /// The client died or detached.
    #[error("client process lost")]
    PeerLost,
    /// The result payload is larger than a slot.
    #[error("result payload of {len} bytes exceeds slot size {max}")]
    PayloadTooLarge { len: usize, max: usize },
}

impl PostError {
    /// Maps the error onto the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PostError::ResultQueueFull { .. } => ErrorKind::QueueFull,
            PostError::PeerLost => ErrorKind::PeerLost,
            PostError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
        }
    }
}
