//! Error handling helpers for the transport crate.
//!
//! Every fallible operation in the task channel reports one of a small, fixed
//! set of [`ErrorKind`]s. The concrete error types carry context (region names,
//! sizes, OS errors) while `kind()` gives callers a stable value to branch on.

use std::io;
use thiserror::Error;

/// Convenience result alias for fallible transport operations.
pub type TransportResult<T, E = TransportError> = Result<T, E>;

/// Failure taxonomy shared by every layer of the task channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The OS could not back the requested allocation.
    ResourceExhausted,
    /// A named object with the requested name is already live.
    AlreadyExists,
    /// No named object with the requested name exists.
    NotFound,
    /// The region header does not describe a layout this build understands.
    IncompatibleLayout,
    /// The payload does not fit in a slot.
    PayloadTooLarge,
    /// The producer timed out waiting for a free slot while the peer was alive.
    QueueFull,
    /// The consumer timed out waiting for data while the peer was alive.
    QueueEmpty,
    /// The peer process terminated or detached.
    PeerLost,
    /// The driver process could not be launched.
    SpawnFailed,
}

/// Errors surfaced by the region allocator and the ring layout.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A region with this name is already live.
    #[error("shared region {name} already exists")]
    AlreadyExists { name: String },

    /// No region with this name exists.
    #[error("shared region {name} not found")]
    NotFound { name: String },

    /// The OS refused to back the allocation.
    #[error("failed to back shared region {name} with {size} bytes")]
    ResourceExhausted {
        name: String,
        size: usize,
        #[source]
        source: io::Error,
    },

    /// Header or ring metadata failed validation.
    #[error("incompatible shared layout: {reason}")]
    IncompatibleLayout { reason: String },

    /// Payload exceeds the slot size fixed at creation time.
    #[error("payload of {len} bytes exceeds slot size {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// Requested ring geometry is unusable.
    #[error("ring capacity {capacity} with slot size {slot_size} is invalid")]
    InvalidCapacity { capacity: u32, slot_size: u32 },

    /// Region names must look like `/name` with no further slashes.
    #[error("invalid shared region name {name:?}")]
    InvalidName { name: String },

    /// Any other OS failure while creating, opening, or mapping a region.
    #[error("shared region {name}: {source}")]
    Os {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    /// Maps the error onto the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            TransportError::NotFound { .. } => ErrorKind::NotFound,
            TransportError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            TransportError::IncompatibleLayout { .. } => ErrorKind::IncompatibleLayout,
            TransportError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            // Geometry and naming mistakes make the layout unusable for both peers.
            TransportError::InvalidCapacity { .. } | TransportError::InvalidName { .. } => {
                ErrorKind::IncompatibleLayout
            }
            TransportError::Os { .. } => ErrorKind::ResourceExhausted,
        }
    }

    pub(crate) fn incompatible(reason: impl Into<String>) -> Self {
        TransportError::IncompatibleLayout {
            reason: reason.into(),
        }
    }
}
