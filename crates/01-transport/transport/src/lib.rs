//! Shared-memory primitives for the task channel between a client and its driver process.
//!
//! * [`SharedRegion`] – a named, mapped block of memory both processes can see.
//! * [`RingBuffer`] – fixed-slot SPSC queue laid out inside a region.
//! * [`Signal`] – futex-backed notification with bounded, liveness-aware waits.
//! * [`TransportError`] / [`ErrorKind`] – error surface shared by every layer above.
//!
//! Linux only: regions are POSIX shared-memory objects and signals are shared futexes.

mod error;
mod region;
mod ring;
mod sync;
pub mod wait;

pub use error::{ErrorKind, TransportError, TransportResult};
pub use region::{RegionName, RegionRole, SharedRegion, REGION_ALIGNMENT};
pub use ring::{
    ReadSlot, RingBuffer, SlotEnvelope, SlotRecord, SlotState, WriteSlot, MAX_CAPACITY,
    MAX_SLOT_SIZE, RING_HEADER_LEN, SLOT_ALIGNMENT, SLOT_HEADER_LEN,
};
pub use sync::{AlwaysAlive, Deadline, PeerLiveness, Signal, WaitError};
