//! Self-describing header at offset 0 of every queue region.
//!
//! ```text
//! 0        QueueHeader (magic, version, geometry, ring offsets, peer blocks)
//! 256      task ring    (client -> driver)
//! aligned  result ring  (driver -> client)
//! ```
//!
//! The creator writes every field, initializes both rings, and publishes
//! `magic` last with `Release`. Openers validate the header before touching
//! anything else and recompute the layout from the geometry it advertises, so
//! a peer built with a different layout fails with `IncompatibleLayout`
//! instead of misreading slots.

use crate::QueueConfig;
use std::mem::{align_of, size_of};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use transport::{
    RingBuffer, SharedRegion, TransportError, TransportResult, SLOT_ALIGNMENT,
};

pub(crate) const QUEUE_MAGIC: u64 = 0x5451_5545_5545_3031; // "TQUEUE01"
pub(crate) const LAYOUT_VERSION: u32 = 1;
pub(crate) const HEADER_LEN: usize = 256;

const _: () = assert!(size_of::<QueueHeader>() <= HEADER_LEN);
const _: () = assert!(HEADER_LEN % SLOT_ALIGNMENT == 0);

/// Attachment state of one side of the queue.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PeerState {
    Vacant = 0,
    Attached = 1,
    Detached = 2,
}

impl PeerState {
    fn from_u32(value: u32) -> Self {
        match value {
            0 => PeerState::Vacant,
            1 => PeerState::Attached,
            _ => PeerState::Detached,
        }
    }
}

#[repr(C)]
pub(crate) struct PeerBlock {
    pid: AtomicU32,
    state: AtomicU32,
}

impl PeerBlock {
    pub(crate) fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> PeerState {
        PeerState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Records `pid` as the live occupant. The pid is visible before the state flips.
    pub(crate) fn attach(&self, pid: u32) {
        self.pid.store(pid, Ordering::Release);
        self.state
            .store(PeerState::Attached as u32, Ordering::Release);
    }

    /// Replaces `expected` with `pid`; fails if someone else got there first.
    pub(crate) fn claim(&self, expected: u32, pid: u32) -> Result<(), u32> {
        self.pid
            .compare_exchange(expected, pid, Ordering::AcqRel, Ordering::Acquire)?;
        self.state
            .store(PeerState::Attached as u32, Ordering::Release);
        Ok(())
    }

    pub(crate) fn detach(&self) {
        self.state
            .store(PeerState::Detached as u32, Ordering::Release);
    }
}

#[repr(C, align(64))]
pub(crate) struct QueueHeader {
    magic: AtomicU64,
    version: u32,
    header_len: u32,
    capacity: u32,
    slot_size: u32,
    total_len: u64,
    task_ring_offset: u64,
    result_ring_offset: u64,
    liveness_us: u32,
    pad: u32,
    pub(crate) client: PeerBlock,
    pub(crate) driver: PeerBlock,
}

/// Byte offsets of both rings for a given geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct QueueLayout {
    pub(crate) capacity: u32,
    pub(crate) slot_size: u32,
    pub(crate) task_ring_offset: usize,
    pub(crate) result_ring_offset: usize,
    pub(crate) total_len: usize,
}

impl QueueLayout {
    pub(crate) fn new(capacity: u32, slot_size: u32) -> TransportResult<Self> {
        let ring_len = RingBuffer::byte_len(capacity, slot_size)?;
        let task_ring_offset = HEADER_LEN;
        let result_ring_offset = align_up(task_ring_offset + ring_len, SLOT_ALIGNMENT);
        Ok(Self {
            capacity,
            slot_size,
            task_ring_offset,
            result_ring_offset,
            total_len: result_ring_offset + ring_len,
        })
    }
}

/// Both rings of a queue plus the header they hang off.
pub(crate) struct QueueRegion {
    pub(crate) region: Arc<SharedRegion>,
    pub(crate) tasks: RingBuffer,
    pub(crate) results: RingBuffer,
    pub(crate) liveness_interval: Duration,
}

impl QueueRegion {
    /// Lays out a fresh queue in a region sized by [`QueueLayout::total_len`].
    /// The client block is attached to the calling process.
    pub(crate) fn initialize(
        region: Arc<SharedRegion>,
        layout: QueueLayout,
        config: &QueueConfig,
    ) -> TransportResult<Self> {
        if region.len() < layout.total_len {
            return Err(incompatible(format!(
                "region of {} bytes cannot hold a {}-byte queue",
                region.len(),
                layout.total_len
            )));
        }
        let liveness_us = u32::try_from(config.liveness_interval.as_micros()).unwrap_or(u32::MAX);

        // SAFETY: offset 0 is page aligned and the region is at least
        // HEADER_LEN bytes; no peer knows the name yet.
        unsafe {
            let header = region.as_ptr() as *mut QueueHeader;
            ptr::write(
                header,
                QueueHeader {
                    magic: AtomicU64::new(0),
                    version: LAYOUT_VERSION,
                    header_len: HEADER_LEN as u32,
                    capacity: layout.capacity,
                    slot_size: layout.slot_size,
                    total_len: layout.total_len as u64,
                    task_ring_offset: layout.task_ring_offset as u64,
                    result_ring_offset: layout.result_ring_offset as u64,
                    liveness_us,
                    pad: 0,
                    client: PeerBlock {
                        pid: AtomicU32::new(0),
                        state: AtomicU32::new(PeerState::Vacant as u32),
                    },
                    driver: PeerBlock {
                        pid: AtomicU32::new(0),
                        state: AtomicU32::new(PeerState::Vacant as u32),
                    },
                },
            );
        }

        let tasks = RingBuffer::initialize(
            Arc::clone(&region),
            layout.task_ring_offset,
            layout.capacity,
            layout.slot_size,
        )?;
        let results = RingBuffer::initialize(
            Arc::clone(&region),
            layout.result_ring_offset,
            layout.capacity,
            layout.slot_size,
        )?;

        let queue = Self {
            region,
            tasks,
            results,
            liveness_interval: config.liveness_interval,
        };
        queue.header().client.attach(std::process::id());
        queue.header().magic.store(QUEUE_MAGIC, Ordering::Release);
        Ok(queue)
    }

    /// Validates the header written by the creator and attaches to both rings.
    pub(crate) fn attach(region: Arc<SharedRegion>) -> TransportResult<Self> {
        if region.len() < HEADER_LEN {
            return Err(incompatible(format!(
                "region of {} bytes is smaller than the queue header",
                region.len()
            )));
        }
        debug_assert_eq!(region.as_ptr() as usize % align_of::<QueueHeader>(), 0);
        // SAFETY: length checked above; the header only holds integers.
        let header = unsafe { region.view::<QueueHeader>(0) };

        let magic = header.magic.load(Ordering::Acquire);
        if magic != QUEUE_MAGIC {
            return Err(incompatible(format!("bad queue magic {magic:#018x}")));
        }
        if header.version != LAYOUT_VERSION {
            return Err(incompatible(format!(
                "layout version {} (expected {LAYOUT_VERSION})",
                header.version
            )));
        }
        if header.header_len as usize != HEADER_LEN {
            return Err(incompatible(format!(
                "header length {} (expected {HEADER_LEN})",
                header.header_len
            )));
        }

        let layout = QueueLayout::new(header.capacity, header.slot_size)?;
        let advertised = (
            header.task_ring_offset,
            header.result_ring_offset,
            header.total_len,
        );
        let expected = (
            layout.task_ring_offset as u64,
            layout.result_ring_offset as u64,
            layout.total_len as u64,
        );
        if advertised != expected {
            return Err(incompatible(format!(
                "ring offsets {advertised:?} do not match geometry {expected:?}"
            )));
        }
        if region.len() < layout.total_len {
            return Err(incompatible(format!(
                "region of {} bytes is shorter than advertised {}",
                region.len(),
                layout.total_len
            )));
        }
        let liveness_interval = Duration::from_micros(u64::from(header.liveness_us.max(1)));

        let tasks = RingBuffer::attach(Arc::clone(&region), layout.task_ring_offset)?;
        let results = RingBuffer::attach(Arc::clone(&region), layout.result_ring_offset)?;
        if tasks.capacity() != layout.capacity || results.slot_size() != layout.slot_size as usize {
            return Err(incompatible("ring geometry disagrees with queue header"));
        }

        Ok(Self {
            region,
            tasks,
            results,
            liveness_interval,
        })
    }

    pub(crate) fn header(&self) -> &QueueHeader {
        // SAFETY: validated by `initialize`/`attach`.
        unsafe { self.region.view::<QueueHeader>(0) }
    }

    /// Wakes every waiter on both rings so blocked peers re-check liveness.
    pub(crate) fn wake_all(&self) {
        self.tasks.wake_all();
        self.results.wake_all();
    }
}

fn incompatible(reason: impl Into<String>) -> TransportError {
    TransportError::IncompatibleLayout {
        reason: reason.into(),
    }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + (align - 1)) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::{ErrorKind, RegionName};

    fn region(len: usize) -> Arc<SharedRegion> {
        let name = RegionName::unique("layout-test").unwrap();
        Arc::new(SharedRegion::create(&name, len).unwrap())
    }

    #[test]
    fn rings_follow_header_and_stay_aligned() {
        let layout = QueueLayout::new(3, 100).unwrap();
        assert_eq!(layout.task_ring_offset, HEADER_LEN);
        assert_eq!(layout.result_ring_offset % SLOT_ALIGNMENT, 0);
        assert!(layout.result_ring_offset > layout.task_ring_offset);
        assert!(layout.total_len > layout.result_ring_offset);
    }

    #[test]
    fn attach_reads_geometry_written_by_creator() {
        let config = QueueConfig::new(5, 48);
        let layout = QueueLayout::new(config.capacity, config.slot_size).unwrap();
        let region = region(layout.total_len);
        let created = QueueRegion::initialize(Arc::clone(&region), layout, &config).unwrap();
        assert_eq!(created.header().client.state(), PeerState::Attached);
        assert_eq!(created.header().client.pid(), std::process::id());
        assert_eq!(created.header().driver.state(), PeerState::Vacant);

        let opened = QueueRegion::attach(region).unwrap();
        assert_eq!(opened.tasks.capacity(), 5);
        assert_eq!(opened.results.slot_size(), 48);
        assert_eq!(opened.liveness_interval, config.liveness_interval);
    }

    #[test]
    fn unpublished_or_tampered_header_is_incompatible() {
        let config = QueueConfig::new(2, 16);
        let layout = QueueLayout::new(config.capacity, config.slot_size).unwrap();
        let region = region(layout.total_len);

        let err = QueueRegion::attach(Arc::clone(&region)).err().expect("no magic yet");
        assert_eq!(err.kind(), ErrorKind::IncompatibleLayout);

        QueueRegion::initialize(Arc::clone(&region), layout, &config).unwrap();
        // Bump the version in place, as a peer from a newer build would.
        unsafe {
            let header = region.as_ptr() as *mut QueueHeader;
            (*header).version = LAYOUT_VERSION + 1;
        }
        let err = QueueRegion::attach(region).err().expect("version mismatch");
        assert_eq!(err.kind(), ErrorKind::IncompatibleLayout);
    }

    #[test]
    fn claim_refuses_lost_race() {
        let block = PeerBlock {
            pid: AtomicU32::new(0),
            state: AtomicU32::new(PeerState::Vacant as u32),
        };
        block.claim(0, 10).unwrap();
        assert_eq!(block.claim(0, 11), Err(10));
        assert_eq!(block.state(), PeerState::Attached);
        block.detach();
        assert_eq!(block.state(), PeerState::Detached);
        block.claim(10, 12).unwrap();
        assert_eq!(block.pid(), 12);
    }
}
