//! Fixed-slot single-producer/single-consumer ring living in a shared region.
//!
//! Layout (offsets relative to the ring's base inside the region):
//!
//! ```text
//! +---------------------------+----------------------------------------------+
//! | RingHeader (64 bytes)     | capacity × slot (stride = align64(32 + size)) |
//! +---------------------------+----------------------------------------------+
//!   magic, geometry,            slot: [state u32][len u32][id u64]
//!   reserved_head, head,              [kind u32][code u32][reserved u64]
//!   reserved_tail, tail,              [payload: slot_size bytes ...]
//!   produced/consumed futexes
//! ```
//!
//! Counters are monotonically increasing 64-bit sequences taken modulo the
//! capacity. They wrap at `wrap = capacity * (u64::MAX / capacity)`, the largest
//! multiple of the capacity that fits, so the modulo mapping stays continuous
//! across the wrap for any capacity.
//!
//! Producers reserve a slot, copy the payload, flip the slot to `Filled`, and
//! only then publish `head` with `Release`. Consumers load `head` with
//! `Acquire` before touching a slot, so a published index always implies a
//! fully written payload. The tail side mirrors this for slot reuse.

use crate::region::SharedRegion;
use crate::sync::{PeerLiveness, Signal, WaitError};
use crate::{TransportError, TransportResult};
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Alignment enforced for every slot and for the ring header.
pub const SLOT_ALIGNMENT: usize = 64;
/// Bytes reserved in front of each slot's payload.
pub const SLOT_HEADER_LEN: usize = size_of::<SlotHeader>();
/// Size of the ring header in bytes.
pub const RING_HEADER_LEN: usize = size_of::<RingHeader>();
/// Upper bound on the number of slots in one ring.
pub const MAX_CAPACITY: u32 = 1 << 20;
/// Upper bound on a single slot's payload.
pub const MAX_SLOT_SIZE: u32 = 64 << 20;

const RING_MAGIC: u64 = 0x5348_4D52_494E_4731; // "SHMRING1"

#[repr(C, align(64))]
struct RingHeader {
    magic: AtomicU64,
    capacity: u32,
    slot_size: u32,
    slot_stride: u32,
    pad: u32,
    wrap: u64,
    reserved_head: AtomicU64,
    head: AtomicU64,
    reserved_tail: AtomicU64,
    tail: AtomicU64,
    produced: AtomicU32,
    consumed: AtomicU32,
}

impl RingHeader {
    fn new(geometry: Geometry) -> Self {
        Self {
            magic: AtomicU64::new(0),
            capacity: geometry.capacity,
            slot_size: geometry.slot_size,
            slot_stride: geometry.stride as u32,
            pad: 0,
            wrap: geometry.wrap,
            reserved_head: AtomicU64::new(0),
            head: AtomicU64::new(0),
            reserved_tail: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            produced: AtomicU32::new(0),
            consumed: AtomicU32::new(0),
        }
    }
}

#[repr(C, align(8))]
struct SlotHeader {
    state: AtomicU32,
    len: AtomicU32,
    id: AtomicU64,
    kind: AtomicU32,
    code: AtomicU32,
    reserved: AtomicU64,
}

/// Lifecycle of a slot. Transitions are strictly
/// `Empty → Filled → InProgress → Done → Empty`; the producer owns `Filled`
/// and `Empty`, the consumer owns `InProgress` and `Done`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Free for the producer.
    Empty = 0,
    /// Payload written and published.
    Filled = 1,
    /// Claimed by the consumer, payload being copied out.
    InProgress = 2,
    /// Consumed; the producer recycles it to `Empty` on its next lap.
    Done = 3,
}

impl SlotState {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(SlotState::Empty),
            1 => Some(SlotState::Filled),
            2 => Some(SlotState::InProgress),
            3 => Some(SlotState::Done),
            _ => None,
        }
    }
}

/// Per-slot metadata that travels with the payload.
///
/// The ring does not interpret these fields; higher layers use them for task
/// identifiers and result status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotEnvelope {
    /// Caller-defined identifier (task id).
    pub id: u64,
    /// Caller-defined discriminant.
    pub kind: u32,
    /// Caller-defined status code.
    pub code: u32,
}

/// A slot reserved for writing. Must be handed back to [`RingBuffer::commit_write`].
#[must_use = "a reserved slot stalls the ring until it is committed"]
#[derive(Debug, PartialEq, Eq)]
pub struct WriteSlot {
    seq: u64,
    index: u32,
}

impl WriteSlot {
    /// Position of the slot inside the ring.
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// A slot reserved for reading. Must be handed back to [`RingBuffer::commit_read`].
#[must_use = "a reserved slot stalls the ring until it is committed"]
#[derive(Debug, PartialEq, Eq)]
pub struct ReadSlot {
    seq: u64,
    index: u32,
}

impl ReadSlot {
    /// Position of the slot inside the ring.
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Owned copy of a slot's contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotRecord {
    /// Metadata written by the producer.
    pub envelope: SlotEnvelope,
    /// Payload bytes, exactly as committed.
    pub payload: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Geometry {
    capacity: u32,
    slot_size: u32,
    stride: usize,
    wrap: u64,
}

impl Geometry {
    fn new(capacity: u32, slot_size: u32) -> TransportResult<Self> {
        if capacity == 0 || capacity > MAX_CAPACITY || slot_size > MAX_SLOT_SIZE {
            return Err(TransportError::InvalidCapacity {
                capacity,
                slot_size,
            });
        }
        let stride = align_up(SLOT_HEADER_LEN + slot_size as usize, SLOT_ALIGNMENT);
        let cap = u64::from(capacity);
        Ok(Self {
            capacity,
            slot_size,
            stride,
            wrap: cap * (u64::MAX / cap),
        })
    }

    fn byte_len(&self) -> usize {
        RING_HEADER_LEN + self.stride * self.capacity as usize
    }
}

/// Bounded FIFO of fixed-size slots inside a [`SharedRegion`].
///
/// One process initializes the ring; the peer attaches and reads the geometry
/// back from the embedded header. At most one producer and one consumer may
/// use a ring at a time.
#[derive(Debug)]
pub struct RingBuffer {
    region: Arc<SharedRegion>,
    offset: usize,
    geometry: Geometry,
}

impl RingBuffer {
    /// Number of bytes a ring with this geometry occupies.
    pub fn byte_len(capacity: u32, slot_size: u32) -> TransportResult<usize> {
        Geometry::new(capacity, slot_size).map(|g| g.byte_len())
    }

    /// Writes a fresh ring header at `offset`. Only the region creator calls this.
    pub fn initialize(
        region: Arc<SharedRegion>,
        offset: usize,
        capacity: u32,
        slot_size: u32,
    ) -> TransportResult<Self> {
        let geometry = Geometry::new(capacity, slot_size)?;
        check_bounds(&region, offset, geometry.byte_len())?;

        // SAFETY: bounds and alignment were checked above; the peer has not
        // been told the region name yet, so nobody else reads these bytes.
        unsafe {
            let header = region.as_ptr().add(offset) as *mut RingHeader;
            header.write(RingHeader::new(geometry));
        }
        let ring = Self {
            region,
            offset,
            geometry,
        };
        ring.header().magic.store(RING_MAGIC, Ordering::Release);
        Ok(ring)
    }

    /// Attaches to a ring initialized by the peer, validating its header.
    pub fn attach(region: Arc<SharedRegion>, offset: usize) -> TransportResult<Self> {
        check_bounds(&region, offset, RING_HEADER_LEN)?;
        // SAFETY: bounds and alignment checked; the header only holds integers.
        let header = unsafe { region.view::<RingHeader>(offset) };
        let magic = header.magic.load(Ordering::Acquire);
        if magic != RING_MAGIC {
            return Err(TransportError::incompatible(format!(
                "ring at offset {offset} has magic {magic:#x}"
            )));
        }

        let geometry = Geometry::new(header.capacity, header.slot_size)
            .map_err(|err| TransportError::incompatible(err.to_string()))?;
        if header.slot_stride as usize != geometry.stride || header.wrap != geometry.wrap {
            return Err(TransportError::incompatible(format!(
                "ring geometry mismatch: stride {} wrap {}",
                header.slot_stride, header.wrap
            )));
        }
        check_bounds(&region, offset, geometry.byte_len())?;

        Ok(Self {
            region,
            offset,
            geometry,
        })
    }

    /// Number of slots.
    pub fn capacity(&self) -> u32 {
        self.geometry.capacity
    }

    /// Maximum payload bytes per slot.
    pub fn slot_size(&self) -> usize {
        self.geometry.slot_size as usize
    }

    /// Published entries not yet released by the consumer.
    pub fn len(&self) -> u32 {
        let header = self.header();
        let head = header.head.load(Ordering::Acquire);
        let tail = header.tail.load(Ordering::Acquire);
        self.distance(head, tail) as u32
    }

    /// Returns true when no published entry is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true when every slot is reserved or occupied.
    pub fn is_full(&self) -> bool {
        !self.has_space()
    }

    /// Claims the next slot for writing; `None` when the ring is full.
    pub fn try_reserve_for_write(&self) -> Option<WriteSlot> {
        let header = self.header();
        let reserved = header.reserved_head.load(Ordering::Relaxed);
        let tail = header.tail.load(Ordering::Acquire);
        if self.distance(reserved, tail) >= u64::from(self.geometry.capacity) {
            return None;
        }
        header
            .reserved_head
            .compare_exchange(
                reserved,
                self.advance(reserved),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .ok()?;

        let index = self.index_of(reserved);
        let slot = self.slot_header(index);
        match self.state_of(slot) {
            Some(SlotState::Done) => slot.state.store(SlotState::Empty as u32, Ordering::Relaxed),
            Some(SlotState::Empty) => {}
            other => debug_assert!(false, "slot {index} reserved in state {other:?}"),
        }
        Some(WriteSlot {
            seq: reserved,
            index,
        })
    }

    /// Copies `payload` into a reserved slot and publishes it.
    ///
    /// An oversized payload releases the reservation and fails with
    /// `PayloadTooLarge`; nothing is published.
    pub fn commit_write(
        &self,
        slot: WriteSlot,
        envelope: SlotEnvelope,
        payload: &[u8],
    ) -> TransportResult<()> {
        let header = self.header();
        if payload.len() > self.slot_size() {
            let _ = header.reserved_head.compare_exchange(
                self.advance(slot.seq),
                slot.seq,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
            return Err(TransportError::PayloadTooLarge {
                len: payload.len(),
                max: self.slot_size(),
            });
        }

        let meta = self.slot_header(slot.index);
        meta.len.store(payload.len() as u32, Ordering::Relaxed);
        meta.id.store(envelope.id, Ordering::Relaxed);
        meta.kind.store(envelope.kind, Ordering::Relaxed);
        meta.code.store(envelope.code, Ordering::Relaxed);
        // SAFETY: the slot was reserved by this producer and is not visible to
        // the consumer until `head` moves past it.
        unsafe {
            ptr::copy_nonoverlapping(payload.as_ptr(), self.payload_ptr(slot.index), payload.len());
        }
        meta.state.store(SlotState::Filled as u32, Ordering::Release);

        debug_assert_eq!(header.head.load(Ordering::Relaxed), slot.seq);
        header
            .head
            .store(self.advance(slot.seq), Ordering::Release);
        self.signal_produced();
        Ok(())
    }

    /// Claims the oldest published slot; `None` when the ring is empty.
    pub fn try_reserve_for_read(&self) -> Option<ReadSlot> {
        let header = self.header();
        let reserved = header.reserved_tail.load(Ordering::Relaxed);
        let head = header.head.load(Ordering::Acquire);
        if reserved == head {
            return None;
        }
        header
            .reserved_tail
            .compare_exchange(
                reserved,
                self.advance(reserved),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .ok()?;

        let index = self.index_of(reserved);
        let slot = self.slot_header(index);
        debug_assert_eq!(self.state_of(slot), Some(SlotState::Filled));
        slot.state
            .store(SlotState::InProgress as u32, Ordering::Relaxed);
        Some(ReadSlot {
            seq: reserved,
            index,
        })
    }

    /// Copies the contents of a slot reserved for reading.
    pub fn read(&self, slot: &ReadSlot) -> SlotRecord {
        let meta = self.slot_header(slot.index);
        let len = (meta.len.load(Ordering::Relaxed) as usize).min(self.slot_size());
        let envelope = SlotEnvelope {
            id: meta.id.load(Ordering::Relaxed),
            kind: meta.kind.load(Ordering::Relaxed),
            code: meta.code.load(Ordering::Relaxed),
        };
        let mut payload = vec![0u8; len];
        // SAFETY: the producer finished writing before publishing `head`,
        // which we observed with `Acquire` when reserving.
        unsafe {
            ptr::copy_nonoverlapping(self.payload_ptr(slot.index), payload.as_mut_ptr(), len);
        }
        SlotRecord { envelope, payload }
    }

    /// Releases a slot after its payload has been copied out.
    pub fn commit_read(&self, slot: ReadSlot) {
        let header = self.header();
        self.slot_header(slot.index)
            .state
            .store(SlotState::Done as u32, Ordering::Release);
        debug_assert_eq!(header.tail.load(Ordering::Relaxed), slot.seq);
        header
            .tail
            .store(self.advance(slot.seq), Ordering::Release);
        self.signal_consumed();
    }

    /// Reserve, copy, and release in one step.
    pub fn try_pop(&self) -> Option<SlotRecord> {
        let slot = self.try_reserve_for_read()?;
        let record = self.read(&slot);
        self.commit_read(slot);
        Some(record)
    }

    /// Hands read reservations left by a consumer that died mid-read back to the ring.
    ///
    /// `reserved_tail` rolls back to the published `tail` and every slot in
    /// between becomes `Filled` again, so those entries are redelivered in
    /// order. Returns the number of entries recovered. The caller must be the
    /// only consumer.
    pub fn recover_consumer(&self) -> u32 {
        let header = self.header();
        let tail = header.tail.load(Ordering::Acquire);
        let reserved = header.reserved_tail.swap(tail, Ordering::AcqRel);
        let abandoned = self.distance(reserved, tail).min(u64::from(self.geometry.capacity));

        let mut seq = tail;
        for _ in 0..abandoned {
            let slot = self.slot_header(self.index_of(seq));
            if matches!(
                self.state_of(slot),
                Some(SlotState::InProgress | SlotState::Done)
            ) {
                slot.state.store(SlotState::Filled as u32, Ordering::Release);
            }
            seq = self.advance(seq);
        }
        abandoned as u32
    }

    /// Discards write reservations left by a producer that died mid-write.
    ///
    /// `reserved_head` rolls back to the published `head` and the abandoned
    /// slots return to `Empty`; their contents were never visible to the
    /// consumer. Returns the number of slots reclaimed. The caller must be the
    /// only producer.
    pub fn recover_producer(&self) -> u32 {
        let header = self.header();
        let head = header.head.load(Ordering::Acquire);
        let reserved = header.reserved_head.swap(head, Ordering::AcqRel);
        let abandoned = self.distance(reserved, head).min(u64::from(self.geometry.capacity));

        let mut seq = head;
        for _ in 0..abandoned {
            self.slot_header(self.index_of(seq))
                .state
                .store(SlotState::Empty as u32, Ordering::Release);
            seq = self.advance(seq);
        }
        abandoned as u32
    }

    /// Current state of slot `index`.
    pub fn slot_state(&self, index: u32) -> Option<SlotState> {
        if index >= self.geometry.capacity {
            return None;
        }
        self.state_of(self.slot_header(index))
    }

    /// Signal bumped on every publish.
    pub fn produced(&self) -> Signal<'_> {
        Signal::new(&self.header().produced)
    }

    /// Signal bumped on every release.
    pub fn consumed(&self) -> Signal<'_> {
        Signal::new(&self.header().consumed)
    }

    /// Announces newly published data to the consumer.
    pub fn signal_produced(&self) {
        self.produced().notify();
    }

    /// Announces a freed slot to the producer.
    pub fn signal_consumed(&self) {
        self.consumed().notify();
    }

    /// Blocks until data is published, the peer is lost, or `timeout` elapses.
    pub fn wait_for_produced(
        &self,
        timeout: Duration,
        peer: &dyn PeerLiveness,
        poll: Duration,
    ) -> Result<(), WaitError> {
        self.produced()
            .wait_until(|| self.has_data(), timeout, peer, poll)
    }

    /// Blocks until a slot frees up, the peer is lost, or `timeout` elapses.
    pub fn wait_for_consumed(
        &self,
        timeout: Duration,
        peer: &dyn PeerLiveness,
        poll: Duration,
    ) -> Result<(), WaitError> {
        self.consumed()
            .wait_until(|| self.has_space(), timeout, peer, poll)
    }

    /// Wakes every waiter on both signals without changing ring state.
    pub fn wake_all(&self) {
        self.signal_produced();
        self.signal_consumed();
    }

    fn has_data(&self) -> bool {
        let header = self.header();
        header.reserved_tail.load(Ordering::Relaxed) != header.head.load(Ordering::Acquire)
    }

    fn has_space(&self) -> bool {
        let header = self.header();
        let reserved = header.reserved_head.load(Ordering::Relaxed);
        let tail = header.tail.load(Ordering::Acquire);
        self.distance(reserved, tail) < u64::from(self.geometry.capacity)
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: validated in `initialize`/`attach`; the region outlives `self`.
        unsafe { self.region.view::<RingHeader>(self.offset) }
    }

    fn slot_offset(&self, index: u32) -> usize {
        self.offset + RING_HEADER_LEN + index as usize * self.geometry.stride
    }

    fn slot_header(&self, index: u32) -> &SlotHeader {
        debug_assert!(index < self.geometry.capacity);
        // SAFETY: `index < capacity` keeps the slot inside the validated range;
        // slot offsets are multiples of SLOT_ALIGNMENT.
        unsafe { self.region.view::<SlotHeader>(self.slot_offset(index)) }
    }

    fn payload_ptr(&self, index: u32) -> *mut u8 {
        // SAFETY: payload bytes follow the slot header inside the same stride.
        unsafe {
            self.region
                .as_ptr()
                .add(self.slot_offset(index) + SLOT_HEADER_LEN)
        }
    }

    fn state_of(&self, slot: &SlotHeader) -> Option<SlotState> {
        SlotState::from_u32(slot.state.load(Ordering::Acquire))
    }

    fn index_of(&self, seq: u64) -> u32 {
        (seq % u64::from(self.geometry.capacity)) as u32
    }

    fn advance(&self, seq: u64) -> u64 {
        let next = seq + 1;
        if next == self.geometry.wrap {
            0
        } else {
            next
        }
    }

    fn distance(&self, ahead: u64, behind: u64) -> u64 {
        if ahead >= behind {
            ahead - behind
        } else {
            self.geometry.wrap - behind + ahead
        }
    }

    #[cfg(test)]
    fn seed_counters(&self, seq: u64) {
        let header = self.header();
        for counter in [
            &header.reserved_head,
            &header.head,
            &header.reserved_tail,
            &header.tail,
        ] {
            counter.store(seq, Ordering::Release);
        }
    }
}

fn check_bounds(region: &SharedRegion, offset: usize, len: usize) -> TransportResult<()> {
    if offset % SLOT_ALIGNMENT != 0 {
        return Err(TransportError::incompatible(format!(
            "ring offset {offset} is not {SLOT_ALIGNMENT}-byte aligned"
        )));
    }
    match offset.checked_add(len) {
        Some(end) if end <= region.len() => Ok(()),
        _ => Err(TransportError::incompatible(format!(
            "ring [{offset}, +{len}) exceeds region of {} bytes",
            region.len()
        ))),
    }
}

fn align_up(value: usize, align: usize) -> usize {
    assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

#[cfg(test)]
mod tests {
    //! Unit coverage for the shared slot ring.
    use super::*;
    use crate::region::RegionName;
    use crate::sync::AlwaysAlive;
    use crate::ErrorKind;
    use rand::prelude::*;
    use std::collections::VecDeque;
    use std::thread;

    const POLL: Duration = Duration::from_millis(5);

    fn ring(capacity: u32, slot_size: u32) -> RingBuffer {
        let len = RingBuffer::byte_len(capacity, slot_size).expect("geometry");
        let name = RegionName::unique("ring-test").expect("name");
        let region = Arc::new(SharedRegion::create(&name, len).expect("create region"));
        RingBuffer::initialize(region, 0, capacity, slot_size).expect("init ring")
    }

    fn push(ring: &RingBuffer, id: u64, payload: &[u8]) -> bool {
        match ring.try_reserve_for_write() {
            Some(slot) => {
                let envelope = SlotEnvelope {
                    id,
                    ..SlotEnvelope::default()
                };
                ring.commit_write(slot, envelope, payload).expect("commit");
                true
            }
            None => false,
        }
    }

    #[test]
    fn single_record_round_trip() {
        let ring = ring(4, 64);
        let envelope = SlotEnvelope {
            id: 42,
            kind: 7,
            code: 9,
        };
        let slot = ring.try_reserve_for_write().expect("reserve");
        ring.commit_write(slot, envelope, b"hello shm ring").unwrap();

        let record = ring.try_pop().expect("record");
        assert_eq!(record.envelope, envelope);
        assert_eq!(record.payload, b"hello shm ring");
        assert!(ring.try_pop().is_none());
    }

    #[test]
    fn abandoned_reads_are_redelivered_in_order() {
        let ring = ring(4, 16);
        for id in 1..=3u64 {
            assert!(push(&ring, id, format!("T{id}").as_bytes()));
        }
        // A consumer that dies after claiming one slot and releasing nothing,
        // and one that dies halfway through `commit_read`.
        let first = ring.try_reserve_for_read().expect("T1");
        let second = ring.try_reserve_for_read().expect("T2");
        ring.slot_header(second.index())
            .state
            .store(SlotState::Done as u32, Ordering::Release);
        assert_eq!(ring.slot_state(first.index()), Some(SlotState::InProgress));

        assert_eq!(ring.recover_consumer(), 2);
        assert_eq!(ring.slot_state(first.index()), Some(SlotState::Filled));
        assert_eq!(ring.slot_state(second.index()), Some(SlotState::Filled));

        let ids: Vec<u64> = std::iter::from_fn(|| ring.try_pop())
            .map(|record| record.envelope.id)
            .collect();
        assert_eq!(ids, [1, 2, 3]);
        assert_eq!(ring.recover_consumer(), 0);
    }

    #[test]
    fn abandoned_writes_are_discarded() {
        let ring = ring(2, 16);
        assert!(push(&ring, 1, b"kept"));
        let lost = ring.try_reserve_for_write().expect("reserve");
        ring.slot_header(lost.index())
            .state
            .store(SlotState::Filled as u32, Ordering::Release);
        assert!(ring.is_full());

        assert_eq!(ring.recover_producer(), 1);
        assert_eq!(ring.slot_state(lost.index()), Some(SlotState::Empty));
        assert!(!ring.is_full());
        assert_eq!(ring.try_pop().map(|r| r.envelope.id), Some(1));
        assert!(ring.try_pop().is_none());

        assert!(push(&ring, 2, b"after"));
        assert_eq!(ring.try_pop().map(|r| r.payload), Some(b"after".to_vec()));
    }

    #[test]
    fn recovery_across_the_counter_wrap() {
        let ring = ring(3, 8);
        ring.seed_counters(ring.geometry.wrap - 1);
        assert!(push(&ring, 10, b"a"));
        assert!(push(&ring, 11, b"b"));
        let _dead = ring.try_reserve_for_read().expect("claim");
        let _dead = ring.try_reserve_for_read().expect("claim");

        assert_eq!(ring.recover_consumer(), 2);
        assert_eq!(ring.try_pop().map(|r| r.envelope.id), Some(10));
        assert_eq!(ring.try_pop().map(|r| r.envelope.id), Some(11));
    }

    #[test]
    fn backpressure_on_full_for_every_small_capacity() {
        for capacity in 1..=9u32 {
            let ring = ring(capacity, 16);
            for id in 0..capacity {
                assert!(push(&ring, u64::from(id), &[id as u8]), "cap {capacity}");
            }
            assert!(ring.is_full());
            assert!(ring.try_reserve_for_write().is_none(), "cap {capacity}");
            assert_eq!(ring.len(), capacity);

            ring.try_pop().expect("pop one");
            assert!(push(&ring, 99, b"x"), "space after pop, cap {capacity}");
        }
    }

    #[test]
    fn slot_states_follow_lifecycle() {
        let ring = ring(2, 16);
        assert_eq!(ring.slot_state(0), Some(SlotState::Empty));

        let slot = ring.try_reserve_for_write().unwrap();
        ring.commit_write(slot, SlotEnvelope::default(), b"a").unwrap();
        assert_eq!(ring.slot_state(0), Some(SlotState::Filled));

        let read = ring.try_reserve_for_read().unwrap();
        assert_eq!(ring.slot_state(0), Some(SlotState::InProgress));
        ring.commit_read(read);
        assert_eq!(ring.slot_state(0), Some(SlotState::Done));

        // Second lap over slot 0 recycles it.
        assert!(push(&ring, 1, b"b"));
        let slot = ring.try_reserve_for_write().unwrap();
        assert_eq!(slot.index(), 0);
        assert_eq!(ring.slot_state(0), Some(SlotState::Empty));
        ring.commit_write(slot, SlotEnvelope::default(), b"c").unwrap();
        assert_eq!(ring.slot_state(4), None);
    }

    #[test]
    fn oversized_payload_is_rejected_and_releases_reservation() {
        let ring = ring(1, 8);
        let slot = ring.try_reserve_for_write().unwrap();
        let err = ring
            .commit_write(slot, SlotEnvelope::default(), &[0u8; 9])
            .expect_err("too large");
        assert_eq!(err.kind(), ErrorKind::PayloadTooLarge);
        assert!(ring.is_empty());
        assert!(push(&ring, 1, &[1u8; 8]), "reservation was released");
    }

    #[test]
    fn counters_wrap_at_capacity_multiple() {
        for capacity in [1u32, 3, 4, 7] {
            let ring = ring(capacity, 8);
            let wrap = ring.geometry.wrap;
            assert_eq!(wrap % u64::from(capacity), 0);
            ring.seed_counters(wrap - 2);

            let mut expected = VecDeque::new();
            for id in 0..20u64 {
                if !push(&ring, id, &id.to_le_bytes()) {
                    let record = ring.try_pop().expect("pop when full");
                    assert_eq!(Some(record.envelope.id), expected.pop_front());
                    assert!(push(&ring, id, &id.to_le_bytes()));
                }
                expected.push_back(id);
            }
            while let Some(record) = ring.try_pop() {
                assert_eq!(Some(record.envelope.id), expected.pop_front());
            }
            assert!(expected.is_empty(), "cap {capacity}");
        }
    }

    #[test]
    fn attach_reads_geometry_from_header() {
        let producer = ring(5, 100);
        let attached = RingBuffer::attach(Arc::clone(&producer.region), 0).expect("attach");
        assert_eq!(attached.capacity(), 5);
        assert_eq!(attached.slot_size(), 100);

        assert!(push(&producer, 3, b"from creator"));
        let record = attached.try_pop().expect("shared contents");
        assert_eq!(record.payload, b"from creator");
    }

    #[test]
    fn attach_rejects_corrupt_or_misaligned_headers() {
        let ring = ring(2, 16);
        let err = RingBuffer::attach(Arc::clone(&ring.region), 8).expect_err("misaligned");
        assert_eq!(err.kind(), ErrorKind::IncompatibleLayout);

        let err = RingBuffer::attach(Arc::clone(&ring.region), 64).expect_err("no ring there");
        assert_eq!(err.kind(), ErrorKind::IncompatibleLayout);

        ring.header().magic.store(0xBAD, Ordering::Release);
        let err = RingBuffer::attach(Arc::clone(&ring.region), 0).expect_err("bad magic");
        assert_eq!(err.kind(), ErrorKind::IncompatibleLayout);
    }

    #[test]
    fn invalid_geometry_is_refused() {
        assert!(RingBuffer::byte_len(0, 64).is_err());
        assert!(RingBuffer::byte_len(MAX_CAPACITY + 1, 64).is_err());
        assert!(RingBuffer::byte_len(1, MAX_SLOT_SIZE + 1).is_err());
        assert_eq!(
            RingBuffer::byte_len(2, 32).unwrap(),
            RING_HEADER_LEN + 2 * 64
        );
    }

    #[test]
    fn empty_wait_times_out_and_full_wait_times_out() {
        let ring = ring(1, 8);
        assert_eq!(
            ring.wait_for_produced(Duration::from_millis(20), &AlwaysAlive, POLL),
            Err(WaitError::TimedOut)
        );
        assert!(push(&ring, 0, b"x"));
        assert_eq!(
            ring.wait_for_consumed(Duration::from_millis(20), &AlwaysAlive, POLL),
            Err(WaitError::TimedOut)
        );
        assert_eq!(
            ring.wait_for_produced(Duration::ZERO, &AlwaysAlive, POLL),
            Ok(())
        );
    }

    /// Randomised two-thread stress covering wrap-around, FIFO order, and data retention.
    #[test]
    fn threaded_fifo_stress() {
        const COUNT: u64 = 5_000;
        let producer = ring(8, 256);
        let consumer = RingBuffer::attach(Arc::clone(&producer.region), 0).unwrap();

        let writer = thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(0xC0FFEE);
            for id in 0..COUNT {
                let len = rng.gen_range(0..=256);
                let payload: Vec<u8> = (0..len).map(|i| (id as usize + i) as u8).collect();
                loop {
                    if let Some(slot) = producer.try_reserve_for_write() {
                        let envelope = SlotEnvelope {
                            id,
                            kind: len as u32,
                            code: 0,
                        };
                        producer.commit_write(slot, envelope, &payload).unwrap();
                        break;
                    }
                    producer
                        .wait_for_consumed(Duration::from_secs(5), &AlwaysAlive, POLL)
                        .expect("consumer keeps draining");
                }
            }
        });

        for expected in 0..COUNT {
            let record = loop {
                if let Some(record) = consumer.try_pop() {
                    break record;
                }
                consumer
                    .wait_for_produced(Duration::from_secs(5), &AlwaysAlive, POLL)
                    .expect("producer keeps writing");
            };
            assert_eq!(record.envelope.id, expected);
            assert_eq!(record.payload.len(), record.envelope.kind as usize);
            for (i, byte) in record.payload.iter().enumerate() {
                assert_eq!(*byte, (expected as usize + i) as u8);
            }
        }
        writer.join().unwrap();
        assert!(consumer.is_empty());
    }
}
