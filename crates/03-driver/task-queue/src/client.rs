//! Producer side of the queue: owns the region, enqueues tasks, collects results.

use crate::layout::{PeerState, QueueLayout, QueueRegion};
use crate::liveness::{pid_alive, PeerStatus, PeerWatch, Side};
use crate::task::{TaskId, TaskOutcome, KIND_DONE, KIND_FAILED, KIND_TASK};
use crate::{EnqueueError, FailureReason, QueueConfig, QueueResult, Status};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use transport::{
    Deadline, ErrorKind, PeerLiveness, RegionName, SharedRegion, SlotEnvelope, SlotRecord, WaitError,
};

/// Results collected by one [`TaskQueueClient::drain_completions`] call.
pub type Completions = SmallVec<[(TaskId, Status); 8]>;

#[derive(Default)]
struct ClientLocal {
    next_id: u64,
    outstanding: HashSet<TaskId>,
    completed: HashMap<TaskId, TaskOutcome>,
}

#[derive(Default)]
struct QueueMetrics {
    enqueued: AtomicU64,
    full_timeouts: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl QueueMetrics {
    fn snapshot(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            full_timeouts: self.full_timeouts.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters for one client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Tasks accepted by `enqueue`.
    pub enqueued: u64,
    /// `enqueue` calls that gave up with `QueueFull`.
    pub full_timeouts: u64,
    /// Results received with `Done`.
    pub completed: u64,
    /// Results received with a driver failure code.
    pub failed: u64,
}

/// Creates the queue region and produces tasks into it.
///
/// Methods take `&self`; the producer and result-consumer roles are
/// serialized internally so the rings keep a single writer and reader.
pub struct TaskQueueClient {
    queue: QueueRegion,
    config: QueueConfig,
    driver: PeerWatch,
    local: Mutex<ClientLocal>,
    metrics: QueueMetrics,
}

impl TaskQueueClient {
    /// Creates a queue under `name`. Fails with `AlreadyExists` if the name is live.
    ///
    /// A queue whose creating client died without unlinking it is replaced.
    pub fn create(name: &RegionName, config: QueueConfig) -> QueueResult<Self> {
        config.validate()?;
        let layout = QueueLayout::new(config.capacity, config.slot_size)?;
        let region = match SharedRegion::create(name, layout.total_len) {
            Err(err) if err.kind() == ErrorKind::AlreadyExists && left_by_dead_client(name) => {
                tracing::warn!(queue = %name, "replacing queue left by a dead client");
                SharedRegion::unlink_stale(name)?;
                SharedRegion::create(name, layout.total_len)?
            }
            region => region?,
        };
        let region = Arc::new(region);
        let queue = QueueRegion::initialize(Arc::clone(&region), layout, &config)?;
        tracing::debug!(
            queue = %name,
            capacity = config.capacity,
            slot_size = config.slot_size,
            "created task queue"
        );
        Ok(Self {
            driver: PeerWatch::new(region, Side::Driver),
            queue,
            config,
            local: Mutex::new(ClientLocal::default()),
            metrics: QueueMetrics::default(),
        })
    }

    /// Creates a queue under a fresh `/<prefix>-<pid>-<random>` name.
    pub fn create_unique(prefix: &str, config: QueueConfig) -> QueueResult<Self> {
        let name = RegionName::unique(prefix)?;
        Self::create(&name, config)
    }

    /// Name the driver must open.
    pub fn name(&self) -> &RegionName {
        self.queue.region.name()
    }

    /// Configuration the queue was created with.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Adds an extra liveness source for the driver, typically the process
    /// manager's probe, so an unreaped crash is noticed.
    pub fn watch_driver(&mut self, probe: impl PeerLiveness + 'static) {
        self.driver.set_probe(Arc::new(probe));
    }

    /// Whether the driver is attached (or still expected) and running.
    pub fn is_driver_alive(&self) -> bool {
        self.driver.is_alive()
    }

    /// Pid of the attached driver, if any.
    pub fn driver_pid(&self) -> Option<u32> {
        match self.driver.status() {
            PeerStatus::Alive(pid) => Some(pid),
            PeerStatus::Pending | PeerStatus::Gone => None,
        }
    }

    /// Blocks until a driver attaches. Returns its pid.
    pub fn wait_for_driver(&self, timeout: Duration) -> Result<u32, WaitError> {
        let mut attached = None;
        self.queue.results.produced().wait_until(
            || {
                attached = self.driver_pid();
                attached.is_some()
            },
            timeout,
            &self.driver,
            self.config.liveness_interval,
        )?;
        attached.ok_or(WaitError::PeerLost)
    }

    /// Enqueues one task, blocking up to `timeout` while the ring is full.
    ///
    /// Results that arrive while blocked are collected so a driver stalled on
    /// a full result ring cannot deadlock the pair.
    pub fn enqueue(&self, payload: &[u8], timeout: Duration) -> Result<TaskId, EnqueueError> {
        let max = self.queue.tasks.slot_size();
        if payload.len() > max {
            return Err(EnqueueError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }
        if !self.is_driver_alive() {
            return Err(EnqueueError::PeerLost);
        }

        let deadline = Deadline::after(timeout);
        loop {
            if let Some(id) = self.try_enqueue(payload)? {
                return Ok(id);
            }
            self.collect_results();

            if deadline.is_expired() {
                self.metrics.full_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(EnqueueError::QueueFull { timeout });
            }
            let slice = deadline.remaining().min(self.config.liveness_interval);
            match self.queue.tasks.wait_for_consumed(
                slice,
                &self.driver,
                self.config.liveness_interval,
            ) {
                Ok(()) | Err(WaitError::TimedOut) => {}
                Err(WaitError::PeerLost) => {
                    tracing::warn!(queue = %self.name(), "driver lost while enqueueing");
                    return Err(EnqueueError::PeerLost);
                }
            }
        }
    }

    fn try_enqueue(&self, payload: &[u8]) -> Result<Option<TaskId>, EnqueueError> {
        let mut local = self.local.lock();
        let Some(slot) = self.queue.tasks.try_reserve_for_write() else {
            return Ok(None);
        };
        let id = TaskId::new(local.next_id);
        let envelope = SlotEnvelope {
            id: id.get(),
            kind: KIND_TASK,
            code: 0,
        };
        self.queue
            .tasks
            .commit_write(slot, envelope, payload)
            .map_err(|_| EnqueueError::PayloadTooLarge {
                len: payload.len(),
                max: self.queue.tasks.slot_size(),
            })?;
        local.next_id += 1;
        local.outstanding.insert(id);
        self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(%id, len = payload.len(), "enqueued task");
        Ok(Some(id))
    }

    /// Non-blocking completion check. A terminal status is reported once.
    ///
    /// Tasks outstanding when the driver is lost keep reporting
    /// `Failed(PeerLost)` but stay tracked: a replacement driver that takes
    /// over the queue is handed them again and may still answer. Use
    /// [`abandon`](Self::abandon) to stop tracking one.
    pub fn poll_completion(&self, id: TaskId) -> Status {
        let mut local = self.local.lock();
        self.drain_results(&mut local);
        if let Some(outcome) = local.completed.remove(&id) {
            return outcome.into();
        }
        if !local.outstanding.contains(&id) {
            return Status::Failed(FailureReason::UnknownTask);
        }
        if self.is_driver_alive() {
            Status::Pending
        } else {
            Status::Failed(FailureReason::PeerLost)
        }
    }

    /// Blocks until `id` completes, the driver is lost, or `timeout` elapses
    /// (then `Pending`).
    pub fn wait_completion(&self, id: TaskId, timeout: Duration) -> Status {
        let deadline = Deadline::after(timeout);
        loop {
            let status = self.poll_completion(id);
            if status.is_terminal() || deadline.is_expired() {
                return status;
            }
            // Any outcome just loops: the next poll drains, or reports PeerLost.
            let _ = self.queue.results.wait_for_produced(
                deadline.remaining(),
                &self.driver,
                self.config.liveness_interval,
            );
        }
    }

    /// Collects every available result and returns them, bypassing per-id polling.
    pub fn drain_completions(&self) -> Completions {
        let mut local = self.local.lock();
        self.drain_results(&mut local);
        local
            .completed
            .drain()
            .map(|(id, outcome)| (id, Status::from(outcome)))
            .collect()
    }

    /// Stops tracking `id`. A result that still arrives for it is discarded.
    /// Returns false if the task was not outstanding.
    pub fn abandon(&self, id: TaskId) -> bool {
        let mut local = self.local.lock();
        let removed = local.outstanding.remove(&id);
        local.completed.remove(&id);
        removed
    }

    /// Tasks accepted but not yet collected.
    pub fn pending(&self) -> usize {
        self.local.lock().outstanding.len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> QueueStats {
        self.metrics.snapshot()
    }

    /// Detaches from the queue so the driver's waits end with `PeerLost`.
    /// The region name stays reserved until the client is dropped. Idempotent.
    pub fn close(&self) {
        let block = &self.queue.header().client;
        if block.state() != PeerState::Detached {
            block.detach();
            self.queue.wake_all();
            tracing::debug!(queue = %self.name(), "client detached");
        }
    }

    fn collect_results(&self) {
        let mut local = self.local.lock();
        self.drain_results(&mut local);
    }

    fn drain_results(&self, local: &mut ClientLocal) {
        while let Some(record) = self.queue.results.try_pop() {
            let id = TaskId::new(record.envelope.id);
            if !local.outstanding.remove(&id) {
                tracing::warn!(%id, "dropping result for unknown task");
                continue;
            }
            let outcome = decode_outcome(record);
            match &outcome {
                TaskOutcome::Done(_) => self.metrics.completed.fetch_add(1, Ordering::Relaxed),
                TaskOutcome::Failed { .. } => self.metrics.failed.fetch_add(1, Ordering::Relaxed),
            };
            local.completed.insert(id, outcome);
        }
    }
}

/// An existing queue under `name` whose client pid no longer runs.
fn left_by_dead_client(name: &RegionName) -> bool {
    let Ok(region) = SharedRegion::open(name) else {
        return false;
    };
    match QueueRegion::attach(Arc::new(region)) {
        Ok(queue) => !pid_alive(queue.header().client.pid()),
        Err(_) => false,
    }
}

fn decode_outcome(record: SlotRecord) -> TaskOutcome {
    match record.envelope.kind {
        KIND_DONE => TaskOutcome::Done(record.payload),
        KIND_FAILED => TaskOutcome::Failed {
            code: record.envelope.code,
        },
        other => {
            tracing::warn!(kind = other, "result slot with unknown kind");
            TaskOutcome::Failed {
                code: record.envelope.code,
            }
        }
    }
}

impl Drop for TaskQueueClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TaskQueueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueueClient")
            .field("name", self.name())
            .field("config", &self.config)
            .field("driver", &self.driver)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn reaped_pid() -> u32 {
        let mut child = Command::new("/bin/true").spawn().expect("spawn /bin/true");
        let pid = child.id();
        child.wait().expect("reap");
        pid
    }

    #[test]
    fn queue_left_by_dead_client_is_replaced() {
        let name = RegionName::unique("tq-stale").unwrap();
        let crashed = TaskQueueClient::create(&name, QueueConfig::new(2, 8)).unwrap();
        crashed.queue.header().client.attach(reaped_pid());
        crashed.enqueue(b"old", Duration::ZERO).unwrap();
        // A crashed creator never runs its destructor.
        std::mem::forget(crashed);

        let fresh = TaskQueueClient::create(&name, QueueConfig::new(4, 8)).expect("replace");
        assert_eq!(fresh.queue.tasks.capacity(), 4);
        assert!(fresh.queue.tasks.is_empty());
        assert_eq!(fresh.queue.header().client.pid(), std::process::id());
    }

    #[test]
    fn queue_of_live_client_is_kept() {
        let name = RegionName::unique("tq-live").unwrap();
        let live = TaskQueueClient::create(&name, QueueConfig::new(2, 8)).unwrap();
        let err = TaskQueueClient::create(&name, QueueConfig::new(2, 8)).expect_err("in use");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert!(live.queue.header().client.state() == PeerState::Attached);
    }
}
