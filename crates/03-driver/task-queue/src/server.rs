//! Driver side of the queue: opens the client's region, consumes tasks, posts results.

use crate::layout::{PeerState, QueueRegion};
use crate::liveness::{pid_alive, PeerWatch, Side};
use crate::task::{Task, TaskId, TaskOutcome};
use crate::{DequeueError, PostError, QueueError, QueueResult};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use transport::{
    Deadline, PeerLiveness, RegionName, SharedRegion, SlotEnvelope, TransportError, WaitError,
};

/// Why [`TaskQueueServer::serve`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServeExit {
    /// The client died or detached.
    ClientLost,
    /// The handler asked to stop.
    Stopped,
}

/// Summary of a [`TaskQueueServer::serve`] run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServeReport {
    /// Results posted.
    pub served: u64,
    /// What ended the loop.
    pub exit: ServeExit,
}

/// Attached driver endpoint. Exactly one may exist per queue.
pub struct TaskQueueServer {
    queue: QueueRegion,
    client: PeerWatch,
    pid: u32,
}

impl TaskQueueServer {
    /// Opens the queue the client created under `name` and claims the driver slot.
    ///
    /// Fails with `NotFound` if no such queue exists, `IncompatibleLayout` if
    /// its header does not validate, and `AlreadyExists` if a live driver is
    /// already attached. A slot held by a dead or detached driver is taken over;
    /// tasks it had claimed but not released are delivered again, in order.
    pub fn open(name: &RegionName) -> QueueResult<Self> {
        let region = Arc::new(SharedRegion::open(name)?);
        let queue = QueueRegion::attach(Arc::clone(&region))?;
        let header = queue.header();

        if header.client.state() == PeerState::Detached {
            return Err(QueueError::ClientGone {
                name: name.to_string(),
            });
        }

        let pid = std::process::id();
        let holder = header.driver.pid();
        if header.driver.state() == PeerState::Attached && pid_alive(holder) {
            return Err(QueueError::DriverAttached { pid: holder });
        }
        header
            .driver
            .claim(holder, pid)
            .map_err(|pid| QueueError::DriverAttached { pid })?;
        if holder != 0 {
            tracing::warn!(queue = %name, previous = holder, "took over driver slot");
        }
        // The previous holder may have died between reserving and committing.
        let redelivered = queue.tasks.recover_consumer();
        let discarded = queue.results.recover_producer();
        if redelivered + discarded > 0 {
            tracing::warn!(
                queue = %name,
                redelivered,
                discarded,
                "recovered slots abandoned by previous driver"
            );
        }
        queue.wake_all();
        tracing::debug!(queue = %name, pid, "driver attached");

        Ok(Self {
            queue,
            client: PeerWatch::new(region, Side::Client),
            pid,
        })
    }

    /// Like [`open`](Self::open) but also insists on a specific geometry.
    pub fn open_expecting(name: &RegionName, capacity: u32, slot_size: u32) -> QueueResult<Self> {
        let server = Self::open(name)?;
        let found = (server.capacity(), server.slot_size() as u32);
        if found != (capacity, slot_size) {
            return Err(TransportError::IncompatibleLayout {
                reason: format!(
                    "queue {name} has capacity/slot_size {found:?}, expected {:?}",
                    (capacity, slot_size)
                ),
            }
            .into());
        }
        Ok(server)
    }

    /// Slots per ring, as advertised by the client.
    pub fn capacity(&self) -> u32 {
        self.queue.tasks.capacity()
    }

    /// Largest task or result payload.
    pub fn slot_size(&self) -> usize {
        self.queue.tasks.slot_size()
    }

    /// Poll slice between liveness checks, as chosen by the client.
    pub fn liveness_interval(&self) -> Duration {
        self.queue.liveness_interval
    }

    /// Pid recorded in the driver block.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the client is still attached and running.
    pub fn is_client_alive(&self) -> bool {
        self.client.is_alive()
    }

    /// Takes the oldest task, blocking up to `timeout` while the ring is empty.
    ///
    /// Tasks the client committed before dying are still delivered; `PeerLost`
    /// is reported only once the ring is drained.
    pub fn dequeue(&mut self, timeout: Duration) -> Result<Task, DequeueError> {
        let deadline = Deadline::after(timeout);
        loop {
            if let Some(record) = self.queue.tasks.try_pop() {
                let id = TaskId::new(record.envelope.id);
                tracing::trace!(%id, len = record.payload.len(), "dequeued task");
                return Ok(Task::new(id, record.payload));
            }
            let remaining = deadline.remaining();
            match self.queue.tasks.wait_for_produced(
                remaining,
                &self.client,
                self.queue.liveness_interval,
            ) {
                Ok(()) => {}
                Err(WaitError::TimedOut) => return Err(DequeueError::QueueEmpty { timeout }),
                Err(WaitError::PeerLost) => {
                    tracing::warn!(queue = %self.queue.region.name(), "client lost while dequeueing");
                    return Err(DequeueError::PeerLost);
                }
            }
        }
    }

    /// Reports the outcome of `id`, blocking up to `timeout` while the result ring is full.
    pub fn post_result(
        &mut self,
        id: TaskId,
        outcome: TaskOutcome,
        timeout: Duration,
    ) -> Result<(), PostError> {
        let payload = outcome.payload();
        let max = self.queue.results.slot_size();
        if payload.len() > max {
            return Err(PostError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }
        if !self.is_client_alive() {
            return Err(PostError::PeerLost);
        }

        let envelope = SlotEnvelope {
            id: id.get(),
            kind: outcome.kind(),
            code: outcome.code(),
        };
        let deadline = Deadline::after(timeout);
        loop {
            if let Some(slot) = self.queue.results.try_reserve_for_write() {
                self.queue
                    .results
                    .commit_write(slot, envelope, payload)
                    .map_err(|_| PostError::PayloadTooLarge {
                        len: payload.len(),
                        max,
                    })?;
                tracing::trace!(%id, kind = envelope.kind, "posted result");
                return Ok(());
            }
            let remaining = deadline.remaining();
            match self.queue.results.wait_for_consumed(
                remaining,
                &self.client,
                self.queue.liveness_interval,
            ) {
                Ok(()) => {}
                Err(WaitError::TimedOut) => return Err(PostError::ResultQueueFull { timeout }),
                Err(WaitError::PeerLost) => return Err(PostError::PeerLost),
            }
        }
    }

    /// Runs dequeue → `handler` → post until the client goes away or the
    /// handler breaks. A task the handler breaks on gets no result.
    pub fn serve<F>(
        &mut self,
        result_timeout: Duration,
        mut handler: F,
    ) -> Result<ServeReport, PostError>
    where
        F: FnMut(&Task) -> ControlFlow<(), TaskOutcome>,
    {
        let mut served = 0;
        loop {
            let task = match self.dequeue(self.queue.liveness_interval) {
                Ok(task) => task,
                Err(DequeueError::QueueEmpty { .. }) => continue,
                Err(DequeueError::PeerLost) => {
                    return Ok(ServeReport {
                        served,
                        exit: ServeExit::ClientLost,
                    })
                }
            };
            let outcome = match handler(&task) {
                ControlFlow::Continue(outcome) => outcome,
                ControlFlow::Break(()) => {
                    return Ok(ServeReport {
                        served,
                        exit: ServeExit::Stopped,
                    })
                }
            };
            match self.post_result(task.id(), outcome, result_timeout) {
                Ok(()) => served += 1,
                Err(PostError::PeerLost) => {
                    return Ok(ServeReport {
                        served,
                        exit: ServeExit::ClientLost,
                    })
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Drop for TaskQueueServer {
    fn drop(&mut self) {
        let block = &self.queue.header().driver;
        if block.pid() == self.pid {
            block.detach();
        }
        self.queue.wake_all();
        tracing::debug!(queue = %self.queue.region.name(), "driver detached");
    }
}

impl std::fmt::Debug for TaskQueueServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueueServer")
            .field("name", self.queue.region.name())
            .field("pid", &self.pid)
            .field("client", &self.client)
            .finish()
    }
}
