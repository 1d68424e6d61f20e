use std::fmt;

/// Slot `kind` used for tasks on the task ring.
pub(crate) const KIND_TASK: u32 = 1;
/// Slot `kind` for a successful result on the result ring.
pub(crate) const KIND_DONE: u32 = 2;
/// Slot `kind` for a driver-reported failure on the result ring.
pub(crate) const KIND_FAILED: u32 = 3;

/// Client-assigned identifier of one task, unique per queue instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Wraps a raw id, e.g. one echoed back by a driver.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value carried in the slot header.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// A task as seen by the driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    id: TaskId,
    payload: Vec<u8>,
}

impl Task {
    pub(crate) fn new(id: TaskId, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    /// Id to pass back to [`crate::TaskQueueServer::post_result`].
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Opaque payload, byte-identical to what the client enqueued.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the task, returning its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// What the driver reports for a task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Finished; the bytes are returned to the client unchanged.
    Done(Vec<u8>),
    /// Failed with a driver-defined code.
    Failed { code: u32 },
}

impl TaskOutcome {
    pub(crate) fn kind(&self) -> u32 {
        match self {
            TaskOutcome::Done(_) => KIND_DONE,
            TaskOutcome::Failed { .. } => KIND_FAILED,
        }
    }

    pub(crate) fn code(&self) -> u32 {
        match self {
            TaskOutcome::Done(_) => 0,
            TaskOutcome::Failed { code } => *code,
        }
    }

    pub(crate) fn payload(&self) -> &[u8] {
        match self {
            TaskOutcome::Done(bytes) => bytes,
            TaskOutcome::Failed { .. } => &[],
        }
    }
}

/// Why a task did not complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    /// The driver died or detached before reporting a result.
    PeerLost,
    /// The driver reported a failure code.
    Driver { code: u32 },
    /// The id was never issued by this client or was already collected.
    UnknownTask,
}

/// Completion state of a task from the client's point of view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// Accepted but not yet answered.
    Pending,
    /// Answered with a result payload.
    Done(Vec<u8>),
    /// Answered with a failure or abandoned by a dead driver.
    Failed(FailureReason),
}

impl Status {
    /// True unless the task is still pending.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Pending)
    }
}

impl From<TaskOutcome> for Status {
    fn from(outcome: TaskOutcome) -> Self {
        match outcome {
            TaskOutcome::Done(bytes) => Status::Done(bytes),
            TaskOutcome::Failed { code } => Status::Failed(FailureReason::Driver { code }),
        }
    }
}
