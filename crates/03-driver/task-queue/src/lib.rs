//! Shared-memory task queue between a client process and its driver process.
//!
//! The client creates a named region holding a header and two rings: tasks
//! flow client → driver, results flow driver → client. Either side detects the
//! other's death through the header's peer blocks plus a pid probe, so no
//! blocking call outlives its peer by more than one liveness interval.
//!
//! ```no_run
//! use std::time::Duration;
//! use task_queue::{QueueConfig, Status, TaskOutcome, TaskQueueClient, TaskQueueServer};
//!
//! let client = TaskQueueClient::create_unique("demo", QueueConfig::new(4, 64))?;
//! let mut server = TaskQueueServer::open(client.name())?;
//!
//! let id = client.enqueue(b"draw", Duration::from_millis(100)).unwrap();
//! let task = server.dequeue(Duration::from_millis(100)).unwrap();
//! server
//!     .post_result(task.id(), TaskOutcome::Done(b"ok".to_vec()), Duration::from_millis(100))
//!     .unwrap();
//! assert_eq!(client.poll_completion(id), Status::Done(b"ok".to_vec()));
//! # Ok::<(), task_queue::QueueError>(())
//! ```

mod client;
mod config;
mod error;
mod layout;
mod liveness;
mod server;
mod task;

pub use client::{Completions, QueueStats, TaskQueueClient};
pub use config::QueueConfig;
pub use error::{DequeueError, EnqueueError, PostError, QueueError, QueueResult};
pub use server::{ServeExit, ServeReport, TaskQueueServer};
pub use task::{FailureReason, Status, Task, TaskId, TaskOutcome};
pub use transport::{ErrorKind, PeerLiveness, RegionName, WaitError};
