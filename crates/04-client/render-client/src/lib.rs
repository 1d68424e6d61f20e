#![deny(missing_docs)]
//! Client-side facade over a rendering driver running in its own process.
//!
//! [`RenderClient`] creates a uniquely named task queue, launches the driver
//! with `--queue <name>`, and waits for it to attach. Callers only get the
//! narrow task API; the queue and the process handle stay private so nothing
//! can bypass the client's bookkeeping or close the driver handle twice.

mod error;

pub use error::{RenderClientError, RenderClientResult};

use driver_process::{
    DriverProcessHandle, DriverState, ExitOutcome, LaunchConfig, ProcessManager,
};
use serde::{Deserialize, Serialize};
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::time::Duration;
use task_queue::{
    EnqueueError, QueueConfig, QueueStats, RegionName, Status, TaskId, TaskQueueClient,
    WaitError,
};

/// Everything needed to stand up a client/driver pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderClientConfig {
    /// Queue geometry and liveness interval.
    pub queue: QueueConfig,
    /// Driver launch and teardown settings.
    pub launch: LaunchConfig,
    /// How long the driver may take to attach after it is spawned.
    pub attach_timeout: Duration,
    /// Prefix of the generated queue name.
    pub name_prefix: String,
}

impl Default for RenderClientConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            launch: LaunchConfig::default(),
            attach_timeout: Duration::from_secs(5),
            name_prefix: "render-queue".to_owned(),
        }
    }
}

/// Owns one task queue and the driver process serving it.
pub struct RenderClient {
    queue: TaskQueueClient,
    process: ProcessManager,
    driver: DriverProcessHandle,
    exit: Option<ExitOutcome>,
}

impl RenderClient {
    /// Creates the queue, spawns `program`, and blocks until it attaches.
    ///
    /// `args` are passed before the `--queue <name>` pair. A driver that exits
    /// or fails to attach in time is reaped before the error is returned.
    pub fn launch<I, S>(
        program: impl AsRef<Path>,
        args: I,
        config: RenderClientConfig,
    ) -> RenderClientResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut queue = TaskQueueClient::create_unique(&config.name_prefix, config.queue)?;
        let process = ProcessManager::new(config.launch);

        let mut argv: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        argv.push("--queue".into());
        argv.push(queue.name().as_str().into());
        let driver = process.spawn(program, &argv)?;
        queue.watch_driver(process.liveness());

        match queue.wait_for_driver(config.attach_timeout) {
            Ok(pid) => {
                process.mark_running();
                tracing::debug!(pid, queue = %queue.name(), "driver running");
            }
            Err(WaitError::TimedOut) => {
                let outcome = process.terminate();
                tracing::warn!(pid = driver.pid(), ?outcome, "driver never attached");
                return Err(RenderClientError::AttachTimedOut {
                    timeout: config.attach_timeout,
                });
            }
            Err(WaitError::PeerLost) => {
                let outcome = process.wait_for_exit(process.config().grace_period);
                let outcome = match outcome {
                    ExitOutcome::TimedOut => process.terminate(),
                    outcome => outcome,
                };
                return Err(RenderClientError::DriverExited { outcome });
            }
        }

        Ok(Self {
            queue,
            process,
            driver,
            exit: None,
        })
    }

    /// Hands a task to the driver. See [`TaskQueueClient::enqueue`].
    pub fn enqueue(&self, payload: &[u8], timeout: Duration) -> Result<TaskId, EnqueueError> {
        self.queue.enqueue(payload, timeout)
    }

    /// Non-blocking completion check.
    pub fn poll_completion(&self, id: TaskId) -> Status {
        self.queue.poll_completion(id)
    }

    /// Blocks until `id` completes, the driver is lost, or `timeout` elapses.
    pub fn wait_completion(&self, id: TaskId, timeout: Duration) -> Status {
        self.queue.wait_completion(id, timeout)
    }

    /// Whether the driver is attached and its process is running.
    pub fn is_driver_alive(&self) -> bool {
        self.queue.is_driver_alive()
    }

    /// Lifecycle state of the driver process.
    pub fn driver_state(&self) -> DriverState {
        self.process.state()
    }

    /// Identity of the driver process.
    pub fn driver(&self) -> &DriverProcessHandle {
        &self.driver
    }

    /// Name of the queue region.
    pub fn queue_name(&self) -> &RegionName {
        self.queue.name()
    }

    /// Queue counters.
    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Forcefully stops the driver now. Safe to call repeatedly.
    pub fn terminate_driver(&self) -> ExitOutcome {
        self.process.terminate()
    }

    /// Detaches from the queue, gives the driver its grace period to exit,
    /// then kills it if needed.
    pub fn shutdown(mut self) -> ExitOutcome {
        self.finish()
    }

    fn finish(&mut self) -> ExitOutcome {
        if let Some(outcome) = self.exit {
            return outcome;
        }
        self.queue.close();
        let outcome = self.process.shutdown();
        tracing::debug!(pid = self.driver.pid(), ?outcome, "driver shut down");
        self.exit = Some(outcome);
        outcome
    }
}

impl Drop for RenderClient {
    fn drop(&mut self) {
        self.finish();
    }
}

impl std::fmt::Debug for RenderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderClient")
            .field("queue", self.queue.name())
            .field("driver", &self.driver)
            .field("state", &self.process.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use task_queue::ErrorKind;

    fn config() -> RenderClientConfig {
        RenderClientConfig {
            queue: QueueConfig::new(4, 64),
            launch: LaunchConfig {
                grace_period: Duration::from_millis(200),
                poll_interval: Duration::from_millis(5),
                kill_on_drop: true,
            },
            attach_timeout: Duration::from_millis(300),
            name_prefix: "rc-test".to_owned(),
        }
    }

    #[test]
    fn missing_executable_is_spawn_failed() {
        let err = RenderClient::launch("/nonexistent/render-driver", [""; 0], config())
            .expect_err("cannot spawn");
        assert_eq!(err.kind(), ErrorKind::SpawnFailed);
    }

    #[test]
    fn driver_that_exits_before_attaching_is_reported() {
        // `sh -c 'exit 4' --queue <name>`: $0 and $1 absorb the queue flag.
        let err = RenderClient::launch("/bin/sh", ["-c", "exit 4"], config())
            .expect_err("never attaches");
        match err {
            RenderClientError::DriverExited { outcome } => {
                assert_eq!(outcome, ExitOutcome::Exited(4))
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn driver_that_never_attaches_times_out_and_is_killed() {
        let err = RenderClient::launch("/bin/sh", ["-c", "exec sleep 30"], config())
            .expect_err("never attaches");
        assert!(matches!(err, RenderClientError::AttachTimedOut { .. }), "{err:?}");
        assert_eq!(err.kind(), ErrorKind::SpawnFailed);
    }

    #[test]
    fn default_config_uses_default_queue() {
        let config = RenderClientConfig::default();
        assert_eq!(config.queue, QueueConfig::default());
        assert_eq!(config.name_prefix, "render-queue");
        assert!(config.launch.kill_on_drop);
    }
}
