use crate::{LaunchConfig, LifecycleError, LifecycleResult};
use parking_lot::Mutex;
use std::ffi::OsStr;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use transport::{Deadline, PeerLiveness};

const MIN_POLL: Duration = Duration::from_millis(1);

/// Observable lifecycle of the driver.
///
/// `NotStarted → Starting → Running → {Exited | Crashed}`. `Starting` becomes
/// `Running` only through [`ProcessManager::mark_running`], once the caller has
/// seen the driver attach to its queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    /// No driver has been launched yet.
    NotStarted,
    /// The process exists but has not confirmed it is serving.
    Starting,
    /// The driver attached and is serving.
    Running,
    /// The driver exited on its own with this status code.
    Exited(i32),
    /// The driver was terminated by a signal (the signal number when known).
    Crashed(Option<i32>),
}

impl DriverState {
    /// True while the process may still be executing.
    pub fn is_live(self) -> bool {
        matches!(self, DriverState::Starting | DriverState::Running)
    }
}

/// Result of waiting for the driver to exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited with a status code.
    Exited(i32),
    /// Killed by a signal.
    Crashed(Option<i32>),
    /// Still running when the timeout elapsed.
    TimedOut,
    /// Nothing was ever spawned.
    NotStarted,
}

/// Identity of a spawned driver. Carries no OS handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverProcessHandle {
    pid: u32,
    program: PathBuf,
}

impl DriverProcessHandle {
    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Executable the driver was launched from.
    pub fn program(&self) -> &Path {
        &self.program
    }
}

struct Inner {
    state: DriverState,
    child: Option<Child>,
}

impl Inner {
    /// Polls the child without blocking and folds any exit into `state`.
    fn refresh(&mut self) -> DriverState {
        if !self.state.is_live() {
            return self.state;
        }
        let Some(child) = self.child.as_mut() else {
            return self.state;
        };
        match child.try_wait() {
            Ok(Some(status)) => self.record_exit(status),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(pid = child.id(), %err, "failed to poll driver, treating as crashed");
                self.state = DriverState::Crashed(None);
                self.child = None;
            }
        }
        self.state
    }

    fn record_exit(&mut self, status: ExitStatus) {
        let pid = self.child.as_ref().map(Child::id);
        self.state = match (status.code(), status.signal()) {
            (Some(code), _) => DriverState::Exited(code),
            (None, signal) => DriverState::Crashed(signal),
        };
        self.child = None;
        tracing::debug!(?pid, state = ?self.state, "driver exited");
    }
}

/// Launches, observes, and terminates a single driver process.
pub struct ProcessManager {
    config: LaunchConfig,
    inner: Arc<Mutex<Inner>>,
    handle: Mutex<Option<DriverProcessHandle>>,
}

impl ProcessManager {
    /// Creates a manager with nothing spawned.
    pub fn new(config: LaunchConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(Inner {
                state: DriverState::NotStarted,
                child: None,
            })),
            handle: Mutex::new(None),
        }
    }

    /// Launch settings in effect.
    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Launches `program` with `args`. Stdin is closed; stdout and stderr are inherited.
    ///
    /// A manager whose previous driver has exited may spawn again; a live one is refused.
    pub fn spawn<I, S>(
        &self,
        program: impl AsRef<Path>,
        args: I,
    ) -> LifecycleResult<DriverProcessHandle>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = program.as_ref();
        let mut inner = self.inner.lock();
        if inner.refresh().is_live() {
            let pid = inner.child.as_ref().map(Child::id).unwrap_or_default();
            return Err(LifecycleError::AlreadyRunning { pid });
        }

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| LifecycleError::SpawnFailed {
                program: program.to_path_buf(),
                source,
            })?;

        let handle = DriverProcessHandle {
            pid: child.id(),
            program: program.to_path_buf(),
        };
        tracing::debug!(pid = handle.pid, program = %program.display(), "spawned driver");
        inner.child = Some(child);
        inner.state = DriverState::Starting;
        *self.handle.lock() = Some(handle.clone());
        Ok(handle)
    }

    /// Promotes `Starting` to `Running`. Returns false in any other state.
    pub fn mark_running(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.refresh() == DriverState::Starting {
            inner.state = DriverState::Running;
            true
        } else {
            false
        }
    }

    /// Current state, refreshed from the OS.
    pub fn state(&self) -> DriverState {
        self.inner.lock().refresh()
    }

    /// Identity of the most recently spawned driver.
    pub fn handle(&self) -> Option<DriverProcessHandle> {
        self.handle.lock().clone()
    }

    /// Whether the driver may still be executing.
    pub fn is_alive(&self) -> bool {
        self.state().is_live()
    }

    /// Read-only probe sharing this manager's view of the process.
    pub fn liveness(&self) -> DriverLiveness {
        DriverLiveness {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Waits up to `timeout` for the driver to exit on its own.
    ///
    /// The child is reaped with non-blocking `try_wait` every
    /// [`LaunchConfig::poll_interval`], so an exit is noticed at most one
    /// interval late. `Duration::MAX` waits indefinitely.
    pub fn wait_for_exit(&self, timeout: Duration) -> ExitOutcome {
        let deadline = Deadline::after(timeout);
        loop {
            let state = self.state();
            if let Some(outcome) = outcome_of(state) {
                return outcome;
            }
            if deadline.is_expired() {
                return ExitOutcome::TimedOut;
            }
            thread::sleep(deadline.remaining().min(self.config.poll_interval.max(MIN_POLL)));
        }
    }

    /// Forcefully stops the driver and reaps it. Idempotent: an exited or
    /// never-started driver is left as is.
    pub fn terminate(&self) -> ExitOutcome {
        let mut inner = self.inner.lock();
        let state = inner.refresh();
        if let Some(outcome) = outcome_of(state) {
            return outcome;
        }
        let Some(child) = inner.child.as_mut() else {
            return ExitOutcome::NotStarted;
        };

        let pid = child.id();
        tracing::warn!(pid, "terminating driver");
        if let Err(err) = child.kill() {
            tracing::debug!(pid, %err, "kill failed, driver likely exited already");
        }
        match child.wait() {
            Ok(status) => inner.record_exit(status),
            Err(err) => {
                tracing::warn!(pid, %err, "failed to reap driver");
                inner.state = DriverState::Crashed(None);
                inner.child = None;
            }
        }
        outcome_of(inner.state).unwrap_or(ExitOutcome::TimedOut)
    }

    /// Gives the driver `grace_period` to exit, then terminates it.
    pub fn shutdown(&self) -> ExitOutcome {
        match self.wait_for_exit(self.config.grace_period) {
            ExitOutcome::TimedOut => self.terminate(),
            outcome => outcome,
        }
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        if self.config.kill_on_drop && self.inner.lock().refresh().is_live() {
            self.terminate();
        }
    }
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("state", &self.inner.lock().state)
            .field("handle", &*self.handle.lock())
            .finish()
    }
}

fn outcome_of(state: DriverState) -> Option<ExitOutcome> {
    match state {
        DriverState::NotStarted => Some(ExitOutcome::NotStarted),
        DriverState::Starting | DriverState::Running => None,
        DriverState::Exited(code) => Some(ExitOutcome::Exited(code)),
        DriverState::Crashed(signal) => Some(ExitOutcome::Crashed(signal)),
    }
}

/// Health probe handed to the queue client. It can observe the process but
/// never signal, wait on, or close it.
#[derive(Clone)]
pub struct DriverLiveness {
    inner: Arc<Mutex<Inner>>,
}

impl DriverLiveness {
    /// Current state, refreshed from the OS.
    pub fn state(&self) -> DriverState {
        self.inner.lock().refresh()
    }
}

impl PeerLiveness for DriverLiveness {
    fn is_alive(&self) -> bool {
        self.state().is_live()
    }
}

impl std::fmt::Debug for DriverLiveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverLiveness")
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use transport::ErrorKind;

    fn manager() -> ProcessManager {
        ProcessManager::new(LaunchConfig {
            grace_period: Duration::from_millis(200),
            poll_interval: Duration::from_millis(5),
            kill_on_drop: true,
        })
    }

    #[test]
    fn fresh_manager_reports_not_started() {
        let manager = manager();
        assert_eq!(manager.state(), DriverState::NotStarted);
        assert!(!manager.is_alive());
        assert!(!manager.liveness().is_alive());
        assert_eq!(manager.wait_for_exit(Duration::ZERO), ExitOutcome::NotStarted);
        assert_eq!(manager.terminate(), ExitOutcome::NotStarted);
        assert!(!manager.mark_running());
    }

    #[test]
    fn spawn_failure_maps_to_spawn_failed() {
        let manager = manager();
        let err = manager
            .spawn("/nonexistent/driver-binary", ["--queue", "/x"])
            .expect_err("missing executable");
        assert_eq!(err.kind(), ErrorKind::SpawnFailed);
        assert_eq!(manager.state(), DriverState::NotStarted);
    }

    #[test]
    fn clean_exit_reports_status_code() {
        let manager = manager();
        let handle = manager.spawn("/bin/sh", ["-c", "exit 3"]).expect("spawn sh");
        assert!(handle.pid() > 0);
        assert_eq!(handle.program(), Path::new("/bin/sh"));
        assert_eq!(
            manager.wait_for_exit(Duration::from_secs(5)),
            ExitOutcome::Exited(3)
        );
        assert_eq!(manager.state(), DriverState::Exited(3));
        assert!(!manager.mark_running());
    }

    #[test]
    fn running_driver_times_out_then_terminates_idempotently() {
        let manager = manager();
        manager.spawn("/bin/sleep", ["30"]).expect("spawn sleep");
        assert_eq!(manager.state(), DriverState::Starting);
        assert!(manager.mark_running());
        assert_eq!(manager.state(), DriverState::Running);

        let liveness = manager.liveness();
        assert!(liveness.is_alive());
        assert_eq!(
            manager.wait_for_exit(Duration::from_millis(30)),
            ExitOutcome::TimedOut
        );

        let first = manager.terminate();
        assert!(matches!(first, ExitOutcome::Crashed(Some(_))), "{first:?}");
        assert_eq!(manager.terminate(), first);
        assert!(!liveness.is_alive());
    }

    #[test]
    fn second_spawn_is_refused_while_live_but_allowed_after_exit() {
        let manager = manager();
        manager.spawn("/bin/sleep", ["30"]).expect("spawn");
        let err = manager.spawn("/bin/sleep", ["30"]).expect_err("already live");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        manager.terminate();
        let handle = manager.spawn("/bin/sh", ["-c", "exit 0"]).expect("respawn");
        assert_eq!(manager.handle(), Some(handle));
        assert_eq!(manager.shutdown(), ExitOutcome::Exited(0));
    }

    #[test]
    fn liveness_notices_external_death() {
        let manager = manager();
        manager.spawn("/bin/sh", ["-c", "kill -9 $$"]).expect("spawn");
        let liveness = manager.liveness();
        let deadline = Instant::now() + Duration::from_secs(5);
        while liveness.is_alive() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(liveness.state(), DriverState::Crashed(Some(9)));
    }

    #[test]
    fn unbounded_wait_returns_once_the_driver_exits() {
        let manager = manager();
        manager
            .spawn("/bin/sh", ["-c", "sleep 0.1; exit 2"])
            .expect("spawn");
        assert_eq!(manager.wait_for_exit(Duration::MAX), ExitOutcome::Exited(2));
    }

    #[test]
    fn drop_kills_live_driver() {
        let manager = manager();
        let pid = manager.spawn("/bin/sleep", ["30"]).expect("spawn").pid();
        let liveness = manager.liveness();
        drop(manager);
        assert!(!liveness.is_alive());
        assert!(!Path::new(&format!("/proc/{pid}")).exists());
    }
}
