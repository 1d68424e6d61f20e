use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for launching and tearing down the driver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// How long an orderly shutdown may take before the driver is killed.
    pub grace_period: Duration,
    /// Interval between exit checks while waiting for the driver.
    ///
    /// Exits are detected by polling `try_wait`, so this is the granularity of
    /// `wait_for_exit` and `shutdown`. Values below one millisecond are raised to it.
    pub poll_interval: Duration,
    /// Kill the driver when the manager is dropped while it is still running.
    pub kill_on_drop: bool,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
            kill_on_drop: true,
        }
    }
}
