#![deny(missing_docs)]
//! Lifecycle management for the out-of-process driver.
//!
//! [`ProcessManager`] is the only owner of the OS child handle. Everything else
//! sees the driver through [`DriverProcessHandle`] (identity) or
//! [`DriverLiveness`] (a read-only health probe usable as a
//! [`transport::PeerLiveness`]).

mod config;
mod error;
mod manager;

pub use config::LaunchConfig;
pub use error::{LifecycleError, LifecycleResult};
pub use manager::{DriverLiveness, DriverProcessHandle, DriverState, ExitOutcome, ProcessManager};
