//! Peer-liveness views built from the header's peer blocks.

use crate::layout::{PeerBlock, PeerState, QueueHeader};
use rustix::io::Errno;
use rustix::process::{test_kill_process, Pid};
use std::fmt;
use std::sync::Arc;
use transport::{PeerLiveness, SharedRegion};

/// Which peer block a watch observes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    Driver,
}

/// What the header says about one peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PeerStatus {
    /// Not attached yet.
    Pending,
    /// Attached and its pid answers signal probes.
    Alive(u32),
    /// Detached, or its pid no longer exists.
    Gone,
}

/// Liveness of the opposite peer: header block, then a pid probe, then any
/// injected probe (e.g. the process manager's reaped exit status). All must agree.
#[derive(Clone)]
pub(crate) struct PeerWatch {
    region: Arc<SharedRegion>,
    side: Side,
    probe: Option<Arc<dyn PeerLiveness>>,
}

impl PeerWatch {
    pub(crate) fn new(region: Arc<SharedRegion>, side: Side) -> Self {
        Self {
            region,
            side,
            probe: None,
        }
    }

    pub(crate) fn set_probe(&mut self, probe: Arc<dyn PeerLiveness>) {
        self.probe = Some(probe);
    }

    fn block(&self) -> &PeerBlock {
        // SAFETY: the region was validated as a queue before the watch was built.
        let header = unsafe { self.region.view::<QueueHeader>(0) };
        match self.side {
            Side::Client => &header.client,
            Side::Driver => &header.driver,
        }
    }

    pub(crate) fn status(&self) -> PeerStatus {
        let block = self.block();
        match block.state() {
            PeerState::Vacant => PeerStatus::Pending,
            PeerState::Detached => PeerStatus::Gone,
            PeerState::Attached => {
                let pid = block.pid();
                if pid_alive(pid) {
                    PeerStatus::Alive(pid)
                } else {
                    PeerStatus::Gone
                }
            }
        }
    }
}

impl PeerLiveness for PeerWatch {
    fn is_alive(&self) -> bool {
        let header_alive = self.status() != PeerStatus::Gone;
        header_alive && self.probe.as_ref().map_or(true, |probe| probe.is_alive())
    }
}

impl fmt::Debug for PeerWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerWatch")
            .field("side", &self.side)
            .field("status", &self.status())
            .field("probe", &self.probe.is_some())
            .finish()
    }
}

/// Signal-0 probe. A zombie still answers, which is why the process manager's
/// reaping probe is layered on top for spawned drivers.
pub(crate) fn pid_alive(pid: u32) -> bool {
    let Some(pid) = i32::try_from(pid).ok().and_then(Pid::from_raw) else {
        return false;
    };
    match test_kill_process(pid) {
        Ok(()) => true,
        Err(Errno::SRCH) => false,
        // EPERM: the pid exists but belongs to someone else.
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn own_pid_is_alive_and_reaped_child_is_not() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));

        let mut child = Command::new("/bin/true").spawn().expect("spawn true");
        let pid = child.id();
        child.wait().expect("reap");
        assert!(!pid_alive(pid));
    }
}
