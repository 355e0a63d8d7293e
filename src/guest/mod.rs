//! Guest model: externally visible states and the XML views the agent
//! reads and writes.

pub mod qga;
pub mod xml;

pub(crate) mod create;
mod migrate;
pub(crate) mod ops;
mod snapshot;

pub use ops::{DirtyScene, GuestOps};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::hypervisor::{Domain, PowerState};

/// Closed set of states the control plane sees. `Booting` is derived:
/// the hypervisor says running but the guest agent has not answered a
/// ping yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestState {
    NoState,
    Booting,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
    Migrating,
    Update,
    Creating,
    SnapshotConverting,
}

impl GuestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuestState::NoState => "no_state",
            GuestState::Booting => "booting",
            GuestState::Running => "running",
            GuestState::Blocked => "blocked",
            GuestState::Paused => "paused",
            GuestState::Shutdown => "shutdown",
            GuestState::Shutoff => "shutoff",
            GuestState::Crashed => "crashed",
            GuestState::PmSuspended => "pm_suspended",
            GuestState::Migrating => "migrating",
            GuestState::Update => "update",
            GuestState::Creating => "creating",
            GuestState::SnapshotConverting => "snapshot_converting",
        }
    }
}

/// Map the hypervisor's power state to the externally visible one,
/// pinging the guest agent to tell `running` from `booting`.
pub async fn observed_state(dom: &dyn Domain, ping_timeout: Duration) -> GuestState {
    let info = match dom.info().await {
        Ok(info) => info,
        Err(_) => return GuestState::NoState,
    };
    match info.state {
        PowerState::Running => {
            if qga::ping(dom, ping_timeout).await {
                GuestState::Running
            } else {
                GuestState::Booting
            }
        }
        PowerState::Blocked => GuestState::Blocked,
        PowerState::Paused => GuestState::Paused,
        PowerState::Shutdown => GuestState::Shutdown,
        PowerState::Shutoff => GuestState::Shutoff,
        PowerState::Crashed => GuestState::Crashed,
        PowerState::PmSuspended => GuestState::PmSuspended,
        PowerState::NoState => GuestState::NoState,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::mock::MockDomain;

    #[tokio::test]
    async fn running_needs_agent_ping() {
        let dom = MockDomain::new("u-1", "g1");
        dom.set_active(true);
        // Default mock agent answers guest-ping.
        let state = observed_state(dom.as_ref(), Duration::from_secs(1)).await;
        assert_eq!(state, GuestState::Running);

        dom.set_agent_handler(|_| {
            Err(crate::hypervisor::HvError::new(
                crate::hypervisor::HvErrorCode::AgentUnresponsive,
                "not up yet",
            ))
        });
        let state = observed_state(dom.as_ref(), Duration::from_secs(1)).await;
        assert_eq!(state, GuestState::Booting);
    }

    #[tokio::test]
    async fn shutoff_maps_directly() {
        let dom = MockDomain::new("u-1", "g1");
        let state = observed_state(dom.as_ref(), Duration::from_secs(1)).await;
        assert_eq!(state, GuestState::Shutoff);
    }
}
