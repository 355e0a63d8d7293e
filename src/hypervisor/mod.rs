//! Narrow hypervisor interface.
//!
//! The agent only ever touches the hypervisor through these traits:
//! [`Connection`], [`Domain`] and [`Snapshot`], plus the event-loop
//! handle in [`event`]. The production backend over libvirt lives in
//! [`libvirt`] behind the `libvirt` feature.

pub mod event;
#[cfg(feature = "libvirt")]
pub mod libvirt;
#[cfg(test)]
pub(crate) mod mock;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitflags::bitflags;

pub type HvResult<T> = std::result::Result<T, HvError>;

/// Semantic error classes the operations dispatch on; backends map their
/// native codes into these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvErrorCode {
    /// Domain unknown to this host.
    NoDomain,
    /// Snapshot (or snapshot parent) does not exist.
    NoDomainSnapshot,
    /// Generic system-level failure; revert retries once on this.
    SystemError,
    /// Guest agent not connected or not answering.
    AgentUnresponsive,
    Other,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("hypervisor: {message}")]
pub struct HvError {
    pub code: HvErrorCode,
    pub message: String,
}

impl HvError {
    pub fn new(code: HvErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(HvErrorCode::Other, message)
    }
}

/// Raw power state as the hypervisor reports it. The externally visible
/// `GuestState` additionally derives `booting` from a failed agent ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
}

#[derive(Debug, Clone, Copy)]
pub struct DomainInfo {
    pub state: PowerState,
    pub max_mem_kib: u64,
    pub mem_kib: u64,
    pub cpu_count: u32,
    pub cpu_time_ns: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InterfaceStats {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errs: u64,
    pub rx_drop: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errs: u64,
    pub tx_drop: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BlockStats {
    pub rd_req: u64,
    pub rd_bytes: u64,
    pub wr_req: u64,
    pub wr_bytes: u64,
}

bitflags! {
    /// Bit values follow the libvirt ABI so the backend passes them
    /// through unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MigrateFlags: u32 {
        const LIVE            = 1 << 0;
        const PEER2PEER       = 1 << 1;
        const TUNNELLED       = 1 << 2;
        const PERSIST_DEST    = 1 << 3;
        const UNDEFINE_SOURCE = 1 << 4;
        const NON_SHARED_DISK = 1 << 6;
        const OFFLINE         = 1 << 10;
        const COMPRESSED      = 1 << 11;
        const AUTO_CONVERGE   = 1 << 13;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceModifyFlags: u32 {
        const AFFECT_LIVE   = 1 << 0;
        const AFFECT_CONFIG = 1 << 1;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SnapshotCreateFlags: u32 {
        const ATOMIC = 1 << 7;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SnapshotRevertFlags: u32 {
        const FORCE = 1 << 2;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XmlFlags: u32 {
        const SECURE = 1 << 0;
    }
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn define_xml(&self, xml: &str) -> HvResult<Arc<dyn Domain>>;

    async fn lookup_by_uuid(&self, uuid: &str) -> HvResult<Arc<dyn Domain>>;

    async fn list_all_domains(&self) -> HvResult<Vec<Arc<dyn Domain>>>;

    /// Subscribe lifecycle and definition-change callbacks; events land
    /// on `tx`. Returns a token for deregistration. Must only be called
    /// after the event loop reports running.
    fn register_domain_events(
        &self,
        tx: tokio::sync::mpsc::UnboundedSender<event::DomainEvent>,
    ) -> HvResult<u32>;

    fn deregister_domain_events(&self, token: u32) -> HvResult<()>;
}

#[async_trait]
pub trait Domain: Send + Sync {
    fn uuid(&self) -> String;

    fn name(&self) -> String;

    async fn info(&self) -> HvResult<DomainInfo>;

    async fn is_active(&self) -> HvResult<bool>;

    async fn xml_desc(&self, flags: XmlFlags) -> HvResult<String>;

    /// Boot a defined domain.
    async fn create(&self) -> HvResult<()>;

    async fn destroy(&self) -> HvResult<()>;

    async fn shutdown(&self) -> HvResult<()>;

    async fn reboot(&self) -> HvResult<()>;

    async fn suspend(&self) -> HvResult<()>;

    async fn resume(&self) -> HvResult<()>;

    async fn undefine(&self) -> HvResult<()>;

    async fn set_user_password(&self, user: &str, password: &str) -> HvResult<()>;

    async fn attach_device(&self, xml: &str, flags: DeviceModifyFlags) -> HvResult<()>;

    async fn detach_device(&self, xml: &str, flags: DeviceModifyFlags) -> HvResult<()>;

    /// `size_kib` per the hypervisor's default resize unit.
    async fn block_resize(&self, device: &str, size_kib: u64) -> HvResult<()>;

    async fn migrate_to_uri(&self, duri: &str, flags: MigrateFlags) -> HvResult<()>;

    async fn snapshot_create(
        &self,
        xml: &str,
        flags: SnapshotCreateFlags,
    ) -> HvResult<Arc<dyn Snapshot>>;

    async fn snapshot_lookup(&self, name: &str) -> HvResult<Arc<dyn Snapshot>>;

    async fn snapshot_names(&self) -> HvResult<Vec<String>>;

    async fn memory_stats(&self) -> HvResult<HashMap<String, u64>>;

    async fn set_memory_stats_period(&self, period_secs: u32) -> HvResult<()>;

    async fn interface_stats(&self, dev: &str) -> HvResult<InterfaceStats>;

    async fn block_stats(&self, dev: &str) -> HvResult<BlockStats>;

    async fn interface_parameters(&self, mac: &str) -> HvResult<HashMap<String, u64>>;

    async fn set_interface_parameters(
        &self,
        mac: &str,
        params: &HashMap<String, u64>,
        flags: DeviceModifyFlags,
    ) -> HvResult<()>;

    /// Guest-agent channel: JSON command in, JSON reply out.
    async fn agent_command(&self, cmd: &str, timeout: Duration) -> HvResult<String>;

    /// Monitor channel (QMP): JSON command in, JSON reply out.
    async fn monitor_command(&self, cmd: &str) -> HvResult<String>;
}

#[async_trait]
pub trait Snapshot: Send + Sync {
    async fn name(&self) -> HvResult<String>;

    /// Errs with [`HvErrorCode::NoDomainSnapshot`] at the root of the
    /// snapshot tree.
    async fn parent_name(&self) -> HvResult<String>;

    async fn xml_desc(&self) -> HvResult<String>;

    async fn delete(&self) -> HvResult<()>;

    async fn revert(&self, flags: SnapshotRevertFlags) -> HvResult<()>;
}
