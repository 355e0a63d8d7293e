//! Downstream wire format.
//!
//! Every instruction carries at least `action`; interactive actions also
//! carry a guest `uuid` (`guest_uuid` is an accepted synonym). Fields a
//! given action does not use simply stay at their defaults.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::StorageMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    // queue-pop discipline
    CreateGuest,
    CreateDisk,
    ResizeDisk,
    DeleteDisk,
    // subscription keep-alive
    Ping,
    Pong,
    // pub/sub discipline
    Reboot,
    ForceReboot,
    Shutdown,
    ForceShutdown,
    Boot,
    Suspend,
    Resume,
    DeleteGuest,
    AttachDisk,
    DetachDisk,
    Migrate,
    CreateSnapshot,
    DeleteSnapshot,
    RevertSnapshot,
    ConvertSnapshot,
    AllocateBandwidth,
    AdjustAbility,
    ResetPassword,
    UpdateSshKey,
    Quota,
    #[serde(other)]
    Unknown,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::CreateGuest => "create_guest",
            Action::CreateDisk => "create_disk",
            Action::ResizeDisk => "resize_disk",
            Action::DeleteDisk => "delete_disk",
            Action::Ping => "ping",
            Action::Pong => "pong",
            Action::Reboot => "reboot",
            Action::ForceReboot => "force_reboot",
            Action::Shutdown => "shutdown",
            Action::ForceShutdown => "force_shutdown",
            Action::Boot => "boot",
            Action::Suspend => "suspend",
            Action::Resume => "resume",
            Action::DeleteGuest => "delete_guest",
            Action::AttachDisk => "attach_disk",
            Action::DetachDisk => "detach_disk",
            Action::Migrate => "migrate",
            Action::CreateSnapshot => "create_snapshot",
            Action::DeleteSnapshot => "delete_snapshot",
            Action::RevertSnapshot => "revert_snapshot",
            Action::ConvertSnapshot => "convert_snapshot",
            Action::AllocateBandwidth => "allocate_bandwidth",
            Action::AdjustAbility => "adjust_ability",
            Action::ResetPassword => "reset_password",
            Action::UpdateSshKey => "update_ssh_key",
            Action::Quota => "quota",
            Action::Unknown => "unknown",
        }
    }
}

/// Per-disk QoS parameters applied through the monitor channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskSpec {
    #[serde(default)]
    pub sequence: u32,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub iops: u64,
    #[serde(default)]
    pub iops_rd: u64,
    #[serde(default)]
    pub iops_wr: u64,
    #[serde(default)]
    pub iops_max: u64,
    #[serde(default)]
    pub iops_max_length: u64,
    #[serde(default)]
    pub bps: u64,
    #[serde(default)]
    pub bps_rd: u64,
    #[serde(default)]
    pub bps_wr: u64,
    #[serde(default)]
    pub bps_max: u64,
    #[serde(default)]
    pub bps_max_length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitOperateKind {
    Cmd,
    WriteFile,
    AppendFile,
}

/// Template initialization step executed against the mounted image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitOperate {
    pub kind: InitOperateKind,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Instruction {
    pub action: Action,
    #[serde(default, alias = "guest_uuid")]
    pub uuid: Option<String>,
    #[serde(default, rename = "_object")]
    pub object: Option<String>,
    #[serde(default)]
    pub passback_parameters: Option<Value>,

    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub template_path: Option<String>,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    #[serde(default)]
    pub xml: Option<String>,
    #[serde(default)]
    pub storage_mode: Option<StorageMode>,
    #[serde(default)]
    pub dfs_volume: Option<String>,
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub os_template_initialize_operates: Vec<InitOperate>,

    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub snapshot_path: Option<String>,
    #[serde(default)]
    pub os_template_image_id: Option<String>,

    #[serde(default)]
    pub duri: Option<String>,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub cpu: Option<u32>,
    /// GiB.
    #[serde(default)]
    pub memory: Option<u64>,
    /// Bits per second as delivered by the control plane.
    #[serde(default)]
    pub bandwidth: Option<u64>,
    #[serde(default)]
    pub device_node: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub disk_uuid: Option<String>,
}

impl Instruction {
    pub fn parse(raw: &str) -> crate::errors::Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| crate::errors::AgentError::InvalidMessage(e.to_string()))
    }

    pub fn uuid(&self) -> crate::errors::Result<&str> {
        self.uuid
            .as_deref()
            .ok_or(crate::errors::AgentError::MissingField("uuid"))
    }
}
