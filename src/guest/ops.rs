//! Guest lifecycle operations.
//!
//! One method per action. Every operation returns `Result<Value>`; the
//! dispatcher folds that into exactly one `response.success` or
//! `response.failure` addressed with the original message's routing
//! fields. Partial hypervisor-visible state is never rolled back here;
//! the control plane issues an explicit delete.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::create::CreatingRecord;
use super::{qga, xml};
use crate::bus::{Bus, DiskSpec, Instruction};
use crate::config::AgentConfig;
use crate::emit::Emitters;
use crate::errors::{AgentError, Result};
use crate::hypervisor::{Connection, DeviceModifyFlags, Domain, XmlFlags};
use crate::inspect::InspectorFactory;
use crate::ssh::RemoteExec;
use crate::storage::{StorageDescriptor, StorageManager, StorageMode};

/// Window between image copy and domain definition. If the process dies
/// inside it, the next queue iteration removes the half-written image.
#[derive(Debug, Clone)]
pub struct DirtyScene {
    pub desc: StorageDescriptor,
    pub system_image_path: String,
}

pub struct GuestOps {
    pub(crate) conn: Arc<dyn Connection>,
    pub(crate) bus: Arc<dyn Bus>,
    pub(crate) storage: Arc<StorageManager>,
    pub(crate) emitters: Emitters,
    pub(crate) inspectors: Arc<dyn InspectorFactory>,
    pub(crate) remote: Arc<dyn RemoteExec>,
    pub(crate) cfg: Arc<AgentConfig>,
    pub(crate) creating_tx: mpsc::UnboundedSender<CreatingRecord>,
}

impl GuestOps {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn: Arc<dyn Connection>,
        bus: Arc<dyn Bus>,
        storage: Arc<StorageManager>,
        emitters: Emitters,
        inspectors: Arc<dyn InspectorFactory>,
        remote: Arc<dyn RemoteExec>,
        cfg: Arc<AgentConfig>,
        creating_tx: mpsc::UnboundedSender<CreatingRecord>,
    ) -> Self {
        Self { conn, bus, storage, emitters, inspectors, remote, cfg, creating_tx }
    }

    pub(crate) fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.cfg.ga_ping_timeout)
    }

    /// Remove the half-written image left by a crashed create.
    pub async fn clear_scene(&self, scene: &mut Option<DirtyScene>) {
        let Some(s) = scene.take() else { return };
        tracing::warn!(path = %s.system_image_path, "cleaning dirty scene");
        match self.storage.backend(&s.desc).await {
            Ok(backend) => {
                if let Err(e) = backend.delete(&s.system_image_path).await {
                    if !e.is_not_found() {
                        self.emitters
                            .log
                            .warn(&format!(
                                "dirty scene cleanup of {} failed: {e}",
                                s.system_image_path
                            ))
                            .await;
                    }
                }
            }
            Err(e) => {
                self.emitters
                    .log
                    .warn(&format!("dirty scene backend unavailable: {e}"))
                    .await;
            }
        }
    }

    pub async fn reboot(&self, dom: &dyn Domain, _ins: &Instruction) -> Result<Value> {
        dom.reboot().await?;
        Ok(Value::Null)
    }

    pub async fn force_reboot(&self, dom: &dyn Domain, ins: &Instruction) -> Result<Value> {
        dom.destroy().await?;
        dom.create().await?;
        self.quota(dom, &ins.disks).await?;
        Ok(Value::Null)
    }

    pub async fn shutdown(&self, dom: &dyn Domain, _ins: &Instruction) -> Result<Value> {
        dom.shutdown().await?;
        Ok(Value::Null)
    }

    pub async fn force_shutdown(&self, dom: &dyn Domain, _ins: &Instruction) -> Result<Value> {
        dom.destroy().await?;
        Ok(Value::Null)
    }

    pub async fn boot(&self, dom: &dyn Domain, ins: &Instruction) -> Result<Value> {
        if !dom.is_active().await? {
            dom.create().await?;
            self.quota(dom, &ins.disks).await?;
        }
        Ok(Value::Null)
    }

    pub async fn suspend(&self, dom: &dyn Domain, _ins: &Instruction) -> Result<Value> {
        dom.suspend().await?;
        Ok(Value::Null)
    }

    pub async fn resume(&self, dom: &dyn Domain, _ins: &Instruction) -> Result<Value> {
        dom.resume().await?;
        Ok(Value::Null)
    }

    pub async fn reset_password(&self, dom: &dyn Domain, ins: &Instruction) -> Result<Value> {
        let user = ins.user.as_deref().ok_or(AgentError::MissingField("user"))?;
        let password = ins
            .password
            .as_deref()
            .ok_or(AgentError::MissingField("password"))?;
        dom.set_user_password(user, password).await?;
        Ok(Value::Null)
    }

    /// Per-disk I/O throttle via the monitor channel, one call per disk.
    pub async fn quota(&self, dom: &dyn Domain, disks: &[DiskSpec]) -> Result<()> {
        for disk in disks {
            let cmd = json!({
                "execute": "block_set_io_throttle",
                "arguments": {
                    "device": format!("drive-virtio-disk{}", disk.sequence),
                    "iops": disk.iops,
                    "iops_rd": disk.iops_rd,
                    "iops_wr": disk.iops_wr,
                    "iops_max": disk.iops_max,
                    "iops_max_length": disk.iops_max_length,
                    "bps": disk.bps,
                    "bps_rd": disk.bps_rd,
                    "bps_wr": disk.bps_wr,
                    "bps_max": disk.bps_max,
                    "bps_max_length": disk.bps_max_length,
                }
            })
            .to_string();
            dom.monitor_command(&cmd).await?;
        }
        Ok(())
    }

    pub async fn apply_quota(&self, dom: &dyn Domain, ins: &Instruction) -> Result<Value> {
        self.quota(dom, &ins.disks).await?;
        Ok(Value::Null)
    }

    pub async fn attach_disk(&self, dom: &dyn Domain, ins: &Instruction) -> Result<Value> {
        let xml = ins.xml.as_deref().ok_or(AgentError::MissingField("xml"))?;
        let mut flags = DeviceModifyFlags::AFFECT_CONFIG;
        if dom.is_active().await? {
            flags |= DeviceModifyFlags::AFFECT_LIVE;
        }
        dom.attach_device(xml, flags).await?;
        self.quota(dom, &ins.disks).await?;
        Ok(Value::Null)
    }

    pub async fn detach_disk(&self, dom: &dyn Domain, ins: &Instruction) -> Result<Value> {
        let xml = ins.xml.as_deref().ok_or(AgentError::MissingField("xml"))?;
        let mut flags = DeviceModifyFlags::AFFECT_CONFIG;
        if dom.is_active().await? {
            flags |= DeviceModifyFlags::AFFECT_LIVE;
        }
        dom.detach_device(xml, flags).await?;
        Ok(Value::Null)
    }

    /// Online grow of an attached block device. `size` arrives in GiB;
    /// the hypervisor resize unit is KiB.
    pub async fn resize_disk_online(&self, dom: &dyn Domain, ins: &Instruction) -> Result<Value> {
        let device = ins
            .device_node
            .as_deref()
            .ok_or(AgentError::MissingField("device_node"))?;
        let size_gib = ins.size.ok_or(AgentError::MissingField("size"))?;
        dom.block_resize(device, size_gib * 1024 * 1024).await?;
        Ok(Value::Null)
    }

    pub async fn allocate_bandwidth(&self, dom: &dyn Domain, ins: &Instruction) -> Result<Value> {
        let bandwidth = ins
            .bandwidth
            .ok_or(AgentError::MissingField("bandwidth"))?
            / 1000
            / 8;
        let xml = dom.xml_desc(XmlFlags::empty()).await?;
        let mac = xml::interfaces(&xml)?
            .into_iter()
            .next()
            .and_then(|i| i.mac)
            .ok_or_else(|| AgentError::InvalidMessage("definition has no interface".into()))?;

        let mut params = dom.interface_parameters(&mac).await?;
        params.insert("inbound.average".to_string(), bandwidth);
        params.insert("outbound.average".to_string(), bandwidth);

        dom.set_interface_parameters(&mac, &params, DeviceModifyFlags::AFFECT_CONFIG)
            .await?;
        if dom.is_active().await? {
            dom.set_interface_parameters(&mac, &params, DeviceModifyFlags::AFFECT_LIVE)
                .await?;
        }
        Ok(Value::Null)
    }

    /// Patch vcpu/memory in the definition; only legal on a shut-off
    /// domain.
    pub async fn adjust_ability(&self, dom: &dyn Domain, ins: &Instruction) -> Result<Value> {
        let cpu = ins.cpu.ok_or(AgentError::MissingField("cpu"))?;
        let memory = ins.memory.ok_or(AgentError::MissingField("memory"))?;

        if dom.is_active().await? {
            return Err(AgentError::Unsupported(
                "ability adjustment needs the domain shut off".into(),
            ));
        }

        let current = dom.xml_desc(XmlFlags::empty()).await?;
        let before = xml::ability(&current)?;
        let patched = xml::patch_ability(&current, cpu, memory)?;
        self.conn.define_xml(&patched).await?;

        self.emitters
            .log
            .info(&format!(
                "domain {}, uuid {} ability changed from {}c/{}{} to {cpu}c/{memory}GiB",
                dom.name(),
                dom.uuid(),
                before.vcpu,
                before.memory,
                before.memory_unit.as_deref().unwrap_or("KiB"),
            ))
            .await;
        Ok(Value::Null)
    }

    /// Write authorized keys through the guest agent: `>` for the first
    /// key, `>>` for the rest.
    pub async fn update_ssh_key(&self, dom: &dyn Domain, ins: &Instruction) -> Result<Value> {
        if !dom.is_active().await? {
            self.emitters
                .log
                .warn("ssh-key update target is not active, skipping")
                .await;
            return Ok(Value::Null);
        }
        let timeout = self.ping_timeout();

        qga::exec(dom, "mkdir", &["-p", "/root/.ssh"], false, timeout).await?;

        let mut results = Vec::with_capacity(ins.ssh_keys.len());
        for (i, key) in ins.ssh_keys.iter().enumerate() {
            let redirect = if i == 0 { ">" } else { ">>" };
            let shell = format!("echo \"{key}\" {redirect} /root/.ssh/authorized_keys");
            let pid = qga::exec(dom, "/bin/sh", &["-c", &shell], true, timeout).await?;
            let status = qga::exec_status(dom, pid, timeout).await?;
            results.push(json!({
                "exited": status.exited,
                "exitcode": status.exitcode,
            }));
        }
        Ok(json!({"results": results}))
    }

    /// Tear the guest down and remove its system image. The `vda` disk
    /// identifies the system image; a missing file during removal is
    /// not an error.
    pub async fn delete_guest(&self, dom: &dyn Domain, ins: &Instruction) -> Result<Value> {
        let definition = dom.xml_desc(XmlFlags::empty()).await?;
        let system = xml::system_disk(&definition)?;

        if dom.is_active().await? {
            dom.destroy().await?;
        }
        dom.undefine().await?;

        let mode = ins
            .storage_mode
            .ok_or(AgentError::MissingField("storage_mode"))?;
        let (desc, path) = match mode {
            StorageMode::Glusterfs => {
                let name = system.source_name.ok_or_else(|| {
                    AgentError::InvalidMessage("network disk without source name".into())
                })?;
                let (volume, rel) = name.split_once('/').ok_or_else(|| {
                    AgentError::InvalidMessage(format!("malformed dfs path {name}"))
                })?;
                (
                    StorageDescriptor::new(mode, Some(volume.to_string()))?,
                    rel.to_string(),
                )
            }
            StorageMode::Ceph => {
                let name = system.source_name.ok_or_else(|| {
                    AgentError::InvalidMessage("network disk without source name".into())
                })?;
                (StorageDescriptor::new(mode, None)?, name)
            }
            StorageMode::Local | StorageMode::SharedMount => {
                let file = system.source_file.ok_or_else(|| {
                    AgentError::InvalidMessage("file disk without source file".into())
                })?;
                (StorageDescriptor::new(mode, None)?, file)
            }
        };

        let backend = self.storage.backend(&desc).await?;
        match backend.delete(&path).await {
            Err(e) if e.is_not_found() => {}
            other => other?,
        }
        Ok(Value::Null)
    }

    // Queue-side disk maintenance, no domain involved.

    pub async fn create_disk(&self, ins: &Instruction) -> Result<Value> {
        let path = ins
            .image_path
            .as_deref()
            .ok_or(AgentError::MissingField("image_path"))?;
        let size = ins.size.ok_or(AgentError::MissingField("size"))?;
        let backend = self.backend_for(ins).await?;
        backend.make(path, size).await?;
        Ok(Value::Null)
    }

    pub async fn resize_disk_offline(&self, ins: &Instruction) -> Result<Value> {
        let path = ins
            .image_path
            .as_deref()
            .ok_or(AgentError::MissingField("image_path"))?;
        let size = ins.size.ok_or(AgentError::MissingField("size"))?;
        let backend = self.backend_for(ins).await?;
        backend.resize(path, size).await?;
        Ok(Value::Null)
    }

    pub async fn delete_disk(&self, ins: &Instruction) -> Result<Value> {
        let path = ins
            .image_path
            .as_deref()
            .ok_or(AgentError::MissingField("image_path"))?;
        let backend = self.backend_for(ins).await?;
        backend.delete(path).await?;
        Ok(Value::Null)
    }

    pub(crate) async fn backend_for(
        &self,
        ins: &Instruction,
    ) -> Result<Arc<dyn crate::storage::StorageBackend>> {
        let mode = ins
            .storage_mode
            .ok_or(AgentError::MissingField("storage_mode"))?;
        let desc = StorageDescriptor::new(mode, ins.dfs_volume.clone())?;
        self.storage.backend(&desc).await
    }
}
