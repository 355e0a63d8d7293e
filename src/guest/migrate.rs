//! Live and offline migration.

use serde_json::Value;

use super::ops::GuestOps;
use super::xml;
use crate::bus::Instruction;
use crate::errors::{AgentError, Result};
use crate::hypervisor::{Domain, MigrateFlags, XmlFlags};
use crate::storage::{StorageDescriptor, StorageMode};

impl GuestOps {
    /// Move the guest to the host in `duri`
    /// (`qemu+ssh://<destination>/system`).
    ///
    /// Local storage additionally needs the destination to hold
    /// same-size empty images at identical paths before the transfer;
    /// those are pre-created over SSH, and the source copies are removed
    /// once the hypervisor reports success.
    pub async fn migrate(&self, dom: &dyn Domain, ins: &Instruction) -> Result<Value> {
        let duri = ins.duri.as_deref().ok_or(AgentError::MissingField("duri"))?;
        let mode = ins
            .storage_mode
            .ok_or(AgentError::MissingField("storage_mode"))?;

        let mut flags = MigrateFlags::PERSIST_DEST
            | MigrateFlags::UNDEFINE_SOURCE
            | MigrateFlags::COMPRESSED
            | MigrateFlags::PEER2PEER
            | MigrateFlags::AUTO_CONVERGE;

        let active = dom.is_active().await?;
        let definition = dom.xml_desc(XmlFlags::empty()).await?;
        let mut source_disks: Vec<String> = Vec::new();

        match mode {
            StorageMode::Local => {
                flags |= MigrateFlags::NON_SHARED_DISK | MigrateFlags::LIVE;
                if !active {
                    return Err(AgentError::Unsupported(
                        "offline migration unsupported on non-shared storage".into(),
                    ));
                }
                let destination = duri.split('/').nth(2).ok_or_else(|| {
                    AgentError::InvalidMessage(format!("malformed destination uri {duri}"))
                })?;

                let backend = self
                    .storage
                    .backend(&StorageDescriptor::new(StorageMode::Local, None)?)
                    .await?;
                for disk in xml::disks(&definition)? {
                    let Some(file) = disk.source_file else { continue };
                    let info = backend.info(&file).await?;
                    let command =
                        format!("qemu-img create -f qcow2 {} {}", file, info.virtual_size);
                    let output = self.remote.exec(destination, &command).await?;
                    for line in output.stdout.lines() {
                        self.emitters.log.info(line).await;
                    }
                    for line in output.stderr.lines() {
                        self.emitters.log.error(line).await;
                    }
                    if output.exit_status != 0 {
                        return Err(AgentError::Remote(format!(
                            "pre-creating {file} on {destination} exited {}",
                            output.exit_status
                        )));
                    }
                    source_disks.push(file);
                }
            }
            StorageMode::SharedMount | StorageMode::Ceph | StorageMode::Glusterfs => {
                if active {
                    flags |= MigrateFlags::LIVE | MigrateFlags::TUNNELLED;
                } else {
                    flags |= MigrateFlags::OFFLINE;
                }
            }
        }

        dom.migrate_to_uri(duri, flags).await?;

        // The guest now lives elsewhere; its local images are dead weight.
        for file in source_disks {
            match tokio::fs::remove_file(&file).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                other => other?,
            }
        }
        Ok(Value::Null)
    }
}
