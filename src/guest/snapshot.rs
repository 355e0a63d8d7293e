//! Snapshot lifecycle: create, delete, revert, convert-to-template.

use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

use super::ops::GuestOps;
use super::qga;
use crate::bus::Instruction;
use crate::errors::{AgentError, Result};
use crate::hypervisor::{
    Domain, HvErrorCode, SnapshotCreateFlags, SnapshotRevertFlags,
};
use crate::storage::{StorageMode, gluster_url};

/// The image tool prints `(12.34/100%)` on each SIGUSR1.
static PROGRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((\d+(\.\d+)?)/100%\)").expect("progress pattern"));

const CONVERT_POLL: Duration = Duration::from_millis(500);

const EMPTY_SNAPSHOT_XML: &str = "<domainsnapshot>\n</domainsnapshot>";

impl GuestOps {
    pub async fn create_snapshot(&self, dom: &dyn Domain, _ins: &Instruction) -> Result<Value> {
        let snap = dom
            .snapshot_create(EMPTY_SNAPSHOT_XML, SnapshotCreateFlags::ATOMIC)
            .await?;

        let parent_id = match snap.parent_name().await {
            Ok(name) => name,
            // Root of the snapshot tree.
            Err(e) if e.code == HvErrorCode::NoDomainSnapshot => "-".to_string(),
            Err(e) => return Err(e.into()),
        };

        Ok(json!({
            "snapshot_id": snap.name().await?,
            "parent_id": parent_id,
            "xml": snap.xml_desc().await?,
        }))
    }

    pub async fn delete_snapshot(&self, dom: &dyn Domain, ins: &Instruction) -> Result<Value> {
        let snapshot_id = ins
            .snapshot_id
            .as_deref()
            .ok_or(AgentError::MissingField("snapshot_id"))?;
        dom.snapshot_lookup(snapshot_id).await?.delete().await?;
        Ok(Value::Null)
    }

    /// Revert with flags=0 first; a system error gets exactly one forced
    /// retry. A domain that comes back running gets its clock synced
    /// through the guest agent.
    pub async fn revert_snapshot(&self, dom: &dyn Domain, ins: &Instruction) -> Result<Value> {
        let snapshot_id = ins
            .snapshot_id
            .as_deref()
            .ok_or(AgentError::MissingField("snapshot_id"))?;
        let snap = dom.snapshot_lookup(snapshot_id).await?;

        match snap.revert(SnapshotRevertFlags::empty()).await {
            Err(e) if e.code == HvErrorCode::SystemError => {
                snap.revert(SnapshotRevertFlags::FORCE).await?;
            }
            other => other?,
        }

        if dom.is_active().await? {
            let now_ns = chrono::Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or(i64::MAX);
            qga::set_time(dom, now_ns, self.ping_timeout()).await?;
        }
        Ok(Value::Null)
    }

    /// Convert one snapshot into a standalone template image. The image
    /// tool runs as a child process; a SIGUSR1 every poll tick makes it
    /// print a progress line, which is forwarded upstream.
    pub async fn convert_snapshot(&self, ins: &Instruction) -> Result<Value> {
        let uuid = ins.uuid()?.to_string();
        let snapshot_id = ins
            .snapshot_id
            .as_deref()
            .ok_or(AgentError::MissingField("snapshot_id"))?;
        let snapshot_path = ins
            .snapshot_path
            .as_deref()
            .ok_or(AgentError::MissingField("snapshot_path"))?;
        let template_path = ins
            .template_path
            .as_deref()
            .ok_or(AgentError::MissingField("template_path"))?;
        let image_id = ins
            .os_template_image_id
            .as_deref()
            .ok_or(AgentError::MissingField("os_template_image_id"))?;
        let mode = ins
            .storage_mode
            .ok_or(AgentError::MissingField("storage_mode"))?;

        let (src, dst) = if mode == StorageMode::Glusterfs {
            let volume = ins
                .dfs_volume
                .as_deref()
                .ok_or(AgentError::MissingField("dfs_volume"))?;
            let dfs = self.storage.dfs_client(volume).await?;
            if let Some(parent) = Path::new(template_path).parent() {
                let parent = parent.to_string_lossy();
                if !parent.is_empty() && !dfs.is_dir(&parent).await? {
                    dfs.make_dirs(&parent).await?;
                }
            }
            (
                gluster_url(volume, snapshot_path),
                gluster_url(volume, template_path),
            )
        } else {
            (snapshot_path.to_string(), template_path.to_string())
        };

        let mut command = self.storage.qemu_img().convert_command(snapshot_id, &src, &dst);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Internal("convert child has no stdout".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let mut eof = false;
        let status = loop {
            if eof {
                tokio::time::sleep(CONVERT_POLL).await;
            } else {
                match tokio::time::timeout(CONVERT_POLL, lines.next_line()).await {
                    Ok(Ok(Some(line))) => {
                        if let Some(progress) = parse_progress(&line) {
                            self.emitters
                                .guest_event
                                .snapshot_converting(&uuid, image_id, progress)
                                .await;
                        }
                        continue;
                    }
                    Ok(Ok(None)) => eof = true,
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => {}
                }
            }

            if let Some(status) = child.try_wait()? {
                break status;
            }
            if let Some(pid) = child.id() {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGUSR1,
                );
            }
        };

        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut err) = child.stderr.take() {
                let _ = err.read_to_string(&mut stderr).await;
            }
            return Err(AgentError::CommandExec(format!(
                "template conversion exited {status}: {}",
                stderr.trim()
            )));
        }
        Ok(Value::Null)
    }
}

fn parse_progress(line: &str) -> Option<u8> {
    let captures = PROGRESS.captures(line.trim())?;
    let whole = captures.get(1)?.as_str().split('.').next()?;
    whole.parse().ok()
}
