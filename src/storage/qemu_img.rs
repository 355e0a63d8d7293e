//! Image-tool subprocess driver.

use std::path::PathBuf;
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;

use crate::errors::{AgentError, Result};

/// Decoded `qemu-img info --output=json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageInfo {
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
    #[serde(rename = "actual-size", default)]
    pub actual_size: u64,
    pub format: String,
    #[serde(rename = "cluster-size", default)]
    pub cluster_size: Option<u64>,
    #[serde(rename = "backing-filename", default)]
    pub backing_filename: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

impl ImageInfo {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "virtual-size": self.virtual_size,
            "actual-size": self.actual_size,
            "format": self.format,
            "cluster-size": self.cluster_size,
            "backing-filename": self.backing_filename,
            "filename": self.filename,
        })
    }
}

#[derive(Clone)]
pub struct QemuImg {
    bin: PathBuf,
}

impl QemuImg {
    pub fn new(bin: PathBuf) -> Self {
        Self { bin }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(AgentError::StorageCommand {
                cmd: format!("{} {}", self.bin.display(), args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub async fn create(&self, url: &str, size_gib: u64) -> Result<()> {
        let size = format!("{size_gib}G");
        self.run(&["create", "-f", "qcow2", url, &size]).await?;
        Ok(())
    }

    pub async fn resize(&self, url: &str, size_gib: u64) -> Result<()> {
        let size = format!("{size_gib}G");
        self.run(&["resize", "-f", "qcow2", url, &size]).await?;
        Ok(())
    }

    pub async fn info(&self, url: &str) -> Result<ImageInfo> {
        let stdout = self
            .run(&["info", "--output=json", "--force-share", url])
            .await?;
        Ok(serde_json::from_str(&stdout)?)
    }

    /// Command for converting one snapshot of `src` into a standalone
    /// template at `dst`. The caller drives the child (progress lines on
    /// stdout, one per SIGUSR1).
    pub fn convert_command(&self, snapshot_id: &str, src: &str, dst: &str) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.args([
            "convert",
            "--force-share",
            "-O",
            "qcow2",
            "-s",
            snapshot_id,
            src,
            dst,
        ]);
        cmd
    }
}
