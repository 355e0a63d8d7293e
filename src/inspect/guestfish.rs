//! guestfish-backed inspector.
//!
//! `launch` starts `guestfish --listen` and every later step is a
//! `guestfish --remote=<pid>` invocation against that session. File
//! content moves through host-side temp files (`upload`/`download`), so
//! arbitrary bytes survive the shell boundary.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::{ImageInspector, InspectDrive, InspectorFactory};
use crate::errors::{AgentError, Result};

pub struct GuestfishFactory;

impl InspectorFactory for GuestfishFactory {
    fn inspector(&self) -> Box<dyn ImageInspector> {
        Box::new(GuestfishInspector::new())
    }
}

pub struct GuestfishInspector {
    drives: Vec<InspectDrive>,
    session_pid: Option<u32>,
}

impl GuestfishInspector {
    pub fn new() -> Self {
        Self { drives: Vec::new(), session_pid: None }
    }

    fn session(&self) -> Result<u32> {
        self.session_pid
            .ok_or_else(|| AgentError::Inspection("session not launched".into()))
    }

    async fn remote(&self, args: &[&str]) -> Result<String> {
        let pid = self.session()?;
        let output = Command::new("guestfish")
            .arg(format!("--remote={pid}"))
            .arg("--")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(AgentError::Inspection(format!(
                "guestfish {}: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for GuestfishInspector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageInspector for GuestfishInspector {
    fn add_drive(&mut self, drive: InspectDrive) {
        self.drives.push(drive);
    }

    async fn launch(&mut self) -> Result<()> {
        let mut cmd = Command::new("guestfish");
        cmd.arg("--listen").arg("--rw");
        for drive in &self.drives {
            let mut spec = format!("file={}", drive.path);
            if let Some(format) = &drive.format {
                spec.push_str(&format!(",format={format}"));
            }
            if let Some(protocol) = &drive.protocol {
                spec.push_str(&format!(",protocol={protocol}"));
            }
            if let Some(server) = &drive.server {
                spec.push_str(&format!(",server={server}"));
            }
            cmd.arg("-a").arg(spec);
        }
        let output = cmd.stdin(Stdio::null()).output().await?;
        if !output.status.success() {
            return Err(AgentError::Inspection(format!(
                "guestfish --listen: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        // Stdout is `GUESTFISH_PID=1234; export GUESTFISH_PID`.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let pid = stdout
            .split(['=', ';'])
            .nth(1)
            .and_then(|p| p.trim().parse().ok())
            .ok_or_else(|| {
                AgentError::Inspection(format!("cannot parse guestfish session: {stdout}"))
            })?;
        self.session_pid = Some(pid);

        self.remote(&["run"]).await?;
        Ok(())
    }

    async fn mount_root(&mut self) -> Result<()> {
        let roots = self.remote(&["inspect-os"]).await?;
        let root = roots
            .lines()
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| AgentError::Inspection("no operating system found".into()))?
            .to_string();
        self.remote(&["mount", &root, "/"]).await?;
        Ok(())
    }

    async fn sh(&mut self, command: &str) -> Result<()> {
        self.remote(&["sh", command]).await?;
        Ok(())
    }

    async fn write_file(&mut self, path: &str, content: &str) -> Result<()> {
        let tmp = tempfile::NamedTempFile::new()?;
        tokio::fs::write(tmp.path(), content).await?;
        let local = tmp.path().to_string_lossy().into_owned();
        self.remote(&["upload", &local, path]).await?;
        Ok(())
    }

    async fn append_file(&mut self, path: &str, content: &str) -> Result<()> {
        let tmp = tempfile::NamedTempFile::new()?;
        let local = tmp.path().to_string_lossy().into_owned();

        // Existing bytes first; a missing file appends from empty.
        let mut combined = match self.remote(&["download", path, &local]).await {
            Ok(_) => tokio::fs::read(tmp.path()).await?,
            Err(_) => Vec::new(),
        };
        combined.extend_from_slice(content.as_bytes());
        tokio::fs::write(tmp.path(), &combined).await?;
        self.remote(&["upload", &local, path]).await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        if self.session_pid.is_some() {
            let result = self.remote(&["exit"]).await;
            self.session_pid = None;
            result?;
        }
        Ok(())
    }
}
