//! Agent configuration.
//!
//! A single JSON file holds everything: bus endpoint and queue names,
//! sampling intervals, admission thresholds, and daemon behavior. The CLI
//! only selects the file and offers `--daemon` / `--debug` overrides.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::errors::{AgentError, Result};

#[derive(Debug, Parser)]
#[command(name = "vmnoded", version, about = "per-host virtualization agent")]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "/etc/vmnoded.conf")]
    pub config: PathBuf,

    /// Detach from the terminal and run in the background.
    #[arg(long)]
    pub daemon: bool,

    /// Raise the log filter to debug.
    #[arg(long)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Redis endpoint, e.g. `redis://127.0.0.1:6379/0`.
    pub bus_url: String,

    /// Hypervisor connection URI. Empty selects the driver default.
    #[serde(default)]
    pub hypervisor_uri: String,

    /// Queue the control plane pushes heavy create-ish jobs onto.
    #[serde(default = "defaults::downstream_queue")]
    pub downstream_queue: String,

    /// Pub/sub channel for interactive guest actions.
    #[serde(default = "defaults::instruction_channel")]
    pub instruction_channel: String,

    /// Single upstream queue shared by every emitter.
    #[serde(default = "defaults::upstream_queue")]
    pub upstream_queue: String,

    /// In-flight create records for the external janitor.
    #[serde(default = "defaults::creating_queue")]
    pub creating_guest_queue: String,

    #[serde(default)]
    pub daemon: bool,

    #[serde(default)]
    pub debug: bool,

    #[serde(default = "defaults::pidfile")]
    pub pidfile: PathBuf,

    /// Log file used when daemonized; stdout otherwise.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Performance sampling interval in seconds.
    #[serde(default = "defaults::interval")]
    pub interval: u64,

    /// Periodic full guest-state sweep, a safety net for lifecycle
    /// callbacks lost during bus outages.
    #[serde(default = "defaults::state_report_interval")]
    pub state_report_interval: u64,

    /// Guest-agent ping timeout (seconds) used to tell `running` from
    /// `booting`.
    #[serde(default = "defaults::ga_ping_timeout")]
    pub ga_ping_timeout: u64,

    /// Path of the image tool binary.
    #[serde(default = "defaults::qemu_img")]
    pub qemu_img: PathBuf,

    /// Root under which distributed-filesystem volumes get mounted.
    #[serde(default = "defaults::dfs_mount_root")]
    pub dfs_mount_root: PathBuf,

    /// User for destination-host pre-creation during local-mode migration.
    #[serde(default = "defaults::ssh_user")]
    pub ssh_user: String,

    /// Private key for the migration SSH session.
    #[serde(default = "defaults::ssh_key")]
    pub ssh_key: PathBuf,
}

mod defaults {
    use std::path::PathBuf;

    pub fn downstream_queue() -> String {
        "downstream_queue".into()
    }
    pub fn instruction_channel() -> String {
        "instruction_channel".into()
    }
    pub fn upstream_queue() -> String {
        "upstream_queue".into()
    }
    pub fn creating_queue() -> String {
        "creating_guest".into()
    }
    pub fn pidfile() -> PathBuf {
        "/var/run/vmnoded.pid".into()
    }
    pub fn interval() -> u64 {
        60
    }
    pub fn state_report_interval() -> u64 {
        300
    }
    pub fn ga_ping_timeout() -> u64 {
        3
    }
    pub fn qemu_img() -> PathBuf {
        "/usr/bin/qemu-img".into()
    }
    pub fn dfs_mount_root() -> PathBuf {
        "/mnt".into()
    }
    pub fn ssh_user() -> String {
        "root".into()
    }
    pub fn ssh_key() -> PathBuf {
        "/root/.ssh/id_rsa".into()
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| AgentError::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// CLI flags win over file values.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if cli.daemon {
            self.daemon = true;
        }
        if cli.debug {
            self.debug = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg: AgentConfig =
            serde_json::from_str(r#"{"bus_url": "redis://127.0.0.1:6379/0"}"#).unwrap();
        assert_eq!(cfg.downstream_queue, "downstream_queue");
        assert_eq!(cfg.interval, 60);
        assert_eq!(cfg.ga_ping_timeout, 3);
        assert!(!cfg.daemon);
        assert_eq!(cfg.qemu_img, PathBuf::from("/usr/bin/qemu-img"));
    }

    #[test]
    fn unknown_keys_rejected() {
        let err = serde_json::from_str::<AgentConfig>(
            r#"{"bus_url": "redis://x", "no_such_key": 1}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = AgentConfig::load(Path::new("/nonexistent/vmnoded.conf")).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }
}
