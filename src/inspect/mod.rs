//! Offline image inspection.
//!
//! Template initialization mounts the guest's disks outside the domain
//! and edits files in place. The core drives the narrow
//! [`ImageInspector`] interface; [`guestfish`] implements it over the
//! guestfish remote protocol.

pub mod guestfish;

use async_trait::async_trait;

use crate::errors::Result;

/// A disk handed to the inspector. Network disks carry protocol and
/// server, file disks just the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectDrive {
    pub path: String,
    pub format: Option<String>,
    pub protocol: Option<String>,
    pub server: Option<String>,
}

#[async_trait]
pub trait ImageInspector: Send {
    fn add_drive(&mut self, drive: InspectDrive);

    /// Boot the inspection appliance with every added drive attached.
    async fn launch(&mut self) -> Result<()>;

    /// Inspect for an OS root and mount it at `/`.
    async fn mount_root(&mut self) -> Result<()>;

    async fn sh(&mut self, command: &str) -> Result<()>;

    async fn write_file(&mut self, path: &str, content: &str) -> Result<()>;

    async fn append_file(&mut self, path: &str, content: &str) -> Result<()>;

    /// Flush and tear the appliance down. Must be called even after a
    /// failed step.
    async fn shutdown(&mut self) -> Result<()>;
}

/// Creates one inspector per create operation.
pub trait InspectorFactory: Send + Sync {
    fn inspector(&self) -> Box<dyn ImageInspector>;
}
