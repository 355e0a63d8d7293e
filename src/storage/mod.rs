//! Guest-image storage abstraction.
//!
//! One interface over four layouts: plain local paths, shared mounts,
//! hypervisor-managed ceph, and glusterfs volumes addressed as
//! `gluster://127.0.0.1/<volume>/<path>`.

mod gluster;
mod local;
pub mod qemu_img;

pub use gluster::{DfsClient, DfsMounter, FuseMounter, GlusterBackend, MountedDfs, gluster_url};
pub use local::LocalBackend;
pub use qemu_img::{ImageInfo, QemuImg};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::errors::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    Local,
    SharedMount,
    Ceph,
    Glusterfs,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Local => "local",
            StorageMode::SharedMount => "shared_mount",
            StorageMode::Ceph => "ceph",
            StorageMode::Glusterfs => "glusterfs",
        }
    }
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mode plus the volume tag that only glusterfs carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDescriptor {
    pub mode: StorageMode,
    pub dfs_volume: Option<String>,
}

impl StorageDescriptor {
    pub fn new(mode: StorageMode, dfs_volume: Option<String>) -> Result<Self> {
        match (mode, &dfs_volume) {
            (StorageMode::Glusterfs, None) => Err(AgentError::MissingField("dfs_volume")),
            (StorageMode::Glusterfs, Some(_)) => Ok(Self { mode, dfs_volume }),
            // The tag is meaningless outside glusterfs; drop it.
            (_, _) => Ok(Self { mode, dfs_volume: None }),
        }
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Create an empty qcow2 image of `size_gib`.
    async fn make(&self, path: &str, size_gib: u64) -> Result<()>;

    /// Grow an existing image to `size_gib`.
    async fn resize(&self, path: &str, size_gib: u64) -> Result<()>;

    async fn copy(&self, src: &str, dst: &str) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    async fn info(&self, path: &str) -> Result<ImageInfo>;

    /// On-disk size in bytes.
    async fn getsize(&self, path: &str) -> Result<u64>;
}

/// Images on ceph are managed by the hypervisor directly; every mutation
/// here is a pass-through.
pub struct CephBackend {
    img: QemuImg,
}

#[async_trait]
impl StorageBackend for CephBackend {
    async fn make(&self, _path: &str, _size_gib: u64) -> Result<()> {
        Ok(())
    }

    async fn resize(&self, _path: &str, _size_gib: u64) -> Result<()> {
        Ok(())
    }

    async fn copy(&self, _src: &str, _dst: &str) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn info(&self, path: &str) -> Result<ImageInfo> {
        self.img.info(path).await
    }

    async fn getsize(&self, path: &str) -> Result<u64> {
        Err(AgentError::Unsupported(format!(
            "size of hypervisor-managed image {path}"
        )))
    }
}

/// Owns the image-tool path and the per-volume mount table; engines and
/// operations resolve a backend per message from it.
pub struct StorageManager {
    img: QemuImg,
    mounter: Arc<dyn DfsMounter>,
    mounts: Mutex<HashMap<String, Arc<dyn DfsClient>>>,
}

impl StorageManager {
    pub fn new(qemu_img: PathBuf, mounter: Arc<dyn DfsMounter>) -> Self {
        Self {
            img: QemuImg::new(qemu_img),
            mounter,
            mounts: Mutex::new(HashMap::new()),
        }
    }

    pub fn qemu_img(&self) -> &QemuImg {
        &self.img
    }

    /// Lazily mount a volume, at most once per process regardless of
    /// concurrent callers; the handle is reused afterwards.
    pub async fn dfs_client(&self, volume: &str) -> Result<Arc<dyn DfsClient>> {
        let mut mounts = self.mounts.lock().await;
        if let Some(client) = mounts.get(volume) {
            return Ok(Arc::clone(client));
        }
        let client = self.mounter.mount(volume).await?;
        mounts.insert(volume.to_string(), Arc::clone(&client));
        Ok(client)
    }

    pub async fn backend(&self, desc: &StorageDescriptor) -> Result<Arc<dyn StorageBackend>> {
        match desc.mode {
            StorageMode::Local | StorageMode::SharedMount => {
                Ok(Arc::new(LocalBackend::new(self.img.clone())))
            }
            StorageMode::Ceph => Ok(Arc::new(CephBackend { img: self.img.clone() })),
            StorageMode::Glusterfs => {
                let volume = desc
                    .dfs_volume
                    .as_deref()
                    .ok_or(AgentError::MissingField("dfs_volume"))?;
                let dfs = self.dfs_client(volume).await?;
                Ok(Arc::new(GlusterBackend::new(
                    volume.to_string(),
                    dfs,
                    self.img.clone(),
                )))
            }
        }
    }
}
