//! Glusterfs backend.
//!
//! File operations go through a [`DfsClient`] bound to the volume's
//! mount; image-tool operations address the volume directly with
//! `gluster://127.0.0.1/<volume>/<path>` URLs (the DFS client is expected
//! on every host, hence the loopback literal).

use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;

use super::qemu_img::{ImageInfo, QemuImg};
use super::StorageBackend;
use crate::errors::{AgentError, Result};

/// Narrow view of the distributed-filesystem client.
#[async_trait]
pub trait DfsClient: Send + Sync {
    async fn is_dir(&self, path: &str) -> Result<bool>;
    async fn make_dirs(&self, path: &str) -> Result<()>;
    async fn copy_file(&self, src: &str, dst: &str) -> Result<()>;
    async fn remove(&self, path: &str) -> Result<()>;
    async fn size_of(&self, path: &str) -> Result<u64>;
}

/// Produces a [`DfsClient`] for a volume. Split from the client so tests
/// can count and fake mounts.
#[async_trait]
pub trait DfsMounter: Send + Sync {
    async fn mount(&self, volume: &str) -> Result<Arc<dyn DfsClient>>;
}

/// Mounts volumes with `mount -t glusterfs` under a fixed root and hands
/// out path-rebasing clients.
pub struct FuseMounter {
    mount_root: PathBuf,
}

impl FuseMounter {
    pub fn new(mount_root: PathBuf) -> Self {
        Self { mount_root }
    }
}

#[async_trait]
impl DfsMounter for FuseMounter {
    async fn mount(&self, volume: &str) -> Result<Arc<dyn DfsClient>> {
        let target = self.mount_root.join(volume);
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&target)?;

        let source = format!("127.0.0.1:/{volume}");
        let output = tokio::process::Command::new("mount")
            .args(["-t", "glusterfs", &source])
            .arg(&target)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Already-mounted is fine; the handle is process-wide anyway.
            if !stderr.contains("already mounted") {
                return Err(AgentError::StorageCommand {
                    cmd: format!("mount -t glusterfs {source} {}", target.display()),
                    stderr: stderr.into_owned(),
                });
            }
        }
        tracing::info!(volume, target = %target.display(), "mounted dfs volume");
        Ok(Arc::new(MountedDfs::new(target)))
    }
}

/// DFS client over an established mount point. Volume-relative paths are
/// rebased under the mount root.
pub struct MountedDfs {
    root: PathBuf,
}

impl MountedDfs {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn rebase(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl DfsClient for MountedDfs {
    async fn is_dir(&self, path: &str) -> Result<bool> {
        Ok(self.rebase(path).is_dir())
    }

    async fn make_dirs(&self, path: &str) -> Result<()> {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(self.rebase(path))?;
        Ok(())
    }

    async fn copy_file(&self, src: &str, dst: &str) -> Result<()> {
        tokio::fs::copy(self.rebase(src), self.rebase(dst)).await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        tokio::fs::remove_file(self.rebase(path)).await?;
        Ok(())
    }

    async fn size_of(&self, path: &str) -> Result<u64> {
        Ok(tokio::fs::metadata(self.rebase(path)).await?.len())
    }
}

pub struct GlusterBackend {
    volume: String,
    dfs: Arc<dyn DfsClient>,
    img: QemuImg,
}

impl GlusterBackend {
    pub fn new(volume: String, dfs: Arc<dyn DfsClient>, img: QemuImg) -> Self {
        Self { volume, dfs, img }
    }

    pub fn url(&self, path: &str) -> String {
        gluster_url(&self.volume, path)
    }

    async fn ensure_parent(&self, path: &str) -> Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            let parent = parent.to_string_lossy();
            if !parent.is_empty() && !self.dfs.is_dir(&parent).await? {
                self.dfs.make_dirs(&parent).await?;
            }
        }
        Ok(())
    }
}

pub fn gluster_url(volume: &str, path: &str) -> String {
    format!("gluster://127.0.0.1/{}/{}", volume, path.trim_start_matches('/'))
}

#[async_trait]
impl StorageBackend for GlusterBackend {
    async fn make(&self, path: &str, size_gib: u64) -> Result<()> {
        self.ensure_parent(path).await?;
        self.img.create(&self.url(path), size_gib).await
    }

    async fn resize(&self, path: &str, size_gib: u64) -> Result<()> {
        self.img.resize(&self.url(path), size_gib).await
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        self.ensure_parent(dst).await?;
        self.dfs.copy_file(src, dst).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.dfs.remove(path).await
    }

    async fn info(&self, path: &str) -> Result<ImageInfo> {
        self.img.info(&self.url(path)).await
    }

    async fn getsize(&self, path: &str) -> Result<u64> {
        self.dfs.size_of(path).await
    }
}
