//! Local-filesystem backend, also used for shared mounts.

use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use async_trait::async_trait;

use super::qemu_img::{ImageInfo, QemuImg};
use super::StorageBackend;
use crate::errors::Result;

pub struct LocalBackend {
    img: QemuImg,
}

impl LocalBackend {
    pub fn new(img: QemuImg) -> Self {
        Self { img }
    }

    /// Make sure `path`'s parent exists as a directory (mode 0755). If
    /// something non-directory already sits there, move it aside as
    /// `<name>.bak` so its content stays available for diagnosis.
    fn prepare_parent(path: &Path) -> Result<()> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        if parent.as_os_str().is_empty() {
            return Ok(());
        }
        if parent.exists() {
            if !parent.is_dir() {
                let mut bak = parent.as_os_str().to_os_string();
                bak.push(".bak");
                std::fs::rename(parent, &bak)?;
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o755)
                    .create(parent)?;
            }
        } else {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(parent)?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn make(&self, path: &str, size_gib: u64) -> Result<()> {
        Self::prepare_parent(Path::new(path))?;
        self.img.create(path, size_gib).await
    }

    async fn resize(&self, path: &str, size_gib: u64) -> Result<()> {
        self.img.resize(path, size_gib).await
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        Self::prepare_parent(Path::new(dst))?;
        tokio::fs::copy(src, dst).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        tokio::fs::remove_file(path).await?;
        Ok(())
    }

    async fn info(&self, path: &str) -> Result<ImageInfo> {
        self.img.info(path).await
    }

    async fn getsize(&self, path: &str) -> Result<u64> {
        Ok(tokio::fs::metadata(path).await?.len())
    }
}
