//! Creating-progress reporter.
//!
//! While a create's template copy is in flight, the image grows toward
//! the template's size; the ratio becomes a 0–90 progress event (the
//! create operation itself owns 92 and 97). Records are dropped once
//! the copy completes or the domain shows up defined.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::emit::Emitters;
use crate::errors::Result;
use crate::guest::create::CreatingRecord;
use crate::hypervisor::Connection;
use crate::storage::{StorageDescriptor, StorageManager};
use crate::util::now_ts;

const POLL_PAUSE: Duration = Duration::from_secs(1);
/// A record nobody could size for an hour is abandoned to the janitor.
const TRACK_EXPIRY_SECS: i64 = 3600;

struct Tracked {
    record: CreatingRecord,
    since: i64,
}

pub struct CreatingProgressEngine {
    pub conn: Arc<dyn Connection>,
    pub storage: Arc<StorageManager>,
    pub emitters: Emitters,
    pub cancel: CancellationToken,

    tracking: Vec<Tracked>,
}

impl CreatingProgressEngine {
    pub fn new(
        conn: Arc<dyn Connection>,
        storage: Arc<StorageManager>,
        emitters: Emitters,
        cancel: CancellationToken,
    ) -> Self {
        Self { conn, storage, emitters, cancel, tracking: Vec::new() }
    }

    pub async fn run(mut self, mut records: UnboundedReceiver<CreatingRecord>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(POLL_PAUSE) => {}
            }
            while let Ok(record) = records.try_recv() {
                self.tracking.push(Tracked { record, since: now_ts() });
            }
            self.report_round().await;
        }
        tracing::info!("creating progress reporter stopped");
    }

    pub(crate) async fn report_round(&mut self) {
        let mut keep = Vec::new();
        for tracked in self.tracking.drain(..) {
            let record = &tracked.record;
            match progress_of(&self.storage, record).await {
                Ok(progress) if progress >= 90 => {
                    self.emitters.guest_event.creating(&record.uuid, 90).await;
                }
                Ok(progress) => {
                    self.emitters
                        .guest_event
                        .creating(&record.uuid, progress)
                        .await;
                    keep.push(tracked);
                }
                Err(_) => {
                    // Sizes unreadable: the copy failed or has not begun.
                    // Once the domain exists the create moved past us.
                    let defined = self.conn.lookup_by_uuid(&record.uuid).await.is_ok();
                    let expired = now_ts() - tracked.since > TRACK_EXPIRY_SECS;
                    if !defined && !expired {
                        keep.push(tracked);
                    }
                }
            }
        }
        self.tracking = keep;
    }

    pub(crate) fn tracked(&self) -> usize {
        self.tracking.len()
    }
}

async fn progress_of(storage: &StorageManager, record: &CreatingRecord) -> Result<u8> {
    let desc = StorageDescriptor::new(record.storage_mode, record.dfs_volume.clone())?;
    let backend = storage.backend(&desc).await?;
    let template = backend.getsize(&record.template_path).await?;
    let image = backend.getsize(&record.system_image_path).await?;
    if template == 0 {
        return Ok(0);
    }
    Ok(((image as f64 / template as f64) * 90.0).min(90.0) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::MemoryBus;
    use crate::hypervisor::mock::MockConnection;
    use crate::storage::{DfsClient, DfsMounter, MountedDfs, StorageMode};
    use async_trait::async_trait;
    use serde_json::Value;

    struct TempMounter(std::path::PathBuf);

    #[async_trait]
    impl DfsMounter for TempMounter {
        async fn mount(&self, volume: &str) -> Result<Arc<dyn DfsClient>> {
            let root = self.0.join(volume);
            std::fs::create_dir_all(&root)?;
            Ok(Arc::new(MountedDfs::new(root)))
        }
    }

    fn progress_events(bus: &MemoryBus) -> Vec<Value> {
        bus.queue("upstream")
            .iter()
            .map(|r| serde_json::from_str::<Value>(r).unwrap())
            .filter(|v| v["type"] == "creating")
            .collect()
    }

    #[tokio::test]
    async fn partial_copy_reports_scaled_progress() {
        let dir = tempfile::tempdir().unwrap();
        let vol = dir.path().join("gv0");
        std::fs::create_dir_all(&vol).unwrap();
        std::fs::write(vol.join("template.qcow2"), vec![0u8; 1000]).unwrap();
        std::fs::write(vol.join("half.qcow2"), vec![0u8; 500]).unwrap();

        let bus = MemoryBus::new();
        let mut engine = CreatingProgressEngine::new(
            MockConnection::new() as Arc<dyn Connection>,
            Arc::new(StorageManager::new(
                "/usr/bin/qemu-img".into(),
                Arc::new(TempMounter(dir.path().to_path_buf())),
            )),
            Emitters::new(Arc::new(bus.clone()), "upstream", "host-t"),
            CancellationToken::new(),
        );
        engine.tracking.push(Tracked {
            record: CreatingRecord {
                storage_mode: StorageMode::Glusterfs,
                dfs_volume: Some("gv0".into()),
                uuid: "u-1".into(),
                template_path: "template.qcow2".into(),
                system_image_path: "half.qcow2".into(),
            },
            since: now_ts(),
        });

        engine.report_round().await;
        let events = progress_events(&bus);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["message"]["progress"], 45);
        assert_eq!(engine.tracked(), 1);

        // Copy completes: one final 90 and the record is released.
        std::fs::write(vol.join("half.qcow2"), vec![0u8; 1000]).unwrap();
        engine.report_round().await;
        assert_eq!(progress_events(&bus).last().unwrap()["message"]["progress"], 90);
        assert_eq!(engine.tracked(), 0);
    }

    #[tokio::test]
    async fn unreadable_sizes_keep_record_until_domain_defined() {
        let dir = tempfile::tempdir().unwrap();
        let conn = MockConnection::new();
        let bus = MemoryBus::new();
        let mut engine = CreatingProgressEngine::new(
            Arc::clone(&conn) as Arc<dyn Connection>,
            Arc::new(StorageManager::new(
                "/usr/bin/qemu-img".into(),
                Arc::new(TempMounter(dir.path().to_path_buf())),
            )),
            Emitters::new(Arc::new(bus.clone()), "upstream", "host-t"),
            CancellationToken::new(),
        );
        engine.tracking.push(Tracked {
            record: CreatingRecord {
                storage_mode: StorageMode::Glusterfs,
                dfs_volume: Some("gv0".into()),
                uuid: "u-2".into(),
                template_path: "missing.qcow2".into(),
                system_image_path: "image.qcow2".into(),
            },
            since: now_ts(),
        });

        engine.report_round().await;
        assert_eq!(engine.tracked(), 1);

        conn.add(crate::hypervisor::mock::MockDomain::new("u-2", "g2"));
        engine.report_round().await;
        assert_eq!(engine.tracked(), 0);
    }
}
