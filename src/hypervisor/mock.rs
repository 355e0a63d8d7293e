//! Scriptable in-memory hypervisor for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use super::event::DomainEvent;
use super::{
    BlockStats, Connection, DeviceModifyFlags, Domain, DomainInfo, HvError, HvErrorCode, HvResult,
    InterfaceStats, MigrateFlags, PowerState, Snapshot, SnapshotCreateFlags, SnapshotRevertFlags,
    XmlFlags,
};

type AgentHandler = Box<dyn FnMut(&str) -> HvResult<String> + Send>;

#[derive(Default)]
pub struct MockConnection {
    pub domains: Mutex<HashMap<String, Arc<MockDomain>>>,
    pub defined: Mutex<Vec<String>>,
    pub define_error: Mutex<Option<HvError>>,
    /// Domain handed out by the next `define_xml`.
    pub next_defined: Mutex<Option<Arc<MockDomain>>>,
    pub event_tx: Mutex<Option<UnboundedSender<DomainEvent>>>,
}

impl MockConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, dom: Arc<MockDomain>) {
        self.domains.lock().insert(dom.uuid.clone(), dom);
    }

    pub fn emit_event(&self, event: DomainEvent) {
        if let Some(tx) = self.event_tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn define_xml(&self, xml: &str) -> HvResult<Arc<dyn Domain>> {
        if let Some(err) = self.define_error.lock().clone() {
            return Err(err);
        }
        self.defined.lock().push(xml.to_string());
        let dom = self
            .next_defined
            .lock()
            .take()
            .unwrap_or_else(|| MockDomain::new("defined-uuid", "defined"));
        dom.xml.lock().clone_from(&xml.to_string());
        self.add(Arc::clone(&dom));
        Ok(dom)
    }

    async fn lookup_by_uuid(&self, uuid: &str) -> HvResult<Arc<dyn Domain>> {
        self.domains
            .lock()
            .get(uuid)
            .cloned()
            .map(|d| d as Arc<dyn Domain>)
            .ok_or_else(|| HvError::new(HvErrorCode::NoDomain, format!("no domain {uuid}")))
    }

    async fn list_all_domains(&self) -> HvResult<Vec<Arc<dyn Domain>>> {
        Ok(self
            .domains
            .lock()
            .values()
            .cloned()
            .map(|d| d as Arc<dyn Domain>)
            .collect())
    }

    fn register_domain_events(&self, tx: UnboundedSender<DomainEvent>) -> HvResult<u32> {
        *self.event_tx.lock() = Some(tx);
        Ok(1)
    }

    fn deregister_domain_events(&self, _token: u32) -> HvResult<()> {
        *self.event_tx.lock() = None;
        Ok(())
    }
}

pub struct MockDomain {
    pub uuid: String,
    pub name: String,
    pub active: Mutex<bool>,
    pub info: Mutex<DomainInfo>,
    pub xml: Mutex<String>,
    pub calls: Mutex<Vec<String>>,
    pub agent_log: Mutex<Vec<String>>,
    pub agent_handler: Mutex<Option<AgentHandler>>,
    pub monitor_log: Mutex<Vec<String>>,
    pub migrations: Mutex<Vec<(String, MigrateFlags)>>,
    pub migrate_error: Mutex<Option<HvError>>,
    pub snapshots: Mutex<HashMap<String, Arc<MockSnapshot>>>,
    pub next_snapshot: Mutex<Option<Arc<MockSnapshot>>>,
    pub memory_stats: Mutex<HashMap<String, u64>>,
    /// Swapped in after `set_memory_stats_period`, mimicking a balloon
    /// period taking effect.
    pub memory_stats_after_period: Mutex<Option<HashMap<String, u64>>>,
    pub interface_stats: Mutex<HashMap<String, InterfaceStats>>,
    pub block_stats: Mutex<HashMap<String, BlockStats>>,
    pub iface_params: Mutex<HashMap<String, u64>>,
    pub iface_param_sets: Mutex<Vec<(String, HashMap<String, u64>, DeviceModifyFlags)>>,
    pub device_ops: Mutex<Vec<(String, String, DeviceModifyFlags)>>,
}

impl MockDomain {
    pub fn new(uuid: &str, name: &str) -> Arc<Self> {
        Arc::new(Self {
            uuid: uuid.to_string(),
            name: name.to_string(),
            active: Mutex::new(false),
            info: Mutex::new(DomainInfo {
                state: PowerState::Shutoff,
                max_mem_kib: 1 << 20,
                mem_kib: 1 << 20,
                cpu_count: 1,
                cpu_time_ns: 0,
            }),
            xml: Mutex::new(String::new()),
            calls: Mutex::new(Vec::new()),
            agent_log: Mutex::new(Vec::new()),
            agent_handler: Mutex::new(None),
            monitor_log: Mutex::new(Vec::new()),
            migrations: Mutex::new(Vec::new()),
            migrate_error: Mutex::new(None),
            snapshots: Mutex::new(HashMap::new()),
            next_snapshot: Mutex::new(None),
            memory_stats: Mutex::new(HashMap::new()),
            memory_stats_after_period: Mutex::new(None),
            interface_stats: Mutex::new(HashMap::new()),
            block_stats: Mutex::new(HashMap::new()),
            iface_params: Mutex::new(HashMap::new()),
            iface_param_sets: Mutex::new(Vec::new()),
            device_ops: Mutex::new(Vec::new()),
        })
    }

    pub fn set_active(&self, active: bool) {
        *self.active.lock() = active;
        self.info.lock().state = if active {
            PowerState::Running
        } else {
            PowerState::Shutoff
        };
    }

    pub fn set_xml(&self, xml: &str) {
        *self.xml.lock() = xml.to_string();
    }

    pub fn set_agent_handler(
        &self,
        handler: impl FnMut(&str) -> HvResult<String> + Send + 'static,
    ) {
        *self.agent_handler.lock() = Some(Box::new(handler));
    }

    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_string());
    }

    pub fn call_count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }
}

#[async_trait]
impl Domain for MockDomain {
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn info(&self) -> HvResult<DomainInfo> {
        Ok(*self.info.lock())
    }

    async fn is_active(&self) -> HvResult<bool> {
        Ok(*self.active.lock())
    }

    async fn xml_desc(&self, _flags: XmlFlags) -> HvResult<String> {
        Ok(self.xml.lock().clone())
    }

    async fn create(&self) -> HvResult<()> {
        self.record("create");
        self.set_active(true);
        Ok(())
    }

    async fn destroy(&self) -> HvResult<()> {
        self.record("destroy");
        self.set_active(false);
        Ok(())
    }

    async fn shutdown(&self) -> HvResult<()> {
        self.record("shutdown");
        Ok(())
    }

    async fn reboot(&self) -> HvResult<()> {
        self.record("reboot");
        Ok(())
    }

    async fn suspend(&self) -> HvResult<()> {
        self.record("suspend");
        Ok(())
    }

    async fn resume(&self) -> HvResult<()> {
        self.record("resume");
        Ok(())
    }

    async fn undefine(&self) -> HvResult<()> {
        self.record("undefine");
        Ok(())
    }

    async fn set_user_password(&self, user: &str, password: &str) -> HvResult<()> {
        self.record(&format!("set_user_password:{user}:{password}"));
        Ok(())
    }

    async fn attach_device(&self, xml: &str, flags: DeviceModifyFlags) -> HvResult<()> {
        self.device_ops
            .lock()
            .push(("attach".into(), xml.to_string(), flags));
        Ok(())
    }

    async fn detach_device(&self, xml: &str, flags: DeviceModifyFlags) -> HvResult<()> {
        self.device_ops
            .lock()
            .push(("detach".into(), xml.to_string(), flags));
        Ok(())
    }

    async fn block_resize(&self, device: &str, size_kib: u64) -> HvResult<()> {
        self.record(&format!("block_resize:{device}:{size_kib}"));
        Ok(())
    }

    async fn migrate_to_uri(&self, duri: &str, flags: MigrateFlags) -> HvResult<()> {
        if let Some(err) = self.migrate_error.lock().clone() {
            return Err(err);
        }
        self.migrations.lock().push((duri.to_string(), flags));
        Ok(())
    }

    async fn snapshot_create(
        &self,
        _xml: &str,
        _flags: SnapshotCreateFlags,
    ) -> HvResult<Arc<dyn Snapshot>> {
        let snap = self
            .next_snapshot
            .lock()
            .take()
            .unwrap_or_else(|| MockSnapshot::new("snap-1", None));
        self.snapshots
            .lock()
            .insert(snap.name.clone(), Arc::clone(&snap));
        Ok(snap)
    }

    async fn snapshot_lookup(&self, name: &str) -> HvResult<Arc<dyn Snapshot>> {
        self.snapshots
            .lock()
            .get(name)
            .cloned()
            .map(|s| s as Arc<dyn Snapshot>)
            .ok_or_else(|| {
                HvError::new(HvErrorCode::NoDomainSnapshot, format!("no snapshot {name}"))
            })
    }

    async fn snapshot_names(&self) -> HvResult<Vec<String>> {
        Ok(self.snapshots.lock().keys().cloned().collect())
    }

    async fn memory_stats(&self) -> HvResult<HashMap<String, u64>> {
        Ok(self.memory_stats.lock().clone())
    }

    async fn set_memory_stats_period(&self, period_secs: u32) -> HvResult<()> {
        self.record(&format!("set_memory_stats_period:{period_secs}"));
        if let Some(after) = self.memory_stats_after_period.lock().take() {
            *self.memory_stats.lock() = after;
        }
        Ok(())
    }

    async fn interface_stats(&self, dev: &str) -> HvResult<InterfaceStats> {
        self.interface_stats
            .lock()
            .get(dev)
            .copied()
            .ok_or_else(|| HvError::other(format!("no interface {dev}")))
    }

    async fn block_stats(&self, dev: &str) -> HvResult<BlockStats> {
        self.block_stats
            .lock()
            .get(dev)
            .copied()
            .ok_or_else(|| HvError::other(format!("no block device {dev}")))
    }

    async fn interface_parameters(&self, _mac: &str) -> HvResult<HashMap<String, u64>> {
        Ok(self.iface_params.lock().clone())
    }

    async fn set_interface_parameters(
        &self,
        mac: &str,
        params: &HashMap<String, u64>,
        flags: DeviceModifyFlags,
    ) -> HvResult<()> {
        self.iface_param_sets
            .lock()
            .push((mac.to_string(), params.clone(), flags));
        Ok(())
    }

    async fn agent_command(&self, cmd: &str, _timeout: Duration) -> HvResult<String> {
        self.agent_log.lock().push(cmd.to_string());
        if let Some(handler) = self.agent_handler.lock().as_mut() {
            return handler(cmd);
        }
        if cmd.contains("guest-ping") {
            return Ok(r#"{"return":{}}"#.to_string());
        }
        Err(HvError::new(HvErrorCode::AgentUnresponsive, "no agent"))
    }

    async fn monitor_command(&self, cmd: &str) -> HvResult<String> {
        self.monitor_log.lock().push(cmd.to_string());
        Ok(r#"{"return":{}}"#.to_string())
    }
}

pub struct MockSnapshot {
    pub name: String,
    pub parent: Option<String>,
    pub revert_errors: Mutex<VecDeque<HvError>>,
    pub revert_calls: Mutex<Vec<SnapshotRevertFlags>>,
    pub deleted: Mutex<bool>,
}

impl MockSnapshot {
    pub fn new(name: &str, parent: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            parent: parent.map(str::to_string),
            revert_errors: Mutex::new(VecDeque::new()),
            revert_calls: Mutex::new(Vec::new()),
            deleted: Mutex::new(false),
        })
    }
}

#[async_trait]
impl Snapshot for MockSnapshot {
    async fn name(&self) -> HvResult<String> {
        Ok(self.name.clone())
    }

    async fn parent_name(&self) -> HvResult<String> {
        self.parent.clone().ok_or_else(|| {
            HvError::new(HvErrorCode::NoDomainSnapshot, "snapshot has no parent")
        })
    }

    async fn xml_desc(&self) -> HvResult<String> {
        Ok(format!("<domainsnapshot><name>{}</name></domainsnapshot>", self.name))
    }

    async fn delete(&self) -> HvResult<()> {
        *self.deleted.lock() = true;
        Ok(())
    }

    async fn revert(&self, flags: SnapshotRevertFlags) -> HvResult<()> {
        self.revert_calls.lock().push(flags);
        if let Some(err) = self.revert_errors.lock().pop_front() {
            return Err(err);
        }
        Ok(())
    }
}
