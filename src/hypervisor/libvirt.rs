//! Production backend over libvirt (cargo feature `libvirt`).
//!
//! High-level calls go through the `virt` crate; surfaces the crate does
//! not wrap (snapshots, qemu channels, typed interface parameters,
//! event registration) drop to `virt::sys`. All methods run under
//! `block_in_place` since libvirt RPCs block the calling thread.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use virt::connect::Connect;
use virt::domain::Domain as VirtDomain;
use virt::sys;

use super::event::{DomainEvent, EventLoopHandle};
use super::{
    BlockStats, Connection, DeviceModifyFlags, Domain, DomainInfo, HvError, HvErrorCode, HvResult,
    InterfaceStats, MigrateFlags, PowerState, Snapshot, SnapshotCreateFlags, SnapshotRevertFlags,
    XmlFlags,
};

// virerror.h codes the agent dispatches on.
const VIR_ERR_SYSTEM_ERROR: c_int = 38;
const VIR_ERR_NO_DOMAIN: c_int = 42;
const VIR_ERR_NO_DOMAIN_SNAPSHOT: c_int = 72;
const VIR_ERR_AGENT_UNRESPONSIVE: c_int = 86;

fn map_code(code: c_int) -> HvErrorCode {
    match code {
        VIR_ERR_SYSTEM_ERROR => HvErrorCode::SystemError,
        VIR_ERR_NO_DOMAIN => HvErrorCode::NoDomain,
        VIR_ERR_NO_DOMAIN_SNAPSHOT => HvErrorCode::NoDomainSnapshot,
        VIR_ERR_AGENT_UNRESPONSIVE => HvErrorCode::AgentUnresponsive,
        _ => HvErrorCode::Other,
    }
}

fn virt_err(e: virt::error::Error) -> HvError {
    HvError::other(e.to_string())
}

/// Pull the thread-local libvirt error after a failed sys call.
unsafe fn last_error() -> HvError {
    let err = unsafe { sys::virGetLastError() };
    if err.is_null() {
        return HvError::other("libvirt call failed without error detail");
    }
    let code = unsafe { (*err).code };
    let message = unsafe {
        let msg = (*err).message;
        if msg.is_null() {
            "libvirt call failed".to_string()
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    };
    HvError::new(map_code(code), message)
}

fn cstring(s: &str) -> HvResult<CString> {
    CString::new(s).map_err(|_| HvError::other("string contains interior nul"))
}

fn blocking<T>(f: impl FnOnce() -> T) -> T {
    tokio::task::block_in_place(f)
}

pub struct LibvirtConnection {
    conn: Connect,
}

// libvirt connections are documented thread-safe for concurrent method
// calls; the raw pointer inside `Connect` is what blocks the auto impls.
unsafe impl Send for LibvirtConnection {}
unsafe impl Sync for LibvirtConnection {}

impl LibvirtConnection {
    pub fn open(uri: &str) -> HvResult<Arc<Self>> {
        let uri = if uri.is_empty() { None } else { Some(uri) };
        let conn = Connect::open(uri).map_err(virt_err)?;
        Ok(Arc::new(Self { conn }))
    }
}

extern "C" fn lifecycle_callback(
    _conn: sys::virConnectPtr,
    dom: sys::virDomainPtr,
    event: c_int,
    _detail: c_int,
    opaque: *mut c_void,
) -> c_int {
    let mut buf = [0 as c_char; 37];
    if unsafe { sys::virDomainGetUUIDString(dom, buf.as_mut_ptr()) } < 0 {
        return 0;
    }
    let uuid = unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    let tx = unsafe { &*(opaque as *const UnboundedSender<DomainEvent>) };
    let ev = if event == sys::VIR_DOMAIN_EVENT_DEFINED as c_int {
        DomainEvent::DefinitionChanged { uuid }
    } else {
        DomainEvent::Lifecycle { uuid }
    };
    let _ = tx.send(ev);
    0
}

extern "C" fn free_callback_opaque(opaque: *mut c_void) {
    drop(unsafe { Box::from_raw(opaque as *mut UnboundedSender<DomainEvent>) });
}

#[async_trait]
impl Connection for LibvirtConnection {
    async fn define_xml(&self, xml: &str) -> HvResult<Arc<dyn Domain>> {
        let dom = blocking(|| VirtDomain::define_xml(&self.conn, xml)).map_err(virt_err)?;
        Ok(Arc::new(LibvirtDomain::wrap(dom)?))
    }

    async fn lookup_by_uuid(&self, uuid: &str) -> HvResult<Arc<dyn Domain>> {
        let dom = blocking(|| VirtDomain::lookup_by_uuid_string(&self.conn, uuid))
            .map_err(|e| HvError::new(HvErrorCode::NoDomain, e.to_string()))?;
        Ok(Arc::new(LibvirtDomain::wrap(dom)?))
    }

    async fn list_all_domains(&self) -> HvResult<Vec<Arc<dyn Domain>>> {
        let flags =
            sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;
        let domains = blocking(|| self.conn.list_all_domains(flags)).map_err(virt_err)?;
        let mut out = Vec::with_capacity(domains.len());
        for dom in domains {
            out.push(Arc::new(LibvirtDomain::wrap(dom)?) as Arc<dyn Domain>);
        }
        Ok(out)
    }

    fn register_domain_events(&self, tx: UnboundedSender<DomainEvent>) -> HvResult<u32> {
        let opaque = Box::into_raw(Box::new(tx)) as *mut c_void;
        let cb: sys::virConnectDomainEventGenericCallback =
            unsafe { std::mem::transmute(lifecycle_callback as *const ()) };
        let id = unsafe {
            sys::virConnectDomainEventRegisterAny(
                self.conn.as_ptr(),
                std::ptr::null_mut(),
                sys::VIR_DOMAIN_EVENT_ID_LIFECYCLE as c_int,
                cb,
                opaque,
                Some(free_callback_opaque),
            )
        };
        if id < 0 {
            // Registration failed; reclaim the sender ourselves.
            free_callback_opaque(opaque);
            return Err(unsafe { last_error() });
        }
        Ok(id as u32)
    }

    fn deregister_domain_events(&self, token: u32) -> HvResult<()> {
        let rc = unsafe {
            sys::virConnectDomainEventDeregisterAny(self.conn.as_ptr(), token as c_int)
        };
        if rc < 0 {
            return Err(unsafe { last_error() });
        }
        Ok(())
    }
}

/// Registers and drives libvirt's default poll loop.
pub struct LibvirtEventLoop;

impl EventLoopHandle for LibvirtEventLoop {
    fn register(&self) -> HvResult<()> {
        if unsafe { sys::virEventRegisterDefaultImpl() } < 0 {
            return Err(unsafe { last_error() });
        }
        Ok(())
    }

    fn run_once(&self) -> HvResult<()> {
        if unsafe { sys::virEventRunDefaultImpl() } < 0 {
            return Err(unsafe { last_error() });
        }
        Ok(())
    }
}

pub struct LibvirtDomain {
    dom: VirtDomain,
    uuid: String,
    name: String,
}

unsafe impl Send for LibvirtDomain {}
unsafe impl Sync for LibvirtDomain {}

impl LibvirtDomain {
    fn wrap(dom: VirtDomain) -> HvResult<Self> {
        let uuid = dom.get_uuid_string().map_err(virt_err)?;
        let name = dom.get_name().map_err(virt_err)?;
        Ok(Self { dom, uuid, name })
    }

    fn ptr(&self) -> sys::virDomainPtr {
        self.dom.as_ptr()
    }
}

fn power_state(state: u32) -> PowerState {
    match state {
        sys::VIR_DOMAIN_RUNNING => PowerState::Running,
        sys::VIR_DOMAIN_BLOCKED => PowerState::Blocked,
        sys::VIR_DOMAIN_PAUSED => PowerState::Paused,
        sys::VIR_DOMAIN_SHUTDOWN => PowerState::Shutdown,
        sys::VIR_DOMAIN_SHUTOFF => PowerState::Shutoff,
        sys::VIR_DOMAIN_CRASHED => PowerState::Crashed,
        sys::VIR_DOMAIN_PMSUSPENDED => PowerState::PmSuspended,
        _ => PowerState::NoState,
    }
}

#[async_trait]
impl Domain for LibvirtDomain {
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn info(&self) -> HvResult<DomainInfo> {
        let info = blocking(|| self.dom.get_info()).map_err(virt_err)?;
        Ok(DomainInfo {
            state: power_state(info.state),
            max_mem_kib: info.max_mem,
            mem_kib: info.memory,
            cpu_count: info.nr_virt_cpu,
            cpu_time_ns: info.cpu_time,
        })
    }

    async fn is_active(&self) -> HvResult<bool> {
        blocking(|| self.dom.is_active()).map_err(virt_err)
    }

    async fn xml_desc(&self, flags: XmlFlags) -> HvResult<String> {
        blocking(|| self.dom.get_xml_desc(flags.bits())).map_err(virt_err)
    }

    async fn create(&self) -> HvResult<()> {
        blocking(|| self.dom.create()).map_err(virt_err)?;
        Ok(())
    }

    async fn destroy(&self) -> HvResult<()> {
        blocking(|| self.dom.destroy()).map_err(virt_err)
    }

    async fn shutdown(&self) -> HvResult<()> {
        blocking(|| self.dom.shutdown()).map(|_| ()).map_err(virt_err)
    }

    async fn reboot(&self) -> HvResult<()> {
        blocking(|| self.dom.reboot(0)).map_err(virt_err)
    }

    async fn suspend(&self) -> HvResult<()> {
        blocking(|| self.dom.suspend()).map(|_| ()).map_err(virt_err)
    }

    async fn resume(&self) -> HvResult<()> {
        blocking(|| self.dom.resume()).map(|_| ()).map_err(virt_err)
    }

    async fn undefine(&self) -> HvResult<()> {
        blocking(|| self.dom.undefine()).map_err(virt_err)
    }

    async fn set_user_password(&self, user: &str, password: &str) -> HvResult<()> {
        let user = cstring(user)?;
        let password = cstring(password)?;
        blocking(|| {
            let rc = unsafe {
                sys::virDomainSetUserPassword(self.ptr(), user.as_ptr(), password.as_ptr(), 0)
            };
            if rc < 0 {
                return Err(unsafe { last_error() });
            }
            Ok(())
        })
    }

    async fn attach_device(&self, xml: &str, flags: DeviceModifyFlags) -> HvResult<()> {
        blocking(|| self.dom.attach_device_flags(xml, flags.bits())).map(|_| ()).map_err(virt_err)
    }

    async fn detach_device(&self, xml: &str, flags: DeviceModifyFlags) -> HvResult<()> {
        blocking(|| self.dom.detach_device_flags(xml, flags.bits())).map(|_| ()).map_err(virt_err)
    }

    async fn block_resize(&self, device: &str, size_kib: u64) -> HvResult<()> {
        let device = cstring(device)?;
        blocking(|| {
            let rc =
                unsafe { sys::virDomainBlockResize(self.ptr(), device.as_ptr(), size_kib, 0) };
            if rc < 0 {
                return Err(unsafe { last_error() });
            }
            Ok(())
        })
    }

    async fn migrate_to_uri(&self, duri: &str, flags: MigrateFlags) -> HvResult<()> {
        let duri = cstring(duri)?;
        blocking(|| {
            let rc = unsafe {
                sys::virDomainMigrateToURI(
                    self.ptr(),
                    duri.as_ptr(),
                    flags.bits() as libc::c_ulong,
                    std::ptr::null(),
                    0,
                )
            };
            if rc < 0 {
                return Err(unsafe { last_error() });
            }
            Ok(())
        })
    }

    async fn snapshot_create(
        &self,
        xml: &str,
        flags: SnapshotCreateFlags,
    ) -> HvResult<Arc<dyn Snapshot>> {
        let xml = cstring(xml)?;
        blocking(|| {
            let ptr = unsafe {
                sys::virDomainSnapshotCreateXML(self.ptr(), xml.as_ptr(), flags.bits())
            };
            if ptr.is_null() {
                return Err(unsafe { last_error() });
            }
            Ok(Arc::new(LibvirtSnapshot { ptr }) as Arc<dyn Snapshot>)
        })
    }

    async fn snapshot_lookup(&self, name: &str) -> HvResult<Arc<dyn Snapshot>> {
        let name = cstring(name)?;
        blocking(|| {
            let ptr =
                unsafe { sys::virDomainSnapshotLookupByName(self.ptr(), name.as_ptr(), 0) };
            if ptr.is_null() {
                return Err(unsafe { last_error() });
            }
            Ok(Arc::new(LibvirtSnapshot { ptr }) as Arc<dyn Snapshot>)
        })
    }

    async fn snapshot_names(&self) -> HvResult<Vec<String>> {
        blocking(|| {
            let mut names: *mut sys::virDomainSnapshotPtr = std::ptr::null_mut();
            let count =
                unsafe { sys::virDomainListAllSnapshots(self.ptr(), &mut names, 0) };
            if count < 0 {
                return Err(unsafe { last_error() });
            }
            let mut out = Vec::with_capacity(count as usize);
            for i in 0..count as isize {
                let snap = unsafe { *names.offset(i) };
                let name = unsafe { sys::virDomainSnapshotGetName(snap) };
                if !name.is_null() {
                    out.push(
                        unsafe { CStr::from_ptr(name) }
                            .to_string_lossy()
                            .into_owned(),
                    );
                }
                unsafe { sys::virDomainSnapshotFree(snap) };
            }
            unsafe { libc::free(names as *mut c_void) };
            Ok(out)
        })
    }

    async fn memory_stats(&self) -> HvResult<HashMap<String, u64>> {
        blocking(|| {
            let mut stats =
                [unsafe { std::mem::zeroed::<sys::virDomainMemoryStatStruct>() }; 16];
            let count = unsafe {
                sys::virDomainMemoryStats(self.ptr(), stats.as_mut_ptr(), stats.len() as u32, 0)
            };
            if count < 0 {
                return Err(unsafe { last_error() });
            }
            let mut out = HashMap::new();
            for stat in &stats[..count as usize] {
                let name = match stat.tag as u32 {
                    sys::VIR_DOMAIN_MEMORY_STAT_SWAP_IN => "swap_in",
                    sys::VIR_DOMAIN_MEMORY_STAT_SWAP_OUT => "swap_out",
                    sys::VIR_DOMAIN_MEMORY_STAT_MAJOR_FAULT => "major_fault",
                    sys::VIR_DOMAIN_MEMORY_STAT_MINOR_FAULT => "minor_fault",
                    sys::VIR_DOMAIN_MEMORY_STAT_UNUSED => "unused",
                    sys::VIR_DOMAIN_MEMORY_STAT_AVAILABLE => "available",
                    sys::VIR_DOMAIN_MEMORY_STAT_ACTUAL_BALLOON => "actual",
                    sys::VIR_DOMAIN_MEMORY_STAT_RSS => "rss",
                    _ => continue,
                };
                out.insert(name.to_string(), stat.val);
            }
            Ok(out)
        })
    }

    async fn set_memory_stats_period(&self, period_secs: u32) -> HvResult<()> {
        blocking(|| {
            let rc = unsafe {
                sys::virDomainSetMemoryStatsPeriod(
                    self.ptr(),
                    period_secs as c_int,
                    sys::VIR_DOMAIN_AFFECT_LIVE,
                )
            };
            if rc < 0 {
                return Err(unsafe { last_error() });
            }
            Ok(())
        })
    }

    async fn interface_stats(&self, dev: &str) -> HvResult<InterfaceStats> {
        let dev = cstring(dev)?;
        blocking(|| {
            let mut stats = unsafe { std::mem::zeroed::<sys::virDomainInterfaceStatsStruct>() };
            let rc = unsafe {
                sys::virDomainInterfaceStats(
                    self.ptr(),
                    dev.as_ptr(),
                    &mut stats,
                    std::mem::size_of::<sys::virDomainInterfaceStatsStruct>(),
                )
            };
            if rc < 0 {
                return Err(unsafe { last_error() });
            }
            let clamp = |v: i64| v.max(0) as u64;
            Ok(InterfaceStats {
                rx_bytes: clamp(stats.rx_bytes),
                rx_packets: clamp(stats.rx_packets),
                rx_errs: clamp(stats.rx_errs),
                rx_drop: clamp(stats.rx_drop),
                tx_bytes: clamp(stats.tx_bytes),
                tx_packets: clamp(stats.tx_packets),
                tx_errs: clamp(stats.tx_errs),
                tx_drop: clamp(stats.tx_drop),
            })
        })
    }

    async fn block_stats(&self, dev: &str) -> HvResult<BlockStats> {
        let dev = cstring(dev)?;
        blocking(|| {
            let mut stats = unsafe { std::mem::zeroed::<sys::virDomainBlockStatsStruct>() };
            let rc = unsafe {
                sys::virDomainBlockStats(
                    self.ptr(),
                    dev.as_ptr(),
                    &mut stats,
                    std::mem::size_of::<sys::virDomainBlockStatsStruct>(),
                )
            };
            if rc < 0 {
                return Err(unsafe { last_error() });
            }
            let clamp = |v: i64| v.max(0) as u64;
            Ok(BlockStats {
                rd_req: clamp(stats.rd_req),
                rd_bytes: clamp(stats.rd_bytes),
                wr_req: clamp(stats.wr_req),
                wr_bytes: clamp(stats.wr_bytes),
            })
        })
    }

    async fn interface_parameters(&self, mac: &str) -> HvResult<HashMap<String, u64>> {
        let mac = cstring(mac)?;
        blocking(|| {
            let mut nparams: c_int = 0;
            let rc = unsafe {
                sys::virDomainGetInterfaceParameters(
                    self.ptr(),
                    mac.as_ptr(),
                    std::ptr::null_mut(),
                    &mut nparams,
                    0,
                )
            };
            if rc < 0 {
                return Err(unsafe { last_error() });
            }
            if nparams == 0 {
                return Ok(HashMap::new());
            }
            let mut params =
                vec![unsafe { std::mem::zeroed::<sys::virTypedParameter>() }; nparams as usize];
            let rc = unsafe {
                sys::virDomainGetInterfaceParameters(
                    self.ptr(),
                    mac.as_ptr(),
                    params.as_mut_ptr(),
                    &mut nparams,
                    0,
                )
            };
            if rc < 0 {
                return Err(unsafe { last_error() });
            }
            let mut out = HashMap::new();
            for p in &params[..nparams as usize] {
                let name = unsafe { CStr::from_ptr(p.field.as_ptr()) }
                    .to_string_lossy()
                    .into_owned();
                // The agent only touches ullong-valued bandwidth params.
                let value = unsafe { *(&p.value as *const _ as *const u64) };
                out.insert(name, value);
            }
            Ok(out)
        })
    }

    async fn set_interface_parameters(
        &self,
        mac: &str,
        params: &HashMap<String, u64>,
        flags: DeviceModifyFlags,
    ) -> HvResult<()> {
        let mac = cstring(mac)?;
        blocking(|| {
            let mut typed = Vec::with_capacity(params.len());
            for (name, value) in params {
                let mut p = unsafe { std::mem::zeroed::<sys::virTypedParameter>() };
                let bytes = name.as_bytes();
                if bytes.len() >= p.field.len() {
                    return Err(HvError::other(format!("parameter name too long: {name}")));
                }
                for (i, b) in bytes.iter().enumerate() {
                    p.field[i] = *b as c_char;
                }
                p.type_ = sys::VIR_TYPED_PARAM_ULLONG as c_int;
                unsafe { *(&mut p.value as *mut _ as *mut u64) = *value };
                typed.push(p);
            }
            let rc = unsafe {
                sys::virDomainSetInterfaceParameters(
                    self.ptr(),
                    mac.as_ptr(),
                    typed.as_mut_ptr(),
                    typed.len() as c_int,
                    flags.bits(),
                )
            };
            if rc < 0 {
                return Err(unsafe { last_error() });
            }
            Ok(())
        })
    }

    async fn agent_command(&self, cmd: &str, timeout: Duration) -> HvResult<String> {
        let cmd = cstring(cmd)?;
        blocking(|| {
            let reply = unsafe {
                sys::virDomainQemuAgentCommand(
                    self.ptr(),
                    cmd.as_ptr(),
                    timeout.as_secs() as c_int,
                    0,
                )
            };
            if reply.is_null() {
                return Err(unsafe { last_error() });
            }
            let out = unsafe { CStr::from_ptr(reply) }
                .to_string_lossy()
                .into_owned();
            unsafe { libc::free(reply as *mut c_void) };
            Ok(out)
        })
    }

    async fn monitor_command(&self, cmd: &str) -> HvResult<String> {
        let cmd = cstring(cmd)?;
        blocking(|| {
            let mut reply: *mut c_char = std::ptr::null_mut();
            let rc = unsafe {
                sys::virDomainQemuMonitorCommand(self.ptr(), cmd.as_ptr(), &mut reply, 0)
            };
            if rc < 0 || reply.is_null() {
                return Err(unsafe { last_error() });
            }
            let out = unsafe { CStr::from_ptr(reply) }
                .to_string_lossy()
                .into_owned();
            unsafe { libc::free(reply as *mut c_void) };
            Ok(out)
        })
    }
}

pub struct LibvirtSnapshot {
    ptr: sys::virDomainSnapshotPtr,
}

unsafe impl Send for LibvirtSnapshot {}
unsafe impl Sync for LibvirtSnapshot {}

impl Drop for LibvirtSnapshot {
    fn drop(&mut self) {
        unsafe { sys::virDomainSnapshotFree(self.ptr) };
    }
}

#[async_trait]
impl Snapshot for LibvirtSnapshot {
    async fn name(&self) -> HvResult<String> {
        blocking(|| {
            let name = unsafe { sys::virDomainSnapshotGetName(self.ptr) };
            if name.is_null() {
                return Err(unsafe { last_error() });
            }
            Ok(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
        })
    }

    async fn parent_name(&self) -> HvResult<String> {
        blocking(|| {
            let parent = unsafe { sys::virDomainSnapshotGetParent(self.ptr, 0) };
            if parent.is_null() {
                return Err(unsafe { last_error() });
            }
            let name = unsafe { sys::virDomainSnapshotGetName(parent) };
            let out = if name.is_null() {
                Err(unsafe { last_error() })
            } else {
                Ok(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
            };
            unsafe { sys::virDomainSnapshotFree(parent) };
            out
        })
    }

    async fn xml_desc(&self) -> HvResult<String> {
        blocking(|| {
            let xml = unsafe { sys::virDomainSnapshotGetXMLDesc(self.ptr, 0) };
            if xml.is_null() {
                return Err(unsafe { last_error() });
            }
            let out = unsafe { CStr::from_ptr(xml) }.to_string_lossy().into_owned();
            unsafe { libc::free(xml as *mut c_void) };
            Ok(out)
        })
    }

    async fn delete(&self) -> HvResult<()> {
        blocking(|| {
            if unsafe { sys::virDomainSnapshotDelete(self.ptr, 0) } < 0 {
                return Err(unsafe { last_error() });
            }
            Ok(())
        })
    }

    async fn revert(&self, flags: SnapshotRevertFlags) -> HvResult<()> {
        blocking(|| {
            if unsafe { sys::virDomainRevertToSnapshot(self.ptr, flags.bits()) } < 0 {
                return Err(unsafe { last_error() });
            }
            Ok(())
        })
    }
}
