//! Guest performance collection.
//!
//! A 1 Hz driver that samples on interval boundaries. Monotonic
//! hypervisor counters become per-interval rates through cursors keyed
//! by guest (cpu), guest+device (traffic) and disk uuid (I/O). The
//! first observation only seeds the cursor; reporting starts with the
//! second. Stale cursors are evicted on the hourly pass and only
//! there, so short-lived guests may leave cursors behind for up to an
//! hour.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::emit::Emitters;
use crate::guest::xml;
use crate::hypervisor::{BlockStats, Connection, Domain, XmlFlags};
use crate::util::now_ts;

struct Cursor<T> {
    value: T,
    timestamp: i64,
}

#[derive(Clone, Copy)]
struct TrafficCounters {
    rx_bytes: u64,
    rx_packets: u64,
    tx_bytes: u64,
    tx_packets: u64,
}

pub struct PerfEngine {
    pub conn: Arc<dyn Connection>,
    pub emitters: Emitters,
    pub cfg: Arc<AgentConfig>,
    pub cancel: CancellationToken,

    last_cpu: HashMap<String, Cursor<u64>>,
    last_traffic: HashMap<String, Cursor<TrafficCounters>>,
    last_disk_io: HashMap<String, Cursor<BlockStats>>,
}

impl PerfEngine {
    pub fn new(
        conn: Arc<dyn Connection>,
        emitters: Emitters,
        cfg: Arc<AgentConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            conn,
            emitters,
            cfg,
            cancel,
            last_cpu: HashMap::new(),
            last_traffic: HashMap::new(),
            last_disk_io: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let ts = now_ts();
            if ts % self.cfg.interval as i64 != 0 {
                continue;
            }
            if ts % 3600 == 0 {
                self.evict_stale(ts);
            }
            self.sample(ts).await;
        }
        tracing::info!("guest performance engine stopped");
    }

    /// One full sampling cycle at interval boundary `ts`.
    pub(crate) async fn sample(&mut self, ts: i64) {
        let domains = match self.conn.list_all_domains().await {
            Ok(domains) => domains,
            Err(e) => {
                tracing::warn!(error = %e, "domain listing failed, skipping sample");
                return;
            }
        };

        let mut active = Vec::new();
        for dom in domains {
            if dom.is_active().await.unwrap_or(false) {
                active.push(dom);
            }
        }

        self.cpu_memory_report(&active, ts).await;
        self.traffic_report(&active, ts).await;
        self.disk_io_report(&active, ts).await;
    }

    async fn cpu_memory_report(&mut self, domains: &[Arc<dyn Domain>], ts: i64) {
        let interval = self.cfg.interval;
        let mut data = Vec::new();

        for dom in domains {
            let uuid = dom.uuid();
            let mut memory = match dom.memory_stats().await {
                Ok(memory) => memory,
                Err(e) => {
                    tracing::debug!(uuid = %uuid, error = %e, "memory stats unavailable");
                    continue;
                }
            };
            if !memory.contains_key("available") {
                // Balloon stats need a collection period before they show.
                let _ = dom.set_memory_stats_period(interval as u32).await;
                memory = dom.memory_stats().await.unwrap_or(memory);
            }
            let Ok(info) = dom.info().await else { continue };

            if let Some(prev) = self.last_cpu.get(&uuid) {
                let delta = info.cpu_time_ns.saturating_sub(prev.value);
                let cpu_load = (delta as f64 / interval as f64 / 1e9 * 100.0
                    / info.cpu_count.max(1) as f64)
                    .min(100.0);
                data.push(json!({
                    "guest_uuid": uuid,
                    "cpu_load": cpu_load,
                    "memory_available": memory.get("available"),
                    "memory_unused": memory.get("unused"),
                }));
            }
            self.last_cpu
                .insert(uuid, Cursor { value: info.cpu_time_ns, timestamp: ts });
        }

        if !data.is_empty() {
            self.emitters.guest_perf.cpu_memory(data).await;
        }
    }

    async fn traffic_report(&mut self, domains: &[Arc<dyn Domain>], ts: i64) {
        let interval = self.cfg.interval;
        let mut data = Vec::new();

        for dom in domains {
            let uuid = dom.uuid();
            let Ok(definition) = dom.xml_desc(XmlFlags::empty()).await else { continue };
            let Ok(interfaces) = xml::interfaces(&definition) else { continue };

            for iface in interfaces {
                let Some(dev) = iface.target_dev else { continue };
                let Ok(stats) = dom.interface_stats(&dev).await else { continue };

                let key = format!("{uuid}_{dev}");
                if let Some(prev) = self.last_traffic.get(&key) {
                    data.push(json!({
                        "guest_uuid": uuid,
                        "name": iface.alias_name,
                        "rx_bytes": stats.rx_bytes.saturating_sub(prev.value.rx_bytes) / interval,
                        "rx_packets":
                            stats.rx_packets.saturating_sub(prev.value.rx_packets) / interval,
                        "rx_errs": stats.rx_errs,
                        "rx_drop": stats.rx_drop,
                        "tx_bytes": stats.tx_bytes.saturating_sub(prev.value.tx_bytes) / interval,
                        "tx_packets":
                            stats.tx_packets.saturating_sub(prev.value.tx_packets) / interval,
                        "tx_errs": stats.tx_errs,
                        "tx_drop": stats.tx_drop,
                    }));
                }
                self.last_traffic.insert(
                    key,
                    Cursor {
                        value: TrafficCounters {
                            rx_bytes: stats.rx_bytes,
                            rx_packets: stats.rx_packets,
                            tx_bytes: stats.tx_bytes,
                            tx_packets: stats.tx_packets,
                        },
                        timestamp: ts,
                    },
                );
            }
        }

        if !data.is_empty() {
            self.emitters.guest_perf.traffic(data).await;
        }
    }

    async fn disk_io_report(&mut self, domains: &[Arc<dyn Domain>], ts: i64) {
        let interval = self.cfg.interval;
        let mut data = Vec::new();

        for dom in domains {
            let Ok(definition) = dom.xml_desc(XmlFlags::empty()).await else { continue };
            let Ok(disks) = xml::disks(&definition) else { continue };

            for disk in disks {
                let Some(dev) = disk.target_dev else { continue };
                // Networked disks carry the image path in source/@name;
                // its filename stem is the disk uuid.
                let Some(path) = disk.source_name else { continue };
                let Some(disk_uuid) = path
                    .rsplit('/')
                    .next()
                    .and_then(|f| f.split('.').next())
                    .map(str::to_string)
                else {
                    continue;
                };
                let Ok(stats) = dom.block_stats(&dev).await else { continue };

                if let Some(prev) = self.last_disk_io.get(&disk_uuid) {
                    data.push(json!({
                        "disk_uuid": disk_uuid,
                        "rd_req": stats.rd_req.saturating_sub(prev.value.rd_req) / interval,
                        "rd_bytes": stats.rd_bytes.saturating_sub(prev.value.rd_bytes) / interval,
                        "wr_req": stats.wr_req.saturating_sub(prev.value.wr_req) / interval,
                        "wr_bytes": stats.wr_bytes.saturating_sub(prev.value.wr_bytes) / interval,
                    }));
                }
                self.last_disk_io
                    .insert(disk_uuid, Cursor { value: stats, timestamp: ts });
            }
        }

        if !data.is_empty() {
            self.emitters.guest_perf.disk_io(data).await;
        }
    }

    /// Hourly pass: anything not refreshed within two intervals goes.
    pub(crate) fn evict_stale(&mut self, ts: i64) {
        let horizon = (self.cfg.interval * 2) as i64;
        self.last_cpu.retain(|_, c| ts - c.timestamp <= horizon);
        self.last_traffic.retain(|_, c| ts - c.timestamp <= horizon);
        self.last_disk_io.retain(|_, c| ts - c.timestamp <= horizon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::MemoryBus;
    use crate::hypervisor::InterfaceStats;
    use crate::hypervisor::mock::{MockConnection, MockDomain};

    const XML: &str = r#"<domain type='kvm'>
  <devices>
    <disk type='network' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source protocol='gluster' name='gv0/images/disk-77.qcow2'>
        <host name='127.0.0.1'/>
      </source>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='bridge'>
      <mac address='52:54:00:00:00:01'/>
      <target dev='vnet0'/>
      <alias name='net0'/>
    </interface>
  </devices>
</domain>"#;

    fn setup() -> (Arc<MockConnection>, MemoryBus, PerfEngine) {
        let conn = MockConnection::new();
        let bus = MemoryBus::new();
        let engine = PerfEngine::new(
            Arc::clone(&conn) as Arc<dyn Connection>,
            Emitters::new(Arc::new(bus.clone()), "upstream", "host-t"),
            Arc::new(
                serde_json::from_str(r#"{"bus_url": "redis://127.0.0.1:6379/0"}"#).unwrap(),
            ),
            CancellationToken::new(),
        );
        (conn, bus, engine)
    }

    fn perf_records(bus: &MemoryBus, type_: &str) -> Vec<Value> {
        bus.queue("upstream")
            .iter()
            .map(|r| serde_json::from_str::<Value>(r).unwrap())
            .filter(|v| v["kind"] == "guest_perf" && v["type"] == type_)
            .collect()
    }

    fn active_domain(conn: &MockConnection) -> Arc<MockDomain> {
        let dom = MockDomain::new("u-1", "g1");
        dom.set_active(true);
        dom.set_xml(XML);
        dom.memory_stats
            .lock()
            .extend([("available".to_string(), 4096u64), ("unused".to_string(), 1024u64)]);
        conn.add(Arc::clone(&dom));
        dom
    }

    #[tokio::test]
    async fn first_sample_seeds_without_emitting() {
        let (conn, bus, mut engine) = setup();
        let dom = active_domain(&conn);
        dom.info.lock().cpu_time_ns = 60_000_000_000;

        engine.sample(60).await;
        assert!(perf_records(&bus, "cpu_memory").is_empty());
        assert!(engine.last_cpu.contains_key("u-1"));
    }

    #[tokio::test]
    async fn two_intervals_of_full_burn_report_100() {
        let (conn, bus, mut engine) = setup();
        let dom = active_domain(&conn);

        dom.info.lock().cpu_time_ns = 60_000_000_000;
        engine.sample(60).await;

        dom.info.lock().cpu_time_ns = 120_000_000_000;
        engine.sample(120).await;

        let records = perf_records(&bus, "cpu_memory");
        assert_eq!(records.len(), 1);
        let sample = &records[0]["message"]["data"][0];
        assert_eq!(sample["guest_uuid"], "u-1");
        assert_eq!(sample["cpu_load"], 100.0);
        assert_eq!(sample["memory_available"], 4096);
    }

    #[tokio::test]
    async fn cpu_load_clamped_to_100() {
        let (conn, bus, mut engine) = setup();
        let dom = active_domain(&conn);

        dom.info.lock().cpu_time_ns = 0;
        engine.sample(60).await;
        // Three minutes of cpu time inside one minute of wall clock.
        dom.info.lock().cpu_time_ns = 180_000_000_000;
        engine.sample(120).await;

        let records = perf_records(&bus, "cpu_memory");
        assert_eq!(records[0]["message"]["data"][0]["cpu_load"], 100.0);
    }

    #[tokio::test]
    async fn memory_period_set_when_available_missing() {
        let (conn, _bus, mut engine) = setup();
        let dom = MockDomain::new("u-2", "g2");
        dom.set_active(true);
        dom.set_xml("<domain><devices/></domain>");
        *dom.memory_stats_after_period.lock() =
            Some(HashMap::from([("available".to_string(), 2048u64)]));
        conn.add(Arc::clone(&dom));

        engine.sample(60).await;
        assert_eq!(dom.call_count("set_memory_stats_period:60"), 1);
    }

    #[tokio::test]
    async fn traffic_rates_are_deltas_errs_absolute() {
        let (conn, bus, mut engine) = setup();
        let dom = active_domain(&conn);
        dom.interface_stats.lock().insert(
            "vnet0".into(),
            InterfaceStats { rx_bytes: 6000, rx_packets: 60, rx_errs: 2, ..Default::default() },
        );

        engine.sample(60).await;
        dom.interface_stats.lock().insert(
            "vnet0".into(),
            InterfaceStats {
                rx_bytes: 12000,
                rx_packets: 120,
                rx_errs: 3,
                tx_bytes: 600,
                ..Default::default()
            },
        );
        engine.sample(120).await;

        let records = perf_records(&bus, "traffic");
        assert_eq!(records.len(), 1);
        let sample = &records[0]["message"]["data"][0];
        assert_eq!(sample["rx_bytes"], 100);
        assert_eq!(sample["rx_packets"], 1);
        assert_eq!(sample["rx_errs"], 3);
        assert_eq!(sample["tx_bytes"], 10);
        assert_eq!(sample["name"], "net0");
    }

    #[tokio::test]
    async fn disk_io_keyed_by_filename_stem() {
        let (conn, bus, mut engine) = setup();
        let dom = active_domain(&conn);
        dom.block_stats.lock().insert(
            "vda".into(),
            BlockStats { rd_req: 600, rd_bytes: 6000, wr_req: 60, wr_bytes: 600 },
        );

        engine.sample(60).await;
        dom.block_stats.lock().insert(
            "vda".into(),
            BlockStats { rd_req: 1200, rd_bytes: 12000, wr_req: 120, wr_bytes: 1200 },
        );
        engine.sample(120).await;

        let records = perf_records(&bus, "disk_io");
        assert_eq!(records.len(), 1);
        let sample = &records[0]["message"]["data"][0];
        assert_eq!(sample["disk_uuid"], "disk-77");
        assert_eq!(sample["rd_req"], 10);
        assert_eq!(sample["wr_bytes"], 10);
    }

    #[tokio::test]
    async fn eviction_only_touches_stale_cursors() {
        let (conn, _bus, mut engine) = setup();
        let dom = active_domain(&conn);
        dom.info.lock().cpu_time_ns = 1;

        engine.sample(60).await;
        assert!(engine.last_cpu.contains_key("u-1"));

        // Within two intervals: survives the hourly pass.
        engine.evict_stale(60 + 120);
        assert!(engine.last_cpu.contains_key("u-1"));

        // Beyond two intervals: evicted.
        engine.evict_stale(60 + 121);
        assert!(!engine.last_cpu.contains_key("u-1"));
    }

    #[tokio::test]
    async fn inactive_domains_are_skipped() {
        let (conn, bus, mut engine) = setup();
        let dom = MockDomain::new("u-3", "g3");
        dom.set_xml(XML);
        conn.add(dom);

        engine.sample(60).await;
        engine.sample(120).await;
        assert!(bus.queue("upstream").is_empty());
        assert!(engine.last_cpu.is_empty());
    }
}
