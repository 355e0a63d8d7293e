//! Host-side reporting: liveness beacon, host performance, and the
//! periodic guest-state sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sysinfo::{Disks, Networks, System};
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::emit::Emitters;
use crate::guest::observed_state;
use crate::hypervisor::Connection;
use crate::util::now_ts;

const HEARTBEAT_PAUSE: Duration = Duration::from_secs(2);

/// Fixed-cadence liveness beacon.
pub struct HeartbeatEngine {
    pub emitters: Emitters,
    pub cancel: CancellationToken,
}

impl HeartbeatEngine {
    pub async fn run(self) {
        let node_id = self.emitters.node_id();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(HEARTBEAT_PAUSE) => {}
            }
            self.emitters.host_event.heartbeat(node_id).await;
        }
        tracing::info!("heartbeat engine stopped");
    }
}

/// Walks every domain on a slow cadence and re-emits its state, a
/// safety net for lifecycle callbacks lost while the bus was away.
pub struct GuestStateSweepEngine {
    pub conn: Arc<dyn Connection>,
    pub emitters: Emitters,
    pub cfg: Arc<AgentConfig>,
    pub cancel: CancellationToken,
}

impl GuestStateSweepEngine {
    pub async fn run(self) {
        let pause = Duration::from_secs(self.cfg.state_report_interval.max(1));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
            self.sweep().await;
        }
        tracing::info!("guest state sweep stopped");
    }

    pub(crate) async fn sweep(&self) {
        let domains = match self.conn.list_all_domains().await {
            Ok(domains) => domains,
            Err(e) => {
                tracing::warn!(error = %e, "domain listing failed, skipping sweep");
                return;
            }
        };
        for dom in domains {
            let state =
                observed_state(dom.as_ref(), Duration::from_secs(self.cfg.ga_ping_timeout))
                    .await;
            self.emitters.guest_event.state(state, &dom.uuid()).await;
        }
    }
}

/// Host cpu/memory, NIC traffic and filesystem usage on the same
/// interval discipline as the guest collector.
pub struct HostPerfEngine {
    pub emitters: Emitters,
    pub cfg: Arc<AgentConfig>,
    pub cancel: CancellationToken,

    sys: System,
    networks: Networks,
    disks: Disks,
    last_net: HashMap<String, NetCursor>,
}

struct NetCursor {
    rx_bytes: u64,
    rx_packets: u64,
    tx_bytes: u64,
    tx_packets: u64,
}

impl HostPerfEngine {
    pub fn new(emitters: Emitters, cfg: Arc<AgentConfig>, cancel: CancellationToken) -> Self {
        Self {
            emitters,
            cfg,
            cancel,
            sys: System::new(),
            networks: Networks::new_with_refreshed_list(),
            disks: Disks::new_with_refreshed_list(),
            last_net: HashMap::new(),
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
            if now_ts() % self.cfg.interval as i64 != 0 {
                continue;
            }
            self.sample().await;
        }
        tracing::info!("host performance engine stopped");
    }

    pub(crate) async fn sample(&mut self) {
        self.cpu_memory_report().await;
        self.traffic_report().await;
        self.disk_usage_report().await;
    }

    async fn cpu_memory_report(&mut self) {
        self.sys.refresh_memory();
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let load = System::load_average();
        let cpu_load = (load.five / cpu_count as f64 * 100.0).min(100.0);

        self.emitters
            .host_perf
            .cpu_memory(json!({
                "cpu_load": cpu_load,
                "memory_total": self.sys.total_memory(),
                "memory_available": self.sys.available_memory(),
                "memory_free": self.sys.free_memory(),
            }))
            .await;
    }

    async fn traffic_report(&mut self) {
        self.networks.refresh();
        let interval = self.cfg.interval;
        let mut data = Vec::new();

        for (name, stats) in &self.networks {
            let rx_bytes = stats.total_received();
            let rx_packets = stats.total_packets_received();
            let tx_bytes = stats.total_transmitted();
            let tx_packets = stats.total_packets_transmitted();

            if let Some(prev) = self.last_net.get(name) {
                data.push(json!({
                    "name": name,
                    "rx_bytes": rx_bytes.saturating_sub(prev.rx_bytes) / interval,
                    "rx_packets": rx_packets.saturating_sub(prev.rx_packets) / interval,
                    "tx_bytes": tx_bytes.saturating_sub(prev.tx_bytes) / interval,
                    "tx_packets": tx_packets.saturating_sub(prev.tx_packets) / interval,
                }));
            }
            self.last_net.insert(
                name.clone(),
                NetCursor { rx_bytes, rx_packets, tx_bytes, tx_packets },
            );
        }

        if !data.is_empty() {
            self.emitters.host_perf.traffic(data).await;
        }
    }

    async fn disk_usage_report(&mut self) {
        self.disks.refresh();
        let mut data = Vec::new();
        for disk in &self.disks {
            let total = disk.total_space();
            let available = disk.available_space();
            data.push(json!({
                "mount": disk.mount_point().to_string_lossy(),
                "total": total,
                "available": available,
                "used": total.saturating_sub(available),
            }));
        }
        if !data.is_empty() {
            self.emitters.host_perf.disk_usage_io(data).await;
        }
    }
}
