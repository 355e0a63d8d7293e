//! Upstream event emission.
//!
//! Every record pushed upstream has the same envelope:
//! `{kind, type, timestamp, host, node_id, message}`. The typed facades
//! in [`facades`] are thin wrappers over [`Emitter::emit`].

mod facades;

pub use facades::{
    Emitters, GuestEventEmit, GuestPerfEmit, HostEventEmit, HostPerfEmit, LogEmit, ResponseEmit,
};

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::bus::Bus;
use crate::util::now_ts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitKind {
    Log,
    GuestEvent,
    HostEvent,
    Response,
    GuestPerf,
    HostPerf,
}

impl EmitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmitKind::Log => "log",
            EmitKind::GuestEvent => "guest_event",
            EmitKind::HostEvent => "host_event",
            EmitKind::Response => "response",
            EmitKind::GuestPerf => "guest_perf",
            EmitKind::HostPerf => "host_perf",
        }
    }
}

/// Stable node identity: the first 16 decimal digits of the hostname's
/// MD5 digest read as a 128-bit integer. Gives every host a 64-bit-range
/// number without central assignment.
pub fn node_id_for(hostname: &str) -> u64 {
    let digest = md5::compute(hostname.as_bytes());
    let value = u128::from_be_bytes(digest.0);
    let decimal = value.to_string();
    let head = &decimal[..decimal.len().min(16)];
    head.parse().unwrap_or(0)
}

#[derive(Clone)]
pub struct Emitter {
    bus: Arc<dyn Bus>,
    queue: String,
    hostname: String,
    node_id: u64,
}

impl Emitter {
    pub fn new(bus: Arc<dyn Bus>, queue: String, hostname: String) -> Self {
        let node_id = node_id_for(&hostname);
        Self { bus, queue, hostname, node_id }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Serialize and push one record. On bus failure: log, then sleep
    /// 5 s before returning so a broken store cannot amplify into a log
    /// flood from the emitting loops.
    pub async fn emit(&self, kind: EmitKind, type_: &str, message: Value) {
        let record = json!({
            "kind": kind.as_str(),
            "type": type_,
            "timestamp": now_ts(),
            "host": self.hostname,
            "node_id": self.node_id,
            "message": message,
        });
        let payload = record.to_string();
        if let Err(e) = self.bus.rpush(&self.queue, payload).await {
            tracing::warn!(kind = kind.as_str(), error = %e, "upstream push failed, backing off");
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::MemoryBus;

    #[test]
    fn node_id_is_deterministic_and_in_u64_range() {
        let a = node_id_for("host-001");
        let b = node_id_for("host-001");
        assert_eq!(a, b);
        assert!(a > 0);
        // 16 decimal digits at most
        assert!(a < 10_000_000_000_000_000);
        assert_ne!(node_id_for("host-001"), node_id_for("host-002"));
    }

    #[tokio::test]
    async fn record_envelope_is_complete() {
        let bus = MemoryBus::new();
        let emitter = Emitter::new(
            Arc::new(bus.clone()),
            "upstream".into(),
            "host-001".into(),
        );
        let before = now_ts();
        emitter
            .emit(EmitKind::HostEvent, "heartbeat", json!({"node_id": 1}))
            .await;

        let records = bus.queue("upstream");
        assert_eq!(records.len(), 1);
        let v: Value = serde_json::from_str(&records[0]).unwrap();
        for key in ["kind", "type", "timestamp", "host", "node_id", "message"] {
            assert!(v.get(key).is_some(), "missing {key}");
        }
        assert_eq!(v["kind"], "host_event");
        assert_eq!(v["host"], "host-001");
        let ts = v["timestamp"].as_i64().unwrap();
        assert!(ts >= before && ts <= now_ts());
    }
}
