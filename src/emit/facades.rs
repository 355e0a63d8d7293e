//! Typed facades over the raw emitter, one per record kind.

use std::sync::Arc;

use serde_json::{Value, json};

use super::{EmitKind, Emitter};
use crate::bus::Bus;
use crate::guest::GuestState;

/// Bundle handed to engines and operations.
#[derive(Clone)]
pub struct Emitters {
    pub log: LogEmit,
    pub guest_event: GuestEventEmit,
    pub host_event: HostEventEmit,
    pub response: ResponseEmit,
    pub guest_perf: GuestPerfEmit,
    pub host_perf: HostPerfEmit,
}

impl Emitters {
    pub fn new(bus: Arc<dyn Bus>, upstream_queue: &str, hostname: &str) -> Self {
        let inner = Emitter::new(bus, upstream_queue.to_string(), hostname.to_string());
        Self {
            log: LogEmit { inner: inner.clone() },
            guest_event: GuestEventEmit { inner: inner.clone() },
            host_event: HostEventEmit { inner: inner.clone() },
            response: ResponseEmit { inner: inner.clone() },
            guest_perf: GuestPerfEmit { inner: inner.clone() },
            host_perf: HostPerfEmit { inner },
        }
    }

    pub fn node_id(&self) -> u64 {
        self.log.inner.node_id()
    }
}

/// Mirrors each record into the local tracing log as well, so operator
/// logs and the central store tell the same story.
#[derive(Clone)]
pub struct LogEmit {
    inner: Emitter,
}

impl LogEmit {
    pub async fn debug(&self, msg: &str) {
        tracing::debug!("{msg}");
        self.inner.emit(EmitKind::Log, "debug", json!(msg)).await;
    }

    pub async fn info(&self, msg: &str) {
        tracing::info!("{msg}");
        self.inner.emit(EmitKind::Log, "info", json!(msg)).await;
    }

    pub async fn warn(&self, msg: &str) {
        tracing::warn!("{msg}");
        self.inner.emit(EmitKind::Log, "warn", json!(msg)).await;
    }

    pub async fn error(&self, msg: &str) {
        tracing::error!("{msg}");
        self.inner.emit(EmitKind::Log, "error", json!(msg)).await;
    }
}

#[derive(Clone)]
pub struct GuestEventEmit {
    inner: Emitter,
}

impl GuestEventEmit {
    async fn emit(
        &self,
        type_: &str,
        uuid: &str,
        os_template_image_id: Option<&str>,
        migrating_info: Option<Value>,
        xml: Option<&str>,
        progress: Option<u8>,
    ) {
        self.inner
            .emit(
                EmitKind::GuestEvent,
                type_,
                json!({
                    "uuid": uuid,
                    "os_template_image_id": os_template_image_id,
                    "migrating_info": migrating_info,
                    "xml": xml,
                    "progress": progress,
                }),
            )
            .await;
    }

    /// Plain state-change event.
    pub async fn state(&self, state: GuestState, uuid: &str) {
        self.emit(state.as_str(), uuid, None, None, None, None).await;
    }

    pub async fn update(&self, uuid: &str, xml: &str) {
        self.emit(GuestState::Update.as_str(), uuid, None, None, Some(xml), None)
            .await;
    }

    pub async fn creating(&self, uuid: &str, progress: u8) {
        self.emit(GuestState::Creating.as_str(), uuid, None, None, None, Some(progress))
            .await;
    }

    pub async fn snapshot_converting(&self, uuid: &str, os_template_image_id: &str, progress: u8) {
        self.emit(
            GuestState::SnapshotConverting.as_str(),
            uuid,
            Some(os_template_image_id),
            None,
            None,
            Some(progress),
        )
        .await;
    }

    pub async fn migrating(&self, uuid: &str, migrating_info: Value) {
        self.emit(
            GuestState::Migrating.as_str(),
            uuid,
            None,
            Some(migrating_info),
            None,
            None,
        )
        .await;
    }
}

#[derive(Clone)]
pub struct HostEventEmit {
    inner: Emitter,
}

impl HostEventEmit {
    pub async fn heartbeat(&self, node_id: u64) {
        self.inner
            .emit(EmitKind::HostEvent, "heartbeat", json!({"node_id": node_id}))
            .await;
    }
}

#[derive(Clone)]
pub struct ResponseEmit {
    inner: Emitter,
}

impl ResponseEmit {
    async fn emit(
        &self,
        type_: &str,
        object: Option<&str>,
        action: &str,
        uuid: Option<&str>,
        data: Value,
        passback_parameters: Option<&Value>,
    ) {
        self.inner
            .emit(
                EmitKind::Response,
                type_,
                json!({
                    "_object": object,
                    "action": action,
                    "uuid": uuid,
                    "data": data,
                    "passback_parameters": passback_parameters,
                }),
            )
            .await;
    }

    pub async fn success(
        &self,
        object: Option<&str>,
        action: &str,
        uuid: Option<&str>,
        data: Value,
        passback_parameters: Option<&Value>,
    ) {
        self.emit("success", object, action, uuid, data, passback_parameters)
            .await;
    }

    pub async fn failure(
        &self,
        object: Option<&str>,
        action: &str,
        uuid: Option<&str>,
        passback_parameters: Option<&Value>,
    ) {
        self.emit(
            "failure",
            object,
            action,
            uuid,
            Value::Null,
            passback_parameters,
        )
        .await;
    }
}

#[derive(Clone)]
pub struct GuestPerfEmit {
    inner: Emitter,
}

impl GuestPerfEmit {
    pub async fn cpu_memory(&self, data: Vec<Value>) {
        self.inner
            .emit(EmitKind::GuestPerf, "cpu_memory", json!({"data": data}))
            .await;
    }

    pub async fn traffic(&self, data: Vec<Value>) {
        self.inner
            .emit(EmitKind::GuestPerf, "traffic", json!({"data": data}))
            .await;
    }

    pub async fn disk_io(&self, data: Vec<Value>) {
        self.inner
            .emit(EmitKind::GuestPerf, "disk_io", json!({"data": data}))
            .await;
    }
}

#[derive(Clone)]
pub struct HostPerfEmit {
    inner: Emitter,
}

impl HostPerfEmit {
    pub async fn cpu_memory(&self, data: Value) {
        self.inner
            .emit(EmitKind::HostPerf, "cpu_memory", json!({"data": data}))
            .await;
    }

    pub async fn traffic(&self, data: Vec<Value>) {
        self.inner
            .emit(EmitKind::HostPerf, "traffic", json!({"data": data}))
            .await;
    }

    pub async fn disk_usage_io(&self, data: Vec<Value>) {
        self.inner
            .emit(EmitKind::HostPerf, "disk_usage_io", json!({"data": data}))
            .await;
    }
}
