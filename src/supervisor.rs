//! Engine-set lifecycle.
//!
//! Owns the shared collaborators, spawns every engine, waits for the
//! hypervisor event loop before subscribing callbacks, and tears the
//! set down on SIGTERM/SIGINT.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::Bus;
use crate::config::AgentConfig;
use crate::emit::Emitters;
use crate::engine::creating::CreatingProgressEngine;
use crate::engine::dispatch::DispatchEngine;
use crate::engine::host::{GuestStateSweepEngine, HeartbeatEngine, HostPerfEngine};
use crate::engine::lifecycle::LifecycleEngine;
use crate::engine::perf::PerfEngine;
use crate::errors::{AgentError, Result};
use crate::guest::GuestOps;
use crate::hypervisor::Connection;
use crate::hypervisor::event::EventLoopHandle;
use crate::inspect::InspectorFactory;
use crate::ssh::RemoteExec;
use crate::storage::StorageManager;
use crate::util;

/// How long the main task waits for the event loop to report running
/// before subscribing callbacks. Subscribing earlier races the loop's
/// internal timer setup.
const EVENT_LOOP_WAIT: Duration = Duration::from_secs(10);

pub struct Collaborators {
    pub conn: Arc<dyn Connection>,
    pub event_loop: Arc<dyn EventLoopHandle>,
    pub bus: Arc<dyn Bus>,
    pub storage: Arc<StorageManager>,
    pub inspectors: Arc<dyn InspectorFactory>,
    pub remote: Arc<dyn RemoteExec>,
}

/// Run the agent until `cancel` fires (the installed signal handlers
/// cancel it on SIGTERM/SIGINT).
pub async fn run(cfg: Arc<AgentConfig>, c: Collaborators, cancel: CancellationToken) -> Result<()> {
    let hostname = util::hostname();
    let emitters = Emitters::new(Arc::clone(&c.bus), &cfg.upstream_queue, &hostname);

    spawn_signal_watcher(cancel.clone());

    // Event loop on its own OS thread; everything else is a task.
    c.event_loop.register()?;
    let loop_running = Arc::new(AtomicBool::new(false));
    let loop_thread = {
        let handle = Arc::clone(&c.event_loop);
        let running = Arc::clone(&loop_running);
        let cancel = cancel.clone();
        std::thread::Builder::new()
            .name("hypervisor-event-loop".into())
            .spawn(move || {
                while !cancel.is_cancelled() {
                    match handle.run_once() {
                        Ok(()) => running.store(true, Ordering::SeqCst),
                        Err(e) => {
                            tracing::warn!(error = %e, "event loop iteration failed");
                            std::thread::sleep(Duration::from_secs(1));
                        }
                    }
                }
            })
            .map_err(|e| AgentError::Internal(format!("event loop thread: {e}")))?
    };

    let waited = tokio::time::timeout(EVENT_LOOP_WAIT, async {
        while !loop_running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if waited.is_err() {
        tracing::warn!("event loop not confirmed running, subscribing anyway");
    }

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let callback_token = c.conn.register_domain_events(event_tx)?;

    let (creating_tx, creating_rx) = mpsc::unbounded_channel();
    let ops = Arc::new(GuestOps::new(
        Arc::clone(&c.conn),
        Arc::clone(&c.bus),
        Arc::clone(&c.storage),
        emitters.clone(),
        Arc::clone(&c.inspectors),
        Arc::clone(&c.remote),
        Arc::clone(&cfg),
        creating_tx,
    ));

    let dispatch = Arc::new(DispatchEngine {
        conn: Arc::clone(&c.conn),
        bus: Arc::clone(&c.bus),
        ops,
        emitters: emitters.clone(),
        cfg: Arc::clone(&cfg),
        cancel: cancel.clone(),
    });

    let lifecycle = LifecycleEngine {
        conn: Arc::clone(&c.conn),
        emitters: emitters.clone(),
        cfg: Arc::clone(&cfg),
        cancel: cancel.clone(),
    };
    let perf = PerfEngine::new(
        Arc::clone(&c.conn),
        emitters.clone(),
        Arc::clone(&cfg),
        cancel.clone(),
    );
    let heartbeat = HeartbeatEngine { emitters: emitters.clone(), cancel: cancel.clone() };
    let host_perf = HostPerfEngine::new(emitters.clone(), Arc::clone(&cfg), cancel.clone());
    let sweep = GuestStateSweepEngine {
        conn: Arc::clone(&c.conn),
        emitters: emitters.clone(),
        cfg: Arc::clone(&cfg),
        cancel: cancel.clone(),
    };
    let creating = CreatingProgressEngine::new(
        Arc::clone(&c.conn),
        Arc::clone(&c.storage),
        emitters.clone(),
        cancel.clone(),
    );

    let tasks = vec![
        tokio::spawn(Arc::clone(&dispatch).run_queue_loop()),
        tokio::spawn(dispatch.run_channel_loop()),
        tokio::spawn(lifecycle.run(event_rx)),
        tokio::spawn(perf.run()),
        tokio::spawn(heartbeat.run()),
        tokio::spawn(host_perf.run()),
        tokio::spawn(sweep.run()),
        tokio::spawn(creating.run(creating_rx)),
    ];
    tracing::info!(host = %hostname, node_id = emitters.node_id(), "agent running");

    cancel.cancelled().await;
    tracing::info!("shutting down");

    if let Err(e) = c.conn.deregister_domain_events(callback_token) {
        tracing::warn!(error = %e, "callback deregistration failed");
    }
    for task in tasks {
        let _ = task.await;
    }
    let _ = tokio::task::spawn_blocking(move || loop_thread.join()).await;

    tracing::info!("agent stopped");
    Ok(())
}

fn spawn_signal_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "cannot install SIGTERM handler");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "cannot install SIGINT handler");
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => tracing::info!("SIGTERM received"),
            _ = int.recv() => tracing::info!("SIGINT received"),
        }
        cancel.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::MemoryBus;
    use crate::guest::ops::testsupport::{RecordingInspectors, ScriptedRemote};
    use crate::hypervisor::HvResult;
    use crate::hypervisor::mock::MockConnection;
    use crate::storage::FuseMounter;

    struct IdleEventLoop;

    impl EventLoopHandle for IdleEventLoop {
        fn register(&self) -> HvResult<()> {
            Ok(())
        }

        fn run_once(&self) -> HvResult<()> {
            std::thread::sleep(Duration::from_millis(10));
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_engine_set_starts_and_stops() {
        let conn = MockConnection::new();
        let bus = MemoryBus::new();
        let cfg: Arc<AgentConfig> = Arc::new(
            serde_json::from_str(r#"{"bus_url": "redis://127.0.0.1:6379/0"}"#).unwrap(),
        );
        let collaborators = Collaborators {
            conn: Arc::clone(&conn) as Arc<dyn Connection>,
            event_loop: Arc::new(IdleEventLoop),
            bus: Arc::new(bus.clone()),
            storage: Arc::new(StorageManager::new(
                "/usr/bin/qemu-img".into(),
                Arc::new(FuseMounter::new("/tmp".into())),
            )),
            inspectors: Arc::new(RecordingInspectors::default()),
            remote: Arc::new(ScriptedRemote::default()),
        };

        let cancel = CancellationToken::new();
        let supervisor = tokio::spawn(run(Arc::clone(&cfg), collaborators, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Callbacks were registered once the loop reported running.
        assert!(conn.event_tx.lock().is_some());

        cancel.cancel();
        supervisor.await.unwrap().unwrap();
        // Shutdown deregistered the lifecycle callbacks.
        assert!(conn.event_tx.lock().is_none());
    }
}
