//! Lifecycle-event translation: hypervisor callbacks in, guest events
//! out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::emit::Emitters;
use crate::guest::observed_state;
use crate::hypervisor::event::DomainEvent;
use crate::hypervisor::{Connection, XmlFlags};

pub struct LifecycleEngine {
    pub conn: Arc<dyn Connection>,
    pub emitters: Emitters,
    pub cfg: Arc<AgentConfig>,
    pub cancel: CancellationToken,
}

impl LifecycleEngine {
    pub async fn run(self, mut events: UnboundedReceiver<DomainEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.handle(event).await;
                }
            }
        }
        tracing::info!("lifecycle event engine stopped");
    }

    async fn handle(&self, event: DomainEvent) {
        match event {
            DomainEvent::Lifecycle { uuid } => {
                // An undefine callback races its own lookup; gone is gone.
                let Ok(dom) = self.conn.lookup_by_uuid(&uuid).await else {
                    tracing::debug!(uuid = %uuid, "event for a domain no longer present");
                    return;
                };
                let state =
                    observed_state(dom.as_ref(), Duration::from_secs(self.cfg.ga_ping_timeout))
                        .await;
                self.emitters
                    .log
                    .info(&format!(
                        "domain {}, uuid {uuid} state changed to {}",
                        dom.name(),
                        state.as_str()
                    ))
                    .await;
                self.emitters.guest_event.state(state, &uuid).await;
            }
            DomainEvent::DefinitionChanged { uuid } => {
                let Ok(dom) = self.conn.lookup_by_uuid(&uuid).await else {
                    tracing::debug!(uuid = %uuid, "definition event for a domain no longer present");
                    return;
                };
                match dom.xml_desc(XmlFlags::SECURE).await {
                    Ok(xml) => self.emitters.guest_event.update(&uuid, &xml).await,
                    Err(e) => {
                        tracing::debug!(uuid = %uuid, error = %e, "secure xml fetch failed")
                    }
                }
            }
        }
    }
}
