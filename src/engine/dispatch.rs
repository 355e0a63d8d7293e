//! Command dispatch: the queue-consumer and channel-consumer loops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::bus::{Action, Bus, Instruction};
use crate::config::AgentConfig;
use crate::emit::Emitters;
use crate::errors::Result;
use crate::guest::{DirtyScene, GuestOps};
use crate::hypervisor::{Connection, Domain};

const BUS_RETRY_PAUSE: Duration = Duration::from_secs(5);
const SUBSCRIPTION_POLL: Duration = Duration::from_secs(1);

/// New work is refused once the 5-minute load average exceeds 60% of
/// the core count.
pub(crate) fn admission_denied(load_avg: f64, cpu_count: usize) -> bool {
    load_avg > cpu_count as f64 * 0.6
}

/// The pop pacing grows with load; +1 keeps an idle host from spinning.
pub(crate) fn intake_pause(load_avg: f64) -> Duration {
    Duration::from_secs_f64(load_avg * 10.0 + 1.0)
}

pub struct DispatchEngine {
    pub conn: Arc<dyn Connection>,
    pub bus: Arc<dyn Bus>,
    pub ops: Arc<GuestOps>,
    pub emitters: Emitters,
    pub cfg: Arc<AgentConfig>,
    pub cancel: CancellationToken,
}

impl DispatchEngine {
    /// Heavy create-ish jobs: one LPOP per iteration, paced by host
    /// load. The dirty scene left by a crash between copy and definition
    /// is cleaned at the top of the next cycle.
    pub async fn run_queue_loop(self: Arc<Self>) {
        let mut scene: Option<DirtyScene> = None;
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.ops.clear_scene(&mut scene).await;

            let load_avg = sysinfo::System::load_average().five;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(intake_pause(load_avg)) => {}
            }
            if admission_denied(load_avg, cpu_count) {
                tracing::debug!(load_avg, cpu_count, "host loaded, refusing intake");
                continue;
            }

            let raw = match self.bus.lpop(&self.cfg.downstream_queue).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "downstream pop failed, backing off");
                    tokio::time::sleep(BUS_RETRY_PAUSE).await;
                    continue;
                }
            };
            let ins = match Instruction::parse(&raw) {
                Ok(ins) => ins,
                Err(e) => {
                    self.emitters.log.error(&format!("bad downstream message: {e}")).await;
                    continue;
                }
            };

            let result = match ins.action {
                Action::CreateGuest => self.ops.create_guest(&ins, &mut scene).await,
                Action::CreateDisk => self.ops.create_disk(&ins).await,
                Action::ResizeDisk => self.ops.resize_disk_offline(&ins).await,
                Action::DeleteDisk => self.ops.delete_disk(&ins).await,
                _ => continue,
            };
            self.respond(&ins, result).await;
        }
        tracing::info!("downstream queue consumer stopped");
    }

    /// Interactive actions over pub/sub. `ping` is answered before any
    /// dispatch; uuids this host does not own are dropped silently.
    pub async fn run_channel_loop(self: Arc<Self>) {
        'resubscribe: loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let mut sub = match self.bus.subscribe(&self.cfg.instruction_channel).await {
                Ok(sub) => sub,
                Err(e) => {
                    tracing::warn!(error = %e, "instruction subscribe failed, backing off");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(BUS_RETRY_PAUSE) => continue,
                    }
                }
            };

            loop {
                if self.cancel.is_cancelled() {
                    break 'resubscribe;
                }
                let raw = match sub.next_message(SUBSCRIPTION_POLL).await {
                    Ok(Some(raw)) => raw,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "subscription broken, resubscribing");
                        tokio::time::sleep(BUS_RETRY_PAUSE).await;
                        continue 'resubscribe;
                    }
                };
                let ins = match Instruction::parse(&raw) {
                    Ok(ins) => ins,
                    Err(e) => {
                        self.emitters
                            .log
                            .error(&format!("bad instruction payload: {e}"))
                            .await;
                        continue;
                    }
                };

                match ins.action {
                    Action::Pong => continue,
                    Action::Ping => {
                        // Keep-alive: idle subscriptions get dropped by the
                        // store, so presence is refreshed with pong.
                        let _ = self
                            .bus
                            .publish(
                                &self.cfg.instruction_channel,
                                json!({"action": "pong"}).to_string(),
                            )
                            .await;
                        continue;
                    }
                    _ => {}
                }

                let Some(uuid) = ins.uuid.clone() else { continue };

                let mapping = match self.refresh_mapping().await {
                    Ok(mapping) => mapping,
                    Err(e) => {
                        self.emitters
                            .log
                            .error(&format!("domain listing failed: {e}"))
                            .await;
                        continue;
                    }
                };
                let Some(dom) = mapping.get(&uuid) else {
                    // The control plane broadcasts; other hosts own this one.
                    tracing::debug!(uuid = %uuid, "uuid not found on this host");
                    continue;
                };

                match self.dispatch(dom.as_ref(), &ins).await {
                    Some(result) => self.respond(&ins, result).await,
                    None => {
                        self.emitters
                            .log
                            .error(&format!("unsupported action: {}", ins.action.as_str()))
                            .await;
                    }
                }
            }
        }
        tracing::info!("instruction channel consumer stopped");
    }

    async fn refresh_mapping(&self) -> Result<HashMap<String, Arc<dyn Domain>>> {
        Ok(self
            .conn
            .list_all_domains()
            .await?
            .into_iter()
            .map(|d| (d.uuid(), d))
            .collect())
    }

    async fn dispatch(&self, dom: &dyn Domain, ins: &Instruction) -> Option<Result<Value>> {
        let ops = &self.ops;
        Some(match ins.action {
            Action::Reboot => ops.reboot(dom, ins).await,
            Action::ForceReboot => ops.force_reboot(dom, ins).await,
            Action::Shutdown => ops.shutdown(dom, ins).await,
            Action::ForceShutdown => ops.force_shutdown(dom, ins).await,
            Action::Boot => ops.boot(dom, ins).await,
            Action::Suspend => ops.suspend(dom, ins).await,
            Action::Resume => ops.resume(dom, ins).await,
            Action::DeleteGuest => ops.delete_guest(dom, ins).await,
            Action::AttachDisk => ops.attach_disk(dom, ins).await,
            Action::DetachDisk => ops.detach_disk(dom, ins).await,
            Action::ResizeDisk => ops.resize_disk_online(dom, ins).await,
            Action::Migrate => ops.migrate(dom, ins).await,
            Action::CreateSnapshot => ops.create_snapshot(dom, ins).await,
            Action::DeleteSnapshot => ops.delete_snapshot(dom, ins).await,
            Action::RevertSnapshot => ops.revert_snapshot(dom, ins).await,
            Action::ConvertSnapshot => ops.convert_snapshot(ins).await,
            Action::AllocateBandwidth => ops.allocate_bandwidth(dom, ins).await,
            Action::AdjustAbility => ops.adjust_ability(dom, ins).await,
            Action::ResetPassword => ops.reset_password(dom, ins).await,
            Action::UpdateSshKey => ops.update_ssh_key(dom, ins).await,
            Action::Quota => ops.apply_quota(dom, ins).await,
            Action::CreateGuest
            | Action::CreateDisk
            | Action::DeleteDisk
            | Action::Ping
            | Action::Pong
            | Action::Unknown => return None,
        })
    }

    /// Exactly one response per dispatched instruction.
    async fn respond(&self, ins: &Instruction, result: Result<Value>) {
        let uuid = ins.uuid.as_deref();
        match result {
            Ok(data) => {
                self.emitters
                    .response
                    .success(
                        ins.object.as_deref(),
                        ins.action.as_str(),
                        uuid,
                        data,
                        ins.passback_parameters.as_ref(),
                    )
                    .await;
            }
            Err(e) => {
                self.emitters
                    .log
                    .error(&format!(
                        "{} on {} failed: {e}",
                        ins.action.as_str(),
                        uuid.unwrap_or("-")
                    ))
                    .await;
                self.emitters
                    .response
                    .failure(
                        ins.object.as_deref(),
                        ins.action.as_str(),
                        uuid,
                        ins.passback_parameters.as_ref(),
                    )
                    .await;
            }
        }
    }
}
