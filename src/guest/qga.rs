//! Guest-agent channel helper.
//!
//! Thin JSON plumbing over the domain's agent command channel: ping,
//! command execution with synchronous completion polling, clock sync,
//! and `/proc/meminfo` harvesting.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use serde::Deserialize;
use serde_json::json;

use crate::errors::{AgentError, Result};
use crate::hypervisor::Domain;

/// Completion polling bounds: up to 1000 probes, 1 ms apart. A command
/// still running after that is reported as not-exited, never an error.
const STATUS_POLL_LIMIT: usize = 1000;
const STATUS_POLL_GAP: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecStatus {
    #[serde(default)]
    pub exited: bool,
    #[serde(default)]
    pub exitcode: Option<i64>,
    #[serde(rename = "out-data", default)]
    pub out_data: Option<String>,
    #[serde(rename = "err-data", default)]
    pub err_data: Option<String>,
}

impl ExecStatus {
    /// `out-data` arrives base64-encoded.
    pub fn decoded_out(&self) -> Result<Vec<u8>> {
        let raw = self.out_data.as_deref().unwrap_or("");
        base64::engine::general_purpose::STANDARD
            .decode(raw)
            .map_err(|e| AgentError::InvalidMessage(format!("out-data: {e}")))
    }
}

fn parse_return<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    #[derive(Deserialize)]
    struct Reply<T> {
        #[serde(rename = "return")]
        ret: T,
    }
    let reply: Reply<T> = serde_json::from_str(raw)
        .map_err(|e| AgentError::InvalidMessage(format!("agent reply: {e}")))?;
    Ok(reply.ret)
}

pub async fn ping(dom: &dyn Domain, timeout: Duration) -> bool {
    let cmd = json!({"execute": "guest-ping", "arguments": {}}).to_string();
    dom.agent_command(&cmd, timeout).await.is_ok()
}

/// Start a command in the guest; returns the in-guest pid.
pub async fn exec(
    dom: &dyn Domain,
    path: &str,
    args: &[&str],
    capture_output: bool,
    timeout: Duration,
) -> Result<i64> {
    let cmd = json!({
        "execute": "guest-exec",
        "arguments": {
            "path": path,
            "capture-output": capture_output,
            "arg": args,
        }
    })
    .to_string();
    let reply = dom.agent_command(&cmd, timeout).await?;

    #[derive(Deserialize)]
    struct ExecReturn {
        pid: i64,
    }
    Ok(parse_return::<ExecReturn>(&reply)?.pid)
}

/// Poll `guest-exec-status` until the command exits or the probe budget
/// runs out; the final status is returned either way.
pub async fn exec_status(dom: &dyn Domain, pid: i64, timeout: Duration) -> Result<ExecStatus> {
    let cmd = json!({
        "execute": "guest-exec-status",
        "arguments": {"pid": pid}
    })
    .to_string();

    let mut status = ExecStatus::default();
    for _ in 0..STATUS_POLL_LIMIT {
        let reply = dom.agent_command(&cmd, timeout).await?;
        status = parse_return(&reply)?;
        if status.exited {
            break;
        }
        tokio::time::sleep(STATUS_POLL_GAP).await;
    }
    Ok(status)
}

/// Set the guest clock, nanoseconds since the epoch.
pub async fn set_time(dom: &dyn Domain, time_ns: i64, timeout: Duration) -> Result<()> {
    let cmd = json!({
        "execute": "guest-set-time",
        "arguments": {"time": time_ns}
    })
    .to_string();
    dom.agent_command(&cmd, timeout).await?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemValue {
    pub value: String,
    pub unit: Option<String>,
}

/// `/proc/meminfo` as a map. Agent failures yield an empty map, not an
/// error; memory info is best-effort garnish.
pub async fn memory_info(dom: &dyn Domain, timeout: Duration) -> HashMap<String, MemValue> {
    let mut out = HashMap::new();

    let pid = match exec(dom, "cat", &["/proc/meminfo"], true, timeout).await {
        Ok(pid) => pid,
        Err(_) => return out,
    };
    let status = match exec_status(dom, pid, timeout).await {
        Ok(status) => status,
        Err(_) => return out,
    };
    let Ok(raw) = status.decoded_out() else {
        return out;
    };

    for line in String::from_utf8_lossy(&raw).lines() {
        if line.is_empty() {
            continue;
        }
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let mut fields = rest.split_whitespace();
        let Some(value) = fields.next() else {
            continue;
        };
        out.entry(key.to_string()).or_insert(MemValue {
            value: value.to_string(),
            unit: fields.next().map(str::to_string),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::mock::MockDomain;
    use base64::Engine as _;

    #[tokio::test]
    async fn exec_status_stops_early_on_exit() {
        let dom = MockDomain::new("u-1", "g1");
        let mut polls = 0;
        dom.set_agent_handler(move |cmd| {
            assert!(cmd.contains("guest-exec-status"));
            polls += 1;
            if polls < 3 {
                Ok(r#"{"return":{"exited":false}}"#.to_string())
            } else {
                Ok(r#"{"return":{"exited":true,"exitcode":0,"out-data":"b2s="}}"#.to_string())
            }
        });

        let status = exec_status(dom.as_ref(), 77, Duration::from_secs(3))
            .await
            .unwrap();
        assert!(status.exited);
        assert_eq!(status.decoded_out().unwrap(), b"ok");
        assert_eq!(dom.agent_log.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exec_status_gives_up_after_probe_budget() {
        let dom = MockDomain::new("u-1", "g1");
        dom.set_agent_handler(|_| Ok(r#"{"return":{"exited":false}}"#.to_string()));

        let status = exec_status(dom.as_ref(), 77, Duration::from_secs(3))
            .await
            .unwrap();
        assert!(!status.exited);
        assert_eq!(dom.agent_log.lock().len(), STATUS_POLL_LIMIT);
    }

    #[tokio::test]
    async fn memory_info_parses_meminfo() {
        let meminfo = "MemTotal:       16314480 kB\nMemFree:         8112312 kB\nHugePages_Total:       0\n";
        let encoded = base64::engine::general_purpose::STANDARD.encode(meminfo);
        let dom = MockDomain::new("u-1", "g1");
        dom.set_agent_handler(move |cmd| {
            if cmd.contains("guest-exec-status") {
                Ok(format!(
                    r#"{{"return":{{"exited":true,"out-data":"{encoded}"}}}}"#
                ))
            } else {
                Ok(r#"{"return":{"pid":5}}"#.to_string())
            }
        });

        let info = memory_info(dom.as_ref(), Duration::from_secs(3)).await;
        assert_eq!(info["MemTotal"].value, "16314480");
        assert_eq!(info["MemTotal"].unit.as_deref(), Some("kB"));
        assert_eq!(info["HugePages_Total"].unit, None);
    }

    #[tokio::test]
    async fn memory_info_swallows_agent_errors() {
        let dom = MockDomain::new("u-1", "g1");
        // Default handler errors for guest-exec.
        let info = memory_info(dom.as_ref(), Duration::from_secs(3)).await;
        assert!(info.is_empty());
    }
}
