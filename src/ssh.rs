//! Remote command execution for migration pre-creation.

use std::path::PathBuf;

use async_ssh2_tokio::client::{AuthMethod, Client, ServerCheckMethod};
use async_trait::async_trait;

use crate::errors::{AgentError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    pub exit_status: u32,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn exec(&self, host: &str, command: &str) -> Result<RemoteOutput>;
}

/// Key-based SSH sessions, one per call; the destination host is only
/// contacted during migrations.
pub struct SshRemoteExec {
    user: String,
    key_path: PathBuf,
}

impl SshRemoteExec {
    pub fn new(user: String, key_path: PathBuf) -> Self {
        Self { user, key_path }
    }
}

#[async_trait]
impl RemoteExec for SshRemoteExec {
    async fn exec(&self, host: &str, command: &str) -> Result<RemoteOutput> {
        let auth = AuthMethod::with_key_file(&self.key_path, None);
        let client = Client::connect((host, 22), &self.user, auth, ServerCheckMethod::NoCheck)
            .await
            .map_err(|e| AgentError::Remote(format!("connect {host}: {e}")))?;

        let result = client
            .execute(command)
            .await
            .map_err(|e| AgentError::Remote(format!("exec on {host}: {e}")))?;

        Ok(RemoteOutput {
            exit_status: result.exit_status,
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }
}
