//! Agent-wide error type.
//!
//! Operations never panic across the dispatch boundary: every failure is
//! folded into `AgentError`, logged, and reported upstream as a
//! `response.failure` emission.

use crate::hypervisor::HvError;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("config: {0}")]
    Config(String),

    #[error("bus: {0}")]
    Bus(String),

    #[error(transparent)]
    Hypervisor(#[from] HvError),

    /// The image tool exited non-zero. Carries the command line and its
    /// stderr for the operator.
    #[error("storage command `{cmd}` failed: {stderr}")]
    StorageCommand { cmd: String, stderr: String },

    /// A child process other than the image tool failed.
    #[error("command failed: {0}")]
    CommandExec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("offline inspection: {0}")]
    Inspection(String),

    #[error("remote exec: {0}")]
    Remote(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl AgentError {
    /// Missing-file errors are swallowed in a few places (image removal
    /// during guest deletion); this is the single predicate for that.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AgentError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}
