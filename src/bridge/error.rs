use thiserror::Error;

use crate::backend::RegistryError;
use crate::exec::ExecError;
use crate::pool::PoolError;
use crate::ssh::SshError;

/// Why a session could not be set up
///
/// The message is what the client sees in the error frame. Failures after
/// the shell is attached end the session with a `PumpExit` instead.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Unknown backend id or cluster
    #[error("{0}")]
    Resolution(String),

    /// Transport or authentication failure reaching the backend
    #[error("{0}")]
    Connect(String),

    /// The remote shell could not be started
    #[error("{0}")]
    ExecCreate(String),
}

impl SessionError {
    /// Stable label for logs and the activity record
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Resolution(_) => "resolution",
            SessionError::Connect(_) => "connect",
            SessionError::ExecCreate(_) => "exec_create",
        }
    }
}

impl From<RegistryError> for SessionError {
    fn from(err: RegistryError) -> Self {
        SessionError::Resolution(err.to_string())
    }
}

impl From<PoolError> for SessionError {
    fn from(err: PoolError) -> Self {
        if err.is_resolution() {
            SessionError::Resolution(err.to_string())
        } else {
            SessionError::Connect(format!("Failed to connect to host: {}", err))
        }
    }
}

impl From<ExecError> for SessionError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Create(msg) => SessionError::ExecCreate(format!("Error creating exec: {}", msg)),
            ExecError::Attach(msg) => {
                SessionError::ExecCreate(format!("Error attaching to exec: {}", msg))
            }
            other => SessionError::ExecCreate(other.to_string()),
        }
    }
}

impl From<SshError> for SessionError {
    fn from(err: SshError) -> Self {
        if err.is_exec_stage() {
            SessionError::ExecCreate(format!("Failed to start pod shell: {}", err))
        } else {
            SessionError::Connect(format!("Failed to connect to cluster: {}", err))
        }
    }
}
