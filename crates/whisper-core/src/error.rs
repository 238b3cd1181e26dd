use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use whisper_ipc::IpcError;
use whisper_sandbox::CapabilityError;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("Backend executable not found: {0}")]
    ExecutableNotFound(PathBuf),

    #[error("Interpreter not found: {0}")]
    InterpreterNotFound(String),

    #[error("Failed to spawn backend: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Backend process exited prematurely ({0})")]
    ProcessExitedPrematurely(String),

    #[error("Backend socket did not appear within {0:?}")]
    SocketTimeout(Duration),

    #[error("Backend health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Backend is not running")]
    NotRunning,

    #[error("Path is outside the approved folders: {0}")]
    PathNotAllowed(PathBuf),

    #[error("Backend request failed with HTTP {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("Auth token error: {0}")]
    Token(#[source] std::io::Error),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// The fail-closed refusal: nothing granted, nothing started
    pub fn is_no_capabilities(&self) -> bool {
        matches!(self, SupervisorError::Capability(CapabilityError::NoCapabilities))
    }
}
