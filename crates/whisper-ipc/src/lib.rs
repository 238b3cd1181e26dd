//! Whisper IPC - HTTP over a Unix domain socket
//!
//! The backend never binds a TCP port. Every call opens a fresh connection
//! to a socket in the user's private data directory, sends one request with
//! `Connection: close`, reads to EOF, and parses the reply. No keep-alive,
//! no retries, no HTTP stack.

pub mod client;
pub mod http;

pub use client::{IpcClient, Request, Transport, DEFAULT_TIMEOUT};
pub use http::{HttpResponse, Method};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Could not set socket timeout: {0}")]
    SocketOption(#[source] std::io::Error),

    #[error("Could not connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out waiting for the backend")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(#[source] std::io::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Refusing to send malformed request: {0}")]
    InvalidRequest(String),
}

impl IpcError {
    /// Connection-level failure, as opposed to a reply we couldn't parse
    pub fn is_transport(&self) -> bool {
        !matches!(
            self,
            IpcError::InvalidResponse(_) | IpcError::InvalidRequest(_)
        )
    }

    /// Map an I/O error from a read or write, folding timeouts into
    /// [`IpcError::Timeout`]
    pub(crate) fn from_io(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => IpcError::Timeout,
            _ => IpcError::Transport(e),
        }
    }
}
