//! IPC client - one request, one fresh socket

use crate::http::{self, HttpResponse, Method};
use crate::IpcError;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Replies larger than this are refused
const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

/// One request to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Overrides the client's timeout for this call
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn get(path: &str) -> Self {
        Self {
            method: Method::Get,
            path: path.to_string(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn post(path: &str, body: Vec<u8>) -> Self {
        Self {
            method: Method::Post,
            path: path.to_string(),
            headers: Vec::new(),
            body: Some(body),
            timeout: None,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Something that can carry a request to the backend and bring a reply back
pub trait Transport: Send + Sync {
    fn send(&self, request: &Request) -> Result<HttpResponse, IpcError>;
}

/// Stateless client bound to one socket path.
///
/// Every call connects, writes, reads to EOF and drops the connection, so
/// concurrent calls never share state.
#[derive(Debug, Clone)]
pub struct IpcClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl IpcClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bound every connect/read/write of a call by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn get(&self, path: &str, headers: &[(String, String)]) -> Result<HttpResponse, IpcError> {
        self.request(Method::Get, path, headers, None)
    }

    pub fn post(
        &self,
        path: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<HttpResponse, IpcError> {
        self.request(Method::Post, path, headers, Some(body))
    }

    pub fn request(
        &self,
        method: Method,
        path: &str,
        headers: &[(String, String)],
        body: Option<&[u8]>,
    ) -> Result<HttpResponse, IpcError> {
        self.exchange(method, path, headers, body, self.timeout)
    }

    fn exchange(
        &self,
        method: Method,
        path: &str,
        headers: &[(String, String)],
        body: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<HttpResponse, IpcError> {
        // Serialize first so a bad request never touches the socket
        let payload = http::encode_request(method, path, headers, body)?;
        let timeout = timeout.max(Duration::from_millis(1));
        let deadline = Instant::now() + timeout;

        let mut stream = UnixStream::connect(&self.socket_path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::TimedOut {
                IpcError::Timeout
            } else {
                IpcError::Connect {
                    path: self.socket_path.clone(),
                    source,
                }
            }
        })?;
        stream
            .set_write_timeout(Some(timeout))
            .map_err(IpcError::SocketOption)?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(IpcError::SocketOption)?;

        stream.write_all(&payload).map_err(IpcError::from_io)?;
        stream.flush().map_err(IpcError::from_io)?;

        let raw = read_to_eof(&mut stream, deadline)?;
        debug!(%method, path, bytes = raw.len(), "IPC exchange complete");
        http::parse_response(&raw)
    }
}

impl Transport for IpcClient {
    fn send(&self, request: &Request) -> Result<HttpResponse, IpcError> {
        self.exchange(
            request.method,
            &request.path,
            &request.headers,
            request.body.as_deref(),
            request.timeout.unwrap_or(self.timeout),
        )
    }
}

/// Read until the peer closes. A peer that trickles bytes can't stretch the
/// call past `deadline`.
fn read_to_eof(stream: &mut UnixStream, deadline: Instant) -> Result<Vec<u8>, IpcError> {
    let mut raw = Vec::with_capacity(4096);
    let mut buf = [0u8; 8192];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(IpcError::Timeout);
        }
        stream
            .set_read_timeout(Some(remaining))
            .map_err(IpcError::SocketOption)?;

        match stream.read(&mut buf) {
            Ok(0) => return Ok(raw),
            Ok(n) => {
                if raw.len() + n > MAX_RESPONSE_BYTES {
                    return Err(IpcError::InvalidResponse(format!(
                        "response exceeds {MAX_RESPONSE_BYTES} bytes"
                    )));
                }
                raw.extend_from_slice(&buf[..n]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(IpcError::from_io(e)),
        }
    }
}
