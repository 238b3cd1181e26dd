//! Process supervisor - the backend's lifecycle and health
//!
//! State machine:
//!
//! ```text
//! Stopped --start--> Starting --socket + health OK--> Healthy
//!                    Starting --timeout | exit | unhealthy--> Error(reason)
//! any state --stop--> Stopped
//! ```
//!
//! Every method here blocks (spawn, socket polling, IPC). Call them from a
//! background thread; [`crate::SupervisorService`] does that for async code.

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::process::{self, LogPaths, ProcessHandle, Termination};
use crate::token::{AuthToken, AUTH_HEADER};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use whisper_ipc::{HttpResponse, IpcClient, Method, Request, Transport};
use whisper_sandbox::AllowlistSource;

/// Environment contract with the backend
pub mod env {
    pub const SOCKET_PATH: &str = "REPOWHISPER_SOCKET_PATH";
    pub const AUTH_TOKEN: &str = "REPOWHISPER_AUTH_TOKEN";
    pub const ALLOWLIST_PATH: &str = "REPOWHISPER_ALLOWLIST_PATH";
    pub const DATA_DIR: &str = "REPOWHISPER_DATA_DIR";
    pub const ASSETS_DIR: &str = "REPOWHISPER_ASSETS_DIR";
    pub const DEBUG: &str = "REPOWHISPER_DEBUG";

    /// Inherited from our own environment; nothing else is
    pub const PASSTHROUGH: &[&str] = &["PATH", "HOME", "LANG"];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Healthy,
    Error(String),
}

impl SupervisorState {
    pub fn is_active(&self) -> bool {
        matches!(self, SupervisorState::Starting | SupervisorState::Healthy)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Stopped => f.write_str("stopped"),
            SupervisorState::Starting => f.write_str("starting"),
            SupervisorState::Healthy => f.write_str("healthy"),
            SupervisorState::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from: SupervisorState,
    pub to: SupervisorState,
    pub at: DateTime<Utc>,
}

/// `GET /health` body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub model_loaded: bool,
    #[serde(default)]
    pub index_count: u64,
    #[serde(default)]
    pub version: String,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// `POST /index` modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    Manual,
    Guided,
    Full,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexRequest {
    pub mode: IndexMode,
    pub repo_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_paths: Option<Vec<PathBuf>>,
}

impl IndexRequest {
    /// The repository followed by any listed files
    pub fn paths(&self) -> Vec<&Path> {
        std::iter::once(self.repo_path.as_path())
            .chain(self.file_paths.iter().flatten().map(PathBuf::as_path))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchRequest {
    pub query: String,
    pub top_k: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<String>,
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    allowlist: Arc<dyn AllowlistSource>,
    transport: Arc<dyn Transport>,
    token: AuthToken,
    auth: Option<SecretString>,
    handle: Option<ProcessHandle>,
    health: Option<HealthReport>,
    state: watch::Sender<SupervisorState>,
    transitions: broadcast::Sender<StateTransition>,
}

impl ProcessSupervisor {
    pub fn new(
        config: SupervisorConfig,
        allowlist: Arc<dyn AllowlistSource>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Stopped);
        let (transitions, _) = broadcast::channel(32);
        Self {
            token: AuthToken::new(&config.token_path),
            config,
            allowlist,
            transport,
            auth: None,
            handle: None,
            health: None,
            state,
            transitions,
        }
    }

    /// Supervisor talking to the backend over its configured socket
    pub fn with_ipc(config: SupervisorConfig, allowlist: Arc<dyn AllowlistSource>) -> Self {
        let client = IpcClient::new(&config.socket_path).with_timeout(config.health_timeout);
        Self::new(config, allowlist, Arc::new(client))
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn state(&self) -> SupervisorState {
        self.state.borrow().clone()
    }

    /// Latest state, for observers that only care about "now"
    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Every transition, in order
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    /// Last successful health report
    pub fn health(&self) -> Option<&HealthReport> {
        self.health.as_ref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(|h| h.pid)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.handle.as_ref().map(|h| h.started_at)
    }

    fn set_state(&self, to: SupervisorState) {
        let from = self.state.borrow().clone();
        if from == to {
            return;
        }
        info!(from = %from, to = %to, "Backend state changed");
        self.state.send_replace(to.clone());
        // No subscribers is fine
        let _ = self.transitions.send(StateTransition {
            from,
            to,
            at: Utc::now(),
        });
    }

    /// Start the backend and wait until it reports healthy.
    ///
    /// No-op while already starting or healthy. On failure the child (if
    /// any) is torn down, the state becomes `Error(reason)` and the error is
    /// returned.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        if self.state.borrow().is_active() {
            debug!("Backend already running, start ignored");
            return Ok(());
        }

        self.set_state(SupervisorState::Starting);
        match self.launch() {
            Ok(report) => {
                info!(
                    pid = self.pid(),
                    index_count = report.index_count,
                    version = %report.version,
                    "Backend healthy"
                );
                self.health = Some(report);
                self.set_state(SupervisorState::Healthy);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Backend failed to start");
                self.teardown();
                self.set_state(SupervisorState::Error(e.to_string()));
                Err(e)
            }
        }
    }

    fn launch(&mut self) -> Result<HealthReport, SupervisorError> {
        let socket_dir = self
            .config
            .socket_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.data_dir.clone());
        for dir in [&self.config.data_dir, &socket_dir, &self.config.log_dir] {
            process::ensure_private_dir(dir)?;
        }
        process::remove_if_exists(&self.config.socket_path)?;

        // The security boundary: no grants, no process
        let manifest = self.allowlist.write_allowlist_manifest()?;

        let exe = process::resolve_executable(&self.config)?;
        let token = self.token.load_or_generate().map_err(SupervisorError::Token)?;

        let mut command = Command::new(&exe.program);
        command.args(&exe.args).env_clear();
        for key in env::PASSTHROUGH {
            if let Some(value) = std::env::var_os(key) {
                command.env(key, value);
            }
        }
        command
            .env(env::SOCKET_PATH, &self.config.socket_path)
            .env(env::AUTH_TOKEN, token.expose_secret())
            .env(env::ALLOWLIST_PATH, &manifest)
            .env(env::DATA_DIR, &self.config.data_dir)
            .env(env::DEBUG, "0");
        if let Some(assets) = &self.config.assets_dir {
            command.env(env::ASSETS_DIR, assets);
        }
        if let Some(dir) = &self.config.backend_dir {
            command.current_dir(dir);
        }

        info!(program = %exe.program.display(), "Spawning backend");
        let handle = ProcessHandle::spawn(
            command,
            &self.config.socket_path,
            LogPaths::in_dir(&self.config.log_dir),
        )?;
        self.handle = Some(handle);
        self.auth = Some(token);

        self.wait_for_socket()?;
        self.check_health()
    }

    /// Poll for the socket while making sure the child is still alive
    fn wait_for_socket(&mut self) -> Result<(), SupervisorError> {
        let started = Instant::now();
        loop {
            let handle = self.handle.as_mut().ok_or(SupervisorError::NotRunning)?;
            if let Some(status) = handle.exit_status() {
                // Already reaped by try_wait
                self.handle = None;
                return Err(SupervisorError::ProcessExitedPrematurely(
                    process::describe_exit(status),
                ));
            }
            if self.config.socket_path.exists() {
                debug!(elapsed = ?started.elapsed(), "Backend socket ready");
                return Ok(());
            }
            if started.elapsed() >= self.config.startup_timeout {
                return Err(SupervisorError::SocketTimeout(self.config.startup_timeout));
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    fn auth_header(&self) -> Result<&str, SupervisorError> {
        self.auth
            .as_ref()
            .map(|t| t.expose_secret().as_str())
            .ok_or(SupervisorError::NotRunning)
    }

    /// One authenticated `GET /health`
    fn check_health(&self) -> Result<HealthReport, SupervisorError> {
        let request = Request::get("/health")
            .header(AUTH_HEADER, self.auth_header()?)
            .timeout(self.config.health_timeout);
        let response = self
            .transport
            .send(&request)
            .map_err(|e| SupervisorError::HealthCheckFailed(e.to_string()))?;

        if response.status_code != 200 {
            return Err(SupervisorError::HealthCheckFailed(format!(
                "HTTP {}",
                response.status_code
            )));
        }
        let report: HealthReport = response
            .json()
            .map_err(|e| SupervisorError::HealthCheckFailed(e.to_string()))?;
        if !report.is_healthy() {
            return Err(SupervisorError::HealthCheckFailed(format!(
                "backend reported status {:?}",
                report.status
            )));
        }
        Ok(report)
    }

    /// Recurring health probe. Updates the cached report on success; never
    /// changes state (the monitor decides what failures mean).
    pub fn probe(&mut self) -> Result<HealthReport, SupervisorError> {
        let handle = self.handle.as_mut().ok_or(SupervisorError::NotRunning)?;
        if let Some(status) = handle.exit_status() {
            return Err(SupervisorError::ProcessExitedPrematurely(
                process::describe_exit(status),
            ));
        }
        let report = self.check_health()?;
        self.health = Some(report.clone());
        Ok(report)
    }

    /// Stop the backend. Never fails; always ends in `Stopped`.
    pub fn stop(&mut self) {
        if self.handle.is_none() {
            // Nothing to reap, but a failed start still settles to Stopped
            self.set_state(SupervisorState::Stopped);
            return;
        }
        self.teardown();
        self.set_state(SupervisorState::Stopped);
    }

    /// Tear down whatever exists without touching state
    fn teardown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let pid = handle.pid;
            match handle.terminate(self.config.grace_period) {
                Termination::AlreadyExited => debug!(pid, "Backend had already exited"),
                Termination::Graceful => info!(pid, "Backend stopped"),
                Termination::Killed => warn!(pid, "Backend force-killed"),
            }
        }
        if let Err(e) = process::remove_if_exists(&self.config.socket_path) {
            warn!(error = %e, "Could not remove backend socket");
        }
        self.auth = None;
        self.health = None;
    }

    pub fn restart(&mut self) -> Result<(), SupervisorError> {
        self.stop();
        self.start()
    }

    /// Tear down and park in `Error(reason)`. Used by the health monitor.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.teardown();
        self.set_state(SupervisorState::Error(reason.into()));
    }

    /// Forward an authenticated request to a healthy backend
    pub fn relay(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<HttpResponse, SupervisorError> {
        if *self.state.borrow() != SupervisorState::Healthy {
            return Err(SupervisorError::NotRunning);
        }
        let mut request = match body {
            Some(body) => Request::post(path, serde_json::to_vec(body).map_err(io_json)?)
                .header("Content-Type", "application/json"),
            None => Request::get(path),
        };
        request.method = method;
        let request = request
            .header(AUTH_HEADER, self.auth_header()?)
            .timeout(self.config.request_timeout);
        Ok(self.transport.send(&request)?)
    }

    fn relay_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, SupervisorError> {
        let response = self.relay(Method::Post, path, Some(&body))?;
        if !response.is_success() {
            return Err(SupervisorError::Backend {
                status: response.status_code,
                body: response.text().unwrap_or_default().to_string(),
            });
        }
        Ok(response.json()?)
    }

    pub fn search(&self, request: &SearchRequest) -> Result<serde_json::Value, SupervisorError> {
        let body = serde_json::to_value(request).map_err(io_json)?;
        self.relay_json("/search", body)
    }

    /// Ask the backend to index a folder. Refused locally unless every path
    /// lies within an approved folder.
    pub fn index(&self, request: &IndexRequest) -> Result<serde_json::Value, SupervisorError> {
        if let Some(path) = self.allowlist.first_disallowed(&request.paths()) {
            return Err(SupervisorError::PathNotAllowed(path.to_path_buf()));
        }
        let body = serde_json::to_value(request).map_err(io_json)?;
        self.relay_json("/index", body)
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.teardown();
        }
    }
}

fn io_json(e: serde_json::Error) -> SupervisorError {
    SupervisorError::Io(e.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutableSpec;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use whisper_ipc::IpcError;
    use whisper_sandbox::CapabilityError;

    /// Allowlist double: granted or not, counting regenerations
    struct FakeAllowlist {
        granted: bool,
        path: PathBuf,
        writes: AtomicUsize,
    }

    impl FakeAllowlist {
        fn new(dir: &Path, granted: bool) -> Arc<Self> {
            Arc::new(Self {
                granted,
                path: dir.join("allowlist.json"),
                writes: AtomicUsize::new(0),
            })
        }
    }

    impl AllowlistSource for FakeAllowlist {
        fn write_allowlist_manifest(&self) -> Result<PathBuf, CapabilityError> {
            if !self.granted {
                return Err(CapabilityError::NoCapabilities);
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            std::fs::write(&self.path, "[\"/repo\"]")?;
            Ok(self.path.clone())
        }
        fn manifest_path(&self) -> PathBuf {
            self.path.clone()
        }
        fn is_path_allowed(&self, path: &Path) -> bool {
            path.starts_with("/repo")
        }
    }

    /// Transport double replaying canned replies and recording requests
    #[derive(Default)]
    struct FakeTransport {
        replies: Mutex<VecDeque<Result<HttpResponse, IpcError>>>,
        seen: Mutex<Vec<Request>>,
    }

    impl FakeTransport {
        fn with(replies: Vec<Result<HttpResponse, IpcError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::default(),
            })
        }
    }

    impl Transport for FakeTransport {
        fn send(&self, request: &Request) -> Result<HttpResponse, IpcError> {
            self.seen.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(IpcError::Timeout))
        }
    }

    fn reply(status: u16, body: &str) -> Result<HttpResponse, IpcError> {
        Ok(HttpResponse {
            status_code: status,
            reason: String::new(),
            headers: Default::default(),
            body: body.as_bytes().to_vec(),
        })
    }

    fn healthy(count: u64) -> Result<HttpResponse, IpcError> {
        reply(
            200,
            &format!(r#"{{"status":"healthy","model_loaded":true,"index_count":{count},"version":"x"}}"#),
        )
    }

    /// Config whose "backend" is a shell snippet
    fn config(dir: &TempDir, script: &str) -> SupervisorConfig {
        let mut config = SupervisorConfig::new(dir.path().join("data"));
        config.executable = Some(ExecutableSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
        });
        config.startup_timeout = Duration::from_secs(5);
        config.poll_interval = Duration::from_millis(20);
        config.grace_period = Duration::from_secs(2);
        config
    }

    /// Pretends to be a backend: marks the socket path, then idles
    const FAKE_BACKEND: &str = r#"touch "$REPOWHISPER_SOCKET_PATH"; exec sleep 30"#;

    fn supervisor(
        dir: &TempDir,
        script: &str,
        granted: bool,
        transport: Arc<FakeTransport>,
    ) -> ProcessSupervisor {
        let allowlist = FakeAllowlist::new(dir.path(), granted);
        ProcessSupervisor::new(config(dir, script), allowlist, transport)
    }

    fn drain(rx: &mut broadcast::Receiver<StateTransition>) -> Vec<SupervisorState> {
        let mut seen = Vec::new();
        while let Ok(t) = rx.try_recv() {
            seen.push(t.to);
        }
        seen
    }

    #[test]
    fn test_start_reaches_healthy() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::with(vec![healthy(42)]);
        let mut sup = supervisor(&dir, FAKE_BACKEND, true, transport.clone());
        let mut rx = sup.subscribe();

        sup.start().unwrap();

        assert_eq!(sup.state(), SupervisorState::Healthy);
        assert_eq!(sup.health().unwrap().index_count, 42);
        assert_eq!(drain(&mut rx), vec![SupervisorState::Starting, SupervisorState::Healthy]);

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].path, "/health");
        assert!(seen[0].headers.iter().any(|(k, v)| k == AUTH_HEADER && v.len() == 64));
        drop(seen);

        sup.stop();
        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert!(!sup.config().socket_path.exists());
    }

    #[test]
    fn test_no_grants_never_spawns() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("spawned");
        let script = format!("touch {}; exec sleep 30", marker.display());
        let transport = FakeTransport::with(vec![]);
        let mut sup = supervisor(&dir, &script, false, transport.clone());

        let err = sup.start().unwrap_err();

        assert!(err.is_no_capabilities());
        assert!(matches!(sup.state(), SupervisorState::Error(_)));
        assert!(sup.pid().is_none());
        thread::sleep(Duration::from_millis(100));
        assert!(!marker.exists());
        assert!(transport.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_start_when_healthy_is_noop() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::with(vec![healthy(1)]);
        let mut sup = supervisor(&dir, FAKE_BACKEND, true, transport.clone());
        sup.start().unwrap();
        let pid = sup.pid();
        let mut rx = sup.subscribe();

        sup.start().unwrap();

        assert_eq!(sup.state(), SupervisorState::Healthy);
        assert_eq!(sup.pid(), pid);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(transport.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_stop_when_stopped_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut sup = supervisor(&dir, FAKE_BACKEND, true, FakeTransport::with(vec![]));
        let mut rx = sup.subscribe();

        sup.stop();

        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_premature_exit_is_fatal_and_fast() {
        let dir = TempDir::new().unwrap();
        let mut sup = supervisor(&dir, "exit 7", true, FakeTransport::with(vec![]));
        let started = Instant::now();

        let err = sup.start().unwrap_err();

        assert!(matches!(err, SupervisorError::ProcessExitedPrematurely(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
        match sup.state() {
            SupervisorState::Error(reason) => {
                assert!(reason.contains("process exited prematurely"), "{reason}");
                assert!(reason.contains("exit code 7"), "{reason}");
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert!(sup.pid().is_none());
    }

    #[test]
    fn test_socket_timeout_reaps_child() {
        let dir = TempDir::new().unwrap();
        let mut sup = supervisor(&dir, "exec sleep 30", true, FakeTransport::with(vec![]));
        sup.config.startup_timeout = Duration::from_millis(300);

        let err = sup.start().unwrap_err();

        assert!(matches!(err, SupervisorError::SocketTimeout(_)));
        assert!(sup.pid().is_none());
        assert!(matches!(sup.state(), SupervisorState::Error(_)));
    }

    #[test]
    fn test_unhealthy_replies_tear_down() {
        for bad in [
            reply(503, r#"{"status":"healthy"}"#),
            reply(200, "not json"),
            reply(200, r#"{"status":"loading","model_loaded":false}"#),
            Err(IpcError::Timeout),
        ] {
            let dir = TempDir::new().unwrap();
            let mut sup = supervisor(&dir, FAKE_BACKEND, true, FakeTransport::with(vec![bad]));

            let err = sup.start().unwrap_err();

            assert!(matches!(err, SupervisorError::HealthCheckFailed(_)), "{err:?}");
            assert!(sup.pid().is_none());
            assert!(!sup.config().socket_path.exists());
        }
    }

    #[test]
    fn test_failed_start_then_stop_settles_stopped() {
        let dir = TempDir::new().unwrap();
        let mut sup = supervisor(&dir, "exit 1", true, FakeTransport::with(vec![]));
        assert!(sup.start().is_err());

        sup.stop();
        assert_eq!(sup.state(), SupervisorState::Stopped);
    }

    #[test]
    fn test_stale_socket_is_removed_before_start() {
        let dir = TempDir::new().unwrap();
        // Backend that never creates the socket: a leftover file must not
        // fool the readiness poll
        let mut sup = supervisor(&dir, "exec sleep 30", true, FakeTransport::with(vec![healthy(1)]));
        sup.config.startup_timeout = Duration::from_millis(300);
        let socket = sup.config().socket_path.clone();
        std::fs::create_dir_all(socket.parent().unwrap()).unwrap();
        std::fs::write(&socket, "").unwrap();

        assert!(matches!(sup.start(), Err(SupervisorError::SocketTimeout(_))));
        assert!(!socket.exists());
    }

    #[test]
    fn test_child_environment_contract() {
        let dir = TempDir::new().unwrap();
        let dump = dir.path().join("env.txt");
        let script = format!(
            r#"env > {}; touch "$REPOWHISPER_SOCKET_PATH"; exec sleep 30"#,
            dump.display()
        );
        let mut sup = supervisor(&dir, &script, true, FakeTransport::with(vec![healthy(0)]));
        sup.start().unwrap();

        let env = std::fs::read_to_string(&dump).unwrap();
        let config = sup.config().clone();
        assert!(env.contains(&format!("REPOWHISPER_SOCKET_PATH={}", config.socket_path.display())));
        assert!(env.contains(&format!("REPOWHISPER_DATA_DIR={}", config.data_dir.display())));
        assert!(env.contains("REPOWHISPER_ALLOWLIST_PATH="));
        assert!(env.contains("REPOWHISPER_AUTH_TOKEN="));
        assert!(env.contains("REPOWHISPER_DEBUG=0"));
        assert!(!env.contains("REPOWHISPER_ASSETS_DIR"));
        // cargo sets this for the test process; it must not reach the child
        if std::env::var_os("CARGO_MANIFEST_DIR").is_some() {
            assert!(!env.contains("CARGO_MANIFEST_DIR="));
        }
        sup.stop();
    }

    #[test]
    fn test_relay_requires_healthy() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, FAKE_BACKEND, true, FakeTransport::with(vec![]));
        let request = SearchRequest {
            query: "auth".into(),
            top_k: 5,
            repo_id: None,
        };
        assert!(matches!(sup.search(&request), Err(SupervisorError::NotRunning)));
    }

    #[test]
    fn test_search_relays_with_auth() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::with(vec![
            healthy(3),
            reply(200, r#"{"results":[],"query":"auth","latency_ms":0.5}"#),
        ]);
        let mut sup = supervisor(&dir, FAKE_BACKEND, true, transport.clone());
        sup.start().unwrap();

        let result = sup
            .search(&SearchRequest {
                query: "auth".into(),
                top_k: 5,
                repo_id: None,
            })
            .unwrap();
        assert_eq!(result["query"], "auth");

        let seen = transport.seen.lock().unwrap();
        let search = &seen[1];
        assert_eq!(search.method, Method::Post);
        assert_eq!(search.path, "/search");
        assert!(search.headers.iter().any(|(k, _)| k == AUTH_HEADER));
        let body: serde_json::Value = serde_json::from_slice(search.body.as_ref().unwrap()).unwrap();
        assert_eq!(body, serde_json::json!({"query": "auth", "top_k": 5}));
    }

    #[test]
    fn test_index_outside_grants_is_refused_locally() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::with(vec![healthy(0)]);
        let mut sup = supervisor(&dir, FAKE_BACKEND, true, transport.clone());
        sup.start().unwrap();

        let err = sup
            .index(&IndexRequest {
                mode: IndexMode::Full,
                repo_path: PathBuf::from("/etc"),
                file_paths: None,
            })
            .unwrap_err();

        assert!(matches!(err, SupervisorError::PathNotAllowed(_)));
        assert_eq!(transport.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_index_names_the_file_outside_grants() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::with(vec![healthy(0)]);
        let mut sup = supervisor(&dir, FAKE_BACKEND, true, transport.clone());
        sup.start().unwrap();

        let err = sup
            .index(&IndexRequest {
                mode: IndexMode::Manual,
                repo_path: PathBuf::from("/repo"),
                file_paths: Some(vec![PathBuf::from("/repo/a.rs"), PathBuf::from("/home/me/.ssh/id")]),
            })
            .unwrap_err();

        match err {
            SupervisorError::PathNotAllowed(path) => assert_eq!(path, PathBuf::from("/home/me/.ssh/id")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transport.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_index_request_paths_lead_with_repo() {
        let request = IndexRequest {
            mode: IndexMode::Manual,
            repo_path: PathBuf::from("/repo"),
            file_paths: Some(vec![PathBuf::from("/repo/a.rs"), PathBuf::from("/repo/b.rs")]),
        };
        assert_eq!(
            request.paths(),
            vec![Path::new("/repo"), Path::new("/repo/a.rs"), Path::new("/repo/b.rs")]
        );

        let whole = IndexRequest { file_paths: None, ..request };
        assert_eq!(whole.paths(), vec![Path::new("/repo")]);
    }

    #[test]
    fn test_probe_updates_cached_report() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::with(vec![healthy(1), healthy(9)]);
        let mut sup = supervisor(&dir, FAKE_BACKEND, true, transport);
        sup.start().unwrap();

        assert_eq!(sup.probe().unwrap().index_count, 9);
        assert_eq!(sup.health().unwrap().index_count, 9);
        // Queue exhausted: the double times out
        assert!(sup.probe().is_err());
        assert_eq!(sup.state(), SupervisorState::Healthy);
    }

    #[test]
    fn test_restart_spawns_new_child() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::with(vec![healthy(1), healthy(2)]);
        let mut sup = supervisor(&dir, FAKE_BACKEND, true, transport);
        sup.start().unwrap();
        let first = sup.pid();

        sup.restart().unwrap();

        assert_eq!(sup.state(), SupervisorState::Healthy);
        assert_ne!(sup.pid(), first);
        assert_eq!(sup.health().unwrap().index_count, 2);
    }

    #[test]
    fn test_health_report_defaults() {
        let report: HealthReport =
            serde_json::from_str(r#"{"status":"healthy","version":"0.1.0"}"#).unwrap();
        assert!(report.is_healthy());
        assert!(!report.model_loaded);
        assert_eq!(report.index_count, 0);
    }
}
