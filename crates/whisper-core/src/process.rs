//! Backend process plumbing: locating the executable, private directories,
//! log files, spawning and reaping.

use crate::config::{ExecutableSpec, SupervisorConfig};
use crate::error::SupervisorError;
use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const BACKEND_BINARY: &str = "repowhisper-backend";
const BACKEND_SCRIPT: &str = "main.py";
const EXIT_POLL: Duration = Duration::from_millis(50);

/// Find the backend: explicit override, bundled per-arch binary, bundled
/// generic binary, then interpreter + script for development checkouts.
pub fn resolve_executable(config: &SupervisorConfig) -> Result<ExecutableSpec, SupervisorError> {
    if let Some(spec) = &config.executable {
        let program = locate_program(&spec.program)
            .ok_or_else(|| SupervisorError::ExecutableNotFound(spec.program.clone()))?;
        return Ok(ExecutableSpec {
            program,
            args: spec.args.clone(),
        });
    }

    if let Some(resources) = &config.resources_dir {
        let bin = resources.join("bin");
        let arch_specific = bin.join(format!("{BACKEND_BINARY}-{}", std::env::consts::ARCH));
        for candidate in [arch_specific, bin.join(BACKEND_BINARY)] {
            if is_executable(&candidate) {
                return Ok(ExecutableSpec {
                    program: candidate,
                    args: Vec::new(),
                });
            }
        }
    }

    let Some(backend_dir) = &config.backend_dir else {
        let searched = config
            .resources_dir
            .as_ref()
            .map(|r| r.join("bin").join(BACKEND_BINARY))
            .unwrap_or_else(|| PathBuf::from(BACKEND_BINARY));
        return Err(SupervisorError::ExecutableNotFound(searched));
    };
    let script = backend_dir.join(BACKEND_SCRIPT);
    if !script.is_file() {
        return Err(SupervisorError::ExecutableNotFound(script));
    }
    let interpreter = locate_program(Path::new(&config.interpreter))
        .ok_or_else(|| SupervisorError::InterpreterNotFound(config.interpreter.clone()))?;

    Ok(ExecutableSpec {
        program: interpreter,
        args: vec![script.to_string_lossy().into_owned()],
    })
}

/// Absolute paths must exist and be executable; bare names go through `PATH`
fn locate_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return is_executable(program).then(|| program.to_path_buf());
    }
    which::which(program).ok()
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Create `path` (and parents) as 0700, tightening it if it already exists
pub fn ensure_private_dir(path: &Path) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(0o700).create(path)?;
    let mode = fs::metadata(path)?.permissions().mode();
    if mode & 0o077 != 0 {
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Append-only, owner-only log file
pub fn open_log(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
}

/// Remove a file, treating "already gone" as success
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone)]
pub struct LogPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl LogPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            stdout: dir.join("backend.stdout.log"),
            stderr: dir.join("backend.stderr.log"),
        }
    }
}

/// How a stop went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    AlreadyExited,
    Graceful,
    Killed,
}

/// The one running backend. Owned by the supervisor.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub socket_path: PathBuf,
    pub logs: LogPaths,
}

impl ProcessHandle {
    pub fn spawn(
        mut command: Command,
        socket_path: &Path,
        logs: LogPaths,
    ) -> Result<Self, SupervisorError> {
        let stdout = open_log(&logs.stdout)?;
        let stderr = open_log(&logs.stderr)?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        let child = command.spawn().map_err(SupervisorError::Spawn)?;
        let pid = child.id();
        debug!(pid, "Backend spawned");
        Ok(Self {
            child,
            pid,
            started_at: Utc::now(),
            socket_path: socket_path.to_path_buf(),
            logs,
        })
    }

    /// `Some(status)` once the child has exited (and been reaped)
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!(pid = self.pid, error = %e, "Could not poll backend status");
                None
            }
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.exit_status().is_none()
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. Never fails; the child is
    /// reaped on every path.
    pub fn terminate(mut self, grace: Duration) -> Termination {
        if self.exit_status().is_some() {
            return Termination::AlreadyExited;
        }

        match i32::try_from(self.pid) {
            Ok(raw) => {
                if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                    debug!(pid = self.pid, error = %e, "SIGTERM failed");
                }
            }
            Err(_) => warn!(pid = self.pid, "PID out of range for signals"),
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.exit_status().is_some() {
                return Termination::Graceful;
            }
            thread::sleep(EXIT_POLL);
        }
        if self.exit_status().is_some() {
            return Termination::Graceful;
        }

        warn!(pid = self.pid, ?grace, "Backend ignored SIGTERM, killing");
        if let Err(e) = self.child.kill() {
            debug!(pid = self.pid, error = %e, "SIGKILL failed");
        }
        if let Err(e) = self.child.wait() {
            debug!(pid = self.pid, error = %e, "Reaping backend failed");
        }
        Termination::Killed
    }
}

/// Exit status in words, for error messages
pub fn describe_exit(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("killed by signal {signal}"),
        _ => "unknown exit status".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_executable(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn config(dir: &TempDir) -> SupervisorConfig {
        SupervisorConfig::new(dir.path().join("data"))
    }

    #[test]
    fn test_prefers_arch_specific_binary() {
        let dir = TempDir::new().unwrap();
        let resources = dir.path().join("Resources");
        let arch = resources
            .join("bin")
            .join(format!("{BACKEND_BINARY}-{}", std::env::consts::ARCH));
        write_executable(&arch);
        write_executable(&resources.join("bin").join(BACKEND_BINARY));

        let mut config = config(&dir);
        config.resources_dir = Some(resources);
        assert_eq!(resolve_executable(&config).unwrap().program, arch);
    }

    #[test]
    fn test_falls_back_to_generic_binary() {
        let dir = TempDir::new().unwrap();
        let resources = dir.path().join("Resources");
        let generic = resources.join("bin").join(BACKEND_BINARY);
        write_executable(&generic);

        let mut config = config(&dir);
        config.resources_dir = Some(resources);
        assert_eq!(resolve_executable(&config).unwrap().program, generic);
    }

    #[test]
    fn test_falls_back_to_interpreter_and_script() {
        let dir = TempDir::new().unwrap();
        let backend = dir.path().join("backend");
        fs::create_dir_all(&backend).unwrap();
        fs::write(backend.join(BACKEND_SCRIPT), "print('hi')\n").unwrap();

        let mut config = config(&dir);
        config.backend_dir = Some(backend.clone());
        config.interpreter = "sh".to_string();

        let spec = resolve_executable(&config).unwrap();
        assert!(spec.program.ends_with("sh"));
        assert_eq!(spec.args, vec![backend.join(BACKEND_SCRIPT).to_string_lossy().into_owned()]);
    }

    #[test]
    fn test_missing_interpreter_is_reported() {
        let dir = TempDir::new().unwrap();
        let backend = dir.path().join("backend");
        fs::create_dir_all(&backend).unwrap();
        fs::write(backend.join(BACKEND_SCRIPT), "").unwrap();

        let mut config = config(&dir);
        config.backend_dir = Some(backend);
        config.interpreter = "definitely-not-an-interpreter-42".to_string();

        assert!(matches!(
            resolve_executable(&config),
            Err(SupervisorError::InterpreterNotFound(_))
        ));
    }

    #[test]
    fn test_nothing_configured_is_not_found() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            resolve_executable(&config(&dir)),
            Err(SupervisorError::ExecutableNotFound(_))
        ));
    }

    #[test]
    fn test_override_must_exist() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.executable = Some(ExecutableSpec {
            program: dir.path().join("nope"),
            args: Vec::new(),
        });
        assert!(matches!(
            resolve_executable(&config),
            Err(SupervisorError::ExecutableNotFound(_))
        ));
    }

    #[test]
    fn test_private_dir_is_tightened() {
        let dir = TempDir::new().unwrap();
        let private = dir.path().join("a/b");
        fs::create_dir_all(&private).unwrap();
        fs::set_permissions(&private, fs::Permissions::from_mode(0o755)).unwrap();

        ensure_private_dir(&private).unwrap();
        let mode = fs::metadata(&private).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_log_is_append_only_and_private() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backend.stdout.log");
        {
            use std::io::Write;
            open_log(&path).unwrap().write_all(b"one\n").unwrap();
            open_log(&path).unwrap().write_all(b"two\n").unwrap();
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "one\ntwo\n");
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);
    }

    fn spawn_sh(dir: &TempDir, script: &str) -> ProcessHandle {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        ProcessHandle::spawn(command, &dir.path().join("x.sock"), LogPaths::in_dir(dir.path())).unwrap()
    }

    #[test]
    fn test_terminate_graceful() {
        let dir = TempDir::new().unwrap();
        let mut handle = spawn_sh(&dir, "exec sleep 30");
        assert!(handle.is_running());
        assert_eq!(handle.terminate(Duration::from_secs(3)), Termination::Graceful);
    }

    #[test]
    fn test_terminate_escalates_to_kill() {
        let dir = TempDir::new().unwrap();
        let handle = spawn_sh(&dir, "trap '' TERM; while true; do sleep 1; done");
        // Give the shell time to install the trap
        thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        assert_eq!(handle.terminate(Duration::from_millis(300)), Termination::Killed);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_exited_child_reports_status() {
        let dir = TempDir::new().unwrap();
        let mut handle = spawn_sh(&dir, "exit 3");
        let deadline = Instant::now() + Duration::from_secs(5);
        let status = loop {
            if let Some(status) = handle.exit_status() {
                break status;
            }
            assert!(Instant::now() < deadline);
            thread::sleep(EXIT_POLL);
        };
        assert_eq!(describe_exit(status), "exit code 3");
        assert_eq!(handle.terminate(Duration::from_secs(1)), Termination::AlreadyExited);
    }
}
