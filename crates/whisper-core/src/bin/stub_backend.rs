//! Minimal stand-in for the search backend
//!
//! Speaks the same contract as the real one: reads its configuration from
//! the environment, refuses to run without an approved folder, serves
//! authenticated HTTP on the Unix socket, and exits cleanly on SIGTERM.
//! Used by the integration tests and for trying the CLI without models.

use clap::Parser;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use whisper_core::supervisor::env;
use whisper_core::AUTH_HEADER;
use whisper_sandbox::manifest::read_manifest;

#[derive(Parser, Debug)]
#[command(name = "whisper-stub-backend")]
#[command(about = "Stand-in backend speaking the supervisor contract")]
struct Args {
    /// Status reported by /health
    #[arg(long, default_value = "healthy")]
    status: String,

    /// index_count reported by /health
    #[arg(long, default_value_t = 42)]
    index_count: u64,

    /// Exit with this code before binding the socket
    #[arg(long)]
    exit_code: Option<i32>,

    /// Sleep before binding the socket
    #[arg(long, default_value_t = 0)]
    startup_delay_ms: u64,

    /// Answer /health with 503 after this many checks
    #[arg(long)]
    fail_health_after: Option<u64>,
}

struct Backend {
    args: Args,
    token: String,
    roots: Vec<PathBuf>,
    health_checks: AtomicU64,
}

struct Exchange {
    method: String,
    path: String,
    token: Option<String>,
    body: Vec<u8>,
}

fn required(key: &str) -> Result<String, String> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(format!("{key} is not set")),
    }
}

/// Approved roots from the manifest. Anything unreadable or empty is fatal.
fn read_roots(path: &Path) -> Result<Vec<PathBuf>, String> {
    let roots = read_manifest(path).map_err(|e| format!("{}: {e}", path.display()))?;
    if roots.is_empty() {
        return Err("allowlist is empty".into());
    }
    Ok(roots)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::new("info"))
        .init();

    let args = Args::parse();
    if let Some(code) = args.exit_code {
        error!(code, "Exiting before startup as requested");
        std::process::exit(code);
    }

    let socket = match required(env::SOCKET_PATH) {
        Ok(s) => PathBuf::from(s),
        Err(e) => fatal(&e),
    };
    let token = required(env::AUTH_TOKEN).unwrap_or_else(|e| fatal(&e));
    let roots = required(env::ALLOWLIST_PATH)
        .and_then(|p| read_roots(Path::new(&p)))
        .unwrap_or_else(|e| fatal(&format!("refusing to start: {e}")));

    if args.startup_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(args.startup_delay_ms)).await;
    }

    let listener = match UnixListener::bind(&socket) {
        Ok(l) => l,
        Err(e) => fatal(&format!("bind {}: {e}", socket.display())),
    };
    info!(socket = %socket.display(), roots = roots.len(), "Stub backend listening");

    let backend = Arc::new(Backend {
        args,
        token,
        roots,
        health_checks: AtomicU64::new(0),
    });

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => fatal(&format!("signal handler: {e}")),
    };

    loop {
        tokio::select! {
            _ = term.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let backend = backend.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve(backend, stream).await {
                            warn!(error = %e, "Connection failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
        }
    }

    let _ = std::fs::remove_file(&socket);
}

fn fatal(message: &str) -> ! {
    error!("{message}");
    std::process::exit(2);
}

async fn read_exchange(stream: &mut UnixStream) -> std::io::Result<Exchange> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut token = None;
    let mut length = 0usize;
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            let value = value.trim();
            if name.eq_ignore_ascii_case(AUTH_HEADER) {
                token = Some(value.to_string());
            } else if name.eq_ignore_ascii_case("content-length") {
                length = value.parse().unwrap_or(0);
            }
        }
    }

    let mut body = vec![0; length];
    reader.read_exact(&mut body).await?;
    Ok(Exchange {
        method,
        path,
        token,
        body,
    })
}

async fn serve(backend: Arc<Backend>, mut stream: UnixStream) -> std::io::Result<()> {
    let exchange = read_exchange(&mut stream).await?;
    debug!(method = %exchange.method, path = %exchange.path, "Request");

    let (status, body) = if exchange.token.as_deref() != Some(backend.token.as_str()) {
        (401, json!({"detail": "invalid auth token"}))
    } else {
        route(&backend, &exchange)
    };

    let payload = body.to_string();
    let reason = match status {
        200 => "OK",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        422 => "Unprocessable Entity",
        _ => "Service Unavailable",
    };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        payload.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(payload.as_bytes()).await?;
    stream.shutdown().await
}

fn route(backend: &Backend, exchange: &Exchange) -> (u16, Value) {
    let body: Value = serde_json::from_slice(&exchange.body).unwrap_or(Value::Null);
    match (exchange.method.as_str(), exchange.path.as_str()) {
        ("GET", "/health") => {
            let n = backend.health_checks.fetch_add(1, Ordering::SeqCst);
            if backend.args.fail_health_after.is_some_and(|limit| n >= limit) {
                return (503, json!({"detail": "unhealthy"}));
            }
            (
                200,
                json!({
                    "status": backend.args.status,
                    "model_loaded": true,
                    "index_count": backend.args.index_count,
                    "version": env!("CARGO_PKG_VERSION"),
                }),
            )
        }
        ("POST", "/search") => match body.get("query").and_then(Value::as_str) {
            Some(query) => (
                200,
                json!({"results": [], "query": query, "latency_ms": 0.1}),
            ),
            None => (422, json!({"detail": "query is required"})),
        },
        ("POST", "/index") => {
            let Some(repo) = body.get("repo_path").and_then(Value::as_str) else {
                return (422, json!({"detail": "repo_path is required"}));
            };
            if !backend.roots.iter().any(|root| Path::new(repo).starts_with(root)) {
                return (403, json!({"detail": "path not in allowlist"}));
            }
            (
                200,
                json!({
                    "status": "indexed",
                    "repo_path": repo,
                    "mode": body.get("mode").cloned().unwrap_or(Value::Null),
                    "files_indexed": 0,
                }),
            )
        }
        _ => (404, json!({"detail": "not found"})),
    }
}
