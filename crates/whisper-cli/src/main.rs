//! RepoWhisper CLI - local code search, sandboxed
//!
//! Usage:
//!   repowhisper grant <dir>     - Approve a folder for indexing
//!   repowhisper revoke <dir>    - Withdraw an approval
//!   repowhisper list            - Show approved folders
//!   repowhisper start           - Run the backend until Ctrl-C
//!   repowhisper status          - Probe a running backend
//!   repowhisper search <query>  - Search indexed code
//!   repowhisper index <repo>    - Index an approved folder
//!   repowhisper token rotate    - Replace the auth token

mod attach;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use whisper_core::{
    AuthToken, IndexMode, IndexRequest, ProcessSupervisor, SearchRequest, SupervisorConfig,
    SupervisorService, SupervisorState,
};
use whisper_sandbox::{CapabilityStore, FixedChooser, PlainPathProvider};

#[derive(Parser)]
#[command(name = "repowhisper")]
#[command(author = "RepoWhisper")]
#[command(version)]
#[command(about = "Private semantic code search over folders you approve", long_about = None)]
struct Cli {
    /// Data directory (default: $REPOWHISPER_HOME or ~/.repowhisper)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Approve a folder for indexing
    Grant {
        /// Folder to approve
        dir: PathBuf,
    },

    /// Withdraw a folder approval
    Revoke {
        /// Folder to withdraw
        dir: PathBuf,
    },

    /// List approved folders
    List,

    /// Start the backend and keep it healthy until Ctrl-C
    Start,

    /// Probe a running backend
    Status,

    /// Search indexed code
    Search {
        query: String,

        #[arg(long, default_value_t = 10)]
        top_k: usize,

        #[arg(long)]
        repo_id: Option<String>,
    },

    /// Index an approved folder
    Index {
        repo: PathBuf,

        #[arg(long, value_enum, default_value_t = Mode::Full)]
        mode: Mode,

        /// Only these files (manual mode)
        #[arg(long = "file")]
        files: Vec<PathBuf>,
    },

    /// Manage the backend auth token
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Generate a new token (takes effect on next start)
    Rotate,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Manual,
    Guided,
    Full,
}

impl From<Mode> for IndexMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Manual => IndexMode::Manual,
            Mode::Guided => IndexMode::Guided,
            Mode::Full => IndexMode::Full,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => SupervisorConfig::default_data_dir()?,
    };
    let config = SupervisorConfig::load(&data_dir)
        .with_context(|| format!("Could not load configuration from {}", data_dir.display()))?;
    let store = Arc::new(CapabilityStore::new(&data_dir, Box::new(PlainPathProvider)));
    let restored = store.restore_all()?;
    info!(restored, "Restored folder approvals");

    match cli.command {
        Commands::Grant { dir } => {
            let dir = absolute(&dir)?;
            match store.add_capability(&FixedChooser::new(dir))? {
                Some(path) => println!("✓ Approved {}", path.display()),
                None => println!("Nothing approved"),
            }
        }

        Commands::Revoke { dir } => {
            let dir = absolute(&dir)?;
            let dir = dir.canonicalize().unwrap_or(dir);
            store.remove_capability(&dir)?;
            println!("✓ Revoked {}", dir.display());
        }

        Commands::List => {
            let folders = store.capabilities();
            if folders.is_empty() {
                println!("No folders approved. Use `repowhisper grant <dir>`.");
            }
            for folder in folders {
                println!("{}", folder.display());
            }
        }

        Commands::Start => run(config, store).await?,

        Commands::Status => {
            let report = attach::Attached::connect(&config)?.health()?;
            println!("status:       {}", report.status);
            println!("model loaded: {}", report.model_loaded);
            println!("indexed:      {}", report.index_count);
            println!("version:      {}", report.version);
        }

        Commands::Search {
            query,
            top_k,
            repo_id,
        } => {
            let request = SearchRequest {
                query,
                top_k,
                repo_id,
            };
            let found = attach::Attached::connect(&config)?.search(&request)?;
            println!("{}", serde_json::to_string_pretty(&found)?);
        }

        Commands::Index { repo, mode, files } => {
            let request = IndexRequest {
                mode: mode.into(),
                repo_path: absolute(&repo)?,
                file_paths: if files.is_empty() {
                    None
                } else {
                    Some(files.iter().map(|f| absolute(f)).collect::<Result<_>>()?)
                },
            };
            let indexed = attach::Attached::connect(&config)?.index(&store, &request)?;
            println!("{}", serde_json::to_string_pretty(&indexed)?);
        }

        Commands::Token { action } => match action {
            TokenAction::Rotate => {
                AuthToken::new(&config.token_path).rotate()?;
                println!("✓ Auth token rotated. Restart the backend to apply it.");
            }
        },
    }

    Ok(())
}

/// Supervise the backend in the foreground
async fn run(config: SupervisorConfig, store: Arc<CapabilityStore>) -> Result<()> {
    let service = SupervisorService::new(ProcessSupervisor::with_ipc(config, store));

    if let Err(e) = service.start().await {
        if e.is_no_capabilities() {
            println!("No folders approved. Use `repowhisper grant <dir>` first.");
        }
        return Err(e.into());
    }
    if let Some(pid) = service.pid().await {
        println!("✓ Backend healthy (pid {pid}). Ctrl-C to stop.");
    }

    let (shutdown, rx) = tokio::sync::watch::channel(false);
    let monitor = service.spawn_monitor(rx);
    let mut states = service.watch_state();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                if let SupervisorState::Error(reason) = &state {
                    warn!(%reason, "Backend is down");
                }
            }
        }
    }

    info!("Shutting down");
    let _ = shutdown.send(true);
    if let Err(e) = monitor.await {
        warn!(error = %e, "Health monitor ended abnormally");
    }
    service.stop().await;
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}
