//! Whisper Core - backend supervision
//!
//! Owns the lifecycle of the local search backend: refuses to start it
//! without approved folders, launches it with a scrubbed environment and a
//! per-user auth token, waits for its socket and health check, monitors it,
//! and relays search and index requests to it.

pub mod config;
pub mod error;
pub mod monitor;
pub mod process;
pub mod service;
pub mod supervisor;
pub mod token;

pub use config::{ConfigError, ExecutableSpec, MonitorPolicy, Settings, SupervisorConfig};
pub use error::SupervisorError;
pub use service::SupervisorService;
pub use supervisor::{
    HealthReport, IndexMode, IndexRequest, ProcessSupervisor, SearchRequest, StateTransition,
    SupervisorState,
};
pub use token::{AuthToken, AUTH_HEADER};
