//! Whisper Sandbox - user-granted folder capabilities
//!
//! This crate provides:
//! - A persisted, revocable store of approved directories
//! - The allowlist manifest the backend reads at startup (fail-closed)
//! - Pluggable access providers for hosts with persistable handles

pub mod capabilities;
mod lock;
pub mod manifest;
pub mod provider;

pub use capabilities::{AllowlistSource, CapabilityError, CapabilityStore, PersistedGrant};
pub use provider::{
    AccessGrant, AccessProvider, DirectoryChooser, FixedChooser, PlainPathProvider, Resolution,
};
