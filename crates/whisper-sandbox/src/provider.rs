//! Access providers - how a directory grant survives a restart
//!
//! A provider turns a user-chosen directory into an opaque token that can be
//! written to disk, and later turns that token back into live access without
//! asking the user again. Hosts with a persistable-handle mechanism plug in
//! their own provider. Everything else gets [`PlainPathProvider`], which is
//! honest about what it is: the token is the path, and nothing in the OS
//! stops the backend from reading outside the allowlist.

use std::path::{Path, PathBuf};

/// Outcome of resolving a persisted token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Token still grants access to `path`. `refreshed` carries a new token
    /// when the provider wants the stored one replaced.
    Active {
        path: PathBuf,
        refreshed: Option<String>,
    },
    /// Token no longer refers to anything we may access. Treat as revoked.
    Stale,
}

/// Live access to a granted directory. Dropping it does not revoke;
/// call [`AccessProvider::stop_access`].
#[derive(Debug)]
pub struct AccessGrant {
    pub path: PathBuf,
    pub token: String,
}

/// Host-specific persistable access mechanism
pub trait AccessProvider: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Whether the OS enforces the grant. `false` means the allowlist
    /// manifest is the only thing keeping the backend in bounds.
    fn is_sandboxed(&self) -> bool;

    /// Create a token for a freshly chosen directory
    fn create_token(&self, path: &Path) -> Result<String, String>;

    /// Turn a stored token back into a path
    fn resolve(&self, token: &str) -> Result<Resolution, String>;

    /// Begin using the grant
    fn start_access(&self, path: &Path, token: &str) -> Result<AccessGrant, String>;

    /// Stop using the grant. Must not fail.
    fn stop_access(&self, grant: &AccessGrant);
}

/// External directory picker. `Ok(None)` means the user cancelled.
pub trait DirectoryChooser {
    fn choose(&self) -> Result<Option<PathBuf>, String>;
}

/// A chooser that "picks" a path decided up front (CLI argument, tests)
pub struct FixedChooser(pub Option<PathBuf>);

impl FixedChooser {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(Some(path.into()))
    }

    pub fn cancelled() -> Self {
        Self(None)
    }
}

impl DirectoryChooser for FixedChooser {
    fn choose(&self) -> Result<Option<PathBuf>, String> {
        Ok(self.0.clone())
    }
}

/// Fallback provider for hosts without persistable handles.
///
/// The token is the canonical path. Resolution only checks that the
/// directory still exists. There is no OS-level sandboxing.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainPathProvider;

impl AccessProvider for PlainPathProvider {
    fn name(&self) -> &'static str {
        "plain-path"
    }

    fn is_sandboxed(&self) -> bool {
        false
    }

    fn create_token(&self, path: &Path) -> Result<String, String> {
        path.to_str()
            .map(str::to_string)
            .ok_or_else(|| format!("path is not valid UTF-8: {}", path.display()))
    }

    fn resolve(&self, token: &str) -> Result<Resolution, String> {
        let path = PathBuf::from(token);
        if !path.is_absolute() {
            return Ok(Resolution::Stale);
        }
        match path.canonicalize() {
            Ok(canonical) if canonical.is_dir() => {
                let refreshed = (canonical != path)
                    .then(|| self.create_token(&canonical))
                    .transpose()?;
                Ok(Resolution::Active {
                    path: canonical,
                    refreshed,
                })
            }
            Ok(_) => Ok(Resolution::Stale),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Resolution::Stale),
            Err(e) => Err(e.to_string()),
        }
    }

    fn start_access(&self, path: &Path, token: &str) -> Result<AccessGrant, String> {
        if !path.is_dir() {
            return Err(format!("not a directory: {}", path.display()));
        }
        Ok(AccessGrant {
            path: path.to_path_buf(),
            token: token.to_string(),
        })
    }

    fn stop_access(&self, _grant: &AccessGrant) {}
}
