//! Capability store - user-approved directories, persisted and revocable
//!
//! The backend never gets to pick what it reads. The user grants a folder,
//! we keep a token for it, and the allowlist manifest handed to the backend
//! lists exactly the folders granted right now. No grants, no manifest,
//! no backend.
//!
//! `grants.json` is the source of truth. Several processes may hold a store
//! over the same data directory, so every operation takes the directory
//! lock and re-reads the file before acting on it.

use crate::lock::DirLock;
use crate::manifest;
use crate::provider::{AccessGrant, AccessProvider, DirectoryChooser, Resolution};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

const MANIFEST_FILE: &str = "allowlist.json";
const GRANTS_FILE: &str = "grants.json";
const LOCK_FILE: &str = "grants.lock";

#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("Directory chooser failed: {0}")]
    Chooser(String),

    #[error("Not an absolute directory: {0}")]
    InvalidPath(PathBuf),

    #[error("OS declined a persistable handle for {path}: {reason}")]
    TokenDenied { path: PathBuf, reason: String },

    #[error("Could not start access to {path}: {reason}")]
    AccessDenied { path: PathBuf, reason: String },

    #[error("No folders approved. Grant a folder before starting the backend.")]
    NoCapabilities,

    #[error("Capability storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the supervisor needs from the store: a fresh manifest, or a refusal
pub trait AllowlistSource: Send + Sync {
    /// Regenerate the manifest. Fails with [`CapabilityError::NoCapabilities`]
    /// when nothing is granted.
    fn write_allowlist_manifest(&self) -> Result<PathBuf, CapabilityError>;

    /// Where the manifest lives. Stable across calls.
    fn manifest_path(&self) -> PathBuf;

    /// Whether `path` is covered by a current grant
    fn is_path_allowed(&self, path: &Path) -> bool;

    /// First of `paths` not covered by a grant
    fn first_disallowed<'a>(&self, paths: &[&'a Path]) -> Option<&'a Path> {
        paths.iter().copied().find(|path| !self.is_path_allowed(path))
    }
}

/// On-disk form of one grant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedGrant {
    pub path: PathBuf,
    pub token: String,
}

/// An approved directory with live access
#[derive(Debug)]
struct Capability {
    grant: AccessGrant,
}

#[derive(Debug, Default)]
struct Grants {
    active: Vec<Capability>,
    /// Rows whose token could not be resolved. Kept on disk for a later try.
    dormant: Vec<PersistedGrant>,
}

impl Grants {
    fn contains(&self, path: &Path) -> bool {
        self.active.iter().any(|c| c.grant.path == path)
    }

    fn roots(&self) -> Vec<PathBuf> {
        self.active.iter().map(|c| c.grant.path.clone()).collect()
    }

    fn rows(&self) -> Vec<PersistedGrant> {
        self.active
            .iter()
            .map(|c| PersistedGrant {
                path: c.grant.path.clone(),
                token: c.grant.token.clone(),
            })
            .chain(self.dormant.iter().cloned())
            .collect()
    }
}

enum Restored {
    Live(Capability),
    Dormant(PersistedGrant),
    Stale,
}

pub struct CapabilityStore {
    provider: Box<dyn AccessProvider>,
    manifest_path: PathBuf,
    grants_path: PathBuf,
    lock_path: PathBuf,
    state: Mutex<Grants>,
}

impl CapabilityStore {
    /// Create a store rooted at `data_dir`. Nothing is loaded until
    /// [`restore_all`](Self::restore_all).
    pub fn new(data_dir: &Path, provider: Box<dyn AccessProvider>) -> Self {
        if !provider.is_sandboxed() {
            warn!(
                provider = provider.name(),
                "Access provider has no OS-level sandboxing; the allowlist manifest is the only boundary"
            );
        }
        Self {
            provider,
            manifest_path: data_dir.join(MANIFEST_FILE),
            grants_path: data_dir.join(GRANTS_FILE),
            lock_path: data_dir.join(LOCK_FILE),
            state: Mutex::new(Grants::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Grants> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the directory lock, then bring memory in line with disk.
    ///
    /// Lock order is always directory lock first, then the mutex.
    fn synced(&self) -> Result<(DirLock, MutexGuard<'_, Grants>), CapabilityError> {
        let dir_lock = DirLock::acquire(&self.lock_path)?;
        let mut grants = self.lock();
        self.sync(&mut grants)?;
        Ok((dir_lock, grants))
    }

    fn sync(&self, grants: &mut Grants) -> Result<(), CapabilityError> {
        let on_disk = self.load_persisted()?;

        let provider = &self.provider;
        grants.active.retain(|cap| {
            let kept = on_disk.iter().any(|row| row.path == cap.grant.path);
            if !kept {
                info!(path = %cap.grant.path.display(), "Folder revoked elsewhere");
                provider.stop_access(&cap.grant);
            }
            kept
        });
        grants.dormant.clear();

        let mut rewrite = false;
        for row in on_disk {
            if grants.contains(&row.path) {
                continue;
            }
            let original = row.token.clone();
            match self.restore(row) {
                Restored::Live(cap) if grants.contains(&cap.grant.path) => {
                    // Duplicate row for a folder already active
                    self.provider.stop_access(&cap.grant);
                    rewrite = true;
                }
                Restored::Live(cap) => {
                    rewrite |= cap.grant.token != original;
                    grants.active.push(cap);
                }
                Restored::Dormant(row) => grants.dormant.push(row),
                Restored::Stale => rewrite = true,
            }
        }

        if rewrite {
            self.persist(grants)?;
        }
        Ok(())
    }

    fn restore(&self, row: PersistedGrant) -> Restored {
        match self.provider.resolve(&row.token) {
            Ok(Resolution::Active { path, refreshed }) => {
                let token = refreshed.unwrap_or(row.token);
                match self.provider.start_access(&path, &token) {
                    Ok(grant) => {
                        debug!(path = %path.display(), "Restored folder grant");
                        Restored::Live(Capability { grant })
                    }
                    Err(reason) => {
                        warn!(path = %path.display(), %reason, "Could not restart access");
                        Restored::Dormant(PersistedGrant { path, token })
                    }
                }
            }
            Ok(Resolution::Stale) => {
                warn!(path = %row.path.display(), "Dropping stale folder grant");
                Restored::Stale
            }
            Err(reason) => {
                warn!(path = %row.path.display(), %reason, "Could not resolve folder grant");
                Restored::Dormant(row)
            }
        }
    }

    /// Ask the chooser for a folder and grant it.
    ///
    /// Returns the granted path, or `None` if the user cancelled. Granting an
    /// already-approved folder returns it again without a second entry.
    /// Nothing is left granted if the manifest can't be updated.
    pub fn add_capability(
        &self,
        chooser: &dyn DirectoryChooser,
    ) -> Result<Option<PathBuf>, CapabilityError> {
        let Some(chosen) = chooser.choose().map_err(CapabilityError::Chooser)? else {
            debug!("Directory chooser cancelled");
            return Ok(None);
        };
        if !chosen.is_absolute() {
            return Err(CapabilityError::InvalidPath(chosen));
        }
        let path = chosen
            .canonicalize()
            .map_err(|_| CapabilityError::InvalidPath(chosen.clone()))?;
        if !path.is_dir() {
            return Err(CapabilityError::InvalidPath(chosen));
        }

        let (_dir_lock, mut grants) = self.synced()?;
        if grants.contains(&path) {
            debug!(path = %path.display(), "Folder already granted");
            return Ok(Some(path));
        }

        let token = self
            .provider
            .create_token(&path)
            .map_err(|reason| CapabilityError::TokenDenied {
                path: path.clone(),
                reason,
            })?;
        let grant = self
            .provider
            .start_access(&path, &token)
            .map_err(|reason| CapabilityError::AccessDenied {
                path: path.clone(),
                reason,
            })?;

        // A fresh grant replaces a dormant row for the same folder
        let displaced = grants
            .dormant
            .iter()
            .position(|row| row.path == path)
            .map(|i| grants.dormant.remove(i));
        grants.active.push(Capability { grant });

        let committed = self
            .persist(&grants)
            .and_then(|()| self.regenerate(&grants.active));
        if let Err(e) = committed {
            warn!(path = %path.display(), error = %e, "Could not record grant, rolling back");
            if let Some(cap) = grants.active.pop() {
                self.provider.stop_access(&cap.grant);
            }
            grants.dormant.extend(displaced);
            if let Err(undo) = self.persist(&grants) {
                warn!(error = %undo, "Could not restore grant file after failed grant");
            }
            return Err(e);
        }

        info!(path = %path.display(), "Folder granted");
        Ok(Some(path))
    }

    /// Revoke a folder. No-op if it was never granted.
    ///
    /// The grant file is rewritten first, so a failed revoke leaves the
    /// folder fully granted. Once it is off disk the manifest must not list
    /// it: if the manifest can't be rewritten it is deleted.
    pub fn remove_capability(&self, path: &Path) -> Result<(), CapabilityError> {
        let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let is_target = |p: &Path| p == target || p == path;

        let (_dir_lock, mut grants) = self.synced()?;
        if let Some(index) = grants.dormant.iter().position(|row| is_target(&row.path)) {
            let row = grants.dormant.remove(index);
            self.persist(&grants)?;
            info!(path = %row.path.display(), "Dormant folder grant revoked");
            return Ok(());
        }
        let Some(index) = grants.active.iter().position(|c| is_target(&c.grant.path)) else {
            return Ok(());
        };

        let mut rows = grants.rows();
        rows.remove(index);
        self.write_rows(&rows)?;

        let cap = grants.active.remove(index);
        self.provider.stop_access(&cap.grant);
        if let Err(e) = self.regenerate(&grants.active) {
            warn!(error = %e, "Could not rewrite allowlist manifest after revoke, removing it");
            if let Err(rm) = remove_if_exists(&self.manifest_path) {
                warn!(path = %self.manifest_path.display(), error = %rm, "Could not remove allowlist manifest");
            }
            return Err(e);
        }

        info!(path = %cap.grant.path.display(), "Folder revoked");
        Ok(())
    }

    /// Re-activate every persisted grant. Called once at startup.
    ///
    /// Stale tokens are dropped. A token that fails to resolve for any other
    /// reason is kept on disk but not activated. A grant file that can't be
    /// parsed is moved aside and the store starts empty. Returns the number
    /// of folders now active.
    pub fn restore_all(&self) -> Result<usize, CapabilityError> {
        let (_dir_lock, grants) = self.synced()?;
        self.regenerate(&grants.active)?;

        info!(count = grants.active.len(), "Folder grants restored");
        Ok(grants.active.len())
    }

    /// Write the manifest for the current set.
    pub fn write_allowlist_manifest(&self) -> Result<PathBuf, CapabilityError> {
        let (_dir_lock, grants) = self.synced()?;
        if grants.active.is_empty() {
            // No stale manifest may outlive the last grant
            self.regenerate(&grants.active)?;
            return Err(CapabilityError::NoCapabilities);
        }
        self.write_manifest_locked(&grants.active)?;
        Ok(self.manifest_path.clone())
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Approved folders in grant order
    pub fn capabilities(&self) -> Vec<PathBuf> {
        match self.synced() {
            Ok((_dir_lock, grants)) => grants.roots(),
            Err(e) => {
                warn!(error = %e, "Could not re-read folder grants");
                self.lock().roots()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities().is_empty()
    }

    /// Whether `path` is an approved folder or lies beneath one.
    /// False when the grant file can't be read.
    pub fn is_path_allowed(&self, path: &Path) -> bool {
        let resolved = match path.canonicalize() {
            Ok(p) => p,
            Err(_) if path.is_absolute() => normalize(path),
            Err(_) => return false,
        };
        match self.synced() {
            Ok((_dir_lock, grants)) => grants
                .active
                .iter()
                .any(|c| resolved.starts_with(&c.grant.path)),
            Err(e) => {
                warn!(error = %e, "Could not re-read folder grants");
                false
            }
        }
    }

    fn persist(&self, grants: &Grants) -> Result<(), CapabilityError> {
        self.write_rows(&grants.rows())
    }

    fn write_rows(&self, rows: &[PersistedGrant]) -> Result<(), CapabilityError> {
        manifest::write_private_json(&self.grants_path, rows)?;
        Ok(())
    }

    /// Unparseable files are moved to `grants.json.corrupt` and read as empty
    fn load_persisted(&self) -> Result<Vec<PersistedGrant>, CapabilityError> {
        let data = match fs::read(&self.grants_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&data) {
            Ok(rows) => Ok(rows),
            Err(e) => {
                let quarantine = self.grants_path.with_extension("json.corrupt");
                warn!(
                    path = %self.grants_path.display(),
                    moved_to = %quarantine.display(),
                    error = %e,
                    "Grant file is corrupt, starting with no folders approved"
                );
                fs::rename(&self.grants_path, &quarantine)?;
                Ok(Vec::new())
            }
        }
    }

    /// Keep the manifest in step with the set. An empty set removes the
    /// manifest so a stale one can't outlive the last grant.
    fn regenerate(&self, active: &[Capability]) -> Result<(), CapabilityError> {
        if active.is_empty() {
            remove_if_exists(&self.manifest_path)?;
            Ok(())
        } else {
            self.write_manifest_locked(active)
        }
    }

    fn write_manifest_locked(&self, active: &[Capability]) -> Result<(), CapabilityError> {
        let roots: Vec<PathBuf> = active.iter().map(|c| c.grant.path.clone()).collect();
        manifest::write_manifest(&self.manifest_path, &roots)?;
        debug!(count = roots.len(), path = %self.manifest_path.display(), "Allowlist manifest written");
        Ok(())
    }
}

impl AllowlistSource for CapabilityStore {
    fn write_allowlist_manifest(&self) -> Result<PathBuf, CapabilityError> {
        CapabilityStore::write_allowlist_manifest(self)
    }

    fn manifest_path(&self) -> PathBuf {
        self.manifest_path.clone()
    }

    fn is_path_allowed(&self, path: &Path) -> bool {
        CapabilityStore::is_path_allowed(self, path)
    }
}

impl Drop for CapabilityStore {
    fn drop(&mut self) {
        for cap in self.lock().active.iter() {
            self.provider.stop_access(&cap.grant);
        }
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Lexically drop `.` and resolve `..` for paths that don't exist on disk
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
