//! Allowlist manifest - the file the backend reads at startup
//!
//! A JSON array of absolute directory paths. Written atomically (temp file in
//! the same directory, then rename) with 0600 permissions.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Write `value` as JSON to `path` atomically, owner read/write only
pub(crate) fn write_private_json<T: serde::Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let data = serde_json::to_vec_pretty(value)?;
    // tempfile creates with 0600 on unix
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&data)?;
    tmp.as_file().sync_all()?;
    tmp.as_file().set_permissions(fs::Permissions::from_mode(0o600))?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Serialize the approved paths to the manifest file
pub fn write_manifest(path: &Path, roots: &[PathBuf]) -> std::io::Result<()> {
    let entries: Vec<String> = roots
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    write_private_json(path, &entries)
}

/// Read a manifest back. Used by the stub backend and tests.
pub fn read_manifest(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    let data = fs::read(path)?;
    let entries: Vec<String> = serde_json::from_slice(&data)?;
    Ok(entries.into_iter().map(PathBuf::from).collect())
}
