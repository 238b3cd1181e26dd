//! Per-installation auth token
//!
//! 32 random bytes, hex-encoded, stored 0600. The raw bytes are wrapped in
//! `Zeroizing<>` and the encoded token in a `SecretString`, so neither
//! lingers in memory or shows up in a `Debug` print.

use crate::process;
use ring::rand::SecureRandom;
use secrecy::{ExposeSecret, SecretString};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Header carrying the token on every IPC request
pub const AUTH_HEADER: &str = "X-Auth-Token";

const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct AuthToken {
    path: PathBuf,
}

impl AuthToken {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the token, generating it on first use
    pub fn load_or_generate(&self) -> io::Result<SecretString> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => {
                let token = raw.trim();
                if is_well_formed(token) {
                    self.tighten_permissions()?;
                    return Ok(SecretString::new(token.to_string()));
                }
                warn!(path = %self.path.display(), "Auth token file is malformed, regenerating");
                fs::remove_file(&self.path)?;
                self.generate()
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => self.generate(),
            Err(e) => Err(e),
        }
    }

    /// Read an existing token without creating one. `None` if absent or
    /// malformed.
    pub fn load(&self) -> io::Result<Option<SecretString>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) if is_well_formed(raw.trim()) => {
                Ok(Some(SecretString::new(raw.trim().to_string())))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete and regenerate. A running backend keeps the old token until
    /// it is restarted.
    pub fn rotate(&self) -> io::Result<SecretString> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let token = self.generate()?;
        info!(path = %self.path.display(), "Auth token rotated");
        Ok(token)
    }

    fn generate(&self) -> io::Result<SecretString> {
        let mut bytes = Zeroizing::new([0u8; TOKEN_BYTES]);
        ring::rand::SystemRandom::new()
            .fill(bytes.as_mut())
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "system random source unavailable"))?;
        let encoded = SecretString::new(bytes.iter().map(|b| format!("{:02x}", b)).collect());

        if let Some(parent) = self.path.parent() {
            process::ensure_private_dir(parent)?;
        }
        // create_new: never clobber a token another process just wrote
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&self.path)?;
        file.write_all(encoded.expose_secret().as_bytes())?;
        file.sync_all()?;
        info!(path = %self.path.display(), "Generated auth token");
        Ok(encoded)
    }

    fn tighten_permissions(&self) -> io::Result<()> {
        let mode = fs::metadata(&self.path)?.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(path = %self.path.display(), "Auth token was readable by others, restricting to 0600");
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_BYTES * 2 && token.bytes().all(|b| b.is_ascii_hexdigit())
}
